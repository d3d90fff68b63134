//! Jittered per-connection heartbeats.
//!
//! A single shared interval would make every connection fire in lockstep
//! and produce burst traffic, so each connection derives its own interval
//! from its identity: the same id always yields the same jitter, which
//! keeps test runs reproducible.

use crate::connection::ConnectionHandle;
use crate::message::{Message, MSG_HEARTBEAT};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tokio::time::{interval_at, Instant};
use tracing::debug;

/// Payload carried by scheduler-originated heartbeats.
pub const HEARTBEAT_BODY: &[u8] = b"heartbeat from server";

/// Pick this connection's send interval: uniform in `[min, max)` seconds,
/// seeded by the connection id. A window with no room in it (min >= max)
/// collapses to the floor, never below one second so the interval timer
/// stays well-formed.
pub fn jittered_interval(conn_id: u32, min_secs: u64, max_secs: u64) -> Duration {
    if min_secs >= max_secs {
        return Duration::from_secs(min_secs.max(1));
    }
    let mut rng = StdRng::seed_from_u64(u64::from(conn_id));
    Duration::from_secs(rng.gen_range(min_secs..max_secs))
}

/// Start this connection's heartbeat task. On every tick a heartbeat
/// message is enqueued outbound; nothing waits for or correlates replies.
/// The task ends on the connection's exit signal or when the outbound
/// queue is gone.
pub fn spawn(handle: ConnectionHandle, period: Duration) {
    tokio::spawn(async move {
        let id = handle.id();
        debug!(conn = id, period_secs = period.as_secs_f64(), "heartbeat started");
        // First beat after one full period, not immediately.
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let beat = Message::new(MSG_HEARTBEAT, HEARTBEAT_BODY);
                    if handle.send(beat).await.is_err() {
                        break;
                    }
                }
                _ = handle.wait_closed() => break,
            }
        }
        debug!(conn = id, "heartbeat stopped");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_handle;
    use tokio::time::timeout;

    #[test]
    fn test_jitter_is_deterministic_per_id() {
        let a = jittered_interval(7, 100, 200);
        let b = jittered_interval(7, 100, 200);
        assert_eq!(a, b);
    }

    #[test]
    fn test_jitter_stays_in_window() {
        for id in 0..500 {
            let d = jittered_interval(id, 100, 200);
            assert!(d >= Duration::from_secs(100));
            assert!(d < Duration::from_secs(200));
        }
    }

    #[test]
    fn test_empty_window_collapses_to_the_floor() {
        assert_eq!(jittered_interval(1, 200, 200), Duration::from_secs(200));
        assert_eq!(jittered_interval(1, 300, 200), Duration::from_secs(300));
        // Never a zero period, which the interval timer rejects.
        assert_eq!(jittered_interval(1, 0, 0), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_varies_across_ids() {
        let distinct: std::collections::HashSet<Duration> =
            (0..100).map(|id| jittered_interval(id, 100, 200)).collect();
        assert!(distinct.len() > 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_beats_are_enqueued_on_schedule() {
        let (handle, mut outbound) = test_handle(3);
        spawn(handle.clone(), Duration::from_secs(5));

        let beat = timeout(Duration::from_secs(6), outbound.recv())
            .await
            .expect("first beat within one period")
            .unwrap();
        assert_eq!(beat.id(), MSG_HEARTBEAT);
        assert_eq!(beat.payload().as_ref(), HEARTBEAT_BODY);

        let beat = timeout(Duration::from_secs(6), outbound.recv())
            .await
            .expect("second beat one period later")
            .unwrap();
        assert_eq!(beat.id(), MSG_HEARTBEAT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_signal_stops_the_beat() {
        let (handle, mut outbound) = test_handle(4);
        spawn(handle.clone(), Duration::from_secs(5));

        handle.shutdown();
        drop(handle);
        // The task drops its queue sender on exit; at most one beat can
        // race the signal before that.
        let mut beats = 0;
        while let Some(msg) = timeout(Duration::from_secs(30), outbound.recv())
            .await
            .expect("queue should close once the task exits")
        {
            assert_eq!(msg.id(), MSG_HEARTBEAT);
            beats += 1;
        }
        assert!(beats <= 1);
    }
}
