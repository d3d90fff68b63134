//! Per-connection duplex pump and the registry of live connections.
//!
//! Every connection runs two tasks: an inbound task that is the sole
//! reader of the socket (read frame, dispatch, repeat) and an outbound
//! task that drains a FIFO queue onto the socket. A watch channel carries
//! the exit signal; it is broadcast, so every task observes it without
//! consuming it for the others. A supervisor task awaits both pumps and
//! detaches the connection from the registry exactly once.

use crate::codec;
use crate::error::ProtocolError;
use crate::message::{msg_name, Message};
use crate::router::{Request, RouterTable};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

/// Depth of the per-connection outbound FIFO. Senders back off when the
/// outbound task falls behind, which is what paces the file send loop.
const OUTBOUND_QUEUE_DEPTH: usize = 64;

/// Cheaply cloneable handle to a live connection: the producer side of the
/// outbound queue plus the shutdown broadcast.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: u32,
    outbound: mpsc::Sender<Message>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl ConnectionHandle {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Enqueue a message for the outbound task. Preserves enqueue order
    /// per sender; fails once the connection has torn down.
    pub async fn send(&self, msg: Message) -> Result<(), ProtocolError> {
        self.outbound
            .send(msg)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Signal the connection to close. Idempotent: every waiter observes
    /// the signal no matter how many tasks raise it or in what order.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolve once the connection is closing. Safe to race from any
    /// number of tasks, including after the signal was already raised.
    pub async fn wait_closed(&self) {
        let mut rx = self.shutdown.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

/// A live connection's tasks. The handle is the only way to interact with
/// it after spawn.
pub struct Connection;

impl Connection {
    /// Split the socket and start the inbound, outbound, and supervisor
    /// tasks. The returned join handle resolves after both pumps have
    /// exited and the connection has been detached from the registry.
    pub fn spawn(
        stream: TcpStream,
        id: u32,
        routes: Arc<RouterTable>,
        max_frame_len: u32,
        registry: ConnectionRegistry,
    ) -> (ConnectionHandle, JoinHandle<()>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let (shutdown_tx, _) = watch::channel(false);
        let handle = ConnectionHandle {
            id,
            outbound: outbound_tx,
            shutdown: Arc::new(shutdown_tx),
        };
        registry.insert(handle.clone());

        let (read_half, write_half) = stream.into_split();
        let inbound = tokio::spawn(inbound_task(read_half, handle.clone(), routes, max_frame_len));
        let outbound = tokio::spawn(outbound_task(write_half, outbound_rx, handle.clone()));

        let supervisor = tokio::spawn(async move {
            let _ = tokio::join!(inbound, outbound);
            registry.detach(id);
            debug!(conn = id, "connection closed");
        });
        (handle, supervisor)
    }
}

/// Sole reader of the socket: frames are read and dispatched strictly in
/// arrival order, one handler at a time. Always raises the exit signal on
/// the way out, whatever the exit reason. The exit signal also interrupts
/// a blocked read, so an externally raised shutdown unwinds the reader
/// even when the peer stays silent; a frame abandoned mid-read is lost
/// with the connection.
async fn inbound_task(
    mut reader: OwnedReadHalf,
    handle: ConnectionHandle,
    routes: Arc<RouterTable>,
    max_frame_len: u32,
) {
    let id = handle.id();
    debug!(conn = id, "reader started");
    loop {
        let result = tokio::select! {
            res = codec::read_frame(&mut reader, max_frame_len) => res,
            _ = handle.wait_closed() => break,
        };
        match result {
            Ok(message) => {
                trace!(
                    conn = id,
                    msg = msg_name(message.id()),
                    len = message.len(),
                    "frame received"
                );
                let req = Request {
                    conn: handle.clone(),
                    message,
                };
                if let Err(e) = routes.dispatch(&req).await {
                    error!(conn = id, error = %e, "dispatch failed, closing connection");
                    break;
                }
            }
            Err(e) if e.is_clean_close() => {
                debug!(conn = id, "peer closed connection");
                break;
            }
            Err(e) => {
                error!(conn = id, error = %e, "read failed, closing connection");
                break;
            }
        }
    }
    handle.shutdown();
    debug!(conn = id, "reader exited");
}

/// Drains the outbound FIFO onto the socket. Returns immediately on the
/// exit signal, dropping anything still queued; a write error raises the
/// signal so the reader unwinds too.
async fn outbound_task(
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::Receiver<Message>,
    handle: ConnectionHandle,
) {
    let id = handle.id();
    debug!(conn = id, "writer started");
    loop {
        tokio::select! {
            maybe = queue.recv() => {
                let Some(msg) = maybe else { break };
                let frame = codec::encode(&msg);
                if let Err(e) = writer.write_all(&frame).await {
                    error!(conn = id, error = %e, "write failed, closing connection");
                    break;
                }
                trace!(conn = id, msg = msg_name(msg.id()), len = msg.len(), "frame written");
            }
            _ = handle.wait_closed() => break,
        }
    }
    handle.shutdown();
    debug!(conn = id, "writer exited");
}

/// Set of live connections. Mutated only under its own lock; identity
/// allocation is monotonic for the process lifetime.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    handles: Arc<Mutex<HashMap<u32, ConnectionHandle>>>,
    next_id: Arc<AtomicU32>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out the next connection identity, starting at 1.
    pub fn allocate_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn insert(&self, handle: ConnectionHandle) {
        self.handles.lock().unwrap().insert(handle.id(), handle);
    }

    fn detach(&self, id: u32) {
        self.handles.lock().unwrap().remove(&id);
    }

    pub fn get(&self, id: u32) -> Option<ConnectionHandle> {
        self.handles.lock().unwrap().get(&id).cloned()
    }

    /// Snapshot of the live handles.
    pub fn handles(&self) -> Vec<ConnectionHandle> {
        self.handles.lock().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.handles.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Signal every live connection to close.
    pub fn shutdown_all(&self) {
        for handle in self.handles() {
            handle.shutdown();
        }
    }
}

/// Build a handle that is not backed by a socket; the returned receiver is
/// the outbound queue's consumer end.
#[cfg(test)]
pub(crate) fn test_handle(id: u32) -> (ConnectionHandle, mpsc::Receiver<Message>) {
    let (outbound, rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
    let (shutdown, _) = watch::channel(false);
    (
        ConnectionHandle {
            id,
            outbound,
            shutdown: Arc::new(shutdown),
        },
        rx,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MSG_GENERAL, MSG_PING};
    use crate::router::Router;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    struct CollectPayloads {
        seen: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    #[async_trait]
    impl Router for CollectPayloads {
        async fn handle(&self, req: &Request) {
            self.seen.lock().unwrap().push(req.payload().to_vec());
        }
    }

    async fn accept_one(
        routes: RouterTable,
    ) -> (TcpStream, ConnectionHandle, JoinHandle<()>, ConnectionRegistry) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = TcpStream::connect(addr).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();

        let registry = ConnectionRegistry::new();
        let id = registry.allocate_id();
        let (handle, done) = Connection::spawn(stream, id, Arc::new(routes), 1024, registry.clone());
        (peer, handle, done, registry)
    }

    #[tokio::test]
    async fn test_handlers_run_in_arrival_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut routes = RouterTable::new();
        routes.register(
            MSG_GENERAL,
            CollectPayloads {
                seen: Arc::clone(&seen),
            },
        );

        let (mut peer, handle, done, _registry) = accept_one(routes).await;

        // Back-to-back frames in one write.
        let mut wire = Vec::new();
        for payload in [&b"first"[..], b"second", b"third"] {
            wire.extend_from_slice(&codec::encode(&Message::new(MSG_GENERAL, payload)));
        }
        peer.write_all(&wire).await.unwrap();
        peer.shutdown().await.unwrap();

        timeout(Duration::from_secs(5), done).await.unwrap().unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()]
        );
        drop(handle);
    }

    #[tokio::test]
    async fn test_unrouted_frame_does_not_close_connection() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut routes = RouterTable::new();
        routes.register(
            MSG_GENERAL,
            CollectPayloads {
                seen: Arc::clone(&seen),
            },
        );

        let (mut peer, _handle, done, _registry) = accept_one(routes).await;

        // MSG_PING has no router here; the frame after it must still be
        // handled.
        let mut wire = Vec::new();
        wire.extend_from_slice(&codec::encode(&Message::new(MSG_PING, &b"?"[..])));
        wire.extend_from_slice(&codec::encode(&Message::new(MSG_GENERAL, &b"after"[..])));
        peer.write_all(&wire).await.unwrap();
        peer.shutdown().await.unwrap();

        timeout(Duration::from_secs(5), done).await.unwrap().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![b"after".to_vec()]);
    }

    #[tokio::test]
    async fn test_outbound_messages_reach_the_peer_in_order() {
        let (mut peer, handle, _done, _registry) = accept_one(RouterTable::new()).await;

        handle.send(Message::new(MSG_GENERAL, &b"one"[..])).await.unwrap();
        handle.send(Message::new(MSG_GENERAL, &b"two"[..])).await.unwrap();

        let first = codec::read_frame(&mut peer, 1024).await.unwrap();
        let second = codec::read_frame(&mut peer, 1024).await.unwrap();
        assert_eq!(first.payload().as_ref(), b"one");
        assert_eq!(second.payload().as_ref(), b"two");
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_detaches_once() {
        let (_peer, handle, done, registry) = accept_one(RouterTable::new()).await;
        assert_eq!(registry.len(), 1);

        // Raise the exit signal from "both sides" at once.
        handle.shutdown();
        handle.shutdown();

        timeout(Duration::from_secs(5), done).await.unwrap().unwrap();
        assert_eq!(registry.len(), 0);
        assert!(handle.is_closed());

        // The queue is released with the pumps; late sends fail cleanly.
        let err = handle
            .send(Message::new(MSG_GENERAL, &b"late"[..]))
            .await
            .unwrap_err();
        assert!(err.is_clean_close());
    }

    #[tokio::test]
    async fn test_shutdown_unblocks_a_reader_with_a_silent_peer() {
        // The peer stays connected but never writes, so the reader is
        // parked inside a frame read when the signal is raised.
        let (peer, handle, done, registry) = accept_one(RouterTable::new()).await;

        handle.shutdown();

        timeout(Duration::from_secs(3), done)
            .await
            .expect("supervisor joins while the peer is still connected")
            .unwrap();
        assert!(registry.is_empty());
        drop(peer);
    }

    #[tokio::test]
    async fn test_peer_close_tears_down() {
        let (peer, handle, done, registry) = accept_one(RouterTable::new()).await;
        drop(peer);

        timeout(Duration::from_secs(5), done).await.unwrap().unwrap();
        assert!(handle.is_closed());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_registry_ids_are_monotonic() {
        let registry = ConnectionRegistry::new();
        let a = registry.allocate_id();
        let b = registry.allocate_id();
        let c = registry.allocate_id();
        assert!(a < b && b < c);
    }
}
