//! Chunked file transfer: responder send loop, requester state machine,
//! and the externally toggled flow-control gate.
//!
//! There is no begin or end marker on the wire. Both sides know the file's
//! total size out of band (the configured catalog); the requester infers
//! completion by counting bytes. If the responder's file yields fewer
//! bytes than the catalog declares, the requester stays idle waiting for
//! the rest; detecting that is left to the deployment, not this layer.

use crate::arrival::ArrivalProcess;
use crate::config::FileEntry;
use crate::connection::ConnectionHandle;
use crate::error::ProtocolError;
use crate::message::{Message, MSG_FILE_REQUEST, MSG_FILE_RESPOND};
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, trace};

/// The "transfers currently allowed" boolean. Toggled by the control
/// plane while responder send loops are running; safe from any task.
#[derive(Clone, Debug)]
pub struct FlowGate(Arc<AtomicBool>);

impl FlowGate {
    pub fn new(open: bool) -> Self {
        FlowGate(Arc::new(AtomicBool::new(open)))
    }

    pub fn is_open(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn open(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn close(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

/// Responder side: stream one file as `FILE_RESPOND` chunks.
///
/// The gate is re-checked before every chunk; a closed gate aborts the
/// loop where it stands, with no end marker and no spurious completion.
/// The bounded outbound queue paces reads against the socket. Returns the
/// number of bytes actually handed to the outbound task.
pub async fn send_file(
    handle: &ConnectionHandle,
    path: &Path,
    chunk_len: usize,
    gate: &FlowGate,
) -> Result<u64, ProtocolError> {
    let mut file = File::open(path).await?;
    let mut buf = vec![0u8; chunk_len];
    let mut sent = 0u64;
    loop {
        if !gate.is_open() {
            debug!(conn = handle.id(), sent, "file transfers disabled, aborting send");
            return Ok(sent);
        }
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let chunk = Message::new(MSG_FILE_RESPOND, Bytes::copy_from_slice(&buf[..n]));
        handle.send(chunk).await?;
        sent += n as u64;
    }
    Ok(sent)
}

/// Progress after one accepted chunk.
#[derive(Debug)]
pub enum SessionProgress {
    InFlight,
    Complete { elapsed: Duration },
}

/// One in-flight download on the requester side. Invariant:
/// `received <= total_size`; a chunk that would break it is rejected
/// before anything is written.
pub struct TransferSession {
    file_name: String,
    total_size: u64,
    received: u64,
    started: std::time::Instant,
    sink: Option<File>,
}

impl TransferSession {
    /// Begin a session for one catalog entry. When `save_dir` is given,
    /// a local sink named after the request is created (truncating any
    /// previous download).
    pub async fn open(entry: &FileEntry, save_dir: Option<&Path>) -> std::io::Result<Self> {
        let sink = match save_dir {
            Some(dir) => Some(File::create(dir.join(&entry.name)).await?),
            None => None,
        };
        Ok(TransferSession {
            file_name: entry.name.clone(),
            total_size: entry.size,
            received: 0,
            started: std::time::Instant::now(),
            sink,
        })
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    /// Account one chunk, writing it to the sink when persistence is on.
    /// Completion fires exactly once, on the chunk whose cumulative size
    /// first reaches the declared total; overshooting the total is a
    /// protocol violation.
    pub async fn accept_chunk(&mut self, chunk: &[u8]) -> Result<SessionProgress, ProtocolError> {
        let new_total = self.received + chunk.len() as u64;
        if new_total > self.total_size {
            return Err(ProtocolError::Violation(format!(
                "file {} overran its declared size: {} > {}",
                self.file_name, new_total, self.total_size
            )));
        }
        if let Some(sink) = self.sink.as_mut() {
            sink.write_all(chunk).await?;
        }
        self.received = new_total;
        if self.received == self.total_size {
            if let Some(mut sink) = self.sink.take() {
                sink.flush().await?;
            }
            Ok(SessionProgress::Complete {
                elapsed: self.started.elapsed(),
            })
        } else {
            Ok(SessionProgress::InFlight)
        }
    }

    /// Abandon the session, releasing the sink if one was opened.
    pub async fn discard(mut self) {
        if let Some(mut sink) = self.sink.take() {
            let _ = sink.flush().await;
        }
    }
}

/// Control-plane signal for one connection's requesting behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferControl {
    Start,
    Stop,
}

/// Producer side of a [`FileRequester`] task.
#[derive(Clone)]
pub struct RequesterHandle {
    ctrl: mpsc::Sender<TransferControl>,
    chunks: mpsc::Sender<Bytes>,
}

/// Consumer side of a [`FileRequester`] task.
pub struct RequesterInbox {
    ctrl: mpsc::Receiver<TransferControl>,
    chunks: mpsc::Receiver<Bytes>,
}

/// Build the requester's channel pair. Split from [`FileRequester::spawn`]
/// so the chunk sender can be wired into the connection's router table
/// before the connection itself exists.
pub fn requester_channel() -> (RequesterHandle, RequesterInbox) {
    let (ctrl_tx, ctrl_rx) = mpsc::channel(1);
    let (chunk_tx, chunk_rx) = mpsc::channel(64);
    (
        RequesterHandle {
            ctrl: ctrl_tx,
            chunks: chunk_tx,
        },
        RequesterInbox {
            ctrl: ctrl_rx,
            chunks: chunk_rx,
        },
    )
}

impl RequesterHandle {
    /// Enable requesting: the timer is armed with a fresh sampled wait.
    /// A no-op when already requesting.
    pub async fn start(&self) {
        let _ = self.ctrl.send(TransferControl::Start).await;
    }

    /// Disable requesting: any in-flight session is discarded and the
    /// timer returns to idle.
    pub async fn stop(&self) {
        let _ = self.ctrl.send(TransferControl::Stop).await;
    }

    /// Where the connection's `FILE_RESPOND` router delivers chunks.
    pub fn chunk_sender(&self) -> mpsc::Sender<Bytes> {
        self.chunks.clone()
    }
}

/// Requester-side state machine, one task per client connection.
///
/// The task owns the session and the request timer outright; the inbound
/// task reaches it only through the chunk channel, so no session field
/// needs a lock. The timer is either disarmed (`None`, idle-waiting) or
/// armed with a deadline sampled from the arrival process.
pub struct FileRequester;

impl FileRequester {
    pub fn spawn(
        handle: ConnectionHandle,
        arrival: Arc<ArrivalProcess>,
        entry: FileEntry,
        min_wait: Duration,
        save_dir: Option<PathBuf>,
        inbox: RequesterInbox,
    ) {
        tokio::spawn(run_requester(
            handle,
            arrival,
            entry,
            min_wait,
            save_dir,
            inbox.ctrl,
            inbox.chunks,
        ));
    }
}

fn next_wait(arrival: &ArrivalProcess, rng: &mut StdRng, min_wait: Duration) -> Duration {
    min_wait + Duration::from_secs(arrival.sample(rng))
}

#[allow(clippy::too_many_arguments)]
async fn run_requester(
    handle: ConnectionHandle,
    arrival: Arc<ArrivalProcess>,
    entry: FileEntry,
    min_wait: Duration,
    save_dir: Option<PathBuf>,
    mut ctrl: mpsc::Receiver<TransferControl>,
    mut chunks: mpsc::Receiver<Bytes>,
) {
    let id = handle.id();
    let mut rng = StdRng::seed_from_u64(u64::from(id));
    let mut requesting = false;
    // None = idle-waiting (timer disarmed), never a sentinel duration.
    let mut deadline: Option<Instant> = None;
    let mut session: Option<TransferSession> = None;

    debug!(conn = id, file = %entry.name, "file requester started");
    loop {
        tokio::select! {
            maybe = ctrl.recv() => {
                let Some(cmd) = maybe else { break };
                match cmd {
                    TransferControl::Start => {
                        if !requesting {
                            requesting = true;
                            let wait = next_wait(&arrival, &mut rng, min_wait);
                            info!(conn = id, wait_secs = wait.as_secs(), "file requesting enabled");
                            deadline = Some(Instant::now() + wait);
                        }
                    }
                    TransferControl::Stop => {
                        if requesting {
                            info!(conn = id, "file requesting disabled");
                        }
                        requesting = false;
                        deadline = None;
                        if let Some(sess) = session.take() {
                            debug!(conn = id, file = %sess.file_name(), "discarding in-flight session");
                            sess.discard().await;
                        }
                    }
                }
            }
            maybe = chunks.recv() => {
                let Some(chunk) = maybe else { break };
                if !requesting {
                    trace!(conn = id, "chunk after stop, ignoring");
                    continue;
                }
                let Some(sess) = session.as_mut() else {
                    // The responder kept sending past the declared size of
                    // a completed session.
                    error!(conn = id, "file chunk with no open session, closing connection");
                    handle.shutdown();
                    break;
                };
                match sess.accept_chunk(&chunk).await {
                    Ok(SessionProgress::InFlight) => {}
                    Ok(SessionProgress::Complete { elapsed }) => {
                        let sess = session.take().expect("session is live here");
                        let secs = elapsed.as_secs_f64();
                        let mbps = sess.total_size() as f64 * 8.0 / secs / 1e6;
                        info!(
                            conn = id,
                            file = %sess.file_name(),
                            elapsed_ms = secs * 1e3,
                            mbps,
                            "download complete"
                        );
                        let wait = next_wait(&arrival, &mut rng, min_wait);
                        deadline = Some(Instant::now() + wait);
                    }
                    Err(ProtocolError::Io(e)) => {
                        // Persistence failure, not a wire failure: the
                        // session is lost but the connection is healthy.
                        error!(conn = id, error = %e, "sink write failed, discarding session");
                        session.take().expect("session is live here").discard().await;
                        deadline = Some(Instant::now() + next_wait(&arrival, &mut rng, min_wait));
                    }
                    Err(e) => {
                        error!(conn = id, error = %e, "closing connection");
                        handle.shutdown();
                        break;
                    }
                }
            }
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                // Disarm until this session completes.
                deadline = None;
                match TransferSession::open(&entry, save_dir.as_deref()).await {
                    Ok(sess) => {
                        debug!(conn = id, file = %entry.name, "requesting file");
                        let req = Message::new(
                            MSG_FILE_REQUEST,
                            Bytes::copy_from_slice(entry.name.as_bytes()),
                        );
                        if handle.send(req).await.is_err() {
                            sess.discard().await;
                            break;
                        }
                        session = Some(sess);
                    }
                    Err(e) => {
                        error!(conn = id, error = %e, "failed to open local sink, retrying later");
                        deadline = Some(Instant::now() + next_wait(&arrival, &mut rng, min_wait));
                    }
                }
            }
            _ = handle.wait_closed() => break,
        }
    }
    if let Some(sess) = session.take() {
        sess.discard().await;
    }
    debug!(conn = id, "file requester exited");
}
