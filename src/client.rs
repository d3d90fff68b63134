//! TCP client: a bundle of connections, each with its own router table
//! entry points and file-requester task.
//!
//! The client answers server heartbeats, logs general messages and pings,
//! and forwards `FILE_RESPOND` chunks into the requester task that owns
//! the connection's download state. Load is applied by enabling a number
//! of requesters; each drives its own request/download/wait cycle.

use crate::arrival::ArrivalProcess;
use crate::config::Config;
use crate::connection::{Connection, ConnectionHandle, ConnectionRegistry};
use crate::message::{
    msg_name, Message, MSG_FILE_REQUEST, MSG_FILE_RESPOND, MSG_GENERAL, MSG_HEARTBEAT, MSG_PING,
};
use crate::router::{Request, Router, RouterTable};
use crate::transfer::{requester_channel, FileRequester, RequesterHandle};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::{Error, ErrorKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

struct ClientConn {
    handle: ConnectionHandle,
    requester: RequesterHandle,
}

/// A running client: `config.connections` established connections, each
/// with an idle file requester.
pub struct Client {
    conns: Vec<ClientConn>,
    registry: ConnectionRegistry,
    supervisors: Vec<JoinHandle<()>>,
    requesting: usize,
}

impl Client {
    /// Dial the server and stand up every connection. The first catalog
    /// entry is the file every requester asks for.
    pub async fn connect(config: &Config) -> std::io::Result<Client> {
        let entry = config
            .files
            .first()
            .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "file catalog is empty"))?
            .clone();
        let arrival = Arc::new(ArrivalProcess::new(config.lambda(), config.max_wait_secs));
        let min_wait = Duration::from_secs(config.min_wait_secs);

        let registry = ConnectionRegistry::new();
        let mut conns = Vec::with_capacity(config.connections);
        let mut supervisors = Vec::with_capacity(config.connections);

        for _ in 0..config.connections {
            let (requester, inbox) = requester_channel();

            let mut routes = RouterTable::new();
            routes.register(MSG_HEARTBEAT, HeartbeatReplyRouter);
            routes.register(MSG_GENERAL, LogRouter);
            routes.register(MSG_PING, LogRouter);
            routes.register(
                MSG_FILE_RESPOND,
                FileRespondRouter {
                    chunks: requester.chunk_sender(),
                },
            );
            // A client only ever receives file chunks.
            routes.reject(MSG_FILE_REQUEST);

            let stream = TcpStream::connect(&config.connect).await?;
            let id = registry.allocate_id();
            let (handle, supervisor) = Connection::spawn(
                stream,
                id,
                Arc::new(routes),
                config.frame_limit(),
                registry.clone(),
            );
            FileRequester::spawn(
                handle.clone(),
                Arc::clone(&arrival),
                entry.clone(),
                min_wait,
                config.save_dir.clone(),
                inbox,
            );
            info!(conn = id, server = %config.connect, "connected");

            conns.push(ClientConn { handle, requester });
            supervisors.push(supervisor);
        }

        Ok(Client {
            conns,
            registry,
            supervisors,
            requesting: 0,
        })
    }

    pub fn connections(&self) -> usize {
        self.conns.len()
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Enable file requesting on up to `amount` connections, first to
    /// last. Already-enabled requesters are counted, not restarted.
    pub async fn start_requesting(&mut self, amount: usize) {
        let target = amount.min(self.conns.len());
        for conn in self.conns.iter().take(target) {
            conn.requester.start().await;
        }
        self.requesting = self.requesting.max(target);
        info!(requesting = self.requesting, "file requesting enabled");
    }

    /// Disable file requesting everywhere; in-flight downloads are
    /// discarded.
    pub async fn stop_requesting(&mut self) {
        for conn in &self.conns {
            conn.requester.stop().await;
        }
        self.requesting = 0;
        info!("file requesting disabled");
    }

    /// Signal every connection to close.
    pub fn shutdown_all(&self) {
        for conn in &self.conns {
            conn.handle.shutdown();
        }
    }

    /// Wait for every connection to finish tearing down.
    pub async fn join(self) {
        for supervisor in self.supervisors {
            let _ = supervisor.await;
        }
        debug!("all connections closed");
    }
}

/// Answers a server heartbeat in kind.
struct HeartbeatReplyRouter;

#[async_trait]
impl Router for HeartbeatReplyRouter {
    async fn handle(&self, req: &Request) {
        debug!(conn = req.conn.id(), "heartbeat received, replying");
        let reply = Message::new(MSG_HEARTBEAT, &b"heartbeat from client"[..]);
        if let Err(e) = req.conn.send(reply).await {
            error!(conn = req.conn.id(), error = %e, "failed to enqueue heartbeat reply");
        }
    }
}

/// Logs messages the client consumes without acting on.
struct LogRouter;

#[async_trait]
impl Router for LogRouter {
    async fn handle(&self, req: &Request) {
        info!(
            conn = req.conn.id(),
            msg = msg_name(req.msg_id()),
            body = %String::from_utf8_lossy(req.payload()),
            "message received"
        );
    }
}

/// Forwards file chunks off the inbound task into the requester task.
/// The bounded channel makes the reader back off when the sink is slow.
struct FileRespondRouter {
    chunks: mpsc::Sender<Bytes>,
}

#[async_trait]
impl Router for FileRespondRouter {
    async fn handle(&self, req: &Request) {
        if self.chunks.send(req.message.payload().clone()).await.is_err() {
            // Requester gone; the connection is already unwinding.
            debug!(conn = req.conn.id(), "dropping chunk, requester exited");
        }
    }
}
