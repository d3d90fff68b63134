//! TCP server: accept loop, connection bookkeeping, and the default
//! server-side routers.
//!
//! The accept loop assigns identities, enforces the concurrent-connection
//! bound (sockets beyond it are accepted then dropped, leaving existing
//! connections untouched), and gives every connection a jittered heartbeat
//! schedule. A listen/bind failure is the only fatal startup condition.

use crate::config::Config;
use crate::connection::{Connection, ConnectionRegistry};
use crate::error::ProtocolError;
use crate::heartbeat;
use crate::message::{
    msg_name, Message, MSG_FILE_REQUEST, MSG_FILE_RESPOND, MSG_GENERAL, MSG_HEARTBEAT, MSG_PING,
};
use crate::router::{Request, Router, RouterTable};
use crate::transfer::{send_file, FlowGate};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Server instance.
pub struct Server {
    config: Config,
    routes: Arc<RouterTable>,
    registry: ConnectionRegistry,
    gate: FlowGate,
}

impl Server {
    /// Create a server with the default routers wired up.
    pub fn new(config: Config) -> Self {
        let gate = FlowGate::new(config.allow_on_start);

        let mut routes = RouterTable::new();
        routes.register(MSG_HEARTBEAT, HeartbeatRouter);
        routes.register(MSG_GENERAL, GeneralMsgRouter);
        routes.register(MSG_PING, PingRouter);
        routes.register(
            MSG_FILE_REQUEST,
            FileRequestRouter {
                root: config.file_root.clone(),
                chunk_len: config.max_chunk_len as usize,
                gate: gate.clone(),
            },
        );
        // A server only ever sends file chunks.
        routes.reject(MSG_FILE_RESPOND);

        Server {
            config,
            routes: Arc::new(routes),
            registry: ConnectionRegistry::new(),
            gate,
        }
    }

    /// Replace a default router. Only meaningful before [`Server::run`].
    pub fn add_router(&mut self, id: u32, router: impl Router + 'static) {
        Arc::get_mut(&mut self.routes)
            .expect("routers must be registered before the server runs")
            .register(id, router);
    }

    /// The transfers-allowed gate, for the control plane to toggle.
    pub fn flow_gate(&self) -> FlowGate {
        self.gate.clone()
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Signal every live connection to close.
    pub fn shutdown_all(&self) {
        self.registry.shutdown_all();
    }

    /// Bind and accept connections forever.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.listen).await?;
        info!(address = %self.config.listen, "server listening");
        self.run_with_listener(listener).await
    }

    /// Accept loop over an already-bound listener.
    pub async fn run_with_listener(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    if self.registry.len() >= self.config.max_connections {
                        warn!(
                            peer = %addr,
                            limit = self.config.max_connections,
                            "connection limit reached, dropping socket"
                        );
                        drop(stream);
                        continue;
                    }

                    let id = self.registry.allocate_id();
                    let (handle, _closed) = Connection::spawn(
                        stream,
                        id,
                        Arc::clone(&self.routes),
                        self.config.frame_limit(),
                        self.registry.clone(),
                    );
                    heartbeat::spawn(
                        handle,
                        heartbeat::jittered_interval(
                            id,
                            self.config.heartbeat_min_secs,
                            self.config.heartbeat_max_secs,
                        ),
                    );
                    info!(conn = id, peer = %addr, "connection established");
                }
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                }
            }
        }
    }
}

/// Logs the peer's heartbeat replies. The server originates heartbeats on
/// its own schedule, so this side never answers one.
struct HeartbeatRouter;

#[async_trait]
impl Router for HeartbeatRouter {
    async fn handle(&self, req: &Request) {
        debug!(
            conn = req.conn.id(),
            msg = msg_name(req.msg_id()),
            body = %String::from_utf8_lossy(req.payload()),
            "heartbeat reply"
        );
    }
}

/// Logs free-form peer messages.
struct GeneralMsgRouter;

#[async_trait]
impl Router for GeneralMsgRouter {
    async fn handle(&self, req: &Request) {
        info!(
            conn = req.conn.id(),
            msg = msg_name(req.msg_id()),
            body = %String::from_utf8_lossy(req.payload()),
            "message received"
        );
    }
}

/// Answers a ping with a ping of its own.
struct PingRouter;

#[async_trait]
impl Router for PingRouter {
    async fn handle(&self, req: &Request) {
        info!(
            conn = req.conn.id(),
            msg = msg_name(req.msg_id()),
            body = %String::from_utf8_lossy(req.payload()),
            "ping received"
        );
        let reply = Message::new(MSG_PING, &b"server respond!"[..]);
        if let Err(e) = req.conn.send(reply).await {
            error!(conn = req.conn.id(), error = %e, "failed to enqueue ping reply");
        }
    }
}

/// Streams the requested file back as chunks, gated by the flow gate.
///
/// Runs on the connection's inbound task, so a long transfer delays later
/// frames on this connection and no other.
struct FileRequestRouter {
    root: PathBuf,
    chunk_len: usize,
    gate: FlowGate,
}

#[async_trait]
impl Router for FileRequestRouter {
    async fn handle(&self, req: &Request) {
        let conn = req.conn.id();
        let Some(name) = safe_file_name(req.payload()) else {
            warn!(conn, "rejecting file request with unusable name");
            return;
        };
        let path = self.root.join(&name);
        match send_file(&req.conn, &path, self.chunk_len, &self.gate).await {
            Ok(sent) => debug!(conn, file = %name, sent, "file send finished"),
            Err(ProtocolError::Io(e)) if e.kind() == ErrorKind::NotFound => {
                warn!(conn, file = %name, "requested file does not exist");
            }
            Err(e) => error!(conn, file = %name, error = %e, "file send aborted"),
        }
    }
}

/// A request names a file inside the serving root, never a path. Anything
/// that could escape the root is refused.
fn safe_file_name(raw: &[u8]) -> Option<String> {
    let name = std::str::from_utf8(raw).ok()?;
    if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains("..") {
        return None;
    }
    Some(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;
    use tokio::time::timeout;
    use tokio_test::assert_ok;

    #[test]
    fn test_safe_file_name() {
        assert_eq!(safe_file_name(b"video.mp4").as_deref(), Some("video.mp4"));
        assert!(safe_file_name(b"").is_none());
        assert!(safe_file_name(b"../etc/passwd").is_none());
        assert!(safe_file_name(b"dir/file").is_none());
        assert!(safe_file_name(b"dir\\file").is_none());
        assert!(safe_file_name(&[0xff, 0xfe]).is_none());
    }

    async fn start_server(config: Config) -> (Arc<Server>, std::net::SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(Server::new(config));
        let runner = Arc::clone(&server);
        tokio::spawn(async move {
            let _ = runner.run_with_listener(listener).await;
        });
        (server, addr)
    }

    struct EchoBack;

    #[async_trait]
    impl Router for EchoBack {
        async fn handle(&self, req: &Request) {
            let echo = Message::new(MSG_GENERAL, req.message.payload().clone());
            let _ = req.conn.send(echo).await;
        }
    }

    #[tokio::test]
    async fn test_add_router_replaces_the_default() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut server = Server::new(Config::default());
        server.add_router(MSG_GENERAL, EchoBack);
        let server = Arc::new(server);
        let runner = Arc::clone(&server);
        tokio::spawn(async move {
            let _ = runner.run_with_listener(listener).await;
        });

        let mut peer = TcpStream::connect(addr).await.unwrap();
        let frame = codec::encode(&Message::new(MSG_GENERAL, &b"say it back"[..]));
        tokio::io::AsyncWriteExt::write_all(&mut peer, &frame)
            .await
            .unwrap();

        let reply = timeout(Duration::from_secs(5), codec::read_frame(&mut peer, 1024))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.id(), MSG_GENERAL);
        assert_eq!(reply.payload().as_ref(), b"say it back");
    }

    #[tokio::test]
    async fn test_ping_gets_a_reply() {
        let (_server, addr) = start_server(Config::default()).await;
        let mut peer = TcpStream::connect(addr).await.unwrap();

        let ping = codec::encode(&Message::new(MSG_PING, &b"hello?"[..]));
        assert_ok!(tokio::io::AsyncWriteExt::write_all(&mut peer, &ping).await);

        let reply = timeout(Duration::from_secs(5), codec::read_frame(&mut peer, 1024))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.id(), MSG_PING);
        assert_eq!(reply.payload().as_ref(), b"server respond!");
    }

    #[tokio::test]
    async fn test_connection_cap_drops_excess_socket_only() {
        let config = Config {
            max_connections: 1,
            ..Config::default()
        };
        let (_server, addr) = start_server(config).await;

        let mut first = TcpStream::connect(addr).await.unwrap();
        // Prove the first connection is fully registered before dialing
        // the second.
        let ping = codec::encode(&Message::new(MSG_PING, &b"1"[..]));
        tokio::io::AsyncWriteExt::write_all(&mut first, &ping)
            .await
            .unwrap();
        codec::read_frame(&mut first, 1024).await.unwrap();

        let mut second = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        let n = timeout(Duration::from_secs(5), second.read(&mut buf))
            .await
            .expect("excess socket should be closed promptly")
            .unwrap();
        assert_eq!(n, 0);

        // The first connection still works.
        tokio::io::AsyncWriteExt::write_all(&mut first, &ping)
            .await
            .unwrap();
        let reply = codec::read_frame(&mut first, 1024).await.unwrap();
        assert_eq!(reply.id(), MSG_PING);
    }

    #[tokio::test]
    async fn test_file_request_streams_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let content: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(dir.path().join("blob.bin"), &content).unwrap();

        let config = Config {
            file_root: dir.path().to_path_buf(),
            max_chunk_len: 1024,
            ..Config::default()
        };
        let (_server, addr) = start_server(config).await;
        let mut peer = TcpStream::connect(addr).await.unwrap();

        let request = codec::encode(&Message::new(MSG_FILE_REQUEST, &b"blob.bin"[..]));
        tokio::io::AsyncWriteExt::write_all(&mut peer, &request)
            .await
            .unwrap();

        let mut received = Vec::new();
        while received.len() < content.len() {
            let msg = timeout(Duration::from_secs(10), codec::read_frame(&mut peer, 32 * 1024))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(msg.id(), MSG_FILE_RESPOND);
            assert!(msg.len() as usize <= 1024);
            received.extend_from_slice(msg.payload());
        }
        assert_eq!(received, content);
    }

    #[tokio::test]
    async fn test_closed_gate_blocks_file_requests() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("blob.bin"), vec![1u8; 4096]).unwrap();

        let config = Config {
            file_root: dir.path().to_path_buf(),
            ..Config::default()
        };
        let (server, addr) = start_server(config).await;
        server.flow_gate().close();

        let mut peer = TcpStream::connect(addr).await.unwrap();
        let request = codec::encode(&Message::new(MSG_FILE_REQUEST, &b"blob.bin"[..]));
        tokio::io::AsyncWriteExt::write_all(&mut peer, &request)
            .await
            .unwrap();

        // No chunk and no completion marker of any kind arrives.
        let res = timeout(Duration::from_millis(300), codec::read_frame(&mut peer, 32 * 1024)).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_file_respond_from_peer_closes_connection() {
        let (_server, addr) = start_server(Config::default()).await;
        let mut peer = TcpStream::connect(addr).await.unwrap();

        let bogus = codec::encode(&Message::new(MSG_FILE_RESPOND, &b"chunk"[..]));
        tokio::io::AsyncWriteExt::write_all(&mut peer, &bogus)
            .await
            .unwrap();

        let mut buf = [0u8; 1];
        let n = timeout(Duration::from_secs(5), peer.read(&mut buf))
            .await
            .expect("violation should close the connection")
            .unwrap();
        assert_eq!(n, 0);
    }
}
