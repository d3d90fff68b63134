//! Message-id-keyed dispatch.
//!
//! Each message id maps to a three-phase handler (pre/handle/post) run in
//! that fixed order, synchronously on the connection's inbound task.
//! Handlers communicate by enqueueing outbound messages through the
//! request's connection handle, never by return value.

use crate::connection::ConnectionHandle;
use crate::error::ProtocolError;
use crate::message::{msg_name, Message};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// One inbound message plus the handle of the connection it arrived on.
pub struct Request {
    pub conn: ConnectionHandle,
    pub message: Message,
}

impl Request {
    pub fn msg_id(&self) -> u32 {
        self.message.id()
    }

    pub fn payload(&self) -> &[u8] {
        self.message.payload()
    }
}

/// Three-phase message handler. All phases default to no-ops, so an
/// implementation overrides only what it needs.
#[async_trait]
pub trait Router: Send + Sync {
    async fn pre_handle(&self, _req: &Request) {}
    async fn handle(&self, _req: &Request) {}
    async fn post_handle(&self, _req: &Request) {}
}

enum Route {
    Handler(Arc<dyn Router>),
    /// This role must never receive the id; dispatching to it is fatal.
    Rejected,
}

/// Registry mapping message ids to handlers.
#[derive(Default)]
pub struct RouterTable {
    routes: HashMap<u32, Route>,
}

impl RouterTable {
    pub fn new() -> Self {
        RouterTable {
            routes: HashMap::new(),
        }
    }

    /// Register a handler for `id`, replacing any previous registration.
    pub fn register(&mut self, id: u32, router: impl Router + 'static) {
        self.routes.insert(id, Route::Handler(Arc::new(router)));
    }

    /// Mark `id` as a message this role never receives. Dispatching to a
    /// rejected id closes the connection.
    pub fn reject(&mut self, id: u32) {
        self.routes.insert(id, Route::Rejected);
    }

    /// Route one request to its handler, running pre/handle/post in order
    /// on the calling task.
    ///
    /// An unregistered id is reported and dropped, so partial deployments
    /// that only wire up some ids keep working. A rejected id is a
    /// protocol violation.
    pub async fn dispatch(&self, req: &Request) -> Result<(), ProtocolError> {
        match self.routes.get(&req.msg_id()) {
            None => {
                warn!(
                    conn = req.conn.id(),
                    msg_id = req.msg_id(),
                    "no router registered for message id, dropping"
                );
                Ok(())
            }
            Some(Route::Rejected) => Err(ProtocolError::Violation(format!(
                "received {} (id {}), which this side never accepts",
                msg_name(req.msg_id()),
                req.msg_id()
            ))),
            Some(Route::Handler(router)) => {
                router.pre_handle(req).await;
                router.handle(req).await;
                router.post_handle(req).await;
                Ok(())
            }
        }
    }
}
