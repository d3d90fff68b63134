//! Framed TCP messaging with routed handlers and chunked file transfer.
//!
//! The wire unit is a length-prefixed frame: an 8-byte little-endian
//! header (message id, payload length) followed by the payload. Each
//! connection runs a duplex pump: a sole-reader inbound task dispatching
//! frames through a [`router::RouterTable`], and an outbound task draining
//! a bounded FIFO onto the socket. On top of that sit jittered server
//! heartbeats, a gated chunked file responder, and a client-side requester
//! that paces downloads with an exponential arrival process.

pub mod arrival;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod heartbeat;
pub mod message;
pub mod router;
pub mod server;
pub mod transfer;

pub use client::Client;
pub use config::Config;
pub use connection::{ConnectionHandle, ConnectionRegistry};
pub use error::ProtocolError;
pub use message::Message;
pub use router::{Request, Router, RouterTable};
pub use server::Server;
