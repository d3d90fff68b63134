//! Error taxonomy for the wire protocol and connection engine.
//!
//! Every variant is local to one connection; nothing here ever crosses
//! connection boundaries. An unregistered message id is not represented
//! here at all; the router logs it and drops the message.

use std::fmt;
use std::io;

/// Errors surfaced by the frame codec, the dispatch layer, and the
/// file-transfer state machine.
#[derive(Debug)]
pub enum ProtocolError {
    /// Fewer than [`crate::codec::HEADER_LEN`] bytes were available where a
    /// frame header was expected.
    MalformedHeader { len: usize },
    /// A header declared a payload longer than the configured maximum.
    /// Raised before any body allocation or read happens.
    PayloadTooLarge { id: u32, declared: u32, max: u32 },
    /// The peer shut down cleanly at a frame boundary. Ends the inbound
    /// task quietly; not a failure.
    ConnectionClosed,
    /// Unexpected socket or file failure.
    Io(io::Error),
    /// The peer broke the protocol contract (oversized transfer, a message
    /// id this role must never receive). Fatal for the connection.
    Violation(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::MalformedHeader { len } => {
                write!(f, "malformed frame header: need 8 bytes, got {len}")
            }
            ProtocolError::PayloadTooLarge { id, declared, max } => {
                write!(
                    f,
                    "payload too large for msg id {id}: declared {declared} bytes, max {max}"
                )
            }
            ProtocolError::ConnectionClosed => write!(f, "connection closed by peer"),
            ProtocolError::Io(e) => write!(f, "io error: {e}"),
            ProtocolError::Violation(msg) => write!(f, "protocol violation: {msg}"),
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProtocolError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ProtocolError {
    fn from(e: io::Error) -> Self {
        ProtocolError::Io(e)
    }
}

impl ProtocolError {
    /// True for a clean peer shutdown, which ends the inbound task without
    /// an error-level log line.
    pub fn is_clean_close(&self) -> bool {
        matches!(self, ProtocolError::ConnectionClosed)
    }
}
