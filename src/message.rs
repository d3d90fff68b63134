//! Application-level message unit: an id tag, a declared length, and the
//! payload bytes. One message maps to exactly one wire frame.

use bytes::Bytes;

/// Jittered keepalive, sent on a per-connection timer and answered
/// immediately by the peer.
pub const MSG_HEARTBEAT: u32 = 0;
/// Free-form text message, logged on receipt.
pub const MSG_GENERAL: u32 = 1;
/// Echo-style request; the receiver answers with its own `MSG_PING`.
pub const MSG_PING: u32 = 2;
/// File download request; the payload is the file name.
pub const MSG_FILE_REQUEST: u32 = 3;
/// One chunk of file bytes; the payload is the chunk.
pub const MSG_FILE_RESPOND: u32 = 4;

/// Human-readable tag for log lines.
pub fn msg_name(id: u32) -> &'static str {
    match id {
        MSG_HEARTBEAT => "HEARTBEAT",
        MSG_GENERAL => "GENERAL_MSG",
        MSG_PING => "PING",
        MSG_FILE_REQUEST => "FILE_REQUEST",
        MSG_FILE_RESPOND => "FILE_RESPOND",
        _ => "UNKNOWN",
    }
}

/// A decoded message. Immutable once constructed; `len` always equals
/// `payload.len()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    id: u32,
    len: u32,
    payload: Bytes,
}

impl Message {
    /// Build a message, deriving the declared length from the payload.
    ///
    /// Panics if the payload does not fit in a `u32` length field; all
    /// payloads in this protocol are bounded far below that by the
    /// configured frame and chunk limits.
    pub fn new(id: u32, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        let len = u32::try_from(payload.len()).expect("payload length exceeds u32");
        Message { id, len, payload }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consume the message, keeping only the payload.
    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}
