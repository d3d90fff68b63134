//! Wire frame codec.
//!
//! A frame is a fixed 8-byte little-endian header (message id, declared
//! payload length) followed by exactly that many payload bytes. Header and
//! body are read in two ordered steps over the same reader, so the inbound
//! task is always the sole reader and frames never interleave.

use crate::error::ProtocolError;
use crate::message::Message;
use bytes::{BufMut, Bytes, BytesMut};
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Fixed header length: message id (4 bytes) + declared length (4 bytes).
pub const HEADER_LEN: usize = 8;

/// Serialize a message into a single contiguous frame.
pub fn encode(msg: &Message) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + msg.payload().len());
    buf.put_u32_le(msg.id());
    buf.put_u32_le(msg.len());
    buf.extend_from_slice(msg.payload());
    buf.freeze()
}

/// Parse a frame header into (message id, declared length).
pub fn decode_header(buf: &[u8]) -> Result<(u32, u32), ProtocolError> {
    if buf.len() < HEADER_LEN {
        return Err(ProtocolError::MalformedHeader { len: buf.len() });
    }
    let id = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let len = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    Ok((id, len))
}

/// Read one full frame: header first, then exactly the declared number of
/// payload bytes.
///
/// The declared length is checked against `max_len` before the body buffer
/// is allocated, so a hostile or corrupt peer cannot force a huge
/// allocation. EOF on the header boundary is a clean close
/// ([`ProtocolError::ConnectionClosed`]); EOF mid-body is an I/O error.
pub async fn read_frame<R>(reader: &mut R, max_len: u32) -> Result<Message, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    if let Err(e) = reader.read_exact(&mut header).await {
        if e.kind() == ErrorKind::UnexpectedEof {
            return Err(ProtocolError::ConnectionClosed);
        }
        return Err(ProtocolError::Io(e));
    }

    let (id, len) = decode_header(&header)?;
    if len > max_len {
        return Err(ProtocolError::PayloadTooLarge {
            id,
            declared: len,
            max: max_len,
        });
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Message::new(id, payload))
}
