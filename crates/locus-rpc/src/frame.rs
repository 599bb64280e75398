//! Message framing.
//!
//! Request frames:
//! `opcode:u16 | request_id:u64 | object_id:u64 | payload_len:u16 | payload`
//!
//! Reply frames (high opcode bit set):
//! `opcode:u16 | request_id:u64 | error:u32 | payload_len:u16 | payload`
//!
//! All integers little-endian; maximum payload 65535 bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use locus_common::{LocusError, LocusResult};

/// Set on the opcode of every reply frame.
pub const REPLY_FLAG: u16 = 1 << 15;

/// Size of a request header in bytes.
pub const REQUEST_HEADER_SIZE: usize = 2 + 8 + 8 + 2;

/// Size of a reply header in bytes.
pub const REPLY_HEADER_SIZE: usize = 2 + 8 + 4 + 2;

/// A parsed frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// An incoming request.
    Request {
        /// Raw opcode (high bit clear).
        opcode: u16,
        /// Correlation id chosen by the sender.
        request_id: u64,
        /// Target object.
        object_id: u64,
        /// Marshalled arguments.
        payload: Bytes,
    },
    /// An incoming reply.
    Reply {
        /// Raw opcode with the reply flag stripped.
        opcode: u16,
        /// Correlation id of the request being answered.
        request_id: u64,
        /// Zero for success, otherwise a wire error code.
        error: u32,
        /// Marshalled results (empty on error).
        payload: Bytes,
    },
}

/// Returns the total size of the first frame in `buf`, if enough bytes
/// have arrived to know it.
#[must_use]
pub fn frame_size(buf: &[u8]) -> Option<usize> {
    if buf.len() < 2 {
        return None;
    }
    let opcode = u16::from_le_bytes([buf[0], buf[1]]);
    let (header, len_offset) = if opcode & REPLY_FLAG != 0 {
        (REPLY_HEADER_SIZE, 2 + 8 + 4)
    } else {
        (REQUEST_HEADER_SIZE, 2 + 8 + 8)
    };
    if buf.len() < header {
        return None;
    }
    let payload_len = u16::from_le_bytes([buf[len_offset], buf[len_offset + 1]]) as usize;
    let total = header + payload_len;
    (buf.len() >= total).then_some(total)
}

/// Parses one complete frame.
pub fn decode(mut frame: Bytes) -> LocusResult<Frame> {
    if frame.len() < 2 {
        return Err(LocusError::malformed("frame shorter than an opcode"));
    }
    let opcode = frame.get_u16_le();
    if opcode & REPLY_FLAG != 0 {
        if frame.remaining() < REPLY_HEADER_SIZE - 2 {
            return Err(LocusError::malformed("truncated reply header"));
        }
        let request_id = frame.get_u64_le();
        let error = frame.get_u32_le();
        let payload_len = frame.get_u16_le() as usize;
        if frame.remaining() != payload_len {
            return Err(LocusError::malformed("reply payload length mismatch"));
        }
        Ok(Frame::Reply {
            opcode: opcode & !REPLY_FLAG,
            request_id,
            error,
            payload: frame,
        })
    } else {
        if frame.remaining() < REQUEST_HEADER_SIZE - 2 {
            return Err(LocusError::malformed("truncated request header"));
        }
        let request_id = frame.get_u64_le();
        let object_id = frame.get_u64_le();
        let payload_len = frame.get_u16_le() as usize;
        if frame.remaining() != payload_len {
            return Err(LocusError::malformed("request payload length mismatch"));
        }
        Ok(Frame::Request {
            opcode,
            request_id,
            object_id,
            payload: frame,
        })
    }
}

/// Builds a request frame.
#[must_use]
pub fn encode_request(opcode: u16, request_id: u64, object_id: u64, payload: &[u8]) -> Bytes {
    debug_assert!(opcode & REPLY_FLAG == 0);
    debug_assert!(payload.len() <= u16::MAX as usize);

    let mut buf = BytesMut::with_capacity(REQUEST_HEADER_SIZE + payload.len());
    buf.put_u16_le(opcode);
    buf.put_u64_le(request_id);
    buf.put_u64_le(object_id);
    buf.put_u16_le(payload.len() as u16);
    buf.put_slice(payload);
    buf.freeze()
}

/// Builds a reply frame. A non-zero error code implies an empty payload.
#[must_use]
pub fn encode_reply(opcode: u16, request_id: u64, error: u32, payload: &[u8]) -> Bytes {
    debug_assert!(payload.len() <= u16::MAX as usize);
    debug_assert!(error == 0 || payload.is_empty());

    let mut buf = BytesMut::with_capacity(REPLY_HEADER_SIZE + payload.len());
    buf.put_u16_le(opcode | REPLY_FLAG);
    buf.put_u64_le(request_id);
    buf.put_u32_le(error);
    buf.put_u16_le(payload.len() as u16);
    buf.put_slice(payload);
    buf.freeze()
}
