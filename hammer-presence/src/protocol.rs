//! Length-prefixed binary framing for the presence IPC channel.
//!
//! Wire format (little endian):
//! ```text
//! ┌──────────┬──────────┬──────────────────────────┐
//! │ opcode   │ length   │ payload (UTF-8 JSON)     │
//! │ 4 bytes  │ 4 bytes  │ `length` bytes           │
//! └──────────┴──────────┴──────────────────────────┘
//! ```
//!
//! `Ping`/`Pong` frames may carry an empty payload. A frame never exceeds
//! [`MAX_FRAME_SIZE`] bytes including the header, matching the block size of
//! the companion's pipe.

use thiserror::Error;

/// Size of the fixed frame header in bytes.
pub const HEADER_SIZE: usize = 8;

/// Largest frame (header + payload) either side will exchange.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Largest payload that fits into a single frame.
pub const MAX_PAYLOAD_SIZE: usize = MAX_FRAME_SIZE - HEADER_SIZE;

/// Largest serialized outbound message kept in a queue slot.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024;

/// Frame opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Opcode {
    /// Client hello carrying the protocol version and application id
    Handshake = 0,
    /// JSON command or dispatch
    Frame = 1,
    /// Peer is closing the channel; payload carries `code`/`message`
    Close = 2,
    /// Keepalive request, must be echoed as `Pong`
    Ping = 3,
    /// Keepalive response
    Pong = 4,
}

impl Opcode {
    /// Map a raw wire value to an opcode, `None` for unknown values.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Handshake),
            1 => Some(Self::Frame),
            2 => Some(Self::Close),
            3 => Some(Self::Ping),
            4 => Some(Self::Pong),
            _ => None,
        }
    }
}

/// Fixed header preceding every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Raw opcode; kept as `u32` so unknown values survive decoding
    pub opcode: u32,
    /// Payload length in bytes
    pub length: u32,
}

impl FrameHeader {
    pub fn new(opcode: Opcode, length: u32) -> Self {
        Self {
            opcode: opcode as u32,
            length,
        }
    }

    /// Decoded opcode, `None` when the peer sent an unknown value.
    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_u32(self.opcode)
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[..4].copy_from_slice(&self.opcode.to_le_bytes());
        bytes[4..].copy_from_slice(&self.length.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Self {
        let opcode = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let length = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Self { opcode, length }
    }
}

/// Encode a complete frame (header followed by payload) into one buffer so
/// the transport sees a single write.
pub fn encode_frame(opcode: Opcode, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(FrameError::PayloadTooLarge {
            max: MAX_PAYLOAD_SIZE,
            actual: payload.len(),
        });
    }
    let header = FrameHeader::new(opcode, payload.len() as u32);
    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Split a complete frame buffer into its header and payload.
pub fn decode_frame(bytes: &[u8]) -> Result<(FrameHeader, &[u8]), FrameError> {
    let header_bytes: &[u8; HEADER_SIZE] = bytes
        .get(..HEADER_SIZE)
        .and_then(|h| h.try_into().ok())
        .ok_or(FrameError::TooShort {
            expected: HEADER_SIZE,
            actual: bytes.len(),
        })?;
    let header = FrameHeader::from_bytes(header_bytes);
    let length = header.length as usize;
    if length > MAX_PAYLOAD_SIZE {
        return Err(FrameError::PayloadTooLarge {
            max: MAX_PAYLOAD_SIZE,
            actual: length,
        });
    }
    let payload = bytes
        .get(HEADER_SIZE..HEADER_SIZE + length)
        .ok_or(FrameError::TooShort {
            expected: HEADER_SIZE + length,
            actual: bytes.len(),
        })?;
    Ok((header, payload))
}

/// Framing errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame too short: expected {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },
    #[error("Frame payload too large: max {max}, got {actual}")]
    PayloadTooLarge { max: usize, actual: usize },
}
