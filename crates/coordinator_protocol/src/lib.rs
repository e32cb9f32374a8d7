//! Coordinator Wire Protocol
//!
//! Fixed-layout binary messages exchanged between the coordinator and its
//! worker pool.
//!
//! # Header format (16 bytes, little-endian)
//!
//! ```text
//! [MAGIC:4][TYPE:1][WORKER_ID:1][PAYLOAD_LEN:4][RESERVED:6]
//! ```
//!
//! - MAGIC (u32): 0xDEADBEEF
//! - TYPE (u8): MessageType
//! - WORKER_ID (u8)
//! - PAYLOAD_LEN (u32): bytes following the header, not counting it
//! - RESERVED (6 bytes): must be zero

pub mod error;
pub mod messages;

pub use error::{ProtocolError, Result};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Protocol magic number.
pub const MAGIC: u32 = 0xDEAD_BEEF;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 16;

/// Wire message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Register = 1,
    RegisterAck = 2,
    Task = 3,
    Result = 4,
    Error = 5,
    Heartbeat = 6,
    Shutdown = 7,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(MessageType::Register),
            2 => Ok(MessageType::RegisterAck),
            3 => Ok(MessageType::Task),
            4 => Ok(MessageType::Result),
            5 => Ok(MessageType::Error),
            6 => Ok(MessageType::Heartbeat),
            7 => Ok(MessageType::Shutdown),
            other => Err(ProtocolError::UnknownType(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Decoded message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub msg_type: MessageType,
    pub worker_id: u8,
    pub payload_len: u32,
}

/// Encode a header. Never fails for in-range arguments: `worker_id` is a
/// `u8` and `payload_len` a `u32`, both already within the wire range.
pub fn encode_header(msg_type: MessageType, worker_id: u8, payload_len: u32) -> [u8; HEADER_SIZE] {
    let mut buf = [0u8; HEADER_SIZE];
    let mut cursor = Cursor::new(&mut buf[..]);
    // Cursor writes into a fixed-size buffer and cannot fail.
    cursor.write_u32::<LittleEndian>(MAGIC).unwrap();
    cursor.write_u8(msg_type.as_u8()).unwrap();
    cursor.write_u8(worker_id).unwrap();
    cursor.write_u32::<LittleEndian>(payload_len).unwrap();
    cursor.write_all(&[0u8; 6]).unwrap();
    buf
}

/// Decode a header from a 16-byte prefix.
pub fn decode_header(data: &[u8]) -> Result<Header> {
    if data.len() < HEADER_SIZE {
        return Err(ProtocolError::ShortBuffer {
            expected: HEADER_SIZE,
            got: data.len(),
        });
    }

    let mut cursor = Cursor::new(&data[..HEADER_SIZE]);
    // Reads are bounded by the length check above, so these cannot fail.
    let magic = cursor.read_u32::<LittleEndian>().unwrap();
    if magic != MAGIC {
        return Err(ProtocolError::BadMagic);
    }
    let raw_type = cursor.read_u8().unwrap();
    let worker_id = cursor.read_u8().unwrap();
    let payload_len = cursor.read_u32::<LittleEndian>().unwrap();
    // remaining 6 reserved bytes are ignored on read.

    let msg_type = MessageType::from_u8(raw_type)?;

    Ok(Header {
        msg_type,
        worker_id,
        payload_len,
    })
}

// byteorder's Write/Read traits need std::io::Write in scope for write_all.
use std::io::Write as _;
