//! Protocol error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("bad magic number")]
    BadMagic,

    #[error("short buffer: expected at least {expected} bytes, got {got}")]
    ShortBuffer { expected: usize, got: usize },

    #[error("unknown message type: {0}")]
    UnknownType(u8),

    #[error("description is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}
