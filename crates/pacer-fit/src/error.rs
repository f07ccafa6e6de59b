//! Error types for the FIT encoder and reader

use pacer_core::InvalidReading;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EncodeError {
    #[error("Encoder already finalized")]
    AlreadyFinalized,

    #[error("Invalid reading: {0}")]
    InvalidReading(#[from] InvalidReading),

    #[error("Data section of {0} bytes exceeds the FIT size limit")]
    TooLarge(usize),
}

pub type EncodeResult<T> = Result<T, EncodeError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("File too short: {0} bytes")]
    TooShort(usize),

    #[error("Invalid header: {0}")]
    BadHeader(String),

    #[error("Header CRC mismatch: stored {stored:#06x}, computed {computed:#06x}")]
    HeaderCrc { stored: u16, computed: u16 },

    #[error("File CRC mismatch: stored {stored:#06x}, computed {computed:#06x}")]
    FileCrc { stored: u16, computed: u16 },

    #[error("Truncated at offset {offset}")]
    Truncated { offset: usize },

    #[error("{0} unexpected bytes after the file CRC")]
    TrailingData(usize),

    #[error("Data message at offset {offset} uses undefined local message {local}")]
    UndefinedLocal { local: u8, offset: usize },

    #[error("Unsupported: {0}")]
    Unsupported(String),
}

pub type DecodeResult<T> = Result<T, DecodeError>;
