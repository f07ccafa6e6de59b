//! Pacer FIT Encoder
//!
//! Streams a recording into a FIT activity file:
//! - One record message per second, last write wins per field
//! - Definitions written only when a message shape is not bound to a slot
//! - Streaming CRC combined with the header CRC at finalize
//! - Lap, session and activity summaries from the metrics snapshot
//!
//! A verifying reader checks artifacts before upload and in tests.

pub mod crc;
pub mod decoder;
pub mod definition;
pub mod encoder;
pub mod error;
pub mod message;
pub mod profile;

pub use decoder::{DecodedField, DecodedMessage, FitFile, FitHeader, decode, validate};
pub use encoder::{FitArtifact, FitEncoder};
pub use error::{DecodeError, DecodeResult, EncodeError, EncodeResult};
