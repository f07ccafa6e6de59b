//! Chunk file framing
//!
//! ```text
//! "PCHK" | version: u8 | payload length: u32 LE | SHA-256(payload): 32 bytes | JSON payload
//! ```

use crate::error::{StorageError, StorageResult};
use bytes::{BufMut, Bytes, BytesMut};
use pacer_core::Chunk;
use sha2::{Digest, Sha256};

pub const MAGIC: &[u8; 4] = b"PCHK";
pub const VERSION: u8 = 1;
const HEADER_LEN: usize = 4 + 1 + 4 + 32;

/// A framed chunk ready to be written, with the hex digest of its payload
#[derive(Debug, Clone)]
pub struct EncodedChunk {
    pub bytes: Bytes,
    pub digest: String,
}

pub fn encode_chunk(chunk: &Chunk) -> StorageResult<EncodedChunk> {
    let payload = serde_json::to_vec(chunk)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| StorageError::InvalidData(format!("chunk payload of {} bytes", payload.len())))?;
    let digest = Sha256::digest(&payload);

    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_slice(MAGIC);
    buf.put_u8(VERSION);
    buf.put_u32_le(len);
    buf.put_slice(&digest);
    buf.put_slice(&payload);

    Ok(EncodedChunk {
        bytes: buf.freeze(),
        digest: hex::encode(digest),
    })
}

/// Parse and verify a framed chunk, returning it with its payload digest
pub fn decode_chunk(data: &[u8]) -> StorageResult<(Chunk, String)> {
    if data.len() < HEADER_LEN {
        return Err(StorageError::InvalidData(format!(
            "chunk file of {} bytes is shorter than its header",
            data.len()
        )));
    }
    if &data[..4] != MAGIC {
        return Err(StorageError::InvalidData("bad chunk magic".to_string()));
    }
    if data[4] != VERSION {
        return Err(StorageError::InvalidData(format!(
            "unsupported chunk version {}",
            data[4]
        )));
    }

    let len = u32::from_le_bytes([data[5], data[6], data[7], data[8]]) as usize;
    let expected_digest = &data[9..HEADER_LEN];
    let payload = &data[HEADER_LEN..];
    if payload.len() != len {
        return Err(StorageError::InvalidData(format!(
            "chunk payload is {} bytes, header says {}",
            payload.len(),
            len
        )));
    }

    let digest = Sha256::digest(payload);
    if digest.as_slice() != expected_digest {
        return Err(StorageError::InvalidData("chunk digest mismatch".to_string()));
    }

    let chunk = serde_json::from_slice(payload)?;
    Ok((chunk, hex::encode(digest)))
}
