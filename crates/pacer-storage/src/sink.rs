//! Destinations for flushed chunks

use crate::atomic_writer::write_atomic;
use crate::checkpoint::write_checkpoint;
use crate::chunk_file::encode_chunk;
use crate::error::{StorageError, StorageResult};
use crate::layout::SessionPaths;
use async_trait::async_trait;
use pacer_core::{Checkpoint, Chunk};

/// Durable destination of one session's chunks and checkpoints
#[async_trait]
pub trait ChunkSink: Send + Sync {
    /// Durably write a chunk, returning the hex digest of its payload
    async fn write_chunk(&self, chunk: &Chunk) -> StorageResult<String>;

    /// Durably write a checkpoint; called only after its chunk is durable
    async fn write_checkpoint(&self, checkpoint: &Checkpoint) -> StorageResult<()>;
}

/// Chunk files in the session directory, written off the async runtime
pub struct FsChunkSink {
    paths: SessionPaths,
}

impl FsChunkSink {
    pub fn new(paths: SessionPaths) -> Self {
        Self { paths }
    }
}

async fn blocking<T, F>(f: F) -> StorageResult<T>
where
    F: FnOnce() -> StorageResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StorageError::Io(std::io::Error::other(e)))?
}

#[async_trait]
impl ChunkSink for FsChunkSink {
    async fn write_chunk(&self, chunk: &Chunk) -> StorageResult<String> {
        let encoded = encode_chunk(chunk)?;
        let path = self.paths.chunk(chunk.sequence);
        let digest = encoded.digest.clone();
        blocking(move || write_atomic(path, &encoded.bytes)).await?;
        Ok(digest)
    }

    async fn write_checkpoint(&self, checkpoint: &Checkpoint) -> StorageResult<()> {
        let paths = self.paths.clone();
        let checkpoint = checkpoint.clone();
        blocking(move || write_checkpoint(&paths, &checkpoint)).await
    }
}
