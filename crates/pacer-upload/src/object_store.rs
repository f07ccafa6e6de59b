//! Remote object store collaborator

use crate::error::PutError;
use async_trait::async_trait;
use bytes::Bytes;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `body` under `path`, replacing any existing object
    async fn put(&self, path: &str, body: Bytes) -> Result<(), PutError>;
}
