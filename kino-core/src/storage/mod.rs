//! Object storage used for uploaded sources and generated HLS output

mod opendal_store;

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

use crate::Result;

pub use opendal_store::OpendalBlobStore;

/// Content type for HLS playlists
pub const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
/// Content type for MPEG-TS segments
pub const SEGMENT_CONTENT_TYPE: &str = "video/mp2t";

/// Blob store contract consumed by the transcode pipeline
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Read a whole object. Missing objects yield `Error::NotFound`.
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Create or overwrite an object
    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> Result<()>;

    /// Time-limited URL for reading `key` directly
    async fn presigned_url(&self, key: &str, ttl: Duration) -> Result<String>;

    /// Every object key below `prefix`, recursively
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Delete the given keys. Keys that do not exist are ignored.
    async fn delete(&self, keys: &[String]) -> Result<()>;
}
