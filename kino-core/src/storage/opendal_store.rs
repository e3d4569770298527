// Object storage backend built on OpenDAL.
//
// Supports:
// - AWS S3
// - Minio
// - Any S3-compatible storage
// - In-memory storage (development and tests)

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use opendal::{services, EntryMode, ErrorKind, Operator};
use std::time::Duration;

use super::BlobStore;
use crate::config::{StorageBackend, StorageConfig};
use crate::{Error, Result};

/// Blob store backed by an OpenDAL [`Operator`]
#[derive(Clone)]
pub struct OpendalBlobStore {
    operator: Operator,
    /// Public URL prefix for serving (e.g. "https://cdn.example.com").
    /// If unset, presigned temporary URLs are generated.
    public_url_prefix: Option<String>,
}

impl OpendalBlobStore {
    /// Build the store selected by configuration
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        let operator = match config.backend {
            StorageBackend::S3 => {
                tracing::info!(
                    bucket = %config.bucket,
                    endpoint = %config.endpoint,
                    "Initializing S3 blob store"
                );
                let builder = services::S3::default()
                    .endpoint(&config.endpoint)
                    .access_key_id(&config.access_key_id)
                    .secret_access_key(&config.secret_access_key)
                    .bucket(&config.bucket)
                    .region(&config.region);
                Operator::new(builder)?.finish()
            }
            StorageBackend::Memory => {
                tracing::info!("Initializing in-memory blob store");
                Operator::new(services::Memory::default())?.finish()
            }
        };

        Ok(Self::new(operator, config.public_url_prefix.clone()))
    }

    #[must_use]
    pub fn new(operator: Operator, public_url_prefix: Option<String>) -> Self {
        Self {
            operator,
            public_url_prefix: public_url_prefix.map(|p| p.trim_end_matches('/').to_string()),
        }
    }

    /// In-memory store serving objects below `public_url_prefix`
    pub fn memory(public_url_prefix: impl Into<String>) -> Result<Self> {
        let operator = Operator::new(services::Memory::default())?.finish();
        Ok(Self::new(operator, Some(public_url_prefix.into())))
    }

    fn list_into<'a>(&'a self, dir: String, keys: &'a mut Vec<String>) -> BoxFuture<'a, Result<()>> {
        async move {
            let entries = match self.operator.list(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(e.into()),
            };

            for entry in entries {
                let path = entry.path();
                // some services report the listed directory itself
                if path == dir {
                    continue;
                }
                match entry.metadata().mode() {
                    EntryMode::DIR => self.list_into(path.to_string(), keys).await?,
                    _ => keys.push(path.to_string()),
                }
            }
            Ok(())
        }
        .boxed()
    }
}

#[async_trait]
impl BlobStore for OpendalBlobStore {
    async fn get(&self, key: &str) -> Result<Bytes> {
        let buffer = self.operator.read(key).await?;
        let data = buffer.to_bytes();
        tracing::trace!(key = %key, size = data.len(), "Read object");
        Ok(data)
    }

    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> Result<()> {
        let size = data.len();
        if self.operator.info().full_capability().write_with_content_type {
            self.operator
                .write_with(key, data)
                .content_type(content_type)
                .await?;
        } else {
            self.operator.write(key, data).await?;
        }
        tracing::trace!(key = %key, size, content_type, "Wrote object");
        Ok(())
    }

    async fn presigned_url(&self, key: &str, ttl: Duration) -> Result<String> {
        if let Some(prefix) = &self.public_url_prefix {
            return Ok(format!("{prefix}/{}", key.trim_start_matches('/')));
        }
        if !self.operator.info().full_capability().presign_read {
            return Err(Error::Internal(format!(
                "storage backend cannot presign and no public url prefix is configured (key {key})"
            )));
        }
        let request = self.operator.presign_read(key, ttl).await?;
        Ok(request.uri().to_string())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = if prefix.ends_with('/') {
            prefix.to_string()
        } else {
            format!("{prefix}/")
        };
        let mut keys = Vec::new();
        self.list_into(dir, &mut keys).await?;
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            self.operator.delete(key).await?;
        }
        tracing::trace!(count = keys.len(), "Deleted objects");
        Ok(())
    }
}
