use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;

use crate::common::{Result, content_type};

pub mod memory;
pub mod s3;

pub use memory::MemoryStorage;
pub use s3::StorageService;

/// The slice of an object store the pipeline needs.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn get_object(&self, key: &str) -> Result<Bytes>;

    async fn put_object(&self, key: &str, body: Bytes, content_type: &str) -> Result<()>;

    /// Downloads `key` into a local file.
    async fn download_to(&self, key: &str, dest: &Path) -> Result<u64> {
        let data = self.get_object(key).await?;
        tokio::fs::write(dest, &data).await?;
        Ok(data.len() as u64)
    }

    /// Uploads a local file, picking the content type from the key.
    async fn upload_file(&self, key: &str, path: &Path) -> Result<()> {
        let data = tokio::fs::read(path).await?;
        self.put_object(key, Bytes::from(data), &content_type::for_key(key))
            .await
    }
}
