use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;

use super::ObjectStorage;
use crate::common::{PipelineError, Result};

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub body: Bytes,
    pub content_type: String,
}

/// Process-local object store for tests and local runs.
#[derive(Default)]
pub struct MemoryStorage {
    objects: Mutex<HashMap<String, StoredObject>>,
    denied_prefixes: Mutex<Vec<String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later write under `prefix` fail.
    pub async fn deny_writes(&self, prefix: impl Into<String>) {
        self.denied_prefixes.lock().await.push(prefix.into());
    }

    pub async fn object(&self, key: &str) -> Option<StoredObject> {
        self.objects.lock().await.get(key).cloned()
    }

    pub async fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .lock()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ObjectStorage for MemoryStorage {
    async fn get_object(&self, key: &str) -> Result<Bytes> {
        self.objects
            .lock()
            .await
            .get(key)
            .map(|o| o.body.clone())
            .ok_or_else(|| PipelineError::storage_read(key, "no such key"))
    }

    async fn put_object(&self, key: &str, body: Bytes, content_type: &str) -> Result<()> {
        let denied = self
            .denied_prefixes
            .lock()
            .await
            .iter()
            .any(|p| key.starts_with(p.as_str()));
        if denied {
            return Err(PipelineError::storage_write(key, "write denied"));
        }

        self.objects.lock().await.insert(
            key.to_string(),
            StoredObject {
                body,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }
}
