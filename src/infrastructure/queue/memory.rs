use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::JobQueue;
use crate::common::Result;

/// In-process stand-in for the Redis list, with the same FIFO and bounded-wait
/// semantics.
pub struct MemoryJobQueue {
    name: String,
    items: Mutex<VecDeque<Vec<u8>>>,
    notify: Notify,
}

impl MemoryJobQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn push(&self, payload: &[u8]) -> Result<()> {
        self.items.lock().await.push_front(payload.to_vec());
        self.notify.notify_one();
        Ok(())
    }

    async fn pop(&self, wait: Duration) -> Result<Option<Vec<u8>>> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(item) = self.items.lock().await.pop_back() {
                return Ok(Some(item));
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }

    async fn len(&self) -> Result<u64> {
        Ok(self.items.lock().await.len() as u64)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
