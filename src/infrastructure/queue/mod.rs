use std::time::Duration;

use async_trait::async_trait;

use crate::common::Result;

pub mod memory;
pub mod redis_list;

pub use memory::MemoryJobQueue;
pub use redis_list::RedisJobQueue;

/// Transport for job descriptors. Payloads stay raw bytes so that consumers
/// decide what is undecodable.
#[async_trait]
pub trait JobQueue: Send + Sync {
    fn name(&self) -> &str;

    async fn push(&self, payload: &[u8]) -> Result<()>;

    /// Waits at most `wait` for an item; `None` on timeout.
    async fn pop(&self, wait: Duration) -> Result<Option<Vec<u8>>>;

    async fn len(&self) -> Result<u64>;

    async fn ping(&self) -> Result<()>;
}
