use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::{debug, warn};

use super::JobQueue;
use crate::common::Result;
use crate::infrastructure::redis::client::RedisService;

/// FIFO job queue on a Redis list: producers `LPUSH`, consumers `BRPOP`.
#[derive(Clone)]
pub struct RedisJobQueue {
    redis: RedisService,
    name: String,
}

impl RedisJobQueue {
    pub fn new(redis: RedisService, name: impl Into<String>) -> Self {
        Self {
            redis,
            name: name.into(),
        }
    }

    async fn push_internal(&self, payload: &[u8]) -> Result<()> {
        let mut conn = self.redis.get_conn().await?;
        conn.lpush::<_, _, ()>(&self.name, payload).await?;
        Ok(())
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn push(&self, payload: &[u8]) -> Result<()> {
        if let Err(e) = self.push_internal(payload).await {
            warn!("Redis push failed: {}. Retrying on a fresh connection.", e);
            self.push_internal(payload).await?;
        }
        debug!("Pushed {} bytes onto '{}'", payload.len(), self.name);
        Ok(())
    }

    async fn pop(&self, wait: Duration) -> Result<Option<Vec<u8>>> {
        let mut conn = self.redis.get_conn().await?;
        // BRPOP treats 0 as "block forever"; keep the wait bounded.
        let timeout = wait.as_secs_f64().max(0.01);
        let item: Option<(String, Vec<u8>)> = conn.brpop(&self.name, timeout).await?;
        Ok(item.map(|(_, payload)| payload))
    }

    async fn len(&self) -> Result<u64> {
        let mut conn = self.redis.get_conn().await?;
        Ok(conn.llen(&self.name).await?)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.redis.get_conn().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}
