use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::common::Result;
use crate::modules::transcode::repository::JobStore;

pub const STALE_REASON: &str = "stale: no heartbeat";

/// Fails every `running` job whose heartbeat is older than `older_than`.
pub async fn reap_once(store: &dyn JobStore, older_than: Duration) -> Result<Vec<Uuid>> {
    let reaped = store.fail_stale_jobs(older_than, STALE_REASON).await?;
    for job_id in &reaped {
        warn!(%job_id, "🧹 Failed stale job (no heartbeat for {:?})", older_than);
    }
    Ok(reaped)
}

pub async fn run_reaper(
    store: Arc<dyn JobStore>,
    every: Duration,
    older_than: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("🧹 Stale-job reaper running every {:?}", every);

    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if let Err(e) = reap_once(store.as_ref(), older_than).await {
                    error!("❌ Stale-job sweep failed: {}", e);
                }
            }
        }
    }

    info!("🛑 Stale-job reaper stopped");
}
