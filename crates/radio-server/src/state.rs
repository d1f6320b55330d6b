//! Shared server state and background maintenance.

use chrono::{DateTime, Utc};
use radio_core::{Broker, StoreStats};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// State shared by every request handler
#[derive(Debug)]
pub struct AppState {
    /// The broker every request is handed to
    pub broker: Arc<Broker>,

    /// When the server started
    pub started_at: DateTime<Utc>,
}

/// Snapshot reported by the health endpoint
#[derive(Debug, Clone, serde::Serialize)]
pub struct StateStats {
    pub uptime_secs: i64,
    pub jobs: StoreStats,
}

impl AppState {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self {
            broker,
            started_at: Utc::now(),
        }
    }

    pub async fn get_stats(&self) -> radio_core::Result<StateStats> {
        Ok(StateStats {
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
            jobs: self.broker.stats().await?,
        })
    }

    /// Run one eviction pass over finished jobs.
    pub async fn cleanup(&self) {
        match self.broker.evict_expired().await {
            Ok(0) => debug!("Retention sweep found nothing to evict"),
            Ok(evicted) => info!("Retention sweep evicted {} jobs", evicted),
            Err(e) => warn!("Retention sweep failed: {}", e),
        }
    }
}

/// Periodically evict expired jobs until the returned task is aborted.
pub fn spawn_cleanup_task(state: Arc<AppState>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);

        loop {
            interval.tick().await;
            state.cleanup().await;
        }
    })
}
