//! Retention cleanup for finished runs.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use courier_common::error::AppError;

use crate::store::BroadcastStore;

pub struct RetentionPurger {
    store: Arc<dyn BroadcastStore>,
    retention: Duration,
}

impl RetentionPurger {
    pub fn new(store: Arc<dyn BroadcastStore>, retention: Duration) -> Self {
        Self { store, retention }
    }

    /// Delete terminal runs (and their deliveries) that finished strictly
    /// before `now - retention`.
    pub async fn purge(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let cutoff = now - self.retention;
        let purged = self.store.purge_terminal_runs(cutoff).await?;
        if purged > 0 {
            tracing::info!(purged, cutoff = %cutoff, "Purged old broadcast runs");
        }
        Ok(purged)
    }
}
