//! Stale delivery recovery.
//!
//! A PROCESSING row whose lease expired more than `grace` ago belongs to a
//! worker that died mid-send. The message may or may not have gone out, so the
//! row becomes UNKNOWN and is never retried automatically.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use courier_common::error::AppError;

use crate::store::BroadcastStore;

pub const STALE_DELIVERY_ERROR: &str =
    "lease expired while processing; delivery outcome unknown";

pub struct StaleRecoverySweeper {
    store: Arc<dyn BroadcastStore>,
    grace: Duration,
}

impl StaleRecoverySweeper {
    pub fn new(store: Arc<dyn BroadcastStore>, grace: Duration) -> Self {
        Self { store, grace }
    }

    /// Sweep every run. Returns the ids of runs that had rows recovered.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<Vec<i64>, AppError> {
        self.recover(None, now).await
    }

    /// Sweep a single run.
    pub async fn sweep_run(&self, run_id: i64, now: DateTime<Utc>) -> Result<bool, AppError> {
        Ok(!self.recover(Some(run_id), now).await?.is_empty())
    }

    async fn recover(
        &self,
        run_id: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>, AppError> {
        let cutoff = now - self.grace;
        let touched = self
            .store
            .recover_stale_deliveries(cutoff, run_id, now)
            .await?;

        for id in &touched {
            let counts = self.store.refresh_run_counters(*id).await?;
            tracing::warn!(
                run_id = id,
                unknown = counts.unknown,
                "Recovered stale deliveries as UNKNOWN"
            );
        }

        Ok(touched)
    }
}
