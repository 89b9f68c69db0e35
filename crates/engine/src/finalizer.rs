//! Closes out a run once none of its deliveries can make progress.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use courier_common::error::AppError;
use courier_common::types::RunStatus;

use crate::lease::RunLease;
use crate::store::BroadcastStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// Deliveries remain; the lease was released and the run stays RUNNING.
    StillActive { active: i64 },
    /// The run was cancelled underneath us; only the lease was dropped.
    Cancelled,
    Finished(RunStatus),
    /// Another worker owns the run now.
    LeaseLost,
    NotFound,
}

pub struct RunFinalizer {
    store: Arc<dyn BroadcastStore>,
}

impl RunFinalizer {
    pub fn new(store: Arc<dyn BroadcastStore>) -> Self {
        Self { store }
    }

    pub async fn finalize(
        &self,
        lease: &RunLease,
        now: DateTime<Utc>,
    ) -> Result<FinalizeOutcome, AppError> {
        let Some(run) = self.store.get_run(lease.run_id).await? else {
            return Ok(FinalizeOutcome::NotFound);
        };

        if run.status == RunStatus::Cancelled {
            self.store
                .release_run_lease(lease.run_id, &lease.token, now)
                .await?;
            return Ok(FinalizeOutcome::Cancelled);
        }

        let counts = self.store.refresh_run_counters(lease.run_id).await?;
        if counts.active() > 0 {
            self.store
                .release_run_lease(lease.run_id, &lease.token, now)
                .await?;
            return Ok(FinalizeOutcome::StillActive {
                active: counts.active(),
            });
        }

        let status = if counts.errors() == 0 {
            RunStatus::Completed
        } else {
            RunStatus::CompletedWithErrors
        };

        if !self
            .store
            .finalize_run(lease.run_id, &lease.token, status, now)
            .await?
        {
            tracing::warn!(run_id = lease.run_id, "Lease lost before run could be finalized");
            return Ok(FinalizeOutcome::LeaseLost);
        }

        tracing::info!(
            run_id = lease.run_id,
            status = %status,
            sent = counts.sent,
            failed = counts.failed_permanent,
            unknown = counts.unknown,
            "Broadcast run finished"
        );
        Ok(FinalizeOutcome::Finished(status))
    }
}
