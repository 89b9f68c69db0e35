//! Queue processing pipeline.
//!
//! One tick:
//! 1. Recovers stale in-flight deliveries across all runs
//! 2. Claims runs one at a time (`LeaseCoordinator`), never revisiting a run
//!    within the same tick
//! 3. For each run, renews the lease, claims a batch and sends it through the
//!    `DeliveryExecutor`, until the run has nothing due or the tick's batch
//!    budget is spent
//! 4. Sweeps the run and hands it to the `RunFinalizer`

use std::sync::Arc;

use chrono::{DateTime, Utc};

use courier_common::config::BroadcastSettings;
use courier_common::error::AppError;
use courier_common::gateway::MessageGateway;

use crate::clock::TickClock;
use crate::executor::DeliveryExecutor;
use crate::finalizer::{FinalizeOutcome, RunFinalizer};
use crate::lease::{LeaseCoordinator, RunLease};
use crate::recovery::StaleRecoverySweeper;
use crate::store::{BroadcastStore, SubscriberRegistry};

/// Totals for one tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub recovered_runs: u32,
    pub runs_visited: u32,
    pub batches: u32,
    pub sent: u32,
    pub retrying: u32,
    pub failed: u32,
    pub lease_lost: u32,
    pub runs_finished: u32,
}

/// Drives broadcast runs to completion, one bounded tick at a time.
pub struct QueueProcessor {
    store: Arc<dyn BroadcastStore>,
    leases: LeaseCoordinator,
    executor: DeliveryExecutor,
    sweeper: StaleRecoverySweeper,
    finalizer: RunFinalizer,
    batch_size: usize,
    concurrency: usize,
    max_batches_per_tick: usize,
}

impl QueueProcessor {
    pub fn new(
        store: Arc<dyn BroadcastStore>,
        gateway: Arc<dyn MessageGateway>,
        registry: Arc<dyn SubscriberRegistry>,
        settings: &BroadcastSettings,
    ) -> Self {
        Self {
            leases: LeaseCoordinator::new(
                store.clone(),
                settings.run_lease(),
                settings.delivery_lease(),
            ),
            executor: DeliveryExecutor::new(
                store.clone(),
                gateway,
                registry,
                settings.max_attempts,
            ),
            sweeper: StaleRecoverySweeper::new(store.clone(), settings.stale_grace()),
            finalizer: RunFinalizer::new(store.clone()),
            store,
            batch_size: settings.batch_size,
            concurrency: settings.concurrency,
            max_batches_per_tick: settings.max_batches_per_tick,
        }
    }

    pub async fn tick(&self) -> Result<TickReport, AppError> {
        self.tick_at(Utc::now()).await
    }

    /// Run one tick with the clock starting at `now`.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport, AppError> {
        let clock = TickClock::starting_at(now);
        let mut report = TickReport::default();

        let recovered = self.sweeper.sweep(clock.now()).await?;
        report.recovered_runs = recovered.len() as u32;

        let mut budget = self.max_batches_per_tick;
        let mut visited: Vec<i64> = Vec::new();

        while budget > 0 {
            let Some(lease) = self.leases.claim_next_run(clock.now(), &visited).await? else {
                break;
            };
            visited.push(lease.run_id);
            report.runs_visited += 1;

            let run_id = lease.run_id;
            let token = lease.token.clone();
            if let Err(e) = self
                .drive_run(lease, &clock, &mut budget, &mut report)
                .await
            {
                tracing::error!(run_id, error = %e, "Run processing failed");
                if let Err(e) = self
                    .store
                    .release_run_lease(run_id, &token, clock.now())
                    .await
                {
                    tracing::error!(run_id, error = %e, "Failed to release run lease");
                }
            }
        }

        if report.runs_visited > 0 || report.recovered_runs > 0 {
            tracing::info!(
                runs = report.runs_visited,
                batches = report.batches,
                sent = report.sent,
                retrying = report.retrying,
                failed = report.failed,
                finished = report.runs_finished,
                recovered_runs = report.recovered_runs,
                "Broadcast tick complete"
            );
        }

        Ok(report)
    }

    async fn drive_run(
        &self,
        mut lease: RunLease,
        clock: &TickClock,
        budget: &mut usize,
        report: &mut TickReport,
    ) -> Result<(), AppError> {
        let run_id = lease.run_id;
        let Some(run) = self.store.get_run(run_id).await? else {
            return Ok(());
        };

        while *budget > 0 {
            if !self.leases.renew(&mut lease, clock.now()).await? {
                tracing::warn!(run_id, "Run lease lost, abandoning run for this tick");
                return Ok(());
            }

            let batch = self
                .leases
                .claim_batch(run_id, self.batch_size, clock.now())
                .await?;
            if batch.is_empty() {
                break;
            }
            *budget -= 1;
            report.batches += 1;

            let claimed = batch.len();
            let summary = self
                .executor
                .process_batch(batch, &run.message, self.concurrency, *clock)
                .await;
            report.sent += summary.sent;
            report.retrying += summary.retrying;
            report.failed += summary.failed;
            report.lease_lost += summary.lease_lost;

            let counts = self.store.refresh_run_counters(run_id).await?;
            tracing::debug!(
                run_id,
                claimed,
                sent = summary.sent,
                pending = counts.active(),
                "Processed delivery batch"
            );
        }

        self.sweeper.sweep_run(run_id, clock.now()).await?;

        if let FinalizeOutcome::Finished(_) = self.finalizer.finalize(&lease, clock.now()).await? {
            report.runs_finished += 1;
        }
        Ok(())
    }
}
