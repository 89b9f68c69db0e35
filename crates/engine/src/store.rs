//! Broadcast persistence contract.
//!
//! Every mutation that matters for correctness is a single conditional update
//! scoped by an expected prior state and, where a lease is involved, by the
//! lock token. Implementations report whether the guard matched instead of
//! raising, so callers can treat "someone else got there first" as a normal
//! outcome.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use courier_common::error::AppError;
use courier_common::types::{
    BroadcastDelivery, BroadcastRun, DeliveryFilter, DeliveryStatus, DeliveryView, Page,
    PageRequest, Recipient, RunStatus, StatusCounts,
};

use crate::resolver::TargetSpec;

/// Everything needed to open a run.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub message: String,
    pub kind: String,
    pub target: TargetSpec,
    pub requested_by: Option<i64>,
    pub recipient_limit: Option<usize>,
}

/// A time-boxed ownership claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// A run eligible for claiming, as observed at selection time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::FromRow)]
pub struct RunCandidate {
    pub id: i64,
    pub status: RunStatus,
}

/// Outcome write for a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    /// Either `FailedRetryable` or `FailedPermanent`.
    pub status: DeliveryStatus,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    NotFound,
    AlreadyTerminal(RunStatus),
    Cancelled {
        cancelled_pending: u64,
        marked_unknown: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueOutcome {
    NotFound,
    Running,
    Requeued(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    NotFound,
    Active(RunStatus),
    Deleted,
}

/// Error recorded on deliveries cancelled before they were attempted.
pub const CANCELLED_ERROR: &str = "cancelled by admin";

/// Error recorded on in-flight deliveries when their run is cancelled.
pub const CANCELLED_IN_FLIGHT_ERROR: &str =
    "run cancelled while the send was in flight; outcome unknown";

/// Error text stored on delivery rows is capped at this many characters.
pub const MAX_ERROR_CHARS: usize = 1000;

/// Truncate on a char boundary.
pub fn truncate_error(error: &str) -> String {
    match error.char_indices().nth(MAX_ERROR_CHARS) {
        Some((idx, _)) => error[..idx].to_string(),
        None => error.to_string(),
    }
}

#[async_trait]
pub trait BroadcastStore: Send + Sync {
    // ---- runs -------------------------------------------------------------

    /// Open a run, resolve its recipients and insert one delivery per distinct
    /// chat id, all in one transaction. A run that resolves to nobody is
    /// returned already COMPLETED.
    async fn create_run(&self, run: &NewRun, now: DateTime<Utc>)
    -> Result<BroadcastRun, AppError>;

    async fn get_run(&self, run_id: i64) -> Result<Option<BroadcastRun>, AppError>;

    async fn list_runs(&self, page: PageRequest) -> Result<Page<BroadcastRun>, AppError>;

    async fn list_deliveries(
        &self,
        run_id: i64,
        filter: DeliveryFilter,
        page: PageRequest,
    ) -> Result<Page<DeliveryView>, AppError>;

    /// Live aggregate over the run's delivery rows.
    async fn delivery_counts(&self, run_id: i64) -> Result<StatusCounts, AppError>;

    /// Recompute the counter cache on the run row from its deliveries.
    async fn refresh_run_counters(&self, run_id: i64) -> Result<StatusCounts, AppError>;

    /// Delete a run (and its deliveries) unless it is QUEUED or RUNNING.
    async fn delete_run(&self, run_id: i64) -> Result<DeleteOutcome, AppError>;

    // ---- run lease --------------------------------------------------------

    /// QUEUED runs first, then RUNNING runs whose lease is absent or expired,
    /// each group oldest first.
    async fn find_run_candidates(
        &self,
        now: DateTime<Utc>,
        exclude: &[i64],
        limit: i64,
    ) -> Result<Vec<RunCandidate>, AppError>;

    /// Conditionally move the candidate to RUNNING under `lease`.
    async fn try_claim_run(
        &self,
        run_id: i64,
        lease: &Lease,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError>;

    /// Extend the lease; fails if the token no longer matches.
    async fn renew_run_lease(
        &self,
        run_id: i64,
        lease: &Lease,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError>;

    /// Drop the lease without touching status.
    async fn release_run_lease(
        &self,
        run_id: i64,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError>;

    /// Move a RUNNING run to a terminal status and clear its lease.
    async fn finalize_run(
        &self,
        run_id: i64,
        token: &str,
        status: RunStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError>;

    // ---- delivery lease ---------------------------------------------------

    /// Due PENDING / FAILED_RETRYABLE deliveries with no live lease, by id.
    async fn find_delivery_candidates(
        &self,
        run_id: i64,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<i64>, AppError>;

    /// Conditionally move one delivery to PROCESSING under `lease`.
    async fn try_claim_delivery(
        &self,
        delivery_id: i64,
        lease: &Lease,
        now: DateTime<Utc>,
    ) -> Result<Option<BroadcastDelivery>, AppError>;

    async fn record_sent(
        &self,
        delivery_id: i64,
        token: &str,
        gateway_message_id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError>;

    async fn record_failure(
        &self,
        delivery_id: i64,
        token: &str,
        failure: &FailureRecord,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError>;

    // ---- recovery & admin transitions -------------------------------------

    /// Move PROCESSING deliveries whose lease expired before `cutoff` to
    /// UNKNOWN. `run_id` narrows the sweep to one run. Returns the ids of the
    /// runs that were touched.
    async fn recover_stale_deliveries(
        &self,
        cutoff: DateTime<Utc>,
        run_id: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>, AppError>;

    async fn cancel_run(&self, run_id: i64, now: DateTime<Utc>) -> Result<CancelOutcome, AppError>;

    async fn requeue_unknown(
        &self,
        run_id: i64,
        now: DateTime<Utc>,
    ) -> Result<RequeueOutcome, AppError>;

    /// Delete terminal runs finished strictly before `cutoff`.
    async fn purge_terminal_runs(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError>;
}

/// Channel subscriber registry maintained by the bot.
#[async_trait]
pub trait SubscriberRegistry: Send + Sync {
    async fn active_subscribers(&self) -> Result<Vec<Recipient>, AppError>;

    /// Returns true if an active subscriber was deactivated.
    async fn mark_inactive(&self, chat_id: &str) -> Result<bool, AppError>;
}
