//! Admin-facing run operations: enqueue, inspect, cancel, repost, requeue,
//! delete.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use courier_common::config::BroadcastSettings;
use courier_common::error::AppError;
use courier_common::types::{
    BroadcastRun, DeliveryFilter, DeliveryView, Page, PageRequest, RunStatus, RunTarget,
    StatusCounts,
};

use crate::resolver::TargetSpec;
use crate::scheduler::TickTrigger;
use crate::store::{BroadcastStore, CancelOutcome, DeleteOutcome, NewRun, RequeueOutcome};

pub const DEFAULT_KIND: &str = "general";

/// Enqueue request as accepted by the admin API.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueRequest {
    pub message: String,
    pub kind: Option<String>,
    pub target: Option<RunTarget>,
    pub role: Option<String>,
    pub user_ids: Option<Vec<i64>>,
    pub limit: Option<i64>,
    pub requested_by: Option<i64>,
}

/// A run plus live per-status counts.
#[derive(Debug, Clone, Serialize)]
pub struct RunDetail {
    pub run: BroadcastRun,
    pub counts: StatusCounts,
}

pub struct RunManager {
    store: Arc<dyn BroadcastStore>,
    trigger: Option<TickTrigger>,
    max_message_chars: usize,
    max_target_users: usize,
}

impl RunManager {
    pub fn new(store: Arc<dyn BroadcastStore>, settings: &BroadcastSettings) -> Self {
        Self {
            store,
            trigger: None,
            max_message_chars: settings.max_message_chars,
            max_target_users: settings.max_target_users,
        }
    }

    /// Kick the queue processor after enqueue and requeue.
    pub fn with_trigger(mut self, trigger: TickTrigger) -> Self {
        self.trigger = Some(trigger);
        self
    }

    fn kick(&self) {
        if let Some(trigger) = &self.trigger {
            trigger.fire();
        }
    }

    /// Validate the request into a `NewRun`.
    pub fn validate(&self, req: EnqueueRequest) -> Result<NewRun, AppError> {
        let message = req.message.trim();
        if message.is_empty() {
            return Err(AppError::Validation("Message must not be empty".into()));
        }
        let chars = message.chars().count();
        if chars > self.max_message_chars {
            return Err(AppError::Validation(format!(
                "Message is {} characters; the maximum is {}",
                chars, self.max_message_chars
            )));
        }

        let kind = req
            .kind
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .unwrap_or(DEFAULT_KIND)
            .to_string();

        let target = match req.target {
            None => return Err(AppError::Validation("Target is required".into())),
            Some(RunTarget::All) => TargetSpec::All,
            Some(RunTarget::Vip) => TargetSpec::Vip,
            Some(RunTarget::ChannelSubscribers) => TargetSpec::ChannelSubscribers,
            Some(RunTarget::Role) => {
                let role = req.role.as_deref().map(str::trim).unwrap_or_default();
                if role.is_empty() {
                    return Err(AppError::Validation(
                        "Role is required for ROLE target".into(),
                    ));
                }
                TargetSpec::Role(role.to_string())
            }
            Some(RunTarget::Users) => {
                let mut seen = HashSet::new();
                let ids: Vec<i64> = req
                    .user_ids
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|id| seen.insert(*id))
                    .collect();
                if ids.is_empty() {
                    return Err(AppError::Validation(
                        "userIds must not be empty for USERS target".into(),
                    ));
                }
                if ids.len() > self.max_target_users {
                    return Err(AppError::Validation(format!(
                        "Too many user ids: {} (max {})",
                        ids.len(),
                        self.max_target_users
                    )));
                }
                TargetSpec::Users(ids)
            }
        };

        let recipient_limit = match req.limit {
            None => None,
            Some(limit) if limit >= 1 => Some(limit as usize),
            Some(limit) => {
                return Err(AppError::Validation(format!(
                    "Limit must be at least 1, got {}",
                    limit
                )));
            }
        };

        Ok(NewRun {
            message: message.to_string(),
            kind,
            target,
            requested_by: req.requested_by,
            recipient_limit,
        })
    }

    pub async fn enqueue(&self, req: EnqueueRequest) -> Result<BroadcastRun, AppError> {
        let new_run = self.validate(req)?;
        self.open(&new_run).await
    }

    async fn open(&self, new_run: &NewRun) -> Result<BroadcastRun, AppError> {
        let run = self.store.create_run(new_run, Utc::now()).await?;

        tracing::info!(
            run_id = run.id,
            target = %run.target,
            recipients = run.total_recipients,
            "Broadcast run enqueued"
        );

        if run.status == RunStatus::Queued {
            self.kick();
        }
        Ok(run)
    }

    async fn require_run(&self, run_id: i64) -> Result<BroadcastRun, AppError> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Broadcast run {} not found", run_id)))
    }

    pub async fn run_detail(&self, run_id: i64) -> Result<RunDetail, AppError> {
        let run = self.require_run(run_id).await?;
        let counts = self.store.delivery_counts(run_id).await?;
        Ok(RunDetail { run, counts })
    }

    pub async fn list_runs(&self, page: PageRequest) -> Result<Page<BroadcastRun>, AppError> {
        self.store.list_runs(page).await
    }

    /// `filter` is the raw query value; absent means ALL.
    pub async fn list_deliveries(
        &self,
        run_id: i64,
        filter: Option<&str>,
        page: PageRequest,
    ) -> Result<Page<DeliveryView>, AppError> {
        let filter = match filter {
            Some(raw) => raw.parse::<DeliveryFilter>().map_err(AppError::Validation)?,
            None => DeliveryFilter::All,
        };
        self.require_run(run_id).await?;
        self.store.list_deliveries(run_id, filter, page).await
    }

    /// Cancel a non-terminal run. Cancelling a terminal run is a no-op.
    pub async fn cancel(&self, run_id: i64) -> Result<BroadcastRun, AppError> {
        match self.store.cancel_run(run_id, Utc::now()).await? {
            CancelOutcome::NotFound => {
                return Err(AppError::NotFound(format!(
                    "Broadcast run {} not found",
                    run_id
                )));
            }
            CancelOutcome::AlreadyTerminal(status) => {
                tracing::debug!(run_id, status = %status, "Cancel ignored for finished run");
            }
            CancelOutcome::Cancelled {
                cancelled_pending,
                marked_unknown,
            } => {
                self.store.refresh_run_counters(run_id).await?;
                tracing::info!(
                    run_id,
                    cancelled_pending,
                    marked_unknown,
                    "Broadcast run cancelled"
                );
            }
        }
        self.require_run(run_id).await
    }

    /// Open a new run with the same message and audience. Recipients are
    /// resolved afresh.
    pub async fn repost(
        &self,
        run_id: i64,
        requested_by: Option<i64>,
    ) -> Result<BroadcastRun, AppError> {
        let original = self.require_run(run_id).await?;
        let target = TargetSpec::from_stored(
            original.target,
            original.target_role.as_deref(),
            original.target_user_ids.as_deref(),
        )
        .ok_or_else(|| {
            AppError::Validation(format!(
                "Broadcast run {} has an incomplete {} target",
                run_id, original.target
            ))
        })?;

        let new_run = NewRun {
            message: original.message,
            kind: original.kind,
            target,
            requested_by: requested_by.or(original.requested_by),
            recipient_limit: original
                .recipient_limit
                .filter(|limit| *limit >= 1)
                .map(|limit| limit as usize),
        };
        let run = self.open(&new_run).await?;
        tracing::info!(run_id = run.id, original = run_id, "Broadcast run reposted");
        Ok(run)
    }

    /// Put UNKNOWN deliveries back in the queue. Returns how many moved.
    pub async fn requeue_unknown(&self, run_id: i64) -> Result<u64, AppError> {
        match self.store.requeue_unknown(run_id, Utc::now()).await? {
            RequeueOutcome::NotFound => Err(AppError::NotFound(format!(
                "Broadcast run {} not found",
                run_id
            ))),
            RequeueOutcome::Running => Err(AppError::Conflict(format!(
                "Broadcast run {} is still running",
                run_id
            ))),
            RequeueOutcome::Requeued(count) => {
                if count > 0 {
                    self.store.refresh_run_counters(run_id).await?;
                    tracing::info!(run_id, requeued = count, "Requeued UNKNOWN deliveries");
                    self.kick();
                }
                Ok(count)
            }
        }
    }

    pub async fn delete(&self, run_id: i64) -> Result<(), AppError> {
        match self.store.delete_run(run_id).await? {
            DeleteOutcome::NotFound => Err(AppError::NotFound(format!(
                "Broadcast run {} not found",
                run_id
            ))),
            DeleteOutcome::Active(status) => Err(AppError::Conflict(format!(
                "Broadcast run {} is {} and cannot be deleted",
                run_id, status
            ))),
            DeleteOutcome::Deleted => {
                tracing::info!(run_id, "Broadcast run deleted");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::memory::{MemoryStore, MemoryUser};

    async fn manager_with_users(n: i64) -> (Arc<MemoryStore>, RunManager) {
        let store = Arc::new(MemoryStore::new(3));
        for id in 1..=n {
            store
                .add_user(MemoryUser {
                    id,
                    chat_id: Some(format!("{}", 500 + id)),
                    role: (if id % 2 == 0 { "admin" } else { "customer" }).to_string(),
                    ..Default::default()
                })
                .await;
        }
        let manager = RunManager::new(store.clone(), &BroadcastSettings::default());
        (store, manager)
    }

    fn request(target: RunTarget) -> EnqueueRequest {
        EnqueueRequest {
            message: "  Big sale today  ".into(),
            target: Some(target),
            ..Default::default()
        }
    }

    fn is_validation<T: std::fmt::Debug>(result: Result<T, AppError>) -> bool {
        matches!(result, Err(AppError::Validation(_)))
    }

    #[tokio::test]
    async fn test_enqueue_trims_message_and_defaults_kind() {
        let (_, manager) = manager_with_users(2).await;
        let run = manager.enqueue(request(RunTarget::All)).await.unwrap();

        assert_eq!(run.message, "Big sale today");
        assert_eq!(run.kind, DEFAULT_KIND);
        assert_eq!(run.status, RunStatus::Queued);
        assert_eq!(run.total_recipients, 2);
        assert_eq!(run.pending_count, 2);
    }

    #[tokio::test]
    async fn test_validation_rules() {
        let (_, manager) = manager_with_users(0).await;

        let mut blank = request(RunTarget::All);
        blank.message = "   ".into();
        assert!(is_validation(manager.validate(blank)));

        let mut long = request(RunTarget::All);
        long.message = "x".repeat(4001);
        assert!(is_validation(manager.validate(long)));

        let mut at_limit = request(RunTarget::All);
        at_limit.message = "x".repeat(4000);
        assert!(manager.validate(at_limit).is_ok());

        assert!(is_validation(manager.validate(request(RunTarget::Role))));
        assert!(is_validation(manager.validate(request(RunTarget::Users))));

        let mut zero_limit = request(RunTarget::All);
        zero_limit.limit = Some(0);
        assert!(is_validation(manager.validate(zero_limit)));

        let mut too_many = request(RunTarget::Users);
        too_many.user_ids = Some((1..=5001).collect());
        assert!(is_validation(manager.validate(too_many)));

        let mut no_target = request(RunTarget::All);
        no_target.target = None;
        assert!(is_validation(manager.validate(no_target)));
    }

    #[tokio::test]
    async fn test_user_ids_are_deduplicated_in_order() {
        let (_, manager) = manager_with_users(0).await;
        let mut req = request(RunTarget::Users);
        req.user_ids = Some(vec![3, 1, 3, 2, 1]);

        let new_run = manager.validate(req).unwrap();
        assert_eq!(new_run.target, TargetSpec::Users(vec![3, 1, 2]));
    }

    #[tokio::test]
    async fn test_zero_recipients_completes_immediately() {
        let (store, manager) = manager_with_users(0).await;
        let run = manager.enqueue(request(RunTarget::All)).await.unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.total_recipients, 0);
        assert!(run.finished_at.is_some());
        assert!(store.deliveries_for(run.id).await.is_empty());
    }

    #[tokio::test]
    async fn test_limit_caps_recipients() {
        let (_, manager) = manager_with_users(5).await;
        let mut req = request(RunTarget::All);
        req.limit = Some(2);

        let run = manager.enqueue(req).await.unwrap();
        assert_eq!(run.total_recipients, 2);
    }

    #[tokio::test]
    async fn test_repost_copies_target() {
        let (_, manager) = manager_with_users(4).await;
        let mut req = request(RunTarget::Role);
        req.role = Some("admin".into());
        let original = manager.enqueue(req).await.unwrap();
        assert_eq!(original.total_recipients, 2);

        let copy = manager.repost(original.id, Some(9)).await.unwrap();
        assert_ne!(copy.id, original.id);
        assert_eq!(copy.target, RunTarget::Role);
        assert_eq!(copy.target_role.as_deref(), Some("admin"));
        assert_eq!(copy.message, original.message);
        assert_eq!(copy.requested_by, Some(9));
        assert_eq!(copy.total_recipients, 2);
    }

    #[tokio::test]
    async fn test_missing_run_is_not_found() {
        let (_, manager) = manager_with_users(0).await;
        assert!(matches!(
            manager.run_detail(99).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(manager.cancel(99).await, Err(AppError::NotFound(_))));
        assert!(matches!(
            manager.requeue_unknown(99).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(manager.delete(99).await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_refuses_active_runs() {
        let (_, manager) = manager_with_users(1).await;
        let run = manager.enqueue(request(RunTarget::All)).await.unwrap();

        assert!(matches!(
            manager.delete(run.id).await,
            Err(AppError::Conflict(_))
        ));

        manager.cancel(run.id).await.unwrap();
        manager.delete(run.id).await.unwrap();
        assert!(matches!(
            manager.run_detail(run.id).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_filter_is_validation_error() {
        let (_, manager) = manager_with_users(1).await;
        let run = manager.enqueue(request(RunTarget::All)).await.unwrap();

        assert!(is_validation(
            manager
                .list_deliveries(run.id, Some("bogus"), PageRequest::default())
                .await
        ));
        let page = manager
            .list_deliveries(run.id, Some("pending"), PageRequest::default())
            .await
            .unwrap();
        assert_eq!(page.total, 1);
    }
}
