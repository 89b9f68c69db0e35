//! In-process broadcast store.
//!
//! Mirrors the guarded-update semantics of the Postgres store behind one
//! mutex. Used by tests and by local runs that do not need durability.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use courier_common::error::AppError;
use courier_common::types::{
    BroadcastDelivery, BroadcastRun, DeliveryFilter, DeliveryStatus, DeliveryView, Page,
    PageRequest, Recipient, RunStatus, StatusCounts,
};

use crate::recovery::STALE_DELIVERY_ERROR;
use crate::resolver::{TargetSpec, prepare_recipients};
use crate::store::{
    BroadcastStore, CANCELLED_ERROR, CANCELLED_IN_FLIGHT_ERROR, CancelOutcome, DeleteOutcome,
    FailureRecord, Lease, NewRun, RequeueOutcome, RunCandidate, SubscriberRegistry,
};

/// A registered storefront user as seen by the resolver.
#[derive(Debug, Clone, Default)]
pub struct MemoryUser {
    pub id: i64,
    pub chat_id: Option<String>,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub role: String,
    pub completed_orders: i64,
}

/// A bot subscriber row.
#[derive(Debug, Clone, Default)]
pub struct MemorySubscriber {
    pub chat_id: String,
    pub user_id: Option<i64>,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub is_active: bool,
}

#[derive(Default)]
struct State {
    runs: BTreeMap<i64, BroadcastRun>,
    deliveries: BTreeMap<i64, BroadcastDelivery>,
    enrolled: HashSet<(i64, String)>,
    users: Vec<MemoryUser>,
    subscribers: Vec<MemorySubscriber>,
    next_run_id: i64,
    next_delivery_id: i64,
}

impl State {
    fn lease_free(lock_expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        lock_expires_at.is_none_or(|expires| expires < now)
    }

    fn is_inactive_chat(&self, chat_id: &str) -> bool {
        self.subscribers
            .iter()
            .any(|s| s.chat_id == chat_id && !s.is_active)
    }

    fn resolve(&self, target: &TargetSpec, vip_min_orders: i64) -> Vec<Recipient> {
        if *target == TargetSpec::ChannelSubscribers {
            return self
                .subscribers
                .iter()
                .filter(|s| s.is_active)
                .map(|s| Recipient {
                    user_id: s.user_id,
                    chat_id: s.chat_id.clone(),
                })
                .collect();
        }

        let mut users: Vec<&MemoryUser> = self
            .users
            .iter()
            .filter(|u| {
                u.chat_id
                    .as_deref()
                    .map(str::trim)
                    .is_some_and(|chat| !chat.is_empty() && !self.is_inactive_chat(chat))
            })
            .filter(|u| match target {
                TargetSpec::All => true,
                TargetSpec::Role(role) => u.role == *role,
                TargetSpec::Vip => u.completed_orders >= vip_min_orders,
                TargetSpec::Users(ids) => ids.contains(&u.id),
                TargetSpec::ChannelSubscribers => false,
            })
            .collect();
        users.sort_by_key(|u| u.id);

        users
            .into_iter()
            .map(|u| Recipient {
                user_id: Some(u.id),
                chat_id: u.chat_id.as_deref().unwrap_or_default().trim().to_string(),
            })
            .collect()
    }

    fn counts(&self, run_id: i64) -> StatusCounts {
        self.deliveries
            .values()
            .filter(|d| d.run_id == run_id)
            .map(|d| (d.status, 1))
            .collect()
    }

    fn refresh(&mut self, run_id: i64, now: DateTime<Utc>) -> StatusCounts {
        let counts = self.counts(run_id);
        if let Some(run) = self.runs.get_mut(&run_id) {
            run.total_recipients = counts.total();
            run.pending_count = counts.active();
            run.sent_count = counts.sent;
            run.failed_count = counts.failed_permanent;
            run.unknown_count = counts.unknown;
            run.updated_at = now;
        }
        counts
    }

    fn view(&self, delivery: &BroadcastDelivery) -> DeliveryView {
        let user = delivery
            .user_id
            .and_then(|id| self.users.iter().find(|u| u.id == id));
        let subscriber = self
            .subscribers
            .iter()
            .find(|s| s.chat_id == delivery.chat_id);

        let user_name = user
            .and_then(|u| u.first_name.clone())
            .filter(|name| !name.trim().is_empty());

        DeliveryView {
            delivery: delivery.clone(),
            recipient_name: user_name.or_else(|| subscriber.and_then(|s| s.first_name.clone())),
            recipient_username: user
                .and_then(|u| u.username.clone())
                .or_else(|| subscriber.and_then(|s| s.username.clone())),
        }
    }
}

fn clear_delivery_lease(delivery: &mut BroadcastDelivery) {
    delivery.lock_token = None;
    delivery.lock_expires_at = None;
    delivery.next_attempt_at = None;
}

/// Broadcast store kept entirely in memory.
pub struct MemoryStore {
    state: Mutex<State>,
    vip_min_orders: i64,
}

impl MemoryStore {
    pub fn new(vip_min_orders: i64) -> Self {
        Self {
            state: Mutex::new(State::default()),
            vip_min_orders,
        }
    }

    pub async fn add_user(&self, user: MemoryUser) {
        self.state.lock().await.users.push(user);
    }

    pub async fn add_subscriber(&self, subscriber: MemorySubscriber) {
        self.state.lock().await.subscribers.push(subscriber);
    }

    pub async fn subscriber(&self, chat_id: &str) -> Option<MemorySubscriber> {
        let state = self.state.lock().await;
        state
            .subscribers
            .iter()
            .find(|s| s.chat_id == chat_id)
            .cloned()
    }

    pub async fn delivery(&self, delivery_id: i64) -> Option<BroadcastDelivery> {
        self.state.lock().await.deliveries.get(&delivery_id).cloned()
    }

    pub async fn deliveries_for(&self, run_id: i64) -> Vec<BroadcastDelivery> {
        let state = self.state.lock().await;
        state
            .deliveries
            .values()
            .filter(|d| d.run_id == run_id)
            .cloned()
            .collect()
    }

    /// Apply `f` to a stored run. Returns false if the run does not exist.
    pub async fn update_run(&self, run_id: i64, f: impl FnOnce(&mut BroadcastRun)) -> bool {
        let mut state = self.state.lock().await;
        state.runs.get_mut(&run_id).map(f).is_some()
    }

    /// Apply `f` to a stored delivery. Returns false if it does not exist.
    pub async fn update_delivery(
        &self,
        delivery_id: i64,
        f: impl FnOnce(&mut BroadcastDelivery),
    ) -> bool {
        let mut state = self.state.lock().await;
        state.deliveries.get_mut(&delivery_id).map(f).is_some()
    }
}

#[async_trait]
impl BroadcastStore for MemoryStore {
    async fn create_run(
        &self,
        run: &NewRun,
        now: DateTime<Utc>,
    ) -> Result<BroadcastRun, AppError> {
        let mut state = self.state.lock().await;

        state.next_run_id += 1;
        let run_id = state.next_run_id;
        let recipients = prepare_recipients(
            state.resolve(&run.target, self.vip_min_orders),
            run.recipient_limit,
        );

        state.runs.insert(
            run_id,
            BroadcastRun {
                id: run_id,
                status: RunStatus::Queued,
                target: run.target.kind(),
                target_role: run.target.role().map(str::to_string),
                target_user_ids: run.target.user_ids().map(<[i64]>::to_vec),
                message: run.message.clone(),
                kind: run.kind.clone(),
                requested_by: run.requested_by,
                recipient_limit: run.recipient_limit.map(|limit| limit as i64),
                total_recipients: 0,
                pending_count: 0,
                sent_count: 0,
                failed_count: 0,
                unknown_count: 0,
                lock_token: None,
                lock_expires_at: None,
                started_at: None,
                finished_at: None,
                last_heartbeat_at: None,
                created_at: now,
                updated_at: now,
            },
        );

        for recipient in recipients {
            if !state.enrolled.insert((run_id, recipient.chat_id.clone())) {
                continue;
            }
            state.next_delivery_id += 1;
            let id = state.next_delivery_id;
            state.deliveries.insert(
                id,
                BroadcastDelivery {
                    id,
                    run_id,
                    user_id: recipient.user_id,
                    chat_id: recipient.chat_id,
                    status: DeliveryStatus::Pending,
                    attempt_count: 0,
                    next_attempt_at: None,
                    last_attempt_at: None,
                    sent_at: None,
                    last_error: None,
                    gateway_message_id: None,
                    lock_token: None,
                    lock_expires_at: None,
                    created_at: now,
                    updated_at: now,
                },
            );
        }

        let counts = state.refresh(run_id, now);
        let created = state
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| AppError::Internal(format!("Run {} vanished during create", run_id)))?;
        if counts.total() == 0 {
            created.status = RunStatus::Completed;
            created.finished_at = Some(now);
        }
        Ok(created.clone())
    }

    async fn get_run(&self, run_id: i64) -> Result<Option<BroadcastRun>, AppError> {
        Ok(self.state.lock().await.runs.get(&run_id).cloned())
    }

    async fn list_runs(&self, page: PageRequest) -> Result<Page<BroadcastRun>, AppError> {
        let state = self.state.lock().await;
        let mut runs: Vec<&BroadcastRun> = state.runs.values().collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let items = runs
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.limit() as usize)
            .cloned()
            .collect();
        Ok(Page::new(items, state.runs.len() as i64, page))
    }

    async fn list_deliveries(
        &self,
        run_id: i64,
        filter: DeliveryFilter,
        page: PageRequest,
    ) -> Result<Page<DeliveryView>, AppError> {
        let state = self.state.lock().await;
        let matching: Vec<&BroadcastDelivery> = state
            .deliveries
            .values()
            .filter(|d| d.run_id == run_id && filter.matches(d.status))
            .collect();

        let total = matching.len() as i64;
        let items = matching
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.limit() as usize)
            .map(|d| state.view(d))
            .collect();
        Ok(Page::new(items, total, page))
    }

    async fn delivery_counts(&self, run_id: i64) -> Result<StatusCounts, AppError> {
        Ok(self.state.lock().await.counts(run_id))
    }

    async fn refresh_run_counters(&self, run_id: i64) -> Result<StatusCounts, AppError> {
        Ok(self.state.lock().await.refresh(run_id, Utc::now()))
    }

    async fn delete_run(&self, run_id: i64) -> Result<DeleteOutcome, AppError> {
        let mut state = self.state.lock().await;
        let status = match state.runs.get(&run_id) {
            None => return Ok(DeleteOutcome::NotFound),
            Some(run) => run.status,
        };
        if matches!(status, RunStatus::Queued | RunStatus::Running) {
            return Ok(DeleteOutcome::Active(status));
        }

        state.runs.remove(&run_id);
        state.deliveries.retain(|_, d| d.run_id != run_id);
        state.enrolled.retain(|(id, _)| *id != run_id);
        Ok(DeleteOutcome::Deleted)
    }

    async fn find_run_candidates(
        &self,
        now: DateTime<Utc>,
        exclude: &[i64],
        limit: i64,
    ) -> Result<Vec<RunCandidate>, AppError> {
        let state = self.state.lock().await;
        let mut candidates: Vec<&BroadcastRun> = state
            .runs
            .values()
            .filter(|r| !exclude.contains(&r.id))
            .filter(|r| match r.status {
                RunStatus::Queued => true,
                RunStatus::Running => State::lease_free(r.lock_expires_at, now),
                _ => false,
            })
            .collect();
        candidates.sort_by_key(|r| (r.status != RunStatus::Queued, r.created_at, r.id));

        Ok(candidates
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|r| RunCandidate {
                id: r.id,
                status: r.status,
            })
            .collect())
    }

    async fn try_claim_run(
        &self,
        run_id: i64,
        lease: &Lease,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let mut state = self.state.lock().await;
        let Some(run) = state.runs.get_mut(&run_id) else {
            return Ok(false);
        };
        if !matches!(run.status, RunStatus::Queued | RunStatus::Running)
            || !State::lease_free(run.lock_expires_at, now)
        {
            return Ok(false);
        }

        run.status = RunStatus::Running;
        run.lock_token = Some(lease.token.clone());
        run.lock_expires_at = Some(lease.expires_at);
        run.started_at.get_or_insert(now);
        run.last_heartbeat_at = Some(now);
        run.updated_at = now;
        Ok(true)
    }

    async fn renew_run_lease(
        &self,
        run_id: i64,
        lease: &Lease,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let mut state = self.state.lock().await;
        match state.runs.get_mut(&run_id) {
            Some(run)
                if run.status == RunStatus::Running
                    && run.lock_token.as_deref() == Some(lease.token.as_str()) =>
            {
                run.lock_expires_at = Some(lease.expires_at);
                run.last_heartbeat_at = Some(now);
                run.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_run_lease(
        &self,
        run_id: i64,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let mut state = self.state.lock().await;
        match state.runs.get_mut(&run_id) {
            Some(run) if run.lock_token.as_deref() == Some(token) => {
                run.lock_token = None;
                run.lock_expires_at = None;
                run.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finalize_run(
        &self,
        run_id: i64,
        token: &str,
        status: RunStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let mut state = self.state.lock().await;
        match state.runs.get_mut(&run_id) {
            Some(run)
                if run.status == RunStatus::Running && run.lock_token.as_deref() == Some(token) =>
            {
                run.status = status;
                run.finished_at = Some(now);
                run.lock_token = None;
                run.lock_expires_at = None;
                run.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_delivery_candidates(
        &self,
        run_id: i64,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<i64>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .deliveries
            .values()
            .filter(|d| {
                d.run_id == run_id
                    && matches!(
                        d.status,
                        DeliveryStatus::Pending | DeliveryStatus::FailedRetryable
                    )
                    && d.next_attempt_at.is_none_or(|at| at <= now)
                    && State::lease_free(d.lock_expires_at, now)
            })
            .take(limit.max(0) as usize)
            .map(|d| d.id)
            .collect())
    }

    async fn try_claim_delivery(
        &self,
        delivery_id: i64,
        lease: &Lease,
        now: DateTime<Utc>,
    ) -> Result<Option<BroadcastDelivery>, AppError> {
        let mut state = self.state.lock().await;
        let Some(delivery) = state.deliveries.get_mut(&delivery_id) else {
            return Ok(None);
        };
        let claimable = matches!(
            delivery.status,
            DeliveryStatus::Pending | DeliveryStatus::FailedRetryable
        ) && delivery.next_attempt_at.is_none_or(|at| at <= now)
            && State::lease_free(delivery.lock_expires_at, now);
        if !claimable {
            return Ok(None);
        }

        delivery.status = DeliveryStatus::Processing;
        delivery.lock_token = Some(lease.token.clone());
        delivery.lock_expires_at = Some(lease.expires_at);
        delivery.attempt_count += 1;
        delivery.last_attempt_at = Some(now);
        delivery.next_attempt_at = None;
        delivery.updated_at = now;
        Ok(Some(delivery.clone()))
    }

    async fn record_sent(
        &self,
        delivery_id: i64,
        token: &str,
        gateway_message_id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let mut state = self.state.lock().await;
        match state.deliveries.get_mut(&delivery_id) {
            Some(d)
                if d.status == DeliveryStatus::Processing
                    && d.lock_token.as_deref() == Some(token) =>
            {
                d.status = DeliveryStatus::Sent;
                d.sent_at = Some(now);
                d.gateway_message_id = Some(gateway_message_id);
                d.last_error = None;
                clear_delivery_lease(d);
                d.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_failure(
        &self,
        delivery_id: i64,
        token: &str,
        failure: &FailureRecord,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let mut state = self.state.lock().await;
        match state.deliveries.get_mut(&delivery_id) {
            Some(d)
                if d.status == DeliveryStatus::Processing
                    && d.lock_token.as_deref() == Some(token) =>
            {
                d.status = failure.status;
                d.lock_token = None;
                d.lock_expires_at = None;
                d.next_attempt_at = failure.next_attempt_at;
                d.last_error = Some(failure.error.clone());
                d.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn recover_stale_deliveries(
        &self,
        cutoff: DateTime<Utc>,
        run_id: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>, AppError> {
        let mut state = self.state.lock().await;
        let mut touched = Vec::new();

        for d in state.deliveries.values_mut() {
            let stale = d.status == DeliveryStatus::Processing
                && d.lock_expires_at.is_some_and(|expires| expires < cutoff)
                && run_id.is_none_or(|id| id == d.run_id);
            if stale {
                d.status = DeliveryStatus::Unknown;
                d.last_error = Some(STALE_DELIVERY_ERROR.to_string());
                clear_delivery_lease(d);
                d.updated_at = now;
                touched.push(d.run_id);
            }
        }

        touched.sort_unstable();
        touched.dedup();
        Ok(touched)
    }

    async fn cancel_run(&self, run_id: i64, now: DateTime<Utc>) -> Result<CancelOutcome, AppError> {
        let mut state = self.state.lock().await;
        match state.runs.get(&run_id) {
            None => return Ok(CancelOutcome::NotFound),
            Some(run) if run.status.is_terminal() => {
                return Ok(CancelOutcome::AlreadyTerminal(run.status));
            }
            Some(_) => {}
        }

        let mut cancelled_pending = 0;
        let mut marked_unknown = 0;
        for d in state.deliveries.values_mut().filter(|d| d.run_id == run_id) {
            match d.status {
                DeliveryStatus::Pending | DeliveryStatus::FailedRetryable => {
                    d.status = DeliveryStatus::FailedPermanent;
                    d.last_error = Some(CANCELLED_ERROR.to_string());
                    cancelled_pending += 1;
                }
                DeliveryStatus::Processing => {
                    d.status = DeliveryStatus::Unknown;
                    d.last_error = Some(CANCELLED_IN_FLIGHT_ERROR.to_string());
                    marked_unknown += 1;
                }
                _ => continue,
            }
            clear_delivery_lease(d);
            d.updated_at = now;
        }

        if let Some(run) = state.runs.get_mut(&run_id) {
            run.status = RunStatus::Cancelled;
            run.lock_token = None;
            run.lock_expires_at = None;
            run.finished_at = Some(now);
            run.updated_at = now;
        }

        Ok(CancelOutcome::Cancelled {
            cancelled_pending,
            marked_unknown,
        })
    }

    async fn requeue_unknown(
        &self,
        run_id: i64,
        now: DateTime<Utc>,
    ) -> Result<RequeueOutcome, AppError> {
        let mut state = self.state.lock().await;
        match state.runs.get(&run_id).map(|r| r.status) {
            None => return Ok(RequeueOutcome::NotFound),
            Some(RunStatus::Running) => return Ok(RequeueOutcome::Running),
            Some(_) => {}
        }

        let mut requeued = 0;
        for d in state
            .deliveries
            .values_mut()
            .filter(|d| d.run_id == run_id && d.status == DeliveryStatus::Unknown)
        {
            d.status = DeliveryStatus::Pending;
            d.last_error = None;
            clear_delivery_lease(d);
            d.updated_at = now;
            requeued += 1;
        }

        if requeued > 0
            && let Some(run) = state.runs.get_mut(&run_id)
        {
            run.status = RunStatus::Queued;
            run.finished_at = None;
            run.lock_token = None;
            run.lock_expires_at = None;
            run.updated_at = now;
        }

        Ok(RequeueOutcome::Requeued(requeued))
    }

    async fn purge_terminal_runs(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError> {
        let mut state = self.state.lock().await;
        let doomed: Vec<i64> = state
            .runs
            .values()
            .filter(|r| r.status.is_terminal() && r.finished_at.is_some_and(|at| at < cutoff))
            .map(|r| r.id)
            .collect();

        for run_id in &doomed {
            state.runs.remove(run_id);
        }
        state.deliveries.retain(|_, d| !doomed.contains(&d.run_id));
        state.enrolled.retain(|(id, _)| !doomed.contains(id));
        Ok(doomed.len() as u64)
    }
}

#[async_trait]
impl SubscriberRegistry for MemoryStore {
    async fn active_subscribers(&self) -> Result<Vec<Recipient>, AppError> {
        Ok(self.state.lock().await.resolve(&TargetSpec::ChannelSubscribers, 0))
    }

    async fn mark_inactive(&self, chat_id: &str) -> Result<bool, AppError> {
        let mut state = self.state.lock().await;
        match state.subscribers.iter_mut().find(|s| s.chat_id == chat_id) {
            Some(subscriber) if subscriber.is_active => {
                subscriber.is_active = false;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => {
                state.subscribers.push(MemorySubscriber {
                    chat_id: chat_id.to_string(),
                    is_active: false,
                    ..Default::default()
                });
                Ok(true)
            }
        }
    }
}
