//! PostgreSQL implementation of the broadcast store.
//!
//! Leases are plain columns on `broadcast_runs` / `broadcast_deliveries`;
//! mutual exclusion comes from `UPDATE ... WHERE <expected state>` and the
//! affected-row count, so no separate lock table is involved.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};

use courier_common::error::AppError;
use courier_common::types::{
    BroadcastDelivery, BroadcastRun, DeliveryFilter, DeliveryStatus, DeliveryView, Page,
    PageRequest, Recipient, RunStatus, StatusCounts,
};

use crate::recovery::STALE_DELIVERY_ERROR;
use crate::resolver::{RecipientResolver, fetch_active_subscribers, prepare_recipients};
use crate::store::{
    BroadcastStore, CANCELLED_ERROR, CANCELLED_IN_FLIGHT_ERROR, CancelOutcome, DeleteOutcome,
    FailureRecord, Lease, NewRun, RequeueOutcome, RunCandidate, SubscriberRegistry,
};

/// Postgres-backed broadcast store.
#[derive(Clone)]
pub struct PgBroadcastStore {
    pool: PgPool,
    resolver: RecipientResolver,
    insert_chunk_size: usize,
}

impl PgBroadcastStore {
    pub fn new(pool: PgPool, vip_min_orders: i64, insert_chunk_size: usize) -> Self {
        Self {
            pool,
            resolver: RecipientResolver::new(vip_min_orders),
            insert_chunk_size: insert_chunk_size.max(1),
        }
    }
}

#[async_trait]
impl BroadcastStore for PgBroadcastStore {
    async fn create_run(
        &self,
        run: &NewRun,
        now: DateTime<Utc>,
    ) -> Result<BroadcastRun, AppError> {
        let mut tx = self.pool.begin().await?;

        let run_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO broadcast_runs
                (status, target, target_role, target_user_ids, message, kind,
                 requested_by, recipient_limit, created_at, updated_at)
            VALUES ('queued', $1, $2, $3, $4, $5, $6, $7, $8, $8)
            RETURNING id
            "#,
        )
        .bind(run.target.kind().to_string())
        .bind(run.target.role())
        .bind(run.target.user_ids().map(|ids| ids.to_vec()))
        .bind(&run.message)
        .bind(&run.kind)
        .bind(run.requested_by)
        .bind(run.recipient_limit.map(|limit| limit as i64))
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        let raw = self.resolver.resolve(&mut tx, &run.target).await?;
        let recipients = prepare_recipients(raw, run.recipient_limit);

        for chunk in recipients.chunks(self.insert_chunk_size) {
            let mut insert = QueryBuilder::<Postgres>::new(
                "INSERT INTO broadcast_deliveries (run_id, user_id, chat_id, status, created_at, updated_at) ",
            );
            insert.push_values(chunk, |mut row, recipient| {
                row.push_bind(run_id)
                    .push_bind(recipient.user_id)
                    .push_bind(recipient.chat_id.clone())
                    .push("'pending'")
                    .push_bind(now)
                    .push_bind(now);
            });
            insert.push(" ON CONFLICT (run_id, chat_id) DO NOTHING");
            insert.build().execute(&mut *tx).await?;
        }

        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM broadcast_deliveries WHERE run_id = $1")
                .bind(run_id)
                .fetch_one(&mut *tx)
                .await?;

        let created: BroadcastRun = if total == 0 {
            sqlx::query_as(
                r#"
                UPDATE broadcast_runs
                SET status = 'completed', finished_at = $2, updated_at = $2
                WHERE id = $1
                RETURNING *
                "#,
            )
            .bind(run_id)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?
        } else {
            sqlx::query_as(
                r#"
                UPDATE broadcast_runs
                SET total_recipients = $2, pending_count = $2, updated_at = $3
                WHERE id = $1
                RETURNING *
                "#,
            )
            .bind(run_id)
            .bind(total)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?
        };

        tx.commit().await?;
        Ok(created)
    }

    async fn get_run(&self, run_id: i64) -> Result<Option<BroadcastRun>, AppError> {
        let run = sqlx::query_as("SELECT * FROM broadcast_runs WHERE id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(run)
    }

    async fn list_runs(&self, page: PageRequest) -> Result<Page<BroadcastRun>, AppError> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM broadcast_runs")
            .fetch_one(&self.pool)
            .await?;

        let runs: Vec<BroadcastRun> = sqlx::query_as(
            "SELECT * FROM broadcast_runs ORDER BY created_at DESC, id DESC LIMIT $1 OFFSET $2",
        )
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;

        Ok(Page::new(runs, total, page))
    }

    async fn list_deliveries(
        &self,
        run_id: i64,
        filter: DeliveryFilter,
        page: PageRequest,
    ) -> Result<Page<DeliveryView>, AppError> {
        let statuses: Vec<String> = filter.statuses().iter().map(|s| s.to_string()).collect();

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM broadcast_deliveries WHERE run_id = $1 AND status = ANY($2)",
        )
        .bind(run_id)
        .bind(&statuses)
        .fetch_one(&self.pool)
        .await?;

        let rows: Vec<DeliveryView> = sqlx::query_as(
            r#"
            SELECT d.*,
                   COALESCE(NULLIF(BTRIM(u.first_name), ''), s.first_name) AS recipient_name,
                   COALESCE(u.username, s.username) AS recipient_username
            FROM broadcast_deliveries d
            LEFT JOIN users u ON u.id = d.user_id
            LEFT JOIN bot_subscribers s ON s.chat_id = d.chat_id
            WHERE d.run_id = $1 AND d.status = ANY($2)
            ORDER BY d.id
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(run_id)
        .bind(&statuses)
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;

        Ok(Page::new(rows, total, page))
    }

    async fn delivery_counts(&self, run_id: i64) -> Result<StatusCounts, AppError> {
        let rows: Vec<(DeliveryStatus, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM broadcast_deliveries WHERE run_id = $1 GROUP BY status",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().collect())
    }

    async fn refresh_run_counters(&self, run_id: i64) -> Result<StatusCounts, AppError> {
        sqlx::query(
            r#"
            UPDATE broadcast_runs r
            SET total_recipients = agg.total,
                pending_count    = agg.pending,
                sent_count       = agg.sent,
                failed_count     = agg.failed,
                unknown_count    = agg.unknown,
                updated_at       = NOW()
            FROM (
                SELECT COUNT(*) AS total,
                       COUNT(*) FILTER (WHERE status IN ('pending', 'processing', 'failed_retryable')) AS pending,
                       COUNT(*) FILTER (WHERE status = 'sent') AS sent,
                       COUNT(*) FILTER (WHERE status = 'failed_permanent') AS failed,
                       COUNT(*) FILTER (WHERE status = 'unknown') AS unknown
                FROM broadcast_deliveries
                WHERE run_id = $1
            ) agg
            WHERE r.id = $1
            "#,
        )
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        self.delivery_counts(run_id).await
    }

    async fn delete_run(&self, run_id: i64) -> Result<DeleteOutcome, AppError> {
        let mut tx = self.pool.begin().await?;

        let status: Option<RunStatus> =
            sqlx::query_scalar("SELECT status FROM broadcast_runs WHERE id = $1 FOR UPDATE")
                .bind(run_id)
                .fetch_optional(&mut *tx)
                .await?;

        let outcome = match status {
            None => DeleteOutcome::NotFound,
            Some(status @ (RunStatus::Queued | RunStatus::Running)) => DeleteOutcome::Active(status),
            Some(_) => {
                sqlx::query("DELETE FROM broadcast_runs WHERE id = $1")
                    .bind(run_id)
                    .execute(&mut *tx)
                    .await?;
                DeleteOutcome::Deleted
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn find_run_candidates(
        &self,
        now: DateTime<Utc>,
        exclude: &[i64],
        limit: i64,
    ) -> Result<Vec<RunCandidate>, AppError> {
        let candidates = sqlx::query_as(
            r#"
            SELECT id, status
            FROM broadcast_runs
            WHERE (status = 'queued'
                   OR (status = 'running' AND (lock_expires_at IS NULL OR lock_expires_at < $1)))
              AND id <> ALL($2)
            ORDER BY CASE WHEN status = 'queued' THEN 0 ELSE 1 END, created_at, id
            LIMIT $3
            "#,
        )
        .bind(now)
        .bind(exclude.to_vec())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(candidates)
    }

    async fn try_claim_run(
        &self,
        run_id: i64,
        lease: &Lease,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE broadcast_runs
            SET status = 'running',
                lock_token = $2,
                lock_expires_at = $3,
                started_at = COALESCE(started_at, $4),
                last_heartbeat_at = $4,
                updated_at = $4
            WHERE id = $1
              AND status IN ('queued', 'running')
              AND (lock_expires_at IS NULL OR lock_expires_at < $4)
            "#,
        )
        .bind(run_id)
        .bind(&lease.token)
        .bind(lease.expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn renew_run_lease(
        &self,
        run_id: i64,
        lease: &Lease,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE broadcast_runs
            SET lock_expires_at = $3, last_heartbeat_at = $4, updated_at = $4
            WHERE id = $1 AND lock_token = $2 AND status = 'running'
            "#,
        )
        .bind(run_id)
        .bind(&lease.token)
        .bind(lease.expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_run_lease(
        &self,
        run_id: i64,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE broadcast_runs
            SET lock_token = NULL, lock_expires_at = NULL, updated_at = $3
            WHERE id = $1 AND lock_token = $2
            "#,
        )
        .bind(run_id)
        .bind(token)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn finalize_run(
        &self,
        run_id: i64,
        token: &str,
        status: RunStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE broadcast_runs
            SET status = $3,
                finished_at = $4,
                lock_token = NULL,
                lock_expires_at = NULL,
                updated_at = $4
            WHERE id = $1 AND lock_token = $2 AND status = 'running'
            "#,
        )
        .bind(run_id)
        .bind(token)
        .bind(status.to_string())
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_delivery_candidates(
        &self,
        run_id: i64,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<i64>, AppError> {
        let ids = sqlx::query_scalar(
            r#"
            SELECT id
            FROM broadcast_deliveries
            WHERE run_id = $1
              AND status IN ('pending', 'failed_retryable')
              AND (next_attempt_at IS NULL OR next_attempt_at <= $2)
              AND (lock_expires_at IS NULL OR lock_expires_at < $2)
            ORDER BY id
            LIMIT $3
            "#,
        )
        .bind(run_id)
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn try_claim_delivery(
        &self,
        delivery_id: i64,
        lease: &Lease,
        now: DateTime<Utc>,
    ) -> Result<Option<BroadcastDelivery>, AppError> {
        let claimed = sqlx::query_as(
            r#"
            UPDATE broadcast_deliveries
            SET status = 'processing',
                lock_token = $2,
                lock_expires_at = $3,
                attempt_count = attempt_count + 1,
                last_attempt_at = $4,
                next_attempt_at = NULL,
                updated_at = $4
            WHERE id = $1
              AND status IN ('pending', 'failed_retryable')
              AND (next_attempt_at IS NULL OR next_attempt_at <= $4)
              AND (lock_expires_at IS NULL OR lock_expires_at < $4)
            RETURNING *
            "#,
        )
        .bind(delivery_id)
        .bind(&lease.token)
        .bind(lease.expires_at)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed)
    }

    async fn record_sent(
        &self,
        delivery_id: i64,
        token: &str,
        gateway_message_id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE broadcast_deliveries
            SET status = 'sent',
                sent_at = $3,
                gateway_message_id = $4,
                last_error = NULL,
                next_attempt_at = NULL,
                lock_token = NULL,
                lock_expires_at = NULL,
                updated_at = $3
            WHERE id = $1 AND status = 'processing' AND lock_token = $2
            "#,
        )
        .bind(delivery_id)
        .bind(token)
        .bind(now)
        .bind(gateway_message_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_failure(
        &self,
        delivery_id: i64,
        token: &str,
        failure: &FailureRecord,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE broadcast_deliveries
            SET status = $3,
                next_attempt_at = $4,
                last_error = $5,
                lock_token = NULL,
                lock_expires_at = NULL,
                updated_at = $6
            WHERE id = $1 AND status = 'processing' AND lock_token = $2
            "#,
        )
        .bind(delivery_id)
        .bind(token)
        .bind(failure.status.to_string())
        .bind(failure.next_attempt_at)
        .bind(&failure.error)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn recover_stale_deliveries(
        &self,
        cutoff: DateTime<Utc>,
        run_id: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>, AppError> {
        let mut run_ids: Vec<i64> = sqlx::query_scalar(
            r#"
            UPDATE broadcast_deliveries
            SET status = 'unknown',
                last_error = $2,
                lock_token = NULL,
                lock_expires_at = NULL,
                next_attempt_at = NULL,
                updated_at = $3
            WHERE status = 'processing'
              AND lock_expires_at < $1
              AND ($4::BIGINT IS NULL OR run_id = $4)
            RETURNING run_id
            "#,
        )
        .bind(cutoff)
        .bind(STALE_DELIVERY_ERROR)
        .bind(now)
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        run_ids.sort_unstable();
        run_ids.dedup();
        Ok(run_ids)
    }

    async fn cancel_run(&self, run_id: i64, now: DateTime<Utc>) -> Result<CancelOutcome, AppError> {
        let mut tx = self.pool.begin().await?;

        let status: Option<RunStatus> =
            sqlx::query_scalar("SELECT status FROM broadcast_runs WHERE id = $1 FOR UPDATE")
                .bind(run_id)
                .fetch_optional(&mut *tx)
                .await?;

        let status = match status {
            None => return Ok(CancelOutcome::NotFound),
            Some(status) if status.is_terminal() => {
                return Ok(CancelOutcome::AlreadyTerminal(status));
            }
            Some(status) => status,
        };

        let cancelled_pending = sqlx::query(
            r#"
            UPDATE broadcast_deliveries
            SET status = 'failed_permanent',
                last_error = $2,
                next_attempt_at = NULL,
                lock_token = NULL,
                lock_expires_at = NULL,
                updated_at = $3
            WHERE run_id = $1 AND status IN ('pending', 'failed_retryable')
            "#,
        )
        .bind(run_id)
        .bind(CANCELLED_ERROR)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let marked_unknown = sqlx::query(
            r#"
            UPDATE broadcast_deliveries
            SET status = 'unknown',
                last_error = $2,
                next_attempt_at = NULL,
                lock_token = NULL,
                lock_expires_at = NULL,
                updated_at = $3
            WHERE run_id = $1 AND status = 'processing'
            "#,
        )
        .bind(run_id)
        .bind(CANCELLED_IN_FLIGHT_ERROR)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query(
            r#"
            UPDATE broadcast_runs
            SET status = 'cancelled',
                lock_token = NULL,
                lock_expires_at = NULL,
                finished_at = $2,
                updated_at = $2
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(run_id, previous = %status, "Run cancelled in store");
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
        let mut tx = self.pool.begin().await?;

        let status: Option<RunStatus> =
            sqlx::query_scalar("SELECT status FROM broadcast_runs WHERE id = $1 FOR UPDATE")
                .bind(run_id)
                .fetch_optional(&mut *tx)
                .await?;

        match status {
            None => return Ok(RequeueOutcome::NotFound),
            Some(RunStatus::Running) => return Ok(RequeueOutcome::Running),
            Some(_) => {}
        }

        let requeued = sqlx::query(
            r#"
            UPDATE broadcast_deliveries
            SET status = 'pending',
                last_error = NULL,
                next_attempt_at = NULL,
                lock_token = NULL,
                lock_expires_at = NULL,
                updated_at = $2
            WHERE run_id = $1 AND status = 'unknown'
            "#,
        )
        .bind(run_id)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if requeued > 0 {
            sqlx::query(
                r#"
                UPDATE broadcast_runs
                SET status = 'queued',
                    finished_at = NULL,
                    lock_token = NULL,
                    lock_expires_at = NULL,
                    updated_at = $2
                WHERE id = $1
                "#,
            )
            .bind(run_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(RequeueOutcome::Requeued(requeued))
    }

    async fn purge_terminal_runs(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            DELETE FROM broadcast_runs
            WHERE status IN ('completed', 'completed_with_errors', 'cancelled')
              AND finished_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

/// Subscriber registry over the bot's `bot_subscribers` table.
#[derive(Clone)]
pub struct PgSubscriberRegistry {
    pool: PgPool,
}

impl PgSubscriberRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriberRegistry for PgSubscriberRegistry {
    async fn active_subscribers(&self) -> Result<Vec<Recipient>, AppError> {
        Ok(fetch_active_subscribers(&self.pool).await?)
    }

    /// Upserts an inactive row so user-targeted runs exclude the chat id too,
    /// even when the user never talked to the bot directly.
    async fn mark_inactive(&self, chat_id: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO bot_subscribers (chat_id, is_active)
            VALUES ($1, FALSE)
            ON CONFLICT (chat_id) DO UPDATE
            SET is_active = FALSE, updated_at = NOW()
            WHERE bot_subscribers.is_active = TRUE
            "#,
        )
        .bind(chat_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
