//! Single-delivery execution: send, classify, record.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use courier_common::error::AppError;
use courier_common::gateway::{GatewayError, MessageGateway};
use courier_common::types::DeliveryStatus;

use crate::backoff::backoff;
use crate::clock::TickClock;
use crate::lease::ClaimedDelivery;
use crate::pool::map_bounded;
use crate::store::{BroadcastStore, FailureRecord, SubscriberRegistry, truncate_error};

/// Substrings in a gateway description that mean the recipient can no longer
/// be reached.
const UNREACHABLE_MARKERS: [&str; 3] = ["blocked", "deactivated", "kicked"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Retryable,
    /// Never retried. `unreachable` recipients are also deactivated in the
    /// subscriber registry.
    Permanent { unreachable: bool },
}

pub fn classify(error: &GatewayError) -> FailureClass {
    let description = error.description.to_lowercase();
    let unreachable = error.code == Some(403)
        || UNREACHABLE_MARKERS
            .iter()
            .any(|marker| description.contains(marker));

    if unreachable || error.code == Some(400) {
        FailureClass::Permanent { unreachable }
    } else {
        FailureClass::Retryable
    }
}

/// What happened to one claimed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent,
    Retrying,
    Failed,
    /// The row's lease was taken away (cancel, stale recovery) before the
    /// outcome could be written.
    LeaseLost,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub sent: u32,
    pub retrying: u32,
    pub failed: u32,
    pub lease_lost: u32,
    pub errors: u32,
}

impl BatchSummary {
    pub fn processed(&self) -> u32 {
        self.sent + self.retrying + self.failed + self.lease_lost + self.errors
    }

    fn record(&mut self, outcome: &Result<DeliveryOutcome, AppError>) {
        match outcome {
            Ok(DeliveryOutcome::Sent) => self.sent += 1,
            Ok(DeliveryOutcome::Retrying) => self.retrying += 1,
            Ok(DeliveryOutcome::Failed) => self.failed += 1,
            Ok(DeliveryOutcome::LeaseLost) => self.lease_lost += 1,
            Err(_) => self.errors += 1,
        }
    }
}

pub struct DeliveryExecutor {
    store: Arc<dyn BroadcastStore>,
    gateway: Arc<dyn MessageGateway>,
    registry: Arc<dyn SubscriberRegistry>,
    max_attempts: i32,
}

impl DeliveryExecutor {
    pub fn new(
        store: Arc<dyn BroadcastStore>,
        gateway: Arc<dyn MessageGateway>,
        registry: Arc<dyn SubscriberRegistry>,
        max_attempts: i32,
    ) -> Self {
        Self {
            store,
            gateway,
            registry,
            max_attempts,
        }
    }

    /// Send one claimed delivery and write its outcome under the claim token.
    /// Outcome timestamps are taken once the gateway has answered.
    pub async fn process(
        &self,
        claimed: &ClaimedDelivery,
        message: &str,
        clock: &TickClock,
    ) -> Result<DeliveryOutcome, AppError> {
        let delivery = &claimed.delivery;

        let reply = self.gateway.send(&delivery.chat_id, message).await;
        let now = clock.now();
        match reply {
            Ok(receipt) => {
                let written = self
                    .store
                    .record_sent(delivery.id, &claimed.token, receipt.message_id, now)
                    .await?;
                if !written {
                    tracing::warn!(
                        delivery_id = delivery.id,
                        run_id = delivery.run_id,
                        "Lease lost before SENT could be recorded"
                    );
                    return Ok(DeliveryOutcome::LeaseLost);
                }
                Ok(DeliveryOutcome::Sent)
            }
            Err(err) => self.handle_failure(claimed, &err, now).await,
        }
    }

    async fn handle_failure(
        &self,
        claimed: &ClaimedDelivery,
        err: &GatewayError,
        now: DateTime<Utc>,
    ) -> Result<DeliveryOutcome, AppError> {
        let delivery = &claimed.delivery;
        let class = classify(err);

        let failure = match class {
            FailureClass::Retryable if delivery.attempt_count < self.max_attempts => {
                let hint = err
                    .retry_after
                    .and_then(|d| chrono::Duration::from_std(d).ok())
                    .unwrap_or_else(chrono::Duration::zero);
                let delay = backoff(delivery.attempt_count).max(hint);
                FailureRecord {
                    status: DeliveryStatus::FailedRetryable,
                    next_attempt_at: Some(now + delay),
                    error: truncate_error(&err.to_string()),
                }
            }
            _ => FailureRecord {
                status: DeliveryStatus::FailedPermanent,
                next_attempt_at: None,
                error: truncate_error(&err.to_string()),
            },
        };

        if let FailureClass::Permanent { unreachable: true } = class {
            match self.registry.mark_inactive(&delivery.chat_id).await {
                Ok(true) => {
                    tracing::info!(chat_id = %delivery.chat_id, "Deactivated unreachable subscriber")
                }
                Ok(false) => {}
                Err(e) => tracing::error!(
                    chat_id = %delivery.chat_id,
                    error = %e,
                    "Failed to deactivate subscriber"
                ),
            }
        }

        let written = self
            .store
            .record_failure(delivery.id, &claimed.token, &failure, now)
            .await?;
        if !written {
            tracing::warn!(
                delivery_id = delivery.id,
                run_id = delivery.run_id,
                "Lease lost before failure could be recorded"
            );
            return Ok(DeliveryOutcome::LeaseLost);
        }

        tracing::debug!(
            delivery_id = delivery.id,
            attempt = delivery.attempt_count,
            status = %failure.status,
            error = %err,
            "Delivery failed"
        );

        Ok(match failure.status {
            DeliveryStatus::FailedRetryable => DeliveryOutcome::Retrying,
            _ => DeliveryOutcome::Failed,
        })
    }

    /// Process a batch with at most `concurrency` sends in flight. A failing
    /// delivery never aborts the others.
    pub async fn process_batch(
        &self,
        batch: Vec<ClaimedDelivery>,
        message: &str,
        concurrency: usize,
        clock: TickClock,
    ) -> BatchSummary {
        let results = map_bounded(batch, concurrency, |claimed| async move {
            let outcome = self.process(&claimed, message, &clock).await;
            if let Err(e) = &outcome {
                tracing::error!(
                    delivery_id = claimed.delivery.id,
                    error = %e,
                    "Failed to write delivery outcome"
                );
            }
            outcome
        })
        .await;

        let mut summary = BatchSummary::default();
        for outcome in &results {
            summary.record(outcome);
        }
        summary
    }
}
