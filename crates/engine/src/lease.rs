//! Run and delivery lease acquisition.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::BroadcastDelivery;

use crate::store::{BroadcastStore, Lease};

/// How many candidates to fetch per delivery slot, so that rows lost to a
/// concurrent claimer can be replaced without another round trip.
const OVERFETCH_FACTOR: i64 = 2;

/// How many run candidates to look at per claim attempt.
const RUN_CANDIDATE_LIMIT: i64 = 10;

/// Ownership of a run held by this worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLease {
    pub run_id: i64,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// A delivery row this worker won, with the token that guards its writes.
#[derive(Debug, Clone)]
pub struct ClaimedDelivery {
    pub delivery: BroadcastDelivery,
    pub token: String,
}

pub struct LeaseCoordinator {
    store: Arc<dyn BroadcastStore>,
    run_lease: Duration,
    delivery_lease: Duration,
}

impl LeaseCoordinator {
    pub fn new(store: Arc<dyn BroadcastStore>, run_lease: Duration, delivery_lease: Duration) -> Self {
        Self {
            store,
            run_lease,
            delivery_lease,
        }
    }

    fn fresh_lease(ttl: Duration, now: DateTime<Utc>) -> Lease {
        Lease {
            token: Uuid::new_v4().to_string(),
            expires_at: now + ttl,
        }
    }

    /// Claim the next processable run, skipping `exclude`.
    ///
    /// Candidates lost to another worker are skipped and the next one tried;
    /// `None` means nothing is claimable right now.
    pub async fn claim_next_run(
        &self,
        now: DateTime<Utc>,
        exclude: &[i64],
    ) -> Result<Option<RunLease>, AppError> {
        let mut skipped: Vec<i64> = exclude.to_vec();

        loop {
            let candidates = self
                .store
                .find_run_candidates(now, &skipped, RUN_CANDIDATE_LIMIT)
                .await?;
            if candidates.is_empty() {
                return Ok(None);
            }

            for candidate in candidates {
                let lease = Self::fresh_lease(self.run_lease, now);
                if self.store.try_claim_run(candidate.id, &lease, now).await? {
                    tracing::debug!(
                        run_id = candidate.id,
                        previous = %candidate.status,
                        "Claimed run"
                    );
                    return Ok(Some(RunLease {
                        run_id: candidate.id,
                        token: lease.token,
                        expires_at: lease.expires_at,
                    }));
                }
                skipped.push(candidate.id);
            }
        }
    }

    /// Extend the run lease. `false` means the lease was lost.
    pub async fn renew(&self, lease: &mut RunLease, now: DateTime<Utc>) -> Result<bool, AppError> {
        let renewed = Lease {
            token: lease.token.clone(),
            expires_at: now + self.run_lease,
        };
        let ok = self
            .store
            .renew_run_lease(lease.run_id, &renewed, now)
            .await?;
        if ok {
            lease.expires_at = renewed.expires_at;
        }
        Ok(ok)
    }

    pub async fn release(&self, lease: &RunLease, now: DateTime<Utc>) -> Result<bool, AppError> {
        self.store
            .release_run_lease(lease.run_id, &lease.token, now)
            .await
    }

    /// Claim up to `batch_size` due deliveries of the run.
    ///
    /// Every row is claimed individually, so two workers racing on the same
    /// candidates split them instead of both sending.
    pub async fn claim_batch(
        &self,
        run_id: i64,
        batch_size: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ClaimedDelivery>, AppError> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }

        let candidates = self
            .store
            .find_delivery_candidates(run_id, now, batch_size as i64 * OVERFETCH_FACTOR)
            .await?;

        let mut claimed = Vec::with_capacity(batch_size);
        for delivery_id in candidates {
            if claimed.len() >= batch_size {
                break;
            }
            let lease = Self::fresh_lease(self.delivery_lease, now);
            if let Some(delivery) = self.store.try_claim_delivery(delivery_id, &lease, now).await? {
                claimed.push(ClaimedDelivery {
                    delivery,
                    token: lease.token,
                });
            }
        }

        Ok(claimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_common::types::{DeliveryStatus, RunStatus};

    use crate::memory::{MemoryStore, MemoryUser};
    use crate::resolver::TargetSpec;
    use crate::store::NewRun;

    async fn seeded_store(recipients: i64) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new(3));
        for id in 1..=recipients {
            store
                .add_user(MemoryUser {
                    id,
                    chat_id: Some(format!("{}", 1000 + id)),
                    ..Default::default()
                })
                .await;
        }
        store
    }

    async fn open_run(store: &MemoryStore) -> i64 {
        store
            .create_run(
                &NewRun {
                    message: "hello".into(),
                    kind: "announcement".into(),
                    target: TargetSpec::All,
                    requested_by: None,
                    recipient_limit: None,
                },
                Utc::now(),
            )
            .await
            .unwrap()
            .id
    }

    fn coordinator(store: Arc<MemoryStore>) -> LeaseCoordinator {
        LeaseCoordinator::new(store, Duration::seconds(120), Duration::seconds(60))
    }

    #[tokio::test]
    async fn test_claimed_run_is_not_claimable_twice() {
        let store = seeded_store(1).await;
        let run_id = open_run(&store).await;
        let leases = coordinator(store.clone());
        let now = Utc::now();

        let first = leases.claim_next_run(now, &[]).await.unwrap().unwrap();
        assert_eq!(first.run_id, run_id);
        assert!(leases.claim_next_run(now, &[]).await.unwrap().is_none());

        let run = store.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.lock_token.as_deref(), Some(first.token.as_str()));
    }

    #[tokio::test]
    async fn test_expired_run_lease_can_be_stolen() {
        let store = seeded_store(1).await;
        open_run(&store).await;
        let leases = coordinator(store.clone());
        let now = Utc::now();

        let first = leases.claim_next_run(now, &[]).await.unwrap().unwrap();
        let later = now + Duration::seconds(121);
        let second = leases.claim_next_run(later, &[]).await.unwrap().unwrap();
        assert_ne!(first.token, second.token);

        let mut stale = first.clone();
        assert!(!leases.renew(&mut stale, later).await.unwrap());
    }

    #[tokio::test]
    async fn test_excluded_runs_are_skipped() {
        let store = seeded_store(1).await;
        let run_id = open_run(&store).await;
        let leases = coordinator(store);

        assert!(
            leases
                .claim_next_run(Utc::now(), &[run_id])
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_claim_batch_caps_at_batch_size() {
        let store = seeded_store(5).await;
        let run_id = open_run(&store).await;
        let leases = coordinator(store.clone());
        let now = Utc::now();

        let batch = leases.claim_batch(run_id, 3, now).await.unwrap();
        assert_eq!(batch.len(), 3);
        for claimed in &batch {
            assert_eq!(claimed.delivery.status, DeliveryStatus::Processing);
            assert_eq!(claimed.delivery.attempt_count, 1);
            assert_eq!(claimed.delivery.lock_token.as_deref(), Some(claimed.token.as_str()));
        }

        let rest = leases.claim_batch(run_id, 3, now).await.unwrap();
        assert_eq!(rest.len(), 2);
    }

    #[tokio::test]
    async fn test_renew_extends_expiry() {
        let store = seeded_store(1).await;
        open_run(&store).await;
        let leases = coordinator(store);
        let now = Utc::now();

        let mut lease = leases.claim_next_run(now, &[]).await.unwrap().unwrap();
        let later = now + Duration::seconds(30);
        assert!(leases.renew(&mut lease, later).await.unwrap());
        assert_eq!(lease.expires_at, later + Duration::seconds(120));
    }
}
