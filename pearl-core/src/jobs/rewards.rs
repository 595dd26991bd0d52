use super::JobReport;
use crate::error::Result;
use crate::ledger::Ledgers;
use crate::storage::{AttachmentStatus, EntityStore, Reward};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Submits signed reward messages to the append-only ledger.
#[derive(Clone)]
pub struct AttachRewardsJob {
    store: Arc<EntityStore>,
    ledgers: Ledgers,
    batch_limit: usize,
}

impl AttachRewardsJob {
    pub fn new(store: Arc<EntityStore>, ledgers: Ledgers, batch_limit: usize) -> Self {
        Self {
            store,
            ledgers,
            batch_limit,
        }
    }

    pub async fn run(&self) -> Result<JobReport> {
        let rewards = self.store.list_rewards_by_attachment(
            &[AttachmentStatus::Signed, AttachmentStatus::AttachError],
            self.batch_limit,
        )?;
        let mut report = JobReport::default();

        for reward in rewards {
            report.processed += 1;
            let next = match self
                .ledgers
                .attach(
                    &reward.ledger_address,
                    &reward.ledger_message,
                    &reward.file_identifier,
                    reward.physical_index,
                )
                .await
            {
                Ok(()) => AttachmentStatus::SignedAndAttached,
                Err(error) => {
                    report.failed += 1;
                    tracing::warn!(
                        "reward attach failed. reward={} address={} error={}",
                        reward.id,
                        reward.ledger_address,
                        error
                    );
                    AttachmentStatus::AttachError
                }
            };

            if update_attachment(&self.store, &reward, next)
                && next == AttachmentStatus::SignedAndAttached
            {
                report.advanced += 1;
            }
        }

        Ok(report)
    }
}

/// Confirms that what the ledger recorded for each attached reward is the
/// reward's message.
#[derive(Clone)]
pub struct VerifyRewardAttachmentJob {
    store: Arc<EntityStore>,
    ledgers: Ledgers,
    batch_limit: usize,
}

impl VerifyRewardAttachmentJob {
    pub fn new(store: Arc<EntityStore>, ledgers: Ledgers, batch_limit: usize) -> Self {
        Self {
            store,
            ledgers,
            batch_limit,
        }
    }

    /// Attached rewards still unrecorded at or before `threshold` are sent
    /// back for re-attachment.
    pub async fn run(&self, threshold: DateTime<Utc>) -> Result<JobReport> {
        let rewards = self
            .store
            .list_rewards_by_attachment(&[AttachmentStatus::SignedAndAttached], self.batch_limit)?;
        let mut report = JobReport::default();

        for reward in rewards {
            report.processed += 1;
            let next = match self.ledgers.fetch_recorded(&reward.ledger_address).await {
                Ok(Some(recorded)) if recorded == reward.ledger_message => {
                    Some(AttachmentStatus::SignedAndAttachmentVerified)
                }
                Ok(Some(_)) => {
                    tracing::warn!(
                        "reward recorded with foreign content. reward={} address={}",
                        reward.id,
                        reward.ledger_address
                    );
                    Some(AttachmentStatus::AttachError)
                }
                Ok(None) if reward.updated_at <= threshold => {
                    tracing::info!(
                        "reward attachment timed out. reward={} address={}",
                        reward.id,
                        reward.ledger_address
                    );
                    Some(AttachmentStatus::AttachError)
                }
                Ok(None) => None,
                Err(error) => {
                    report.failed += 1;
                    tracing::warn!(
                        "reward verification failed. reward={} error={}",
                        reward.id,
                        error
                    );
                    (reward.updated_at <= threshold).then_some(AttachmentStatus::AttachError)
                }
            };

            let Some(next) = next else {
                continue;
            };
            if update_attachment(&self.store, &reward, next)
                && next == AttachmentStatus::SignedAndAttachmentVerified
            {
                report.advanced += 1;
            }
        }

        Ok(report)
    }
}

fn update_attachment(store: &EntityStore, reward: &Reward, status: AttachmentStatus) -> bool {
    match store.set_attachment_status(&reward.id, status) {
        Ok(()) => {
            tracing::debug!(
                "reward attachment updated. reward={} from={} to={}",
                reward.id,
                reward.attachment_status,
                status
            );
            true
        }
        Err(error) => {
            tracing::warn!(
                "reward status write failed. reward={} status={} error={}",
                reward.id,
                status,
                error
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::StartPairedSessionOperationRequest;
    use crate::test_support::{Harness, REWARD_SEED, StaticPeer};

    async fn open_session(harness: &Harness) -> Vec<Reward> {
        let session = harness
            .start_paired(Arc::new(StaticPeer::failing()))
            .run(StartPairedSessionOperationRequest {
                file_identifier: "genesis".to_string(),
                file_size_bytes: 5,
                chunk_count: 5,
                storage_years: 1,
                peer_address: None,
                reward_seed: REWARD_SEED.to_string(),
            })
            .await
            .unwrap()
            .session;
        harness.store.list_rewards_for_session(&session.id).unwrap()
    }

    fn status_of(harness: &Harness, reward: &Reward) -> AttachmentStatus {
        harness
            .store
            .get_reward(&reward.id)
            .unwrap()
            .unwrap()
            .attachment_status
    }

    #[tokio::test]
    async fn test_attach_then_verify() {
        let harness = Harness::new();
        let rewards = open_session(&harness).await;
        assert_eq!(rewards.len(), 1);

        let attach = AttachRewardsJob::new(harness.store.clone(), harness.ledgers.clone(), 10);
        let verify =
            VerifyRewardAttachmentJob::new(harness.store.clone(), harness.ledgers.clone(), 10);

        let report = attach.run().await.unwrap();
        assert_eq!(report.advanced, 1);
        assert_eq!(
            status_of(&harness, &rewards[0]),
            AttachmentStatus::SignedAndAttached
        );

        let report = verify.run(Utc::now() - chrono::Duration::hours(1)).await.unwrap();
        assert_eq!(report.advanced, 1);
        assert_eq!(
            status_of(&harness, &rewards[0]),
            AttachmentStatus::SignedAndAttachmentVerified
        );

        // terminal
        assert_eq!(attach.run().await.unwrap().processed, 0);
        assert_eq!(verify.run(Utc::now()).await.unwrap().processed, 0);
    }

    #[tokio::test]
    async fn test_attach_failure_is_retried() {
        let harness = Harness::new();
        let rewards = open_session(&harness).await;
        let attach = AttachRewardsJob::new(harness.store.clone(), harness.ledgers.clone(), 10);

        harness.append.set_fail_calls(true);
        let report = attach.run().await.unwrap();
        assert_eq!((report.failed, report.advanced), (1, 0));
        assert_eq!(status_of(&harness, &rewards[0]), AttachmentStatus::AttachError);

        harness.append.set_fail_calls(false);
        attach.run().await.unwrap();
        assert_eq!(
            status_of(&harness, &rewards[0]),
            AttachmentStatus::SignedAndAttached
        );
    }

    #[tokio::test]
    async fn test_unrecorded_attachment_times_out() {
        let harness = Harness::new();
        let rewards = open_session(&harness).await;
        harness.append.set_hold_attachments(true);

        AttachRewardsJob::new(harness.store.clone(), harness.ledgers.clone(), 10)
            .run()
            .await
            .unwrap();
        let verify =
            VerifyRewardAttachmentJob::new(harness.store.clone(), harness.ledgers.clone(), 10);

        // inside the grace window nothing changes
        verify.run(Utc::now() - chrono::Duration::hours(1)).await.unwrap();
        assert_eq!(
            status_of(&harness, &rewards[0]),
            AttachmentStatus::SignedAndAttached
        );

        verify.run(Utc::now() + chrono::Duration::hours(1)).await.unwrap();
        assert_eq!(status_of(&harness, &rewards[0]), AttachmentStatus::AttachError);
    }

    #[tokio::test]
    async fn test_mismatched_record_forces_reattach() {
        let harness = Harness::new();
        let rewards = open_session(&harness).await;

        AttachRewardsJob::new(harness.store.clone(), harness.ledgers.clone(), 10)
            .run()
            .await
            .unwrap();
        harness
            .append
            .record(&rewards[0].ledger_address, "someone else")
            .await;

        VerifyRewardAttachmentJob::new(harness.store.clone(), harness.ledgers.clone(), 10)
            .run(Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(status_of(&harness, &rewards[0]), AttachmentStatus::AttachError);
    }
}
