use super::JobReport;
use crate::crypto::compute_hash;
use crate::error::Result;
use crate::storage::{ContentStore, EntityStore, Session, chunk_key};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

/// Writes each paid session's reward messages into their reserved chunk
/// slots, then releases the session's chunks for ledger submission.
#[derive(Clone)]
pub struct ReleaseBuriedRewardsJob {
    store: Arc<EntityStore>,
    content_store: Arc<dyn ContentStore>,
    content_ttl: Duration,
    batch_limit: usize,
}

impl ReleaseBuriedRewardsJob {
    pub fn new(
        store: Arc<EntityStore>,
        content_store: Arc<dyn ContentStore>,
        content_ttl: Duration,
        batch_limit: usize,
    ) -> Self {
        Self {
            store,
            content_store,
            content_ttl,
            batch_limit,
        }
    }

    pub async fn run(&self) -> Result<JobReport> {
        let sessions = self.store.list_sessions_awaiting_burial(self.batch_limit)?;
        let mut report = JobReport::default();

        for session in sessions {
            report.processed += 1;
            match self.bury(&session).await {
                Ok(rewards) => {
                    report.advanced += 1;
                    tracing::info!(
                        "rewards buried. session={} file={} rewards={}",
                        session.id,
                        session.file_identifier,
                        rewards
                    );
                }
                Err(error) => {
                    report.failed += 1;
                    tracing::warn!("reward burial failed. session={} error={}", session.id, error);
                }
            }
        }

        Ok(report)
    }

    async fn bury(&self, session: &Session) -> Result<usize> {
        let rewards = self.store.list_rewards_for_session(&session.id)?;

        let entries: Vec<(String, Bytes)> = rewards
            .iter()
            .map(|reward| {
                (
                    chunk_key(&session.file_identifier, reward.physical_index),
                    Bytes::from(reward.ledger_message.clone()),
                )
            })
            .collect();
        self.content_store
            .batch_set(entries, self.content_ttl)
            .await?;

        for reward in &rewards {
            self.store.mark_chunk_payload(
                &session.file_identifier,
                reward.physical_index,
                Some(&compute_hash(reward.ledger_message.as_bytes())),
            )?;
        }

        self.store.complete_burial(session)?;
        Ok(rewards.len())
    }
}
