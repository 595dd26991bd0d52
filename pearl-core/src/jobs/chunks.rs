use super::JobReport;
use crate::crypto::compute_hash;
use crate::error::Result;
use crate::storage::{ContentStore, EntityStore, Session, chunk_key};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Returns stuck ledger submissions to the pool of open chunk work.
#[derive(Clone)]
pub struct ExpireTimedOutChunksJob {
    store: Arc<EntityStore>,
    batch_limit: usize,
}

impl ExpireTimedOutChunksJob {
    pub fn new(store: Arc<EntityStore>, batch_limit: usize) -> Self {
        Self { store, batch_limit }
    }

    pub async fn run(&self, threshold: DateTime<Utc>) -> Result<JobReport> {
        let expired = self
            .store
            .expire_unverified_chunks(threshold, self.batch_limit)?;
        if expired > 0 {
            tracing::info!("timed out chunks reset. count={}", expired);
        }

        Ok(JobReport {
            processed: expired,
            advanced: expired,
            failed: 0,
        })
    }
}

/// Raises `all_data_ready` on sessions once every chunk slot has a payload in
/// the content store.
#[derive(Clone)]
pub struct CheckAllDataReadyJob {
    store: Arc<EntityStore>,
    content_store: Arc<dyn ContentStore>,
    batch_limit: usize,
}

impl CheckAllDataReadyJob {
    pub fn new(
        store: Arc<EntityStore>,
        content_store: Arc<dyn ContentStore>,
        batch_limit: usize,
    ) -> Self {
        Self {
            store,
            content_store,
            batch_limit,
        }
    }

    pub async fn run(&self) -> Result<JobReport> {
        let sessions = self.store.list_sessions_awaiting_data(self.batch_limit)?;
        let mut report = JobReport::default();

        for session in sessions {
            report.processed += 1;
            match self.check(&session).await {
                Ok(true) => {
                    report.advanced += 1;
                    tracing::info!(
                        "all data ready. session={} file={}",
                        session.id,
                        session.file_identifier
                    );
                }
                Ok(false) => {}
                Err(error) => {
                    report.failed += 1;
                    tracing::warn!("data check failed. session={} error={}", session.id, error);
                }
            }
        }

        Ok(report)
    }

    async fn check(&self, session: &Session) -> Result<bool> {
        let missing = self
            .store
            .list_chunks_missing_payload(&session.file_identifier)?;

        let mut still_missing = 0usize;
        for chunk in missing {
            let key = chunk_key(&chunk.file_identifier, chunk.physical_index);
            match self.content_store.get(&key).await? {
                Some(payload) => {
                    self.store.mark_chunk_payload(
                        &chunk.file_identifier,
                        chunk.physical_index,
                        Some(&compute_hash(&payload)),
                    )?;
                }
                None => still_missing += 1,
            }
        }

        tracing::debug!(
            "data check. session={} missing={}",
            session.id,
            still_missing
        );
        if still_missing > 0 {
            return Ok(false);
        }

        self.store.set_all_data_ready(&session.id)?;
        Ok(true)
    }
}
