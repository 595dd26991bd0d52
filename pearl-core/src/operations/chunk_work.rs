use crate::error::{PearlError, Result};
use crate::ledger::Ledgers;
use crate::options::BrokerOptions;
use crate::storage::{ChunkStatus, ContentStore, EntityStore, FileIdentifier, chunk_key};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct AssignFileIdentifierOperationRequest {
    pub exclude: Vec<String>,
}

/// Hands out the oldest eligible file identifier from the pool.
#[derive(Clone)]
pub struct AssignFileIdentifierOperation {
    store: Arc<EntityStore>,
    options: Arc<BrokerOptions>,
}

impl AssignFileIdentifierOperation {
    pub fn new(store: Arc<EntityStore>, options: Arc<BrokerOptions>) -> Self {
        Self { store, options }
    }

    pub fn run(&self, request: AssignFileIdentifierOperationRequest) -> Result<FileIdentifier> {
        let AssignFileIdentifierOperationRequest { exclude } = request;
        self.store
            .assign_file_identifier(&exclude, self.options.assignment_bound)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClaimChunkWorkOperationRequest {
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ClaimChunkWorkOperationResult {
    pub chunk_id: i64,
    pub file_identifier: String,
    pub physical_index: u64,
    pub address: String,
    /// Hex payload to carry in the ledger transaction, if still cached.
    pub message: Option<String>,
    pub branch: String,
    pub trunk: String,
}

/// Gives a worker one chunk to submit to the append-only ledger.
#[derive(Clone)]
pub struct ClaimChunkWorkOperation {
    store: Arc<EntityStore>,
    ledgers: Ledgers,
    content_store: Arc<dyn ContentStore>,
    options: Arc<BrokerOptions>,
}

impl ClaimChunkWorkOperation {
    pub fn new(
        store: Arc<EntityStore>,
        ledgers: Ledgers,
        content_store: Arc<dyn ContentStore>,
        options: Arc<BrokerOptions>,
    ) -> Self {
        Self {
            store,
            ledgers,
            content_store,
            options,
        }
    }

    pub async fn run(
        &self,
        request: ClaimChunkWorkOperationRequest,
    ) -> Result<ClaimChunkWorkOperationResult> {
        let ClaimChunkWorkOperationRequest { exclude } = request;

        let tips = self.ledgers.tips().await?;
        let (entry, chunk) = self.store.claim_chunk_work(
            &exclude,
            self.options.assignment_bound,
            &tips.branch,
            &tips.trunk,
        )?;

        let message = self
            .content_store
            .get(&chunk_key(&chunk.file_identifier, chunk.physical_index))
            .await?
            .map(hex::encode);

        tracing::info!(
            "chunk work claimed. file={} index={} chunk={}",
            entry.identifier,
            chunk.physical_index,
            chunk.id
        );

        Ok(ClaimChunkWorkOperationResult {
            chunk_id: chunk.id,
            file_identifier: chunk.file_identifier,
            physical_index: chunk.physical_index,
            address: chunk.address,
            message,
            branch: tips.branch,
            trunk: tips.trunk,
        })
    }
}

#[derive(Debug, Clone)]
pub struct CompleteChunkWorkOperationRequest {
    pub chunk_id: i64,
    pub raw_transaction: String,
}

/// Checks a signed transaction against the claimed chunk, broadcasts it and
/// returns the file identifier to the pool.
#[derive(Clone)]
pub struct CompleteChunkWorkOperation {
    store: Arc<EntityStore>,
    ledgers: Ledgers,
    content_store: Arc<dyn ContentStore>,
}

impl CompleteChunkWorkOperation {
    pub fn new(
        store: Arc<EntityStore>,
        ledgers: Ledgers,
        content_store: Arc<dyn ContentStore>,
    ) -> Self {
        Self {
            store,
            ledgers,
            content_store,
        }
    }

    pub async fn run(&self, request: CompleteChunkWorkOperationRequest) -> Result<()> {
        let CompleteChunkWorkOperationRequest {
            chunk_id,
            raw_transaction,
        } = request;

        let chunk = self
            .store
            .get_chunk(chunk_id)?
            .ok_or_else(|| PearlError::ChunkNotFound(chunk_id.to_string()))?;
        if chunk.status != ChunkStatus::Unverified {
            return Err(PearlError::InvalidRequest(format!(
                "chunk {} is {}, not awaiting completion",
                chunk_id, chunk.status
            )));
        }

        let transaction = self.ledgers.decode_signed(&raw_transaction).await?;
        if transaction.address != chunk.address {
            return Err(PearlError::InvalidRequest(
                "transaction address does not match chunk".to_string(),
            ));
        }
        if Some(&transaction.branch) != chunk.branch.as_ref()
            || Some(&transaction.trunk) != chunk.trunk.as_ref()
        {
            return Err(PearlError::InvalidRequest(
                "transaction does not reference the assigned tips".to_string(),
            ));
        }

        let payload = self
            .content_store
            .get(&chunk_key(&chunk.file_identifier, chunk.physical_index))
            .await?;
        let message_matches = match payload {
            Some(payload) => hex::encode(payload) == transaction.message,
            None => !transaction.message.is_empty(),
        };
        if !message_matches {
            return Err(PearlError::InvalidRequest(
                "transaction message does not match chunk payload".to_string(),
            ));
        }

        self.ledgers.broadcast_signed(&raw_transaction).await?;
        self.store.complete_chunk_work(chunk.id)?;

        tracing::info!(
            "chunk work completed. file={} index={} chunk={}",
            chunk.file_identifier,
            chunk.physical_index,
            chunk.id
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::SignedTransaction;
    use crate::storage::entity_store::tests::sample_session;
    use crate::storage::{IdentifierStatus, NewChunk};
    use crate::test_support::Harness;
    use bytes::Bytes;
    use std::time::Duration;

    fn seed_released_file(harness: &Harness) {
        let session = sample_session("genesis", 2);
        let chunks: Vec<NewChunk> = (0..3)
            .map(|index| NewChunk {
                physical_index: index,
                address: format!("addr-{}", index),
            })
            .collect();
        harness.store.insert_session(&session, &[], &chunks).unwrap();
        harness.store.complete_burial(&session).unwrap();
    }

    fn signed(result: &ClaimChunkWorkOperationResult, message: &str) -> String {
        serde_json::to_string(&SignedTransaction {
            address: result.address.clone(),
            message: message.to_string(),
            branch: result.branch.clone(),
            trunk: result.trunk.clone(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_claim_and_complete_chunk_work() {
        let harness = Harness::new();
        seed_released_file(&harness);
        harness
            .content
            .batch_set(
                vec![(chunk_key("genesis", 0), Bytes::from_static(b"payload"))],
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        let claim = ClaimChunkWorkOperation::new(
            harness.store.clone(),
            harness.ledgers.clone(),
            harness.content.clone(),
            harness.options.clone(),
        );
        let complete = CompleteChunkWorkOperation::new(
            harness.store.clone(),
            harness.ledgers.clone(),
            harness.content.clone(),
        );

        let work = claim.run(ClaimChunkWorkOperationRequest::default()).await.unwrap();
        assert_eq!(work.physical_index, 0);
        assert_eq!(work.message.as_deref(), Some(hex::encode(b"payload").as_str()));

        // second worker finds the identifier taken
        assert!(matches!(
            claim.run(ClaimChunkWorkOperationRequest::default()).await,
            Err(PearlError::NoneAvailable)
        ));

        let wrong = complete
            .run(CompleteChunkWorkOperationRequest {
                chunk_id: work.chunk_id,
                raw_transaction: signed(&work, "6f74686572"),
            })
            .await;
        assert!(matches!(wrong, Err(PearlError::InvalidRequest(_))));

        complete
            .run(CompleteChunkWorkOperationRequest {
                chunk_id: work.chunk_id,
                raw_transaction: signed(&work, &hex::encode(b"payload")),
            })
            .await
            .unwrap();

        assert_eq!(harness.append.broadcasts().await.len(), 1);
        let chunk = harness.store.get_chunk(work.chunk_id).unwrap().unwrap();
        assert_eq!(chunk.status, ChunkStatus::Complete);

        let pool = harness.store.list_file_identifiers("genesis").unwrap();
        assert_eq!(pool[0].status, IdentifierStatus::Unassigned);
        assert_eq!(pool[0].assignment_count, 1);

        let next = claim.run(ClaimChunkWorkOperationRequest::default()).await.unwrap();
        assert_eq!(next.physical_index, 1);
        assert!(next.message.is_none());
    }

    #[tokio::test]
    async fn test_claim_respects_exclusions() {
        let harness = Harness::new();
        seed_released_file(&harness);

        let claim = ClaimChunkWorkOperation::new(
            harness.store.clone(),
            harness.ledgers.clone(),
            harness.content.clone(),
            harness.options.clone(),
        );
        let result = claim
            .run(ClaimChunkWorkOperationRequest {
                exclude: vec!["genesis".to_string()],
            })
            .await;
        assert!(matches!(result, Err(PearlError::NoneAvailable)));
    }

    #[tokio::test]
    async fn test_assign_file_identifier_operation() {
        let harness = Harness::new();
        harness.store.register_file_identifier("a", 1, 1).unwrap();

        let operation = AssignFileIdentifierOperation::new(harness.store.clone(), harness.options.clone());
        let entry = operation
            .run(AssignFileIdentifierOperationRequest::default())
            .unwrap();
        assert_eq!(entry.identifier, "a");
        assert!(matches!(
            operation.run(AssignFileIdentifierOperationRequest::default()),
            Err(PearlError::NoneAvailable)
        ));
    }
}
