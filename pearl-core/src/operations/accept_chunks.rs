use crate::crypto::compute_hash;
use crate::error::{PearlError, Result};
use crate::options::BrokerOptions;
use crate::storage::{ContentStore, EntityStore, chunk_key};
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct ChunkUpload {
    pub logical_index: u64,
    pub payload: Bytes,
    /// Echo of the session's file identifier.
    pub integrity_tag: String,
}

#[derive(Debug, Clone)]
pub struct AcceptChunkBatchOperationRequest {
    pub session_id: String,
    pub chunks: Vec<ChunkUpload>,
}

#[derive(Debug, Clone)]
pub struct AcceptedChunk {
    pub logical_index: u64,
    pub physical_index: u64,
    pub payload_hash: String,
}

#[derive(Debug, Clone)]
pub struct AcceptChunkBatchOperationResult {
    pub accepted: Vec<AcceptedChunk>,
}

#[derive(Debug)]
struct IngestionBatch {
    session_id: String,
    file_identifier: String,
    entries: Vec<(String, Bytes)>,
    /// (physical index, payload hash) per entry.
    hashes: Vec<(u64, String)>,
}

#[derive(Debug, Default)]
pub struct IngestionStats {
    persisted_batches: AtomicU64,
    persisted_chunks: AtomicU64,
    dropped_batches: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IngestionStatsSnapshot {
    pub persisted_batches: u64,
    pub persisted_chunks: u64,
    pub dropped_batches: u64,
}

impl IngestionStats {
    pub fn snapshot(&self) -> IngestionStatsSnapshot {
        IngestionStatsSnapshot {
            persisted_batches: self.persisted_batches.load(Ordering::Relaxed),
            persisted_chunks: self.persisted_chunks.load(Ordering::Relaxed),
            dropped_batches: self.dropped_batches.load(Ordering::Relaxed),
        }
    }
}

/// Bounded queue between request handlers and the content store.
///
/// One worker drains the queue, writes each batch to the content store and
/// then records the payload hashes on the chunk rows. A failed write is
/// logged and the batch is dropped. Clients notice through chunk status and
/// upload again.
pub struct IngestionQueue {
    sender: Mutex<Option<mpsc::Sender<IngestionBatch>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<IngestionStats>,
}

impl IngestionQueue {
    pub fn start(
        store: Arc<EntityStore>,
        content_store: Arc<dyn ContentStore>,
        ttl: Duration,
        depth: usize,
    ) -> Self {
        let (sender, mut receiver) = mpsc::channel::<IngestionBatch>(depth.max(1));
        let stats = Arc::new(IngestionStats::default());

        let worker_stats = stats.clone();
        let worker = tokio::spawn(async move {
            while let Some(batch) = receiver.recv().await {
                let chunk_count = batch.entries.len() as u64;
                match content_store.batch_set(batch.entries, ttl).await {
                    Ok(()) => {
                        if let Err(error) =
                            store.record_chunk_payloads(&batch.file_identifier, &batch.hashes)
                        {
                            tracing::warn!(
                                "chunk payload hashes not recorded. session={} error={}",
                                batch.session_id,
                                error
                            );
                        }
                        worker_stats.persisted_batches.fetch_add(1, Ordering::Relaxed);
                        worker_stats
                            .persisted_chunks
                            .fetch_add(chunk_count, Ordering::Relaxed);
                        tracing::debug!(
                            "chunk batch persisted. session={} chunks={}",
                            batch.session_id,
                            chunk_count
                        );
                    }
                    Err(error) => {
                        worker_stats.dropped_batches.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            "chunk batch dropped. session={} chunks={} error={}",
                            batch.session_id,
                            chunk_count,
                            error
                        );
                    }
                }
            }
        });

        Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            stats,
        }
    }

    pub fn stats(&self) -> IngestionStatsSnapshot {
        self.stats.snapshot()
    }

    async fn submit(&self, batch: IngestionBatch) -> Result<()> {
        let guard = self.sender.lock().await;
        let sender = guard
            .as_ref()
            .ok_or_else(|| PearlError::Internal("ingestion queue is closed".to_string()))?;

        sender.try_send(batch).map_err(|error| match error {
            mpsc::error::TrySendError::Full(_) => {
                PearlError::Busy("ingestion queue is full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                PearlError::Internal("ingestion worker stopped".to_string())
            }
        })
    }

    /// Stops accepting batches, drains what is queued and waits for the worker.
    pub async fn close(&self) {
        self.sender.lock().await.take();
        if let Some(worker) = self.worker.lock().await.take() {
            if let Err(error) = worker.await {
                tracing::warn!("ingestion worker ended abnormally. error={}", error);
            }
        }
    }
}

#[derive(Clone)]
pub struct AcceptChunkBatchOperation {
    store: Arc<EntityStore>,
    queue: Arc<IngestionQueue>,
    options: Arc<BrokerOptions>,
}

impl AcceptChunkBatchOperation {
    pub fn new(
        store: Arc<EntityStore>,
        queue: Arc<IngestionQueue>,
        options: Arc<BrokerOptions>,
    ) -> Self {
        Self {
            store,
            queue,
            options,
        }
    }

    /// Validates and enqueues the batch; returns before anything is written.
    pub async fn run(
        &self,
        request: AcceptChunkBatchOperationRequest,
    ) -> Result<AcceptChunkBatchOperationResult> {
        let AcceptChunkBatchOperationRequest { session_id, chunks } = request;

        if chunks.is_empty() {
            return Err(PearlError::InvalidRequest("empty chunk batch".to_string()));
        }
        if chunks.len() > self.options.max_batch_size {
            return Err(PearlError::InvalidRequest(format!(
                "batch of {} chunks exceeds limit {}",
                chunks.len(),
                self.options.max_batch_size
            )));
        }

        let session = self
            .store
            .get_session(&session_id)?
            .ok_or_else(|| PearlError::SessionNotFound(session_id.clone()))?;

        let mut accepted = Vec::with_capacity(chunks.len());
        let mut entries = Vec::with_capacity(chunks.len());
        let mut hashes = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            if chunk.logical_index >= session.chunk_count {
                return Err(PearlError::InvalidRequest(format!(
                    "chunk index {} out of range for {} chunks",
                    chunk.logical_index, session.chunk_count
                )));
            }
            if chunk.integrity_tag != session.file_identifier {
                return Err(PearlError::InvalidRequest(format!(
                    "chunk {} does not belong to file {}",
                    chunk.logical_index, session.file_identifier
                )));
            }

            let physical_index = self
                .options
                .layout
                .to_physical_index(chunk.logical_index, &session.placement_map);
            let payload_hash = compute_hash(&chunk.payload);
            hashes.push((physical_index, payload_hash.clone()));
            accepted.push(AcceptedChunk {
                logical_index: chunk.logical_index,
                physical_index,
                payload_hash,
            });
            entries.push((
                chunk_key(&session.file_identifier, physical_index),
                chunk.payload,
            ));
        }

        self.queue
            .submit(IngestionBatch {
                session_id: session.id,
                file_identifier: session.file_identifier,
                entries,
                hashes,
            })
            .await?;

        Ok(AcceptChunkBatchOperationResult { accepted })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::StartPairedSessionOperationRequest;
    use crate::test_support::{Harness, REWARD_SEED, StaticPeer};

    async fn open_session(harness: &Harness) -> crate::storage::Session {
        harness
            .start_paired(Arc::new(StaticPeer::failing()))
            .run(StartPairedSessionOperationRequest {
                file_identifier: "genesis".to_string(),
                file_size_bytes: 20,
                chunk_count: 20,
                storage_years: 1,
                peer_address: None,
                reward_seed: REWARD_SEED.to_string(),
            })
            .await
            .unwrap()
            .session
    }

    fn upload(logical_index: u64, tag: &str) -> ChunkUpload {
        ChunkUpload {
            logical_index,
            payload: Bytes::from(format!("chunk-{}", logical_index)),
            integrity_tag: tag.to_string(),
        }
    }

    #[tokio::test]
    async fn test_accept_batch_maps_to_physical_slots() {
        let harness = Harness::new();
        let session = open_session(&harness).await;
        let queue = Arc::new(IngestionQueue::start(
            harness.store.clone(),
            harness.content.clone(),
            Duration::from_secs(60),
            4,
        ));
        let operation =
            AcceptChunkBatchOperation::new(harness.store.clone(), queue.clone(), harness.options.clone());

        let result = operation
            .run(AcceptChunkBatchOperationRequest {
                session_id: session.id.clone(),
                chunks: (0..20).map(|index| upload(index, "genesis")).collect(),
            })
            .await
            .unwrap();
        queue.close().await;

        assert_eq!(queue.stats().persisted_batches, 1);
        assert_eq!(queue.stats().persisted_chunks, 20);
        for chunk in &result.accepted {
            assert_eq!(
                chunk.physical_index,
                harness
                    .options
                    .layout
                    .to_physical_index(chunk.logical_index, &session.placement_map)
            );
            let stored = harness
                .content
                .get(&chunk_key("genesis", chunk.physical_index))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(stored, Bytes::from(format!("chunk-{}", chunk.logical_index)));
        }

        let rows = harness.store.list_chunks("genesis").unwrap();
        for chunk in &result.accepted {
            let row = &rows[chunk.physical_index as usize];
            assert_eq!(row.payload_hash.as_deref(), Some(chunk.payload_hash.as_str()));
            assert!(row.has_payload);
        }

        // reward slots stay empty
        for placement in &session.reward_map {
            assert!(
                !harness
                    .content
                    .exists(&chunk_key("genesis", placement.physical_index))
                    .await
                    .unwrap()
            );
        }
    }

    #[tokio::test]
    async fn test_accept_batch_validation() {
        let harness = Harness::new();
        let session = open_session(&harness).await;
        let queue = Arc::new(IngestionQueue::start(
            harness.store.clone(),
            harness.content.clone(),
            Duration::from_secs(60),
            4,
        ));
        let operation =
            AcceptChunkBatchOperation::new(harness.store.clone(), queue.clone(), harness.options.clone());

        let run = |chunks: Vec<ChunkUpload>| {
            operation.run(AcceptChunkBatchOperationRequest {
                session_id: session.id.clone(),
                chunks,
            })
        };

        assert!(matches!(run(vec![]).await, Err(PearlError::InvalidRequest(_))));
        assert!(matches!(
            run(vec![upload(20, "genesis")]).await,
            Err(PearlError::InvalidRequest(_))
        ));
        assert!(matches!(
            run(vec![upload(0, "other")]).await,
            Err(PearlError::InvalidRequest(_))
        ));
        assert!(matches!(
            run((0..51).map(|index| upload(index % 20, "genesis")).collect()).await,
            Err(PearlError::InvalidRequest(_))
        ));
        assert!(matches!(
            operation
                .run(AcceptChunkBatchOperationRequest {
                    session_id: "missing".to_string(),
                    chunks: vec![upload(0, "genesis")],
                })
                .await,
            Err(PearlError::SessionNotFound(_))
        ));

        queue.close().await;
        assert_eq!(queue.stats().persisted_batches, 0);
    }

    #[tokio::test]
    async fn test_failed_write_is_dropped() {
        let harness = Harness::new();
        let session = open_session(&harness).await;
        harness.content.set_fail_writes(true);
        let queue = Arc::new(IngestionQueue::start(
            harness.store.clone(),
            harness.content.clone(),
            Duration::from_secs(60),
            4,
        ));
        let operation =
            AcceptChunkBatchOperation::new(harness.store.clone(), queue.clone(), harness.options.clone());

        operation
            .run(AcceptChunkBatchOperationRequest {
                session_id: session.id.clone(),
                chunks: vec![upload(0, "genesis")],
            })
            .await
            .unwrap();
        queue.close().await;

        assert_eq!(queue.stats().dropped_batches, 1);
        assert!(harness.content.is_empty().await);
        assert!(
            harness
                .store
                .list_chunks("genesis")
                .unwrap()
                .iter()
                .all(|chunk| chunk.payload_hash.is_none())
        );
    }

    #[tokio::test]
    async fn test_session_without_rewards_keeps_logical_slots() {
        let harness = Harness::without_rewards();
        let session = harness
            .start_paired(Arc::new(StaticPeer::failing()))
            .run(StartPairedSessionOperationRequest {
                file_identifier: "genesis".to_string(),
                file_size_bytes: 20,
                chunk_count: 20,
                storage_years: 1,
                peer_address: None,
                reward_seed: String::new(),
            })
            .await
            .unwrap()
            .session;
        assert!(session.placement_map.is_empty());

        let queue = Arc::new(IngestionQueue::start(
            harness.store.clone(),
            harness.content.clone(),
            Duration::from_secs(60),
            4,
        ));
        let operation =
            AcceptChunkBatchOperation::new(harness.store.clone(), queue.clone(), harness.options.clone());

        let result = operation
            .run(AcceptChunkBatchOperationRequest {
                session_id: session.id.clone(),
                chunks: (0..20).map(|index| upload(index, "genesis")).collect(),
            })
            .await
            .unwrap();
        queue.close().await;

        assert!(
            result
                .accepted
                .iter()
                .all(|chunk| chunk.physical_index == chunk.logical_index)
        );
        assert!(
            harness
                .store
                .list_chunks("genesis")
                .unwrap()
                .iter()
                .all(|chunk| chunk.has_payload)
        );
    }

    #[tokio::test]
    async fn test_closed_queue_rejects_batches() {
        let harness = Harness::new();
        let session = open_session(&harness).await;
        let queue = Arc::new(IngestionQueue::start(
            harness.store.clone(),
            harness.content.clone(),
            Duration::from_secs(60),
            1,
        ));
        queue.close().await;

        let operation =
            AcceptChunkBatchOperation::new(harness.store.clone(), queue, harness.options.clone());
        let result = operation
            .run(AcceptChunkBatchOperationRequest {
                session_id: session.id,
                chunks: vec![upload(0, "genesis")],
            })
            .await;
        assert!(matches!(result, Err(PearlError::Internal(_))));
    }
}
