use async_trait::async_trait;
use bytes::Bytes;
use pearl_core::jobs::{ConfirmPaymentJob, ReleaseBuriedRewardsJob};
use pearl_core::operations::{
    AcceptChunkBatchOperation, AcceptChunkBatchOperationRequest, ChunkUpload,
    ClaimChunkWorkOperation, ClaimChunkWorkOperationRequest, CompleteChunkWorkOperation,
    CompleteChunkWorkOperationRequest, IngestionQueue, StartPairedSessionOperation,
    StartPairedSessionOperationRequest, StartSecondarySessionOperation,
};
use pearl_core::storage::{ChunkStatus, PaymentStatus, RewardBurialStatus, SessionRole};
use pearl_core::{
    BrokerOptions, CredentialSealer, EntityStore, Ledgers, MemoryAppendLedger,
    MemoryContentStore, MemoryValueLedger, PeerBroker, Result, SectorLayout,
    SecondarySessionReply, SecondarySessionRequest, SignedTransaction,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const FILE: &str = "treasure-map";
const CHUNKS: u64 = 20;

struct Broker {
    _temp_dir: TempDir,
    store: Arc<EntityStore>,
    ledgers: Ledgers,
    content: Arc<MemoryContentStore>,
    sealer: Arc<CredentialSealer>,
    options: Arc<BrokerOptions>,
}

impl Broker {
    fn new(ledgers: Ledgers, secret: &str) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(EntityStore::new(temp_dir.path().join("pearl.db")).unwrap());
        let options = BrokerOptions {
            layout: SectorLayout::new(1, 10).unwrap(),
            max_batch_size: 100,
            ..BrokerOptions::default()
        };

        Self {
            _temp_dir: temp_dir,
            store,
            ledgers,
            content: Arc::new(MemoryContentStore::new()),
            sealer: Arc::new(CredentialSealer::new(secret).unwrap()),
            options: Arc::new(options),
        }
    }
}

/// Routes the peer call straight into the other broker.
struct InProcessPeer {
    operation: StartSecondarySessionOperation,
}

#[async_trait]
impl PeerBroker for InProcessPeer {
    async fn start_secondary(
        &self,
        _peer_address: &str,
        request: &SecondarySessionRequest,
    ) -> Result<SecondarySessionReply> {
        self.operation.run(request.clone()).await
    }
}

#[tokio::test]
async fn test_paired_session_end_to_end() {
    let append = Arc::new(MemoryAppendLedger::new());
    let value = Arc::new(MemoryValueLedger::new());
    let ledgers = Ledgers::new(append.clone(), value.clone(), Duration::from_secs(2));

    let alpha = Broker::new(ledgers.clone(), "alpha-secret");
    let beta = Broker::new(ledgers.clone(), "beta-secret");

    let peer = Arc::new(InProcessPeer {
        operation: StartSecondarySessionOperation::new(
            beta.store.clone(),
            beta.ledgers.clone(),
            beta.sealer.clone(),
            beta.options.clone(),
        ),
    });
    let started = StartPairedSessionOperation::new(
        alpha.store.clone(),
        alpha.ledgers.clone(),
        peer,
        alpha.sealer.clone(),
        alpha.options.clone(),
    )
    .run(StartPairedSessionOperationRequest {
        file_identifier: FILE.to_string(),
        file_size_bytes: CHUNKS,
        chunk_count: CHUNKS,
        storage_years: 2,
        peer_address: Some("beta:8080".to_string()),
        reward_seed: "uploader-seed".to_string(),
    })
    .await
    .unwrap();

    // both brokers persisted the same merged placement
    let primary = started.session;
    let secondary_ref = started.secondary.unwrap();
    let secondary = beta
        .store
        .get_session(&secondary_ref.session_id)
        .unwrap()
        .unwrap();
    assert_eq!(primary.role, SessionRole::Primary);
    assert_eq!(secondary.role, SessionRole::Secondary);
    assert_eq!(primary.placement_map.len(), 3);
    assert_eq!(primary.placement_map, secondary.placement_map);
    assert_eq!(
        primary.peer_escrow_address.as_deref(),
        Some(secondary.escrow_address.as_str())
    );
    assert_eq!(started.invoice.cost, CHUNKS * 2);

    // every chunk lands on a distinct slot that avoids the reward slots
    let queue = Arc::new(IngestionQueue::start(
        alpha.store.clone(),
        alpha.content.clone(),
        Duration::from_secs(60),
        4,
    ));
    let accepted = AcceptChunkBatchOperation::new(
        alpha.store.clone(),
        queue.clone(),
        alpha.options.clone(),
    )
    .run(AcceptChunkBatchOperationRequest {
        session_id: primary.id.clone(),
        chunks: (0..CHUNKS)
            .map(|index| ChunkUpload {
                logical_index: index,
                payload: Bytes::from(format!("chunk-{}", index)),
                integrity_tag: FILE.to_string(),
            })
            .collect(),
    })
    .await
    .unwrap()
    .accepted;
    queue.close().await;

    let layout = alpha.options.layout;
    let mut slots = BTreeSet::new();
    for chunk in &accepted {
        assert_eq!(
            chunk.physical_index,
            layout.to_physical_index(chunk.logical_index, &primary.placement_map)
        );
        assert!(slots.insert(chunk.physical_index));
    }
    for placement in &primary.reward_map {
        assert!(slots.insert(placement.physical_index));
    }
    assert_eq!(slots, (0..CHUNKS + 3).collect::<BTreeSet<u64>>());
    assert_eq!(queue.stats().persisted_chunks, CHUNKS);

    // the client pays the primary, which forwards half to the peer
    value.credit(&primary.escrow_address, 40).await;
    for broker in [&alpha, &beta] {
        ConfirmPaymentJob::new(
            broker.store.clone(),
            broker.ledgers.clone(),
            broker.sealer.clone(),
            10,
        )
        .run()
        .await
        .unwrap();
    }
    assert_eq!(value.balance(&secondary.escrow_address).await, 20);
    assert_eq!(value.balance(&primary.escrow_address).await, 20);
    for (broker, session_id) in [(&alpha, &primary.id), (&beta, &secondary.id)] {
        let stored = broker.store.get_session(session_id).unwrap().unwrap();
        assert_eq!(stored.payment_status, PaymentStatus::Confirmed);
        assert_eq!(stored.reward_status, RewardBurialStatus::BurialPending);
    }

    // burial opens the file's chunks for ledger submission
    ReleaseBuriedRewardsJob::new(
        alpha.store.clone(),
        alpha.content.clone(),
        Duration::from_secs(60),
        10,
    )
    .run()
    .await
    .unwrap();
    assert!(
        alpha
            .store
            .list_chunks(FILE)
            .unwrap()
            .iter()
            .all(|chunk| chunk.status == ChunkStatus::Unassigned)
    );

    // a worker submits one chunk through the broker
    let claimed = ClaimChunkWorkOperation::new(
        alpha.store.clone(),
        alpha.ledgers.clone(),
        alpha.content.clone(),
        alpha.options.clone(),
    )
    .run(ClaimChunkWorkOperationRequest::default())
    .await
    .unwrap();
    assert_eq!(claimed.file_identifier, FILE);
    let message = claimed.message.clone().unwrap();

    let raw_transaction = serde_json::to_string(&SignedTransaction {
        address: claimed.address.clone(),
        message,
        branch: claimed.branch.clone(),
        trunk: claimed.trunk.clone(),
    })
    .unwrap();
    CompleteChunkWorkOperation::new(
        alpha.store.clone(),
        alpha.ledgers.clone(),
        alpha.content.clone(),
    )
    .run(CompleteChunkWorkOperationRequest {
        chunk_id: claimed.chunk_id,
        raw_transaction,
    })
    .await
    .unwrap();

    assert_eq!(append.broadcasts().await.len(), 1);
    assert_eq!(
        alpha
            .store
            .get_chunk(claimed.chunk_id)
            .unwrap()
            .unwrap()
            .status,
        ChunkStatus::Complete
    );
    let pool = alpha.store.list_file_identifiers(FILE).unwrap();
    assert_eq!(pool.len(), 1);
    assert_eq!(pool[0].assignment_count, 1);
}
