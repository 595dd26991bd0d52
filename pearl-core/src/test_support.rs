use crate::crypto::CredentialSealer;
use crate::error::{PearlError, Result};
use crate::ledger::{Ledgers, MemoryAppendLedger, MemoryValueLedger};
use crate::operations::StartPairedSessionOperation;
use crate::options::{BrokerOptions, FundingWallet};
use crate::peer::{PeerBroker, SecondarySessionReply, SecondarySessionRequest};
use crate::sectors::SectorLayout;
use crate::storage::{EntityStore, MemoryContentStore};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub(crate) const FUNDING_ADDRESS: &str = "funding-wallet";
pub(crate) const REWARD_SEED: &str = "uploader-seed";

/// One broker's collaborators, all in memory except sqlite.
pub(crate) struct Harness {
    pub _temp_dir: TempDir,
    pub store: Arc<EntityStore>,
    pub append: Arc<MemoryAppendLedger>,
    pub value: Arc<MemoryValueLedger>,
    pub ledgers: Ledgers,
    pub content: Arc<MemoryContentStore>,
    pub sealer: Arc<CredentialSealer>,
    pub options: Arc<BrokerOptions>,
}

impl Harness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(EntityStore::new(temp_dir.path().join("pearl.db")).unwrap());
        let append = Arc::new(MemoryAppendLedger::new());
        let value = Arc::new(MemoryValueLedger::new());
        let ledgers = Ledgers::new(append.clone(), value.clone(), Duration::from_secs(2));

        let options = BrokerOptions {
            layout: SectorLayout::new(1, 10).unwrap(),
            max_chunks_per_session: 10_000,
            max_batch_size: 50,
            ingest_queue_depth: 8,
            content_ttl: Duration::from_secs(60),
            cost_per_chunk_year: 1,
            reward_amount: 5,
            gas_amount: 2,
            bury_rewards: true,
            assignment_bound: 3,
            funding_wallet: Some(FundingWallet {
                address: FUNDING_ADDRESS.to_string(),
                private_key: "funding-key".to_string(),
            }),
        };

        Self {
            _temp_dir: temp_dir,
            store,
            append,
            value,
            ledgers,
            content: Arc::new(MemoryContentStore::new()),
            sealer: Arc::new(CredentialSealer::new("test-secret").unwrap()),
            options: Arc::new(options),
        }
    }

    /// Same collaborators with reward burial switched off.
    pub fn without_rewards() -> Self {
        let mut harness = Self::new();
        let mut options = (*harness.options).clone();
        options.bury_rewards = false;
        harness.options = Arc::new(options);
        harness
    }

    pub fn start_paired(&self, peer: Arc<dyn PeerBroker>) -> StartPairedSessionOperation {
        StartPairedSessionOperation::new(
            self.store.clone(),
            self.ledgers.clone(),
            peer,
            self.sealer.clone(),
            self.options.clone(),
        )
    }
}

/// Peer that either fails or answers with fixed positions.
pub(crate) struct StaticPeer {
    positions: Option<Vec<u64>>,
}

impl StaticPeer {
    pub fn failing() -> Self {
        Self { positions: None }
    }

    pub fn replying(positions: Vec<u64>) -> Self {
        Self {
            positions: Some(positions),
        }
    }
}

#[async_trait]
impl PeerBroker for StaticPeer {
    async fn start_secondary(
        &self,
        peer_address: &str,
        _request: &SecondarySessionRequest,
    ) -> Result<SecondarySessionReply> {
        match &self.positions {
            Some(positions) => Ok(SecondarySessionReply {
                session_id: "peer-session".to_string(),
                positions: positions.clone(),
                escrow_address: "peer-escrow".to_string(),
            }),
            None => Err(PearlError::Peer(format!("{} unreachable", peer_address))),
        }
    }
}
