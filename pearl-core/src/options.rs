use crate::sectors::SectorLayout;
use std::time::Duration;

/// Protocol version stamped on new sessions.
pub const PROTOCOL_VERSION: u32 = 2;

/// Wallet that pays reward escrows.
#[derive(Debug, Clone)]
pub struct FundingWallet {
    pub address: String,
    pub private_key: String,
}

#[derive(Debug, Clone)]
pub struct BrokerOptions {
    pub layout: SectorLayout,
    pub max_chunks_per_session: u64,
    pub max_batch_size: usize,
    pub ingest_queue_depth: usize,
    pub content_ttl: Duration,
    pub cost_per_chunk_year: u64,
    pub reward_amount: u64,
    /// Sent to each funded reward escrow so it can pay for its own burial.
    pub gas_amount: u64,
    /// Off: sessions reserve no reward slots and chunks keep their logical
    /// index.
    pub bury_rewards: bool,
    /// How many times one file identifier may be handed out for chunk work.
    pub assignment_bound: u32,
    pub funding_wallet: Option<FundingWallet>,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            layout: SectorLayout::default(),
            max_chunks_per_session: 5_000_000,
            max_batch_size: 1_000,
            ingest_queue_depth: 256,
            content_ttl: Duration::from_secs(3 * 24 * 60 * 60),
            cost_per_chunk_year: 1,
            reward_amount: 1,
            gas_amount: 1,
            bury_rewards: true,
            assignment_bound: 10,
            funding_wallet: None,
        }
    }
}

impl BrokerOptions {
    pub fn session_cost(&self, chunk_count: u64, storage_years: u32) -> u64 {
        chunk_count
            .saturating_mul(storage_years as u64)
            .saturating_mul(self.cost_per_chunk_year)
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub batch_limit: usize,
    pub attach_interval: Duration,
    pub verify_interval: Duration,
    pub payment_interval: Duration,
    pub funding_interval: Duration,
    pub burial_interval: Duration,
    pub expire_interval: Duration,
    pub purge_interval: Duration,
    pub data_ready_interval: Duration,
    /// Attached rewards with nothing recorded after this long are re-attached.
    pub attach_grace: Duration,
    pub chunk_timeout: Duration,
    pub unpaid_expiration: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            batch_limit: 25,
            attach_interval: Duration::from_secs(30),
            verify_interval: Duration::from_secs(60),
            payment_interval: Duration::from_secs(15),
            funding_interval: Duration::from_secs(60),
            burial_interval: Duration::from_secs(15),
            expire_interval: Duration::from_secs(60),
            purge_interval: Duration::from_secs(10 * 60),
            data_ready_interval: Duration::from_secs(30),
            attach_grace: Duration::from_secs(60 * 60),
            chunk_timeout: Duration::from_secs(20 * 60),
            unpaid_expiration: Duration::from_secs(24 * 60 * 60),
        }
    }
}
