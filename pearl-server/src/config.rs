use pearl_core::{
    BrokerOptions, FundingWallet, PearlError, Result, SchedulerOptions, SectorLayout,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    pub database: DatabaseConfig,
    pub content_store: ContentStoreConfig,
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub funding: Option<FundingConfig>,
    #[serde(default)]
    pub placement: PlacementConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
    pub credential_secret: String,
    #[serde(default)]
    pub peer: PeerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: String,
    pub bind_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

/// Content store backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentStoreConfig {
    pub backend: ContentBackend,
    #[serde(default)]
    pub namespace: Option<String>,
    pub redis: Option<RedisConfig>,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

impl ContentStoreConfig {
    pub fn namespace_or_default(&self) -> &str {
        self.namespace
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or("pearl")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentBackend {
    Redis,
    Memory,
}

impl ContentBackend {
    pub fn name(self) -> &'static str {
        match self {
            ContentBackend::Redis => "redis",
            ContentBackend::Memory => "memory",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

fn default_ttl_secs() -> u64 {
    3 * 24 * 60 * 60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    pub backend: LedgerBackend,
    #[serde(default)]
    pub append_url: Option<String>,
    #[serde(default)]
    pub value_url: Option<String>,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    Http,
    Memory,
}

fn default_call_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingConfig {
    pub address: String,
    pub private_key: String,
    #[serde(default = "default_reward_amount")]
    pub reward_amount: u64,
    #[serde(default = "default_gas_amount")]
    pub gas_amount: u64,
}

fn default_reward_amount() -> u64 {
    1
}

fn default_gas_amount() -> u64 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementConfig {
    pub chunk_size_bytes: u64,
    pub sector_chunk_capacity: u64,
    #[serde(default = "default_bury_rewards")]
    pub bury_rewards: bool,
}

fn default_bury_rewards() -> bool {
    true
}

impl Default for PlacementConfig {
    fn default() -> Self {
        let layout = SectorLayout::default();
        Self {
            chunk_size_bytes: layout.chunk_size_bytes,
            sector_chunk_capacity: layout.sector_chunk_capacity,
            bury_rewards: default_bury_rewards(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub max_chunks_per_session: u64,
    pub max_batch_size: usize,
    pub ingest_queue_depth: usize,
    pub assignment_bound: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        let options = BrokerOptions::default();
        Self {
            max_chunks_per_session: options.max_chunks_per_session,
            max_batch_size: options.max_batch_size,
            ingest_queue_depth: options.ingest_queue_depth,
            assignment_bound: options.assignment_bound,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    pub cost_per_chunk_year: u64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            cost_per_chunk_year: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub timeout_ms: u64,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self { timeout_ms: 5_000 }
    }
}

/// Intervals and thresholds are in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub batch_limit: usize,
    pub attach_interval_secs: u64,
    pub verify_interval_secs: u64,
    pub payment_interval_secs: u64,
    pub funding_interval_secs: u64,
    pub burial_interval_secs: u64,
    pub expire_interval_secs: u64,
    pub purge_interval_secs: u64,
    pub data_ready_interval_secs: u64,
    pub attach_grace_secs: u64,
    pub chunk_timeout_secs: u64,
    pub unpaid_expiration_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let options = SchedulerOptions::default();
        Self {
            enabled: false,
            batch_limit: options.batch_limit,
            attach_interval_secs: options.attach_interval.as_secs(),
            verify_interval_secs: options.verify_interval.as_secs(),
            payment_interval_secs: options.payment_interval.as_secs(),
            funding_interval_secs: options.funding_interval.as_secs(),
            burial_interval_secs: options.burial_interval.as_secs(),
            expire_interval_secs: options.expire_interval.as_secs(),
            purge_interval_secs: options.purge_interval.as_secs(),
            data_ready_interval_secs: options.data_ready_interval.as_secs(),
            attach_grace_secs: options.attach_grace.as_secs(),
            chunk_timeout_secs: options.chunk_timeout.as_secs(),
            unpaid_expiration_secs: options.unpaid_expiration.as_secs(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(
                ::config::Environment::with_prefix("PEARL")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .map_err(|e| PearlError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| PearlError::Config(e.to_string()))?;

        Ok(config)
    }

    pub fn broker_options(&self) -> Result<BrokerOptions> {
        let layout = SectorLayout::new(
            self.placement.chunk_size_bytes,
            self.placement.sector_chunk_capacity,
        )
        .map_err(|e| PearlError::Config(e.to_string()))?;

        if self.limits.max_batch_size == 0 || self.limits.ingest_queue_depth == 0 {
            return Err(PearlError::Config(
                "max_batch_size and ingest_queue_depth must be positive".to_string(),
            ));
        }

        let funding_wallet = self.funding.as_ref().map(|funding| FundingWallet {
            address: funding.address.clone(),
            private_key: funding.private_key.clone(),
        });
        let reward_amount = self
            .funding
            .as_ref()
            .map(|funding| funding.reward_amount)
            .unwrap_or_else(default_reward_amount);
        let gas_amount = self
            .funding
            .as_ref()
            .map(|funding| funding.gas_amount)
            .unwrap_or_else(default_gas_amount);

        Ok(BrokerOptions {
            layout,
            max_chunks_per_session: self.limits.max_chunks_per_session,
            max_batch_size: self.limits.max_batch_size,
            ingest_queue_depth: self.limits.ingest_queue_depth,
            content_ttl: Duration::from_secs(self.content_store.ttl_secs),
            cost_per_chunk_year: self.pricing.cost_per_chunk_year,
            reward_amount,
            gas_amount,
            bury_rewards: self.placement.bury_rewards,
            assignment_bound: self.limits.assignment_bound,
            funding_wallet,
        })
    }

    pub fn scheduler_options(&self) -> SchedulerOptions {
        let scheduler = &self.scheduler;
        SchedulerOptions {
            batch_limit: scheduler.batch_limit.max(1),
            attach_interval: interval(scheduler.attach_interval_secs),
            verify_interval: interval(scheduler.verify_interval_secs),
            payment_interval: interval(scheduler.payment_interval_secs),
            funding_interval: interval(scheduler.funding_interval_secs),
            burial_interval: interval(scheduler.burial_interval_secs),
            expire_interval: interval(scheduler.expire_interval_secs),
            purge_interval: interval(scheduler.purge_interval_secs),
            data_ready_interval: interval(scheduler.data_ready_interval_secs),
            attach_grace: Duration::from_secs(scheduler.attach_grace_secs),
            chunk_timeout: Duration::from_secs(scheduler.chunk_timeout_secs),
            unpaid_expiration: Duration::from_secs(scheduler.unpaid_expiration_secs),
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.ledger.call_timeout_ms.max(1))
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer.timeout_ms.max(1))
    }
}

// tokio intervals panic on a zero period
fn interval(secs: u64) -> Duration {
    Duration::from_secs(secs.max(1))
}
