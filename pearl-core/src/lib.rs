//! Pearl Core - core library for a treasure-burying storage broker
//!
//! Files are cut into fixed-size chunks and spread over sectors. Every sector
//! reserves one chunk slot whose position is agreed between two brokers; a
//! funded reward credential is buried in that slot. The core provides:
//! - index algebra mapping logical chunks to physical slots
//! - sqlite entity state and an expiring content store
//! - request operations for sessions, ingestion and chunk work
//! - periodic lifecycle jobs driving payment, funding and burial

pub mod crypto;
pub mod error;
pub mod jobs;
pub mod ledger;
pub mod operations;
pub mod options;
pub mod peer;
pub mod sectors;
pub mod storage;

#[cfg(test)]
mod test_support;

pub use crypto::{CredentialSealer, chunk_address, compute_hash};
pub use error::{PearlError, Result};
pub use jobs::{JobKind, JobReport, Scheduler};
pub use ledger::{
    AppendLedger, HttpAppendLedger, HttpValueLedger, LedgerTips, Ledgers, MemoryAppendLedger,
    MemoryValueLedger, SignedTransaction, ValueLedger,
};
pub use options::{BrokerOptions, FundingWallet, PROTOCOL_VERSION, SchedulerOptions};
pub use peer::{
    HttpPeerBroker, PeerBroker, SECONDARY_SESSION_PATH, SecondarySessionReply,
    SecondarySessionRequest,
};
pub use sectors::{
    CHUNK_SIZE_BYTES, POSITION_DELIMITER, SECTOR_CHUNK_CAPACITY, SectorLayout, merge_positions,
};
pub use storage::{ContentStore, ContentStoreBuilder, EntityStore, MemoryContentStore};
