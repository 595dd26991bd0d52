//! Storage for the broker
//!
//! Relational entity state lives in sqlite; chunk payloads live in a separate
//! keyed content store with expiry.

pub mod content_store;
pub mod entities;
pub mod entity_store;

pub use content_store::{
    ContentStore, ContentStoreBuilder, MemoryContentStore, RedisContentStore, chunk_key,
};
pub use entities::{
    AttachmentStatus, Chunk, ChunkStatus, FileIdentifier, FundingStatus, IdentifierStatus,
    NewChunk, PaymentStatus, Reward, RewardBurialStatus, RewardPlacement, Session, SessionRole,
};
pub use entity_store::EntityStore;
