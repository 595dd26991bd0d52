use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Fixed-width RFC 3339 so that text comparison in sqlite orders timestamps.
pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

macro_rules! status_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $value:expr),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_i64(self) -> i64 {
                match self {
                    $($name::$variant => $value),+
                }
            }

            pub fn from_i64(value: i64) -> Option<Self> {
                match value {
                    $(v if v == $value => Some($name::$variant),)+
                    _ => None,
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $($name::$variant => stringify!($variant)),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.name())
            }
        }
    };
}

status_enum!(IdentifierStatus {
    Unassigned = 0,
    Assigned = 1,
});

status_enum!(
    /// Which broker of the pair owns the session.
    SessionRole {
        Primary = 1,
        Secondary = 2,
    }
);

status_enum!(PaymentStatus {
    Pending = 1,
    Confirmed = 2,
    Error = 3,
});

status_enum!(RewardBurialStatus {
    Pending = 1,
    BurialPending = 2,
    BurialComplete = 3,
});

status_enum!(
    /// `Pending` rows exist from session start but are invisible to chunk work
    /// until the rewards are buried.
    ChunkStatus {
        Pending = 0,
        Unassigned = 1,
        Unverified = 2,
        Complete = 3,
    }
);

status_enum!(FundingStatus {
    Waiting = 1,
    Pending = 2,
    Confirmed = 3,
    GasPending = 4,
    GasConfirmed = 5,
    BuryPending = 6,
    BuryConfirmed = 7,
    FundingError = -1,
    GasError = -3,
    BuryError = -5,
});

status_enum!(AttachmentStatus {
    Signed = 1,
    SignedAndAttached = 2,
    SignedAndAttachmentVerified = 3,
    AttachError = -1,
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileIdentifier {
    pub id: i64,
    pub identifier: String,
    pub file_size_bytes: u64,
    pub chunk_count: u64,
    pub status: IdentifierStatus,
    pub assignment_count: u32,
    pub reward_buried: bool,
    pub created_at: DateTime<Utc>,
}

/// One reward slot of a session, serialized into `sessions.reward_map`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardPlacement {
    pub sector: u64,
    pub position: u64,
    pub physical_index: u64,
    pub reward_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub role: SessionRole,
    pub file_identifier: String,
    pub file_size_bytes: u64,
    pub chunk_count: u64,
    pub storage_years: u32,
    pub escrow_address: String,
    pub sealed_escrow_key: String,
    pub peer_escrow_address: Option<String>,
    pub total_cost: u64,
    pub payment_status: PaymentStatus,
    pub reward_status: RewardBurialStatus,
    pub placement_map: Vec<u64>,
    pub reward_map: Vec<RewardPlacement>,
    pub all_data_ready: bool,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: i64,
    pub file_identifier: String,
    pub physical_index: u64,
    pub address: String,
    pub payload_hash: Option<String>,
    pub status: ChunkStatus,
    pub has_payload: bool,
    pub branch: Option<String>,
    pub trunk: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Chunk row before it is inserted.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub physical_index: u64,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reward {
    pub id: String,
    pub session_id: String,
    pub file_identifier: String,
    pub sector: u64,
    pub physical_index: u64,
    pub escrow_address: String,
    pub sealed_escrow_key: String,
    pub amount: u64,
    pub funding_status: FundingStatus,
    pub attachment_status: AttachmentStatus,
    pub ledger_address: String,
    pub ledger_message: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
