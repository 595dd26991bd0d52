//! Lifecycle jobs
//!
//! Each job derives its work list from persisted status fields, processes a
//! bounded batch and isolates failures per item, so a run can be repeated or
//! interrupted at any point.

pub mod burial;
pub mod chunks;
pub mod funding;
pub mod payments;
pub mod rewards;
pub mod scheduler;

pub use burial::ReleaseBuriedRewardsJob;
pub use chunks::{CheckAllDataReadyJob, ExpireTimedOutChunksJob};
pub use funding::FundRewardsJob;
pub use payments::{ConfirmPaymentJob, PurgeUnfundedSessionsJob};
pub use rewards::{AttachRewardsJob, VerifyRewardAttachmentJob};
pub use scheduler::{JobKind, Scheduler};

use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobReport {
    pub processed: usize,
    pub advanced: usize,
    pub failed: usize,
}
