use super::{
    AttachRewardsJob, CheckAllDataReadyJob, ConfirmPaymentJob, ExpireTimedOutChunksJob,
    FundRewardsJob, JobReport, PurgeUnfundedSessionsJob, ReleaseBuriedRewardsJob,
    VerifyRewardAttachmentJob,
};
use crate::crypto::CredentialSealer;
use crate::error::{PearlError, Result};
use crate::ledger::Ledgers;
use crate::options::{BrokerOptions, SchedulerOptions};
use crate::storage::{ContentStore, EntityStore};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    AttachRewards,
    VerifyRewardAttachment,
    ConfirmPayment,
    FundRewards,
    ReleaseBuriedRewards,
    ExpireTimedOutChunks,
    PurgeUnfundedSessions,
    CheckAllDataReady,
}

impl JobKind {
    pub const ALL: [JobKind; 8] = [
        JobKind::AttachRewards,
        JobKind::VerifyRewardAttachment,
        JobKind::ConfirmPayment,
        JobKind::FundRewards,
        JobKind::ReleaseBuriedRewards,
        JobKind::ExpireTimedOutChunks,
        JobKind::PurgeUnfundedSessions,
        JobKind::CheckAllDataReady,
    ];

    pub fn name(self) -> &'static str {
        match self {
            JobKind::AttachRewards => "attach_rewards",
            JobKind::VerifyRewardAttachment => "verify_reward_attachment",
            JobKind::ConfirmPayment => "confirm_payment",
            JobKind::FundRewards => "fund_rewards",
            JobKind::ReleaseBuriedRewards => "release_buried_rewards",
            JobKind::ExpireTimedOutChunks => "expire_timed_out_chunks",
            JobKind::PurgeUnfundedSessions => "purge_unfunded_sessions",
            JobKind::CheckAllDataReady => "check_all_data_ready",
        }
    }
}

/// Runs every lifecycle job on its own interval.
///
/// Runs of the same job never overlap: a run that finds the previous one
/// still active is skipped. Only one scheduler may run against a database.
pub struct Scheduler {
    attach: AttachRewardsJob,
    verify: VerifyRewardAttachmentJob,
    payments: ConfirmPaymentJob,
    funding: FundRewardsJob,
    burial: ReleaseBuriedRewardsJob,
    expire: ExpireTimedOutChunksJob,
    purge: PurgeUnfundedSessionsJob,
    data_ready: CheckAllDataReadyJob,
    options: SchedulerOptions,
    running: HashMap<JobKind, Arc<Mutex<()>>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<EntityStore>,
        ledgers: Ledgers,
        content_store: Arc<dyn ContentStore>,
        sealer: Arc<CredentialSealer>,
        broker_options: &BrokerOptions,
        options: SchedulerOptions,
    ) -> Self {
        let limit = options.batch_limit;
        let running = JobKind::ALL
            .iter()
            .map(|kind| (*kind, Arc::new(Mutex::new(()))))
            .collect();

        Self {
            attach: AttachRewardsJob::new(store.clone(), ledgers.clone(), limit),
            verify: VerifyRewardAttachmentJob::new(store.clone(), ledgers.clone(), limit),
            payments: ConfirmPaymentJob::new(
                store.clone(),
                ledgers.clone(),
                sealer.clone(),
                limit,
            ),
            funding: FundRewardsJob::new(
                store.clone(),
                ledgers.clone(),
                sealer,
                broker_options.funding_wallet.clone(),
                broker_options.gas_amount,
                limit,
            ),
            burial: ReleaseBuriedRewardsJob::new(
                store.clone(),
                content_store.clone(),
                broker_options.content_ttl,
                limit,
            ),
            expire: ExpireTimedOutChunksJob::new(store.clone(), limit),
            purge: PurgeUnfundedSessionsJob::new(store.clone(), ledgers, limit),
            data_ready: CheckAllDataReadyJob::new(store, content_store, limit),
            options,
            running,
        }
    }

    fn interval(&self, kind: JobKind) -> Duration {
        match kind {
            JobKind::AttachRewards => self.options.attach_interval,
            JobKind::VerifyRewardAttachment => self.options.verify_interval,
            JobKind::ConfirmPayment => self.options.payment_interval,
            JobKind::FundRewards => self.options.funding_interval,
            JobKind::ReleaseBuriedRewards => self.options.burial_interval,
            JobKind::ExpireTimedOutChunks => self.options.expire_interval,
            JobKind::PurgeUnfundedSessions => self.options.purge_interval,
            JobKind::CheckAllDataReady => self.options.data_ready_interval,
        }
    }

    /// Runs one job now. `None` means the previous run is still active.
    pub async fn run_once(&self, kind: JobKind) -> Result<Option<JobReport>> {
        let guard = self
            .running
            .get(&kind)
            .ok_or_else(|| PearlError::Internal(format!("unknown job {}", kind.name())))?;
        let Ok(_running) = guard.try_lock() else {
            return Ok(None);
        };

        let report = match kind {
            JobKind::AttachRewards => self.attach.run().await?,
            JobKind::VerifyRewardAttachment => {
                self.verify
                    .run(threshold(self.options.attach_grace))
                    .await?
            }
            JobKind::ConfirmPayment => self.payments.run().await?,
            JobKind::FundRewards => self.funding.run().await?,
            JobKind::ReleaseBuriedRewards => self.burial.run().await?,
            JobKind::ExpireTimedOutChunks => {
                self.expire
                    .run(threshold(self.options.chunk_timeout))
                    .await?
            }
            JobKind::PurgeUnfundedSessions => {
                self.purge
                    .run(threshold(self.options.unpaid_expiration))
                    .await?
            }
            JobKind::CheckAllDataReady => self.data_ready.run().await?,
        };

        Ok(Some(report))
    }

    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        JobKind::ALL
            .iter()
            .map(|&kind| {
                let scheduler = self.clone();
                let every = scheduler.interval(kind);
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(every);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

                    loop {
                        ticker.tick().await;
                        match scheduler.run_once(kind).await {
                            Ok(Some(report)) if report.processed > 0 => {
                                tracing::info!(
                                    "job finished. job={} processed={} advanced={} failed={}",
                                    kind.name(),
                                    report.processed,
                                    report.advanced,
                                    report.failed
                                );
                            }
                            Ok(Some(_)) => {}
                            Ok(None) => {
                                tracing::debug!("job still running, tick skipped. job={}", kind.name());
                            }
                            Err(error) => {
                                tracing::warn!("job failed. job={} error={}", kind.name(), error);
                            }
                        }
                    }
                })
            })
            .collect()
    }
}

fn threshold(age: Duration) -> DateTime<Utc> {
    let age = chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::zero());
    Utc::now() - age
}
