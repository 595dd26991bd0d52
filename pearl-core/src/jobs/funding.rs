use super::JobReport;
use crate::crypto::CredentialSealer;
use crate::error::Result;
use crate::ledger::Ledgers;
use crate::options::FundingWallet;
use crate::storage::{EntityStore, FundingStatus, Reward};
use std::sync::Arc;

/// Carries reward escrows of paid sessions through funding, gas and burial
/// on the value ledger.
///
/// Each run walks the stages in order, so a reward can move through several
/// of them in one run:
///
/// 1. `Waiting`/`FundingError`: the wallet pays the reward amount -> `Pending`.
/// 2. `Pending`: the escrow shows the amount -> `Confirmed`.
/// 3. `Confirmed`/`GasError`: the wallet pays gas -> `GasPending`.
/// 4. `GasPending`: the escrow shows amount plus gas -> `GasConfirmed`.
/// 5. `GasConfirmed`/`BuryError`: the escrow buries itself -> `BuryPending`.
/// 6. `BuryPending`: the ledger reports the burial -> `BuryConfirmed`.
///
/// A refused or failed call moves the reward to the stage's error status,
/// which the next run retries.
#[derive(Clone)]
pub struct FundRewardsJob {
    store: Arc<EntityStore>,
    ledgers: Ledgers,
    sealer: Arc<CredentialSealer>,
    wallet: Option<FundingWallet>,
    gas_amount: u64,
    batch_limit: usize,
}

impl FundRewardsJob {
    pub fn new(
        store: Arc<EntityStore>,
        ledgers: Ledgers,
        sealer: Arc<CredentialSealer>,
        wallet: Option<FundingWallet>,
        gas_amount: u64,
        batch_limit: usize,
    ) -> Self {
        Self {
            store,
            ledgers,
            sealer,
            wallet,
            gas_amount,
            batch_limit,
        }
    }

    pub async fn run(&self) -> Result<JobReport> {
        let mut report = JobReport::default();
        let Some(wallet) = self.wallet.as_ref() else {
            tracing::debug!("no funding wallet configured, rewards stay unfunded");
            return Ok(report);
        };

        self.send_funds(wallet, &mut report).await?;
        self.confirm_balance(FundingStatus::Pending, FundingStatus::Confirmed, 0, &mut report)
            .await?;
        self.send_gas(wallet, &mut report).await?;
        self.confirm_balance(
            FundingStatus::GasPending,
            FundingStatus::GasConfirmed,
            self.gas_amount,
            &mut report,
        )
        .await?;
        self.bury(&mut report).await?;
        self.confirm_burial(&mut report).await?;
        Ok(report)
    }

    async fn send_funds(&self, wallet: &FundingWallet, report: &mut JobReport) -> Result<()> {
        for reward in self.store.list_fundable_rewards(self.batch_limit)? {
            let amount = reward.amount;
            self.pay_from_wallet(
                wallet,
                &reward,
                amount,
                (FundingStatus::Pending, FundingStatus::FundingError),
                report,
            )
            .await;
        }
        Ok(())
    }

    async fn send_gas(&self, wallet: &FundingWallet, report: &mut JobReport) -> Result<()> {
        let rewards = self.store.list_rewards_by_funding(
            &[FundingStatus::Confirmed, FundingStatus::GasError],
            self.batch_limit,
        )?;
        for reward in rewards {
            self.pay_from_wallet(
                wallet,
                &reward,
                self.gas_amount,
                (FundingStatus::GasPending, FundingStatus::GasError),
                report,
            )
            .await;
        }
        Ok(())
    }

    async fn pay_from_wallet(
        &self,
        wallet: &FundingWallet,
        reward: &Reward,
        amount: u64,
        (sent, failed): (FundingStatus, FundingStatus),
        report: &mut JobReport,
    ) {
        report.processed += 1;
        let next = match self
            .ledgers
            .transfer(
                &wallet.address,
                &reward.escrow_address,
                amount,
                &wallet.private_key,
            )
            .await
        {
            Ok(true) => sent,
            Ok(false) => {
                tracing::warn!(
                    "reward transfer refused. reward={} stage={} amount={}",
                    reward.id,
                    sent,
                    amount
                );
                failed
            }
            Err(error) => {
                tracing::warn!(
                    "reward transfer failed. reward={} stage={} error={}",
                    reward.id,
                    sent,
                    error
                );
                failed
            }
        };

        if next == failed {
            report.failed += 1;
        }
        self.advance(reward, next, report);
    }

    /// Escrows whose balance covers the reward plus `extra` move on.
    async fn confirm_balance(
        &self,
        waiting: FundingStatus,
        confirmed: FundingStatus,
        extra: u64,
        report: &mut JobReport,
    ) -> Result<()> {
        let rewards = self
            .store
            .list_rewards_by_funding(&[waiting], self.batch_limit)?;

        for reward in rewards {
            report.processed += 1;
            match self.ledgers.check_balance(&reward.escrow_address).await {
                Ok(balance) if balance > 0 && balance >= reward.amount.saturating_add(extra) => {
                    self.advance(&reward, confirmed, report);
                }
                Ok(_) => {}
                Err(error) => {
                    report.failed += 1;
                    tracing::warn!(
                        "reward balance check failed. reward={} error={}",
                        reward.id,
                        error
                    );
                }
            }
        }

        Ok(())
    }

    async fn bury(&self, report: &mut JobReport) -> Result<()> {
        let rewards = self.store.list_rewards_by_funding(
            &[FundingStatus::GasConfirmed, FundingStatus::BuryError],
            self.batch_limit,
        )?;

        for reward in rewards {
            report.processed += 1;
            let result = match self.sealer.open(&reward.sealed_escrow_key) {
                Ok(private_key) => self.ledgers.bury(&reward.escrow_address, &private_key).await,
                Err(error) => Err(error),
            };

            let next = match result {
                Ok(true) => FundingStatus::BuryPending,
                Ok(false) => {
                    tracing::warn!("reward burial refused. reward={}", reward.id);
                    FundingStatus::BuryError
                }
                Err(error) => {
                    tracing::warn!("reward burial failed. reward={} error={}", reward.id, error);
                    FundingStatus::BuryError
                }
            };

            if next == FundingStatus::BuryError {
                report.failed += 1;
            }
            self.advance(&reward, next, report);
        }

        Ok(())
    }

    async fn confirm_burial(&self, report: &mut JobReport) -> Result<()> {
        let rewards = self
            .store
            .list_rewards_by_funding(&[FundingStatus::BuryPending], self.batch_limit)?;

        for reward in rewards {
            report.processed += 1;
            match self.ledgers.is_buried(&reward.escrow_address).await {
                Ok(true) => {
                    self.advance(&reward, FundingStatus::BuryConfirmed, report);
                    tracing::info!(
                        "reward buried on ledger. reward={} file={} sector={}",
                        reward.id,
                        reward.file_identifier,
                        reward.sector
                    );
                }
                Ok(false) => {}
                Err(error) => {
                    report.failed += 1;
                    tracing::warn!(
                        "reward burial check failed. reward={} error={}",
                        reward.id,
                        error
                    );
                }
            }
        }

        Ok(())
    }

    fn advance(&self, reward: &Reward, next: FundingStatus, report: &mut JobReport) {
        match self.store.set_funding_status(&reward.id, next) {
            Ok(()) if next.as_i64() > 0 => {
                report.advanced += 1;
                tracing::debug!("reward funding advanced. reward={} status={}", reward.id, next);
            }
            Ok(()) => {}
            Err(error) => {
                tracing::warn!(
                    "reward funding write failed. reward={} status={} error={}",
                    reward.id,
                    next,
                    error
                );
            }
        }
    }
}
