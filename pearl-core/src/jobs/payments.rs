use super::JobReport;
use crate::crypto::CredentialSealer;
use crate::error::Result;
use crate::ledger::Ledgers;
use crate::storage::{EntityStore, Session, SessionRole};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Marks a funded session Confirmed.
///
/// A primary session first forwards half of its escrow to the peer escrow if
/// the peer has not been paid yet; the session stays unconfirmed when that
/// transfer fails so the next run retries it. Returns whether the session is
/// now confirmed.
pub(crate) async fn settle_payment(
    store: &EntityStore,
    ledgers: &Ledgers,
    sealer: &CredentialSealer,
    session: &Session,
    balance: u64,
) -> Result<bool> {
    if session.role == SessionRole::Primary {
        if let Some(peer_escrow) = session.peer_escrow_address.as_deref() {
            let share = balance / 2;
            if share > 0 && ledgers.check_balance(peer_escrow).await? == 0 {
                let private_key = sealer.open(&session.sealed_escrow_key)?;
                let sent = ledgers
                    .transfer(&session.escrow_address, peer_escrow, share, &private_key)
                    .await?;
                if !sent {
                    tracing::warn!(
                        "peer share transfer refused. session={} peer_escrow={} amount={}",
                        session.id,
                        peer_escrow,
                        share
                    );
                    return Ok(false);
                }
                tracing::info!(
                    "peer share sent. session={} peer_escrow={} amount={}",
                    session.id,
                    peer_escrow,
                    share
                );
            }
        }
    }

    if store.confirm_payment(&session.id)? {
        tracing::info!(
            "payment confirmed. session={} file={} balance={}",
            session.id,
            session.file_identifier,
            balance
        );
    }
    Ok(true)
}

/// Polls escrow balances of sessions that are not yet paid.
#[derive(Clone)]
pub struct ConfirmPaymentJob {
    store: Arc<EntityStore>,
    ledgers: Ledgers,
    sealer: Arc<CredentialSealer>,
    batch_limit: usize,
}

impl ConfirmPaymentJob {
    pub fn new(
        store: Arc<EntityStore>,
        ledgers: Ledgers,
        sealer: Arc<CredentialSealer>,
        batch_limit: usize,
    ) -> Self {
        Self {
            store,
            ledgers,
            sealer,
            batch_limit,
        }
    }

    pub async fn run(&self) -> Result<JobReport> {
        let sessions = self.store.list_unpaid_sessions(self.batch_limit)?;
        let mut report = JobReport::default();

        for session in sessions {
            report.processed += 1;
            let balance = match self.ledgers.check_balance(&session.escrow_address).await {
                Ok(balance) => balance,
                Err(error) => {
                    report.failed += 1;
                    tracing::warn!(
                        "balance check failed. session={} error={}",
                        session.id,
                        error
                    );
                    continue;
                }
            };
            if balance == 0 {
                continue;
            }

            match settle_payment(&self.store, &self.ledgers, &self.sealer, &session, balance).await
            {
                Ok(true) => report.advanced += 1,
                Ok(false) => {}
                Err(error) => {
                    report.failed += 1;
                    tracing::warn!(
                        "payment settlement failed. session={} error={}",
                        session.id,
                        error
                    );
                }
            }
        }

        Ok(report)
    }
}

/// Deletes sessions that were never paid once they are older than the
/// expiration threshold. A non-zero escrow balance keeps the session.
#[derive(Clone)]
pub struct PurgeUnfundedSessionsJob {
    store: Arc<EntityStore>,
    ledgers: Ledgers,
    batch_limit: usize,
}

impl PurgeUnfundedSessionsJob {
    pub fn new(store: Arc<EntityStore>, ledgers: Ledgers, batch_limit: usize) -> Self {
        Self {
            store,
            ledgers,
            batch_limit,
        }
    }

    pub async fn run(&self, expiration_threshold: DateTime<Utc>) -> Result<JobReport> {
        let sessions = self
            .store
            .list_unpaid_sessions_before(expiration_threshold, self.batch_limit)?;
        let mut report = JobReport::default();

        for session in sessions {
            report.processed += 1;
            match self.ledgers.check_balance(&session.escrow_address).await {
                Ok(0) => {}
                Ok(balance) => {
                    tracing::debug!(
                        "expired session has funds, keeping it. session={} balance={}",
                        session.id,
                        balance
                    );
                    continue;
                }
                Err(error) => {
                    report.failed += 1;
                    tracing::warn!(
                        "balance check failed. session={} error={}",
                        session.id,
                        error
                    );
                    continue;
                }
            }

            match self.store.delete_session(&session.id) {
                Ok(true) => {
                    report.advanced += 1;
                    tracing::info!(
                        "unfunded session purged. session={} file={}",
                        session.id,
                        session.file_identifier
                    );
                }
                Ok(false) => {}
                Err(error) => {
                    report.failed += 1;
                    tracing::warn!(
                        "session purge failed. session={} error={}",
                        session.id,
                        error
                    );
                }
            }
        }

        Ok(report)
    }
}
