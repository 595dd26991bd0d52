use crate::crypto::CredentialSealer;
use crate::error::{PearlError, Result};
use crate::jobs::payments::settle_payment;
use crate::ledger::Ledgers;
use crate::storage::{EntityStore, PaymentStatus};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct CheckPaymentStatusOperationRequest {
    pub session_id: String,
}

#[derive(Debug, Clone)]
pub struct CheckPaymentStatusOperationResult {
    pub payment_status: PaymentStatus,
    pub balance: Option<u64>,
}

/// Forces the payment check for one session instead of waiting for the job.
#[derive(Clone)]
pub struct CheckPaymentStatusOperation {
    store: Arc<EntityStore>,
    ledgers: Ledgers,
    sealer: Arc<CredentialSealer>,
}

impl CheckPaymentStatusOperation {
    pub fn new(store: Arc<EntityStore>, ledgers: Ledgers, sealer: Arc<CredentialSealer>) -> Self {
        Self {
            store,
            ledgers,
            sealer,
        }
    }

    pub async fn run(
        &self,
        request: CheckPaymentStatusOperationRequest,
    ) -> Result<CheckPaymentStatusOperationResult> {
        let CheckPaymentStatusOperationRequest { session_id } = request;

        let session = self
            .store
            .get_session(&session_id)?
            .ok_or_else(|| PearlError::SessionNotFound(session_id.clone()))?;

        if session.payment_status == PaymentStatus::Confirmed {
            return Ok(CheckPaymentStatusOperationResult {
                payment_status: PaymentStatus::Confirmed,
                balance: None,
            });
        }

        let balance = self.ledgers.check_balance(&session.escrow_address).await?;
        let payment_status = if balance > 0
            && settle_payment(&self.store, &self.ledgers, &self.sealer, &session, balance).await?
        {
            PaymentStatus::Confirmed
        } else {
            session.payment_status
        };

        Ok(CheckPaymentStatusOperationResult {
            payment_status,
            balance: Some(balance),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::StartPairedSessionOperationRequest;
    use crate::storage::RewardBurialStatus;
    use crate::test_support::{Harness, REWARD_SEED, StaticPeer};

    #[tokio::test]
    async fn test_check_payment_status() {
        let harness = Harness::new();
        let session = harness
            .start_paired(Arc::new(StaticPeer::failing()))
            .run(StartPairedSessionOperationRequest {
                file_identifier: "genesis".to_string(),
                file_size_bytes: 5,
                chunk_count: 5,
                storage_years: 1,
                peer_address: None,
                reward_seed: REWARD_SEED.to_string(),
            })
            .await
            .unwrap()
            .session;

        let operation = CheckPaymentStatusOperation::new(
            harness.store.clone(),
            harness.ledgers.clone(),
            harness.sealer.clone(),
        );
        let request = CheckPaymentStatusOperationRequest {
            session_id: session.id.clone(),
        };

        let result = operation.run(request.clone()).await.unwrap();
        assert_eq!(result.payment_status, PaymentStatus::Pending);
        assert_eq!(result.balance, Some(0));

        harness.value.credit(&session.escrow_address, 10).await;
        let result = operation.run(request.clone()).await.unwrap();
        assert_eq!(result.payment_status, PaymentStatus::Confirmed);

        let stored = harness.store.get_session(&session.id).unwrap().unwrap();
        assert_eq!(stored.payment_status, PaymentStatus::Confirmed);
        assert_eq!(stored.reward_status, RewardBurialStatus::BurialPending);

        let result = operation.run(request).await.unwrap();
        assert_eq!(result.balance, None);

        assert!(matches!(
            operation
                .run(CheckPaymentStatusOperationRequest {
                    session_id: "missing".to_string()
                })
                .await,
            Err(PearlError::SessionNotFound(_))
        ));
    }
}
