//! Contracts for the two external ledgers.
//!
//! The append-only ledger stores chunk and reward messages; the value ledger
//! holds escrow balances. Every call made through [`Ledgers`] carries a
//! deadline, and an expired deadline is reported as [`PearlError::Timeout`].

pub mod http;
pub mod memory;

use crate::error::{PearlError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub use http::{HttpAppendLedger, HttpValueLedger};
pub use memory::{MemoryAppendLedger, MemoryValueLedger};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTips {
    pub branch: String,
    pub trunk: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub address: String,
    pub message: String,
    pub branch: String,
    pub trunk: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowCredential {
    pub address: String,
    pub private_key: String,
}

#[async_trait]
pub trait AppendLedger: Send + Sync {
    async fn attach(
        &self,
        address: &str,
        message: &str,
        file_identifier: &str,
        index: u64,
    ) -> Result<()>;

    /// What the ledger holds at `address`, if anything.
    async fn fetch_recorded(&self, address: &str) -> Result<Option<String>>;

    async fn broadcast_signed(&self, raw: &str) -> Result<()>;

    async fn tips(&self) -> Result<LedgerTips>;

    async fn decode_signed(&self, raw: &str) -> Result<SignedTransaction>;
}

#[async_trait]
pub trait ValueLedger: Send + Sync {
    async fn generate_address(&self) -> Result<EscrowCredential>;

    async fn check_balance(&self, address: &str) -> Result<u64>;

    async fn transfer(&self, from: &str, to: &str, amount: u64, private_key: &str)
    -> Result<bool>;

    /// Registers the escrow's balance as a buried reward, signed with the
    /// escrow's own key and paid from its gas. `false` when the ledger refuses.
    async fn bury(&self, address: &str, private_key: &str) -> Result<bool>;

    async fn is_buried(&self, address: &str) -> Result<bool>;
}

pub async fn with_deadline<T, F>(operation: &str, deadline: Duration, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(deadline, future).await {
        Ok(result) => result,
        Err(_) => Err(PearlError::Timeout(format!(
            "{} exceeded {}ms",
            operation,
            deadline.as_millis()
        ))),
    }
}

/// Both ledger clients plus the per-call deadline.
#[derive(Clone)]
pub struct Ledgers {
    append: Arc<dyn AppendLedger>,
    value: Arc<dyn ValueLedger>,
    call_timeout: Duration,
}

impl Ledgers {
    pub fn new(
        append: Arc<dyn AppendLedger>,
        value: Arc<dyn ValueLedger>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            append,
            value,
            call_timeout,
        }
    }

    pub async fn attach(
        &self,
        address: &str,
        message: &str,
        file_identifier: &str,
        index: u64,
    ) -> Result<()> {
        with_deadline(
            "attach",
            self.call_timeout,
            self.append.attach(address, message, file_identifier, index),
        )
        .await
    }

    pub async fn fetch_recorded(&self, address: &str) -> Result<Option<String>> {
        with_deadline(
            "fetch_recorded",
            self.call_timeout,
            self.append.fetch_recorded(address),
        )
        .await
    }

    pub async fn broadcast_signed(&self, raw: &str) -> Result<()> {
        with_deadline(
            "broadcast_signed",
            self.call_timeout,
            self.append.broadcast_signed(raw),
        )
        .await
    }

    pub async fn tips(&self) -> Result<LedgerTips> {
        with_deadline("tips", self.call_timeout, self.append.tips()).await
    }

    pub async fn decode_signed(&self, raw: &str) -> Result<SignedTransaction> {
        with_deadline(
            "decode_signed",
            self.call_timeout,
            self.append.decode_signed(raw),
        )
        .await
    }

    pub async fn generate_address(&self) -> Result<EscrowCredential> {
        with_deadline(
            "generate_address",
            self.call_timeout,
            self.value.generate_address(),
        )
        .await
    }

    pub async fn check_balance(&self, address: &str) -> Result<u64> {
        with_deadline(
            "check_balance",
            self.call_timeout,
            self.value.check_balance(address),
        )
        .await
    }

    pub async fn transfer(
        &self,
        from: &str,
        to: &str,
        amount: u64,
        private_key: &str,
    ) -> Result<bool> {
        with_deadline(
            "transfer",
            self.call_timeout,
            self.value.transfer(from, to, amount, private_key),
        )
        .await
    }

    pub async fn bury(&self, address: &str, private_key: &str) -> Result<bool> {
        with_deadline(
            "bury",
            self.call_timeout,
            self.value.bury(address, private_key),
        )
        .await
    }

    pub async fn is_buried(&self, address: &str) -> Result<bool> {
        with_deadline("is_buried", self.call_timeout, self.value.is_buried(address)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_deadline_expires() {
        let result: Result<()> = with_deadline("slow", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(PearlError::Timeout(_))));
        assert!(result.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn test_ledgers_apply_call_timeout() {
        let append = Arc::new(MemoryAppendLedger::new());
        append.set_delay(Duration::from_millis(200));
        let ledgers = Ledgers::new(
            append,
            Arc::new(MemoryValueLedger::new()),
            Duration::from_millis(20),
        );

        assert!(matches!(
            ledgers.attach("addr", "msg", "genesis", 0).await,
            Err(PearlError::Timeout(_))
        ));
        assert!(ledgers.check_balance("addr").await.is_ok());
    }
}
