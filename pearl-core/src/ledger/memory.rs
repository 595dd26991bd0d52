use super::{AppendLedger, EscrowCredential, LedgerTips, SignedTransaction, ValueLedger};
use crate::error::{PearlError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

/// In-process append-only ledger.
///
/// Signed transactions are the JSON form of [`SignedTransaction`].
#[derive(Default)]
pub struct MemoryAppendLedger {
    records: Mutex<HashMap<String, String>>,
    broadcasts: Mutex<Vec<SignedTransaction>>,
    tip_counter: AtomicU64,
    delay_ms: AtomicU64,
    fail_calls: AtomicBool,
    hold_attachments: AtomicBool,
}

impl MemoryAppendLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call waits this long first.
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_fail_calls(&self, fail: bool) {
        self.fail_calls.store(fail, Ordering::SeqCst);
    }

    /// Accept attachments without recording them, like a ledger that has not
    /// confirmed yet.
    pub fn set_hold_attachments(&self, hold: bool) {
        self.hold_attachments.store(hold, Ordering::SeqCst);
    }

    pub async fn record(&self, address: &str, content: &str) {
        self.records
            .lock()
            .await
            .insert(address.to_string(), content.to_string());
    }

    pub async fn broadcasts(&self) -> Vec<SignedTransaction> {
        self.broadcasts.lock().await.clone()
    }

    async fn enter(&self, call: &str) -> Result<()> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_calls.load(Ordering::SeqCst) {
            return Err(PearlError::Ledger(format!("{} unavailable", call)));
        }
        Ok(())
    }
}

#[async_trait]
impl AppendLedger for MemoryAppendLedger {
    async fn attach(
        &self,
        address: &str,
        message: &str,
        _file_identifier: &str,
        _index: u64,
    ) -> Result<()> {
        self.enter("attach").await?;
        if !self.hold_attachments.load(Ordering::SeqCst) {
            self.record(address, message).await;
        }
        Ok(())
    }

    async fn fetch_recorded(&self, address: &str) -> Result<Option<String>> {
        self.enter("fetch_recorded").await?;
        Ok(self.records.lock().await.get(address).cloned())
    }

    async fn broadcast_signed(&self, raw: &str) -> Result<()> {
        self.enter("broadcast_signed").await?;
        let transaction = self.decode_signed(raw).await?;
        self.record(&transaction.address, &transaction.message).await;
        self.broadcasts.lock().await.push(transaction);
        Ok(())
    }

    async fn tips(&self) -> Result<LedgerTips> {
        self.enter("tips").await?;
        let n = self.tip_counter.fetch_add(1, Ordering::SeqCst);
        Ok(LedgerTips {
            branch: format!("branch-{}", n),
            trunk: format!("trunk-{}", n),
        })
    }

    async fn decode_signed(&self, raw: &str) -> Result<SignedTransaction> {
        serde_json::from_str(raw)
            .map_err(|e| PearlError::InvalidRequest(format!("undecodable transaction: {}", e)))
    }
}

/// In-process value ledger with explicit balances.
#[derive(Default)]
pub struct MemoryValueLedger {
    balances: Mutex<HashMap<String, u64>>,
    keys: Mutex<HashMap<String, String>>,
    transfers: Mutex<Vec<(String, String, u64)>>,
    buried: Mutex<HashSet<String>>,
    address_counter: AtomicU64,
    fail_calls: AtomicBool,
    hold_burials: AtomicBool,
}

impl MemoryValueLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_calls(&self, fail: bool) {
        self.fail_calls.store(fail, Ordering::SeqCst);
    }

    /// Accept burials without confirming them.
    pub fn set_hold_burials(&self, hold: bool) {
        self.hold_burials.store(hold, Ordering::SeqCst);
    }

    pub async fn credit(&self, address: &str, amount: u64) {
        *self
            .balances
            .lock()
            .await
            .entry(address.to_string())
            .or_insert(0) += amount;
    }

    pub async fn balance(&self, address: &str) -> u64 {
        self.balances
            .lock()
            .await
            .get(address)
            .copied()
            .unwrap_or(0)
    }

    pub async fn transfers(&self) -> Vec<(String, String, u64)> {
        self.transfers.lock().await.clone()
    }

    fn check_available(&self, call: &str) -> Result<()> {
        if self.fail_calls.load(Ordering::SeqCst) {
            return Err(PearlError::Ledger(format!("{} unavailable", call)));
        }
        Ok(())
    }
}

#[async_trait]
impl ValueLedger for MemoryValueLedger {
    async fn generate_address(&self) -> Result<EscrowCredential> {
        self.check_available("generate_address")?;
        let n = self.address_counter.fetch_add(1, Ordering::SeqCst);
        let credential = EscrowCredential {
            address: format!("escrow-{:08}", n),
            private_key: format!("key-{:08}", n),
        };
        self.keys.lock().await.insert(
            credential.address.clone(),
            credential.private_key.clone(),
        );
        Ok(credential)
    }

    async fn check_balance(&self, address: &str) -> Result<u64> {
        self.check_available("check_balance")?;
        Ok(self.balance(address).await)
    }

    async fn transfer(
        &self,
        from: &str,
        to: &str,
        amount: u64,
        private_key: &str,
    ) -> Result<bool> {
        self.check_available("transfer")?;

        if let Some(expected) = self.keys.lock().await.get(from) {
            if expected != private_key {
                return Ok(false);
            }
        }

        let mut balances = self.balances.lock().await;
        let available = balances.get(from).copied().unwrap_or(0);
        if available < amount {
            return Ok(false);
        }
        balances.insert(from.to_string(), available - amount);
        *balances.entry(to.to_string()).or_insert(0) += amount;
        drop(balances);

        self.transfers
            .lock()
            .await
            .push((from.to_string(), to.to_string(), amount));
        Ok(true)
    }

    async fn bury(&self, address: &str, private_key: &str) -> Result<bool> {
        self.check_available("bury")?;

        if let Some(expected) = self.keys.lock().await.get(address) {
            if expected != private_key {
                return Ok(false);
            }
        }
        if self.balance(address).await == 0 {
            return Ok(false);
        }

        if !self.hold_burials.load(Ordering::SeqCst) {
            self.buried.lock().await.insert(address.to_string());
        }
        Ok(true)
    }

    async fn is_buried(&self, address: &str) -> Result<bool> {
        self.check_available("is_buried")?;
        Ok(self.buried.lock().await.contains(address))
    }
}
