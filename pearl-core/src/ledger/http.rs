use super::{AppendLedger, EscrowCredential, LedgerTips, SignedTransaction, ValueLedger};
use crate::error::{PearlError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// JSON gateway in front of an append-only ledger node.
#[derive(Clone)]
pub struct HttpAppendLedger {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAppendLedger {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[derive(Serialize)]
struct AttachRequest<'a> {
    address: &'a str,
    message: &'a str,
    file_identifier: &'a str,
    index: u64,
}

#[derive(Serialize)]
struct RawTransaction<'a> {
    raw: &'a str,
}

#[derive(Deserialize)]
struct RecordedResponse {
    content: Option<String>,
}

#[async_trait]
impl AppendLedger for HttpAppendLedger {
    async fn attach(
        &self,
        address: &str,
        message: &str,
        file_identifier: &str,
        index: u64,
    ) -> Result<()> {
        let request = self.client.post(format!("{}/attach", self.base_url)).json(
            &AttachRequest {
                address,
                message,
                file_identifier,
                index,
            },
        );
        send_empty(request, "attach").await
    }

    async fn fetch_recorded(&self, address: &str) -> Result<Option<String>> {
        let response = self
            .client
            .get(format!("{}/records/{}", self.base_url, address))
            .send()
            .await
            .map_err(|error| PearlError::Ledger(error.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let payload: RecordedResponse = read_json(response, "fetch_recorded").await?;
        Ok(payload.content.filter(|content| !content.is_empty()))
    }

    async fn broadcast_signed(&self, raw: &str) -> Result<()> {
        let request = self
            .client
            .post(format!("{}/broadcast", self.base_url))
            .json(&RawTransaction { raw });
        send_empty(request, "broadcast").await
    }

    async fn tips(&self) -> Result<LedgerTips> {
        let response = self
            .client
            .get(format!("{}/tips", self.base_url))
            .send()
            .await
            .map_err(|error| PearlError::Ledger(error.to_string()))?;
        read_json(response, "tips").await
    }

    async fn decode_signed(&self, raw: &str) -> Result<SignedTransaction> {
        let response = self
            .client
            .post(format!("{}/decode", self.base_url))
            .json(&RawTransaction { raw })
            .send()
            .await
            .map_err(|error| PearlError::Ledger(error.to_string()))?;

        if response.status() == reqwest::StatusCode::BAD_REQUEST {
            return Err(PearlError::InvalidRequest(
                "ledger could not decode the transaction".to_string(),
            ));
        }

        read_json(response, "decode").await
    }
}

/// JSON gateway in front of a value-transfer ledger node.
#[derive(Clone)]
pub struct HttpValueLedger {
    client: reqwest::Client,
    base_url: String,
}

impl HttpValueLedger {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[derive(Deserialize)]
struct BalanceResponse {
    balance: u64,
}

#[derive(Serialize)]
struct TransferRequest<'a> {
    from: &'a str,
    to: &'a str,
    amount: u64,
    private_key: &'a str,
}

#[derive(Deserialize)]
struct TransferResponse {
    success: bool,
}

#[derive(Serialize)]
struct BuryRequest<'a> {
    address: &'a str,
    private_key: &'a str,
}

#[derive(Deserialize)]
struct BuriedResponse {
    buried: bool,
}

#[async_trait]
impl ValueLedger for HttpValueLedger {
    async fn generate_address(&self) -> Result<EscrowCredential> {
        let response = self
            .client
            .post(format!("{}/addresses", self.base_url))
            .send()
            .await
            .map_err(|error| PearlError::Ledger(error.to_string()))?;
        read_json(response, "generate_address").await
    }

    async fn check_balance(&self, address: &str) -> Result<u64> {
        let response = self
            .client
            .get(format!("{}/balances/{}", self.base_url, address))
            .send()
            .await
            .map_err(|error| PearlError::Ledger(error.to_string()))?;
        let payload: BalanceResponse = read_json(response, "check_balance").await?;
        Ok(payload.balance)
    }

    async fn transfer(
        &self,
        from: &str,
        to: &str,
        amount: u64,
        private_key: &str,
    ) -> Result<bool> {
        let response = self
            .client
            .post(format!("{}/transfers", self.base_url))
            .json(&TransferRequest {
                from,
                to,
                amount,
                private_key,
            })
            .send()
            .await
            .map_err(|error| PearlError::Ledger(error.to_string()))?;
        let payload: TransferResponse = read_json(response, "transfer").await?;
        Ok(payload.success)
    }

    async fn bury(&self, address: &str, private_key: &str) -> Result<bool> {
        let response = self
            .client
            .post(format!("{}/burials", self.base_url))
            .json(&BuryRequest {
                address,
                private_key,
            })
            .send()
            .await
            .map_err(|error| PearlError::Ledger(error.to_string()))?;
        let payload: TransferResponse = read_json(response, "bury").await?;
        Ok(payload.success)
    }

    async fn is_buried(&self, address: &str) -> Result<bool> {
        let response = self
            .client
            .get(format!("{}/burials/{}", self.base_url, address))
            .send()
            .await
            .map_err(|error| PearlError::Ledger(error.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }

        let payload: BuriedResponse = read_json(response, "is_buried").await?;
        Ok(payload.buried)
    }
}

async fn send_empty(request: reqwest::RequestBuilder, call: &str) -> Result<()> {
    let response = request
        .send()
        .await
        .map_err(|error| PearlError::Ledger(error.to_string()))?;

    if !response.status().is_success() {
        return Err(PearlError::Ledger(format!(
            "{} failed: status={}",
            call,
            response.status()
        )));
    }

    Ok(())
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response, call: &str) -> Result<T> {
    if !response.status().is_success() {
        return Err(PearlError::Ledger(format!(
            "{} failed: status={}",
            call,
            response.status()
        )));
    }

    response
        .json()
        .await
        .map_err(|error| PearlError::Ledger(format!("{} response: {}", call, error)))
}
