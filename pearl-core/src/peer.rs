use crate::error::{PearlError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const SECONDARY_SESSION_PATH: &str = "/api/v2/upload-sessions/beta";

/// What the primary broker sends when it opens the paired session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecondarySessionRequest {
    pub file_identifier: String,
    pub file_size_bytes: u64,
    pub chunk_count: u64,
    pub storage_years: u32,
    pub primary_positions: Vec<u64>,
    pub primary_escrow_address: String,
    /// Empty when the session buries no rewards.
    #[serde(default)]
    pub reward_seed: String,
    pub version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecondarySessionReply {
    pub session_id: String,
    pub positions: Vec<u64>,
    pub escrow_address: String,
}

/// The other broker of the pair.
#[async_trait]
pub trait PeerBroker: Send + Sync {
    async fn start_secondary(
        &self,
        peer_address: &str,
        request: &SecondarySessionRequest,
    ) -> Result<SecondarySessionReply>;
}

#[derive(Clone)]
pub struct HttpPeerBroker {
    client: reqwest::Client,
    timeout: Duration,
}

#[derive(Deserialize)]
struct PeerEnvelope {
    success: bool,
    data: Option<SecondarySessionReply>,
    error: Option<String>,
}

impl HttpPeerBroker {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

fn peer_url(peer_address: &str) -> String {
    let base = peer_address.trim_end_matches('/');
    if base.starts_with("http://") || base.starts_with("https://") {
        format!("{}{}", base, SECONDARY_SESSION_PATH)
    } else {
        format!("http://{}{}", base, SECONDARY_SESSION_PATH)
    }
}

#[async_trait]
impl PeerBroker for HttpPeerBroker {
    async fn start_secondary(
        &self,
        peer_address: &str,
        request: &SecondarySessionRequest,
    ) -> Result<SecondarySessionReply> {
        let response = self
            .client
            .post(peer_url(peer_address))
            .timeout(self.timeout)
            .json(request)
            .send()
            .await
            .map_err(|error| {
                if error.is_timeout() {
                    PearlError::Timeout(format!("peer {}: {}", peer_address, error))
                } else {
                    PearlError::Peer(format!("peer {}: {}", peer_address, error))
                }
            })?;

        let status = response.status();
        let envelope: PeerEnvelope = response
            .json()
            .await
            .map_err(|error| PearlError::Peer(format!("peer {} reply: {}", peer_address, error)))?;

        if !status.is_success() || !envelope.success {
            return Err(PearlError::Peer(format!(
                "peer {} refused secondary session: status={} error={}",
                peer_address,
                status,
                envelope.error.unwrap_or_default()
            )));
        }

        envelope
            .data
            .ok_or_else(|| PearlError::Peer(format!("peer {} returned no session", peer_address)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_url() {
        assert_eq!(
            peer_url("10.0.0.2:8080"),
            "http://10.0.0.2:8080/api/v2/upload-sessions/beta"
        );
        assert_eq!(
            peer_url("https://beta.example/"),
            "https://beta.example/api/v2/upload-sessions/beta"
        );
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_retryable() {
        let broker = HttpPeerBroker::new(reqwest::Client::new(), Duration::from_millis(500));
        let request = SecondarySessionRequest {
            file_identifier: "genesis".to_string(),
            file_size_bytes: 10,
            chunk_count: 1,
            storage_years: 1,
            primary_positions: vec![0],
            primary_escrow_address: "escrow".to_string(),
            reward_seed: "seed".to_string(),
            version: 2,
        };

        let error = broker
            .start_secondary("127.0.0.1:1", &request)
            .await
            .unwrap_err();
        assert!(error.is_retryable());
    }
}
