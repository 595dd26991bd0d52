use crate::crypto::{CredentialSealer, chunk_address};
use crate::error::{PearlError, Result};
use crate::ledger::{EscrowCredential, Ledgers};
use crate::options::{BrokerOptions, PROTOCOL_VERSION};
use crate::peer::{PeerBroker, SecondarySessionReply, SecondarySessionRequest};
use crate::sectors::merge_positions;
use crate::storage::{
    AttachmentStatus, EntityStore, FundingStatus, NewChunk, PaymentStatus, Reward,
    RewardBurialStatus, RewardPlacement, Session, SessionRole,
};
use chrono::Utc;
use std::sync::Arc;
use ulid::Ulid;

#[derive(Debug, Clone)]
pub struct StartPairedSessionOperationRequest {
    pub file_identifier: String,
    pub file_size_bytes: u64,
    pub chunk_count: u64,
    pub storage_years: u32,
    pub peer_address: Option<String>,
    /// Secret the uploader derives from its file; it opens the buried rewards.
    pub reward_seed: String,
}

#[derive(Debug, Clone)]
pub struct SecondarySessionRef {
    pub session_id: String,
    pub escrow_address: String,
}

#[derive(Debug, Clone)]
pub struct Invoice {
    pub cost: u64,
    pub escrow_address: String,
}

#[derive(Debug, Clone)]
pub struct StartPairedSessionOperationResult {
    pub session: Session,
    pub secondary: Option<SecondarySessionRef>,
    pub invoice: Invoice,
}

/// Opens the primary session and, when a peer is named, the secondary one on
/// the peer broker. The peer call happens before anything is persisted.
#[derive(Clone)]
pub struct StartPairedSessionOperation {
    store: Arc<EntityStore>,
    ledgers: Ledgers,
    peer: Arc<dyn PeerBroker>,
    sealer: Arc<CredentialSealer>,
    options: Arc<BrokerOptions>,
}

impl StartPairedSessionOperation {
    pub fn new(
        store: Arc<EntityStore>,
        ledgers: Ledgers,
        peer: Arc<dyn PeerBroker>,
        sealer: Arc<CredentialSealer>,
        options: Arc<BrokerOptions>,
    ) -> Self {
        Self {
            store,
            ledgers,
            peer,
            sealer,
            options,
        }
    }

    pub async fn run(
        &self,
        request: StartPairedSessionOperationRequest,
    ) -> Result<StartPairedSessionOperationResult> {
        let StartPairedSessionOperationRequest {
            file_identifier,
            file_size_bytes,
            chunk_count,
            storage_years,
            peer_address,
            reward_seed,
        } = request;

        validate_session_shape(
            &self.options,
            &file_identifier,
            file_size_bytes,
            chunk_count,
            storage_years,
        )?;
        if self.options.bury_rewards && reward_seed.trim().is_empty() {
            return Err(PearlError::InvalidRequest(
                "reward seed cannot be empty".to_string(),
            ));
        }

        let local_positions = if self.options.bury_rewards {
            self.options
                .layout
                .candidate_positions(file_size_bytes as i64)
        } else {
            Vec::new()
        };
        let escrow = self.ledgers.generate_address().await?;

        let (merged, secondary) = match peer_address.as_deref().map(str::trim) {
            Some(peer_address) if !peer_address.is_empty() => {
                let peer_request = SecondarySessionRequest {
                    file_identifier: file_identifier.clone(),
                    file_size_bytes,
                    chunk_count,
                    storage_years,
                    primary_positions: local_positions.clone(),
                    primary_escrow_address: escrow.address.clone(),
                    reward_seed: reward_seed.clone(),
                    version: PROTOCOL_VERSION,
                };

                let reply = self
                    .peer
                    .start_secondary(peer_address, &peer_request)
                    .await
                    .inspect_err(|error| {
                        tracing::warn!(
                            "secondary session request failed. peer={} file={} error={}",
                            peer_address,
                            file_identifier,
                            error
                        );
                    })?;

                let merged = if local_positions.is_empty() && reply.positions.is_empty() {
                    Vec::new()
                } else {
                    merge_positions(&local_positions, &reply.positions).map_err(|_| {
                        PearlError::Peer(format!(
                            "peer {} returned {} positions, expected {}",
                            peer_address,
                            reply.positions.len(),
                            local_positions.len()
                        ))
                    })?
                };

                (
                    merged,
                    Some(SecondarySessionRef {
                        session_id: reply.session_id,
                        escrow_address: reply.escrow_address,
                    }),
                )
            }
            _ => (local_positions, None),
        };

        let session = persist_session(
            &self.store,
            &self.ledgers,
            &self.sealer,
            &self.options,
            NewSession {
                role: SessionRole::Primary,
                file_identifier,
                file_size_bytes,
                chunk_count,
                storage_years,
                placement: merged,
                escrow,
                peer_escrow_address: secondary
                    .as_ref()
                    .map(|secondary| secondary.escrow_address.clone()),
                reward_seed,
            },
        )
        .await?;

        let invoice = Invoice {
            cost: session.total_cost,
            escrow_address: session.escrow_address.clone(),
        };

        Ok(StartPairedSessionOperationResult {
            session,
            secondary,
            invoice,
        })
    }
}

/// Peer side of the paired session: merges the primary's candidates with
/// freshly drawn local ones. A primary that sends no candidates opens a
/// session without rewards on both brokers.
#[derive(Clone)]
pub struct StartSecondarySessionOperation {
    store: Arc<EntityStore>,
    ledgers: Ledgers,
    sealer: Arc<CredentialSealer>,
    options: Arc<BrokerOptions>,
}

impl StartSecondarySessionOperation {
    pub fn new(
        store: Arc<EntityStore>,
        ledgers: Ledgers,
        sealer: Arc<CredentialSealer>,
        options: Arc<BrokerOptions>,
    ) -> Self {
        Self {
            store,
            ledgers,
            sealer,
            options,
        }
    }

    pub async fn run(&self, request: SecondarySessionRequest) -> Result<SecondarySessionReply> {
        let SecondarySessionRequest {
            file_identifier,
            file_size_bytes,
            chunk_count,
            storage_years,
            primary_positions,
            primary_escrow_address,
            reward_seed,
            version: _,
        } = request;

        validate_session_shape(
            &self.options,
            &file_identifier,
            file_size_bytes,
            chunk_count,
            storage_years,
        )?;

        if primary_positions.is_empty() {
            tracing::debug!("primary buries no rewards. file={}", file_identifier);
        } else if reward_seed.trim().is_empty() {
            return Err(PearlError::InvalidRequest(
                "reward seed cannot be empty".to_string(),
            ));
        }

        let local_positions = if primary_positions.is_empty() {
            Vec::new()
        } else {
            self.options
                .layout
                .candidate_positions(file_size_bytes as i64)
        };
        if primary_positions.len() != local_positions.len() {
            return Err(PearlError::InvalidRequest(format!(
                "primary sent {} positions for a file of {} sectors",
                primary_positions.len(),
                local_positions.len()
            )));
        }

        let merged = if primary_positions.is_empty() {
            Vec::new()
        } else {
            merge_positions(&primary_positions, &local_positions)?
        };
        let escrow = self.ledgers.generate_address().await?;

        let session = persist_session(
            &self.store,
            &self.ledgers,
            &self.sealer,
            &self.options,
            NewSession {
                role: SessionRole::Secondary,
                file_identifier,
                file_size_bytes,
                chunk_count,
                storage_years,
                placement: merged,
                escrow,
                peer_escrow_address: Some(primary_escrow_address),
                reward_seed,
            },
        )
        .await?;

        Ok(SecondarySessionReply {
            session_id: session.id,
            positions: local_positions,
            escrow_address: session.escrow_address,
        })
    }
}

fn validate_session_shape(
    options: &BrokerOptions,
    file_identifier: &str,
    file_size_bytes: u64,
    chunk_count: u64,
    storage_years: u32,
) -> Result<()> {
    if file_identifier.trim().is_empty() {
        return Err(PearlError::InvalidRequest(
            "file identifier cannot be empty".to_string(),
        ));
    }
    if file_size_bytes == 0 || chunk_count == 0 {
        return Err(PearlError::InvalidRequest(
            "file size and chunk count must be positive".to_string(),
        ));
    }
    if file_size_bytes > i64::MAX as u64 {
        return Err(PearlError::InvalidRequest("file size too large".to_string()));
    }
    if storage_years == 0 {
        return Err(PearlError::InvalidRequest(
            "storage years must be positive".to_string(),
        ));
    }
    if chunk_count > options.max_chunks_per_session {
        return Err(PearlError::InvalidRequest(format!(
            "chunk count {} exceeds limit {}",
            chunk_count, options.max_chunks_per_session
        )));
    }

    let layout = &options.layout;
    let by_size = layout.sector_count(file_size_bytes as i64);
    let by_chunks = layout.sectors_for_chunks(chunk_count);
    if by_size != by_chunks {
        return Err(PearlError::InvalidRequest(format!(
            "file size implies {} sectors but chunk count implies {}",
            by_size, by_chunks
        )));
    }

    Ok(())
}

struct NewSession {
    role: SessionRole,
    file_identifier: String,
    file_size_bytes: u64,
    chunk_count: u64,
    storage_years: u32,
    placement: Vec<u64>,
    escrow: EscrowCredential,
    peer_escrow_address: Option<String>,
    reward_seed: String,
}

async fn persist_session(
    store: &EntityStore,
    ledgers: &Ledgers,
    sealer: &CredentialSealer,
    options: &BrokerOptions,
    new_session: NewSession,
) -> Result<Session> {
    let NewSession {
        role,
        file_identifier,
        file_size_bytes,
        chunk_count,
        storage_years,
        placement,
        escrow,
        peer_escrow_address,
        reward_seed,
    } = new_session;

    let layout = &options.layout;
    let slots = layout.reward_slots(chunk_count, &placement)?;
    let session_id = Ulid::new().to_string();
    let now = Utc::now();

    let mut rewards = Vec::with_capacity(slots.len());
    let mut reward_map = Vec::with_capacity(slots.len());
    for (sector, (&position, &physical_index)) in placement.iter().zip(&slots).enumerate() {
        let sector = sector as u64;
        let reward_escrow = ledgers.generate_address().await?;
        let reward = Reward {
            id: Ulid::new().to_string(),
            session_id: session_id.clone(),
            file_identifier: file_identifier.clone(),
            sector,
            physical_index,
            escrow_address: reward_escrow.address,
            sealed_escrow_key: sealer.seal(&reward_escrow.private_key)?,
            amount: options.reward_amount,
            funding_status: FundingStatus::Waiting,
            attachment_status: AttachmentStatus::Signed,
            ledger_address: chunk_address(&file_identifier, physical_index),
            ledger_message: CredentialSealer::for_reward(&reward_seed, &file_identifier, sector)?
                .seal(&reward_escrow.private_key)?,
            created_at: now,
            updated_at: now,
        };

        reward_map.push(RewardPlacement {
            sector,
            position,
            physical_index,
            reward_id: reward.id.clone(),
        });
        rewards.push(reward);
    }

    let chunks: Vec<NewChunk> = (0..chunk_count + placement.len() as u64)
        .map(|physical_index| NewChunk {
            physical_index,
            address: chunk_address(&file_identifier, physical_index),
        })
        .collect();

    let session = Session {
        id: session_id,
        role,
        file_identifier,
        file_size_bytes,
        chunk_count,
        storage_years,
        escrow_address: escrow.address,
        sealed_escrow_key: sealer.seal(&escrow.private_key)?,
        peer_escrow_address,
        total_cost: options.session_cost(chunk_count, storage_years),
        payment_status: PaymentStatus::Pending,
        reward_status: RewardBurialStatus::Pending,
        placement_map: placement,
        reward_map,
        all_data_ready: false,
        version: PROTOCOL_VERSION,
        created_at: now,
        updated_at: now,
    };

    store.insert_session(&session, &rewards, &chunks)?;

    tracing::info!(
        "session opened. session={} role={} file={} sectors={}",
        session.id,
        session.role,
        session.file_identifier,
        session.placement_map.len()
    );
    tracing::info!(
        target: "pearl::accounting",
        session_id = %session.id,
        file_identifier = %session.file_identifier,
        role = %session.role,
        chunk_count = session.chunk_count,
        cost = session.total_cost,
        "upload session billed"
    );

    Ok(session)
}
