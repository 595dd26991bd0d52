use crate::error::{PearlError, Result};
use crate::sectors::{POSITION_DELIMITER, join_positions, parse_placement_map};
use crate::storage::entities::{
    AttachmentStatus, Chunk, ChunkStatus, FileIdentifier, FundingStatus, IdentifierStatus,
    NewChunk, PaymentStatus, Reward, RewardBurialStatus, RewardPlacement, Session, SessionRole,
    format_timestamp,
};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Params, Row, Transaction, TransactionBehavior, params};
use std::path::{Path, PathBuf};
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const IDENTIFIER_COLUMNS: &str = "id, identifier, file_size_bytes, chunk_count, status, \
     assignment_count, reward_buried, created_at";

const SESSION_COLUMNS: &str = "id, role, file_identifier, file_size_bytes, chunk_count, \
     storage_years, escrow_address, sealed_escrow_key, peer_escrow_address, total_cost, \
     payment_status, reward_status, placement_map, reward_map, all_data_ready, version, \
     created_at, updated_at";

const CHUNK_COLUMNS: &str = "id, file_identifier, physical_index, address, payload_hash, \
     status, has_payload, branch, trunk, created_at, updated_at";

const REWARD_COLUMNS: &str = "id, session_id, file_identifier, sector, physical_index, \
     escrow_address, sealed_escrow_key, amount, funding_status, attachment_status, \
     ledger_address, ledger_message, created_at, updated_at";

/// Sessions, chunks, rewards and the file identifier pool in one sqlite file.
#[derive(Debug, Clone)]
pub struct EntityStore {
    db_path: PathBuf,
}

impl EntityStore {
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let store = Self { db_path };
        store.init_schema()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn get_conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.get_conn()?;

        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS file_identifiers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                identifier TEXT NOT NULL,
                file_size_bytes INTEGER NOT NULL,
                chunk_count INTEGER NOT NULL,
                status INTEGER NOT NULL,
                assignment_count INTEGER NOT NULL DEFAULT 0,
                reward_buried INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_file_identifiers_status
             ON file_identifiers(status, created_at)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                role INTEGER NOT NULL,
                file_identifier TEXT NOT NULL UNIQUE,
                file_size_bytes INTEGER NOT NULL,
                chunk_count INTEGER NOT NULL,
                storage_years INTEGER NOT NULL,
                escrow_address TEXT NOT NULL,
                sealed_escrow_key TEXT NOT NULL,
                peer_escrow_address TEXT,
                total_cost INTEGER NOT NULL,
                payment_status INTEGER NOT NULL,
                reward_status INTEGER NOT NULL,
                placement_map TEXT NOT NULL,
                reward_map TEXT NOT NULL,
                all_data_ready INTEGER NOT NULL DEFAULT 0,
                version INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS chunks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                file_identifier TEXT NOT NULL,
                physical_index INTEGER NOT NULL,
                address TEXT NOT NULL,
                payload_hash TEXT,
                status INTEGER NOT NULL,
                has_payload INTEGER NOT NULL DEFAULT 0,
                branch TEXT,
                trunk TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (file_identifier, physical_index)
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_chunks_status ON chunks(status, updated_at)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS rewards (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                file_identifier TEXT NOT NULL,
                sector INTEGER NOT NULL,
                physical_index INTEGER NOT NULL,
                escrow_address TEXT NOT NULL,
                sealed_escrow_key TEXT NOT NULL,
                amount INTEGER NOT NULL,
                funding_status INTEGER NOT NULL,
                attachment_status INTEGER NOT NULL,
                ledger_address TEXT NOT NULL,
                ledger_message TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_rewards_attachment ON rewards(attachment_status)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_rewards_session ON rewards(session_id)",
            [],
        )?;

        Ok(())
    }

    // === File identifier pool ===

    pub fn register_file_identifier(
        &self,
        identifier: &str,
        file_size_bytes: u64,
        chunk_count: u64,
    ) -> Result<FileIdentifier> {
        let conn = self.get_conn()?;
        insert_file_identifier(&conn, identifier, file_size_bytes, chunk_count, false)?;
        let id = conn.last_insert_rowid();

        let sql = format!("SELECT {} FROM file_identifiers WHERE id = ?1", IDENTIFIER_COLUMNS);
        Ok(conn.query_row(&sql, [id], identifier_from_row)?)
    }

    pub fn list_file_identifiers(&self, identifier: &str) -> Result<Vec<FileIdentifier>> {
        let sql = format!(
            "SELECT {} FROM file_identifiers WHERE identifier = ?1 ORDER BY created_at, id",
            IDENTIFIER_COLUMNS
        );
        self.query_all(&sql, [identifier], identifier_from_row)
    }

    /// Takes the oldest eligible identifier and marks it Assigned.
    ///
    /// The read and the mark share an immediate transaction, so two callers
    /// racing for one entry cannot both receive it.
    pub fn assign_file_identifier(
        &self,
        exclude: &[String],
        assignment_bound: u32,
    ) -> Result<FileIdentifier> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut entry = select_eligible_identifier(&tx, exclude, assignment_bound, false)?
            .ok_or(PearlError::NoneAvailable)?;
        mark_identifier_assigned(&tx, entry.id)?;
        tx.commit()?;

        entry.status = IdentifierStatus::Assigned;
        Ok(entry)
    }

    /// Assigns an identifier and hands out one of its Unassigned chunks with
    /// the given ledger tips, in a single transaction.
    pub fn claim_chunk_work(
        &self,
        exclude: &[String],
        assignment_bound: u32,
        branch: &str,
        trunk: &str,
    ) -> Result<(FileIdentifier, Chunk)> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut entry = select_eligible_identifier(&tx, exclude, assignment_bound, true)?
            .ok_or(PearlError::NoneAvailable)?;
        mark_identifier_assigned(&tx, entry.id)?;

        let sql = format!(
            "SELECT {} FROM chunks WHERE file_identifier = ?1 AND status = ?2
             ORDER BY physical_index LIMIT 1",
            CHUNK_COLUMNS
        );
        let mut chunk = tx
            .query_row(
                &sql,
                params![entry.identifier, ChunkStatus::Unassigned.as_i64()],
                chunk_from_row,
            )
            .optional()?
            .ok_or(PearlError::NoneAvailable)?;

        let now = Utc::now();
        tx.execute(
            "UPDATE chunks SET status = ?1, branch = ?2, trunk = ?3, updated_at = ?4 WHERE id = ?5",
            params![
                ChunkStatus::Unverified.as_i64(),
                branch,
                trunk,
                format_timestamp(now),
                chunk.id,
            ],
        )?;
        tx.commit()?;

        entry.status = IdentifierStatus::Assigned;
        chunk.status = ChunkStatus::Unverified;
        chunk.branch = Some(branch.to_string());
        chunk.trunk = Some(trunk.to_string());
        chunk.updated_at = now;
        Ok((entry, chunk))
    }

    /// Marks a submitted chunk Complete and returns its identifier to the pool.
    pub fn complete_chunk_work(&self, chunk_id: i64) -> Result<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let file_identifier: String = tx
            .query_row(
                "SELECT file_identifier FROM chunks WHERE id = ?1",
                [chunk_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| PearlError::ChunkNotFound(chunk_id.to_string()))?;

        let updated = tx.execute(
            "UPDATE chunks SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
            params![
                ChunkStatus::Complete.as_i64(),
                format_timestamp(Utc::now()),
                chunk_id,
                ChunkStatus::Unverified.as_i64(),
            ],
        )?;
        if updated == 0 {
            return Err(PearlError::InvalidRequest(format!(
                "chunk {} is not awaiting completion",
                chunk_id
            )));
        }

        tx.execute(
            "UPDATE file_identifiers
             SET status = ?1, assignment_count = assignment_count + 1
             WHERE id = (
                SELECT id FROM file_identifiers
                WHERE identifier = ?2 AND status = ?3
                ORDER BY created_at, id LIMIT 1
             )",
            params![
                IdentifierStatus::Unassigned.as_i64(),
                file_identifier,
                IdentifierStatus::Assigned.as_i64(),
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    // === Sessions ===

    /// Persists a session together with its rewards and pre-created chunk rows.
    pub fn insert_session(
        &self,
        session: &Session,
        rewards: &[Reward],
        chunks: &[NewChunk],
    ) -> Result<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let reward_map = serde_json::to_string(&session.reward_map)?;

        tx.execute(
            &format!(
                "INSERT INTO sessions ({}) VALUES
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
                SESSION_COLUMNS
            ),
            params![
                session.id,
                session.role.as_i64(),
                session.file_identifier,
                session.file_size_bytes as i64,
                session.chunk_count as i64,
                session.storage_years as i64,
                session.escrow_address,
                session.sealed_escrow_key,
                session.peer_escrow_address,
                session.total_cost as i64,
                session.payment_status.as_i64(),
                session.reward_status.as_i64(),
                join_positions(&session.placement_map, POSITION_DELIMITER),
                reward_map,
                session.all_data_ready,
                session.version as i64,
                format_timestamp(session.created_at),
                format_timestamp(session.updated_at),
            ],
        )?;

        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO rewards ({}) VALUES
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                REWARD_COLUMNS
            ))?;
            for reward in rewards {
                stmt.execute(params![
                    reward.id,
                    reward.session_id,
                    reward.file_identifier,
                    reward.sector as i64,
                    reward.physical_index as i64,
                    reward.escrow_address,
                    reward.sealed_escrow_key,
                    reward.amount as i64,
                    reward.funding_status.as_i64(),
                    reward.attachment_status.as_i64(),
                    reward.ledger_address,
                    reward.ledger_message,
                    format_timestamp(reward.created_at),
                    format_timestamp(reward.updated_at),
                ])?;
            }

            let now = format_timestamp(session.created_at);
            let mut stmt = tx.prepare(
                "INSERT INTO chunks (
                    file_identifier, physical_index, address, status, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            )?;
            for chunk in chunks {
                stmt.execute(params![
                    session.file_identifier,
                    chunk.physical_index as i64,
                    chunk.address,
                    ChunkStatus::Pending.as_i64(),
                    now,
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let conn = self.get_conn()?;
        let sql = format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS);
        Ok(conn
            .query_row(&sql, [session_id], session_from_row)
            .optional()?)
    }

    pub fn list_unpaid_sessions(&self, limit: usize) -> Result<Vec<Session>> {
        let sql = format!(
            "SELECT {} FROM sessions WHERE payment_status != ?1 ORDER BY created_at LIMIT ?2",
            SESSION_COLUMNS
        );
        self.query_all(
            &sql,
            params![PaymentStatus::Confirmed.as_i64(), limit as i64],
            session_from_row,
        )
    }

    pub fn list_unpaid_sessions_before(
        &self,
        threshold: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Session>> {
        let sql = format!(
            "SELECT {} FROM sessions
             WHERE payment_status != ?1 AND created_at <= ?2
             ORDER BY created_at LIMIT ?3",
            SESSION_COLUMNS
        );
        self.query_all(
            &sql,
            params![
                PaymentStatus::Confirmed.as_i64(),
                format_timestamp(threshold),
                limit as i64
            ],
            session_from_row,
        )
    }

    /// Payment observed: the session moves to Confirmed and its rewards
    /// become due for burial. Returns false if it was already confirmed.
    pub fn confirm_payment(&self, session_id: &str) -> Result<bool> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            "UPDATE sessions
             SET payment_status = ?1,
                 reward_status = CASE WHEN reward_status = ?2 THEN ?3 ELSE reward_status END,
                 updated_at = ?4
             WHERE id = ?5 AND payment_status != ?1",
            params![
                PaymentStatus::Confirmed.as_i64(),
                RewardBurialStatus::Pending.as_i64(),
                RewardBurialStatus::BurialPending.as_i64(),
                format_timestamp(Utc::now()),
                session_id,
            ],
        )?;

        Ok(affected > 0)
    }

    pub fn list_sessions_awaiting_burial(&self, limit: usize) -> Result<Vec<Session>> {
        let sql = format!(
            "SELECT {} FROM sessions
             WHERE payment_status = ?1 AND reward_status = ?2
             ORDER BY created_at LIMIT ?3",
            SESSION_COLUMNS
        );
        self.query_all(
            &sql,
            params![
                PaymentStatus::Confirmed.as_i64(),
                RewardBurialStatus::BurialPending.as_i64(),
                limit as i64
            ],
            session_from_row,
        )
    }

    /// Releases every chunk of the session to chunk work and publishes the
    /// file identifier to the pool.
    pub fn complete_burial(&self, session: &Session) -> Result<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let now = format_timestamp(Utc::now());

        tx.execute(
            "UPDATE chunks SET status = ?1, updated_at = ?2
             WHERE file_identifier = ?3 AND status = ?4",
            params![
                ChunkStatus::Unassigned.as_i64(),
                now,
                session.file_identifier,
                ChunkStatus::Pending.as_i64(),
            ],
        )?;

        tx.execute(
            "UPDATE sessions SET reward_status = ?1, updated_at = ?2 WHERE id = ?3",
            params![RewardBurialStatus::BurialComplete.as_i64(), now, session.id],
        )?;

        insert_file_identifier(
            &tx,
            &session.file_identifier,
            session.file_size_bytes,
            session.chunk_count,
            true,
        )?;

        tx.commit()?;
        Ok(())
    }

    pub fn list_sessions_awaiting_data(&self, limit: usize) -> Result<Vec<Session>> {
        let sql = format!(
            "SELECT {} FROM sessions WHERE all_data_ready = 0 ORDER BY created_at LIMIT ?1",
            SESSION_COLUMNS
        );
        self.query_all(&sql, [limit as i64], session_from_row)
    }

    pub fn set_all_data_ready(&self, session_id: &str) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE sessions SET all_data_ready = 1, updated_at = ?1 WHERE id = ?2",
            params![format_timestamp(Utc::now()), session_id],
        )?;
        Ok(())
    }

    /// Deletes an unfunded session with its chunks and rewards.
    pub fn delete_session(&self, session_id: &str) -> Result<bool> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        let file_identifier: Option<String> = tx
            .query_row(
                "SELECT file_identifier FROM sessions WHERE id = ?1",
                [session_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(file_identifier) = file_identifier else {
            return Ok(false);
        };

        tx.execute("DELETE FROM chunks WHERE file_identifier = ?1", [&file_identifier])?;
        tx.execute("DELETE FROM rewards WHERE session_id = ?1", [session_id])?;
        tx.execute("DELETE FROM sessions WHERE id = ?1", [session_id])?;

        tx.commit()?;
        Ok(true)
    }

    // === Chunks ===

    pub fn list_chunks(&self, file_identifier: &str) -> Result<Vec<Chunk>> {
        let sql = format!(
            "SELECT {} FROM chunks WHERE file_identifier = ?1 ORDER BY physical_index",
            CHUNK_COLUMNS
        );
        self.query_all(&sql, [file_identifier], chunk_from_row)
    }

    pub fn list_chunks_missing_payload(&self, file_identifier: &str) -> Result<Vec<Chunk>> {
        let sql = format!(
            "SELECT {} FROM chunks WHERE file_identifier = ?1 AND has_payload = 0
             ORDER BY physical_index",
            CHUNK_COLUMNS
        );
        self.query_all(&sql, [file_identifier], chunk_from_row)
    }

    pub fn get_chunk(&self, chunk_id: i64) -> Result<Option<Chunk>> {
        let conn = self.get_conn()?;
        let sql = format!("SELECT {} FROM chunks WHERE id = ?1", CHUNK_COLUMNS);
        Ok(conn.query_row(&sql, [chunk_id], chunk_from_row).optional()?)
    }

    pub fn mark_chunk_payload(
        &self,
        file_identifier: &str,
        physical_index: u64,
        payload_hash: Option<&str>,
    ) -> Result<bool> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            "UPDATE chunks
             SET has_payload = 1, payload_hash = COALESCE(?1, payload_hash), updated_at = ?2
             WHERE file_identifier = ?3 AND physical_index = ?4",
            params![
                payload_hash,
                format_timestamp(Utc::now()),
                file_identifier,
                physical_index as i64,
            ],
        )?;
        Ok(affected > 0)
    }

    /// Records payloads the ingestion worker wrote to the content store.
    pub fn record_chunk_payloads(
        &self,
        file_identifier: &str,
        payloads: &[(u64, String)],
    ) -> Result<usize> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let now = format_timestamp(Utc::now());

        let mut recorded = 0;
        {
            let mut stmt = tx.prepare(
                "UPDATE chunks SET has_payload = 1, payload_hash = ?1, updated_at = ?2
                 WHERE file_identifier = ?3 AND physical_index = ?4",
            )?;
            for (physical_index, payload_hash) in payloads {
                recorded += stmt.execute(params![
                    payload_hash,
                    now,
                    file_identifier,
                    *physical_index as i64,
                ])?;
            }
        }

        tx.commit()?;
        Ok(recorded)
    }

    /// Up to `limit` Unverified chunks last touched at or before `threshold`
    /// go back to Unassigned, oldest first; identifiers left without in-flight
    /// chunks are released.
    pub fn expire_unverified_chunks(
        &self,
        threshold: DateTime<Utc>,
        limit: usize,
    ) -> Result<usize> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let threshold = format_timestamp(threshold);

        let stale: Vec<(i64, String)> = {
            let mut stmt = tx.prepare(
                "SELECT id, file_identifier FROM chunks WHERE status = ?1 AND updated_at <= ?2
                 ORDER BY updated_at, id LIMIT ?3",
            )?;
            let rows = stmt.query_map(
                params![ChunkStatus::Unverified.as_i64(), threshold, limit as i64],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        let now = format_timestamp(Utc::now());
        let mut expired = 0;
        for (chunk_id, _) in &stale {
            expired += tx.execute(
                "UPDATE chunks SET status = ?1, branch = NULL, trunk = NULL, updated_at = ?2
                 WHERE id = ?3",
                params![ChunkStatus::Unassigned.as_i64(), now, chunk_id],
            )?;
        }

        let mut identifiers: Vec<String> = stale
            .into_iter()
            .map(|(_, identifier)| identifier)
            .collect();
        identifiers.sort();
        identifiers.dedup();

        for identifier in identifiers {
            tx.execute(
                "UPDATE file_identifiers SET status = ?1
                 WHERE identifier = ?2 AND status = ?3
                 AND NOT EXISTS (
                    SELECT 1 FROM chunks WHERE file_identifier = ?2 AND status = ?4
                 )",
                params![
                    IdentifierStatus::Unassigned.as_i64(),
                    identifier,
                    IdentifierStatus::Assigned.as_i64(),
                    ChunkStatus::Unverified.as_i64(),
                ],
            )?;
        }

        tx.commit()?;
        Ok(expired)
    }

    // === Rewards ===

    pub fn get_reward(&self, reward_id: &str) -> Result<Option<Reward>> {
        let conn = self.get_conn()?;
        let sql = format!("SELECT {} FROM rewards WHERE id = ?1", REWARD_COLUMNS);
        Ok(conn
            .query_row(&sql, [reward_id], reward_from_row)
            .optional()?)
    }

    pub fn list_rewards_for_session(&self, session_id: &str) -> Result<Vec<Reward>> {
        let sql = format!(
            "SELECT {} FROM rewards WHERE session_id = ?1 ORDER BY sector",
            REWARD_COLUMNS
        );
        self.query_all(&sql, [session_id], reward_from_row)
    }

    pub fn list_rewards_by_attachment(
        &self,
        statuses: &[AttachmentStatus],
        limit: usize,
    ) -> Result<Vec<Reward>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let codes = statuses
            .iter()
            .map(|status| status.as_i64().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {} FROM rewards WHERE attachment_status IN ({})
             ORDER BY updated_at LIMIT ?1",
            REWARD_COLUMNS, codes
        );
        self.query_all(&sql, [limit as i64], reward_from_row)
    }

    /// Waiting or previously failed rewards whose owning session has been paid.
    pub fn list_fundable_rewards(&self, limit: usize) -> Result<Vec<Reward>> {
        let columns = REWARD_COLUMNS
            .split(", ")
            .map(|column| format!("r.{}", column.trim()))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {} FROM rewards r JOIN sessions s ON s.id = r.session_id
             WHERE r.funding_status IN (?1, ?2) AND s.payment_status = ?3
             ORDER BY r.created_at, r.sector LIMIT ?4",
            columns
        );
        self.query_all(
            &sql,
            params![
                FundingStatus::Waiting.as_i64(),
                FundingStatus::FundingError.as_i64(),
                PaymentStatus::Confirmed.as_i64(),
                limit as i64
            ],
            reward_from_row,
        )
    }

    pub fn list_rewards_by_funding(
        &self,
        statuses: &[FundingStatus],
        limit: usize,
    ) -> Result<Vec<Reward>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let codes = statuses
            .iter()
            .map(|status| status.as_i64().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {} FROM rewards WHERE funding_status IN ({})
             ORDER BY updated_at LIMIT ?1",
            REWARD_COLUMNS, codes
        );
        self.query_all(&sql, [limit as i64], reward_from_row)
    }

    pub fn set_attachment_status(&self, reward_id: &str, status: AttachmentStatus) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE rewards SET attachment_status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_i64(), format_timestamp(Utc::now()), reward_id],
        )?;
        Ok(())
    }

    pub fn set_funding_status(&self, reward_id: &str, status: FundingStatus) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE rewards SET funding_status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_i64(), format_timestamp(Utc::now()), reward_id],
        )?;
        Ok(())
    }

    fn query_all<T, P, F>(&self, sql: &str, params: P, map: F) -> Result<Vec<T>>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, map)?;

        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }

        Ok(items)
    }
}

fn insert_file_identifier(
    conn: &Connection,
    identifier: &str,
    file_size_bytes: u64,
    chunk_count: u64,
    reward_buried: bool,
) -> Result<()> {
    conn.execute(
        "INSERT INTO file_identifiers (
            identifier, file_size_bytes, chunk_count, status, assignment_count,
            reward_buried, created_at
        ) VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6)",
        params![
            identifier,
            file_size_bytes as i64,
            chunk_count as i64,
            IdentifierStatus::Unassigned.as_i64(),
            reward_buried,
            format_timestamp(Utc::now()),
        ],
    )?;
    Ok(())
}

fn select_eligible_identifier(
    tx: &Transaction<'_>,
    exclude: &[String],
    assignment_bound: u32,
    require_open_chunk: bool,
) -> Result<Option<FileIdentifier>> {
    let open_chunk_clause = if require_open_chunk {
        format!(
            "AND EXISTS (SELECT 1 FROM chunks c
                         WHERE c.file_identifier = file_identifiers.identifier AND c.status = {})",
            ChunkStatus::Unassigned.as_i64()
        )
    } else {
        String::new()
    };
    let sql = format!(
        "SELECT {} FROM file_identifiers
         WHERE status = ?1 AND assignment_count < ?2 {}
         ORDER BY created_at, id",
        IDENTIFIER_COLUMNS, open_chunk_clause
    );

    let mut stmt = tx.prepare(&sql)?;
    let rows = stmt.query_map(
        params![IdentifierStatus::Unassigned.as_i64(), assignment_bound as i64],
        identifier_from_row,
    )?;

    for row in rows {
        let entry = row?;
        if !exclude.contains(&entry.identifier) {
            return Ok(Some(entry));
        }
    }

    Ok(None)
}

fn mark_identifier_assigned(tx: &Transaction<'_>, id: i64) -> Result<()> {
    let updated = tx.execute(
        "UPDATE file_identifiers SET status = ?1 WHERE id = ?2 AND status = ?3",
        params![
            IdentifierStatus::Assigned.as_i64(),
            id,
            IdentifierStatus::Unassigned.as_i64()
        ],
    )?;
    if updated == 0 {
        return Err(PearlError::NoneAvailable);
    }
    Ok(())
}

fn parse_timestamp(value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn status<T>(column: usize, value: i64, decode: fn(i64) -> Option<T>) -> rusqlite::Result<T> {
    decode(value).ok_or(rusqlite::Error::IntegralValueOutOfRange(column, value))
}

fn identifier_from_row(row: &Row<'_>) -> rusqlite::Result<FileIdentifier> {
    let file_size_bytes: i64 = row.get(2)?;
    let chunk_count: i64 = row.get(3)?;
    let assignment_count: i64 = row.get(5)?;
    let created_at: String = row.get(7)?;

    Ok(FileIdentifier {
        id: row.get(0)?,
        identifier: row.get(1)?,
        file_size_bytes: file_size_bytes as u64,
        chunk_count: chunk_count as u64,
        status: status(4, row.get(4)?, IdentifierStatus::from_i64)?,
        assignment_count: assignment_count as u32,
        reward_buried: row.get(6)?,
        created_at: parse_timestamp(&created_at)?,
    })
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    let file_size_bytes: i64 = row.get(3)?;
    let chunk_count: i64 = row.get(4)?;
    let storage_years: i64 = row.get(5)?;
    let total_cost: i64 = row.get(9)?;
    let placement_map: String = row.get(12)?;
    let reward_map: String = row.get(13)?;
    let version: i64 = row.get(15)?;
    let created_at: String = row.get(16)?;
    let updated_at: String = row.get(17)?;

    let placement_map = parse_placement_map(&placement_map)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
    let reward_map: Vec<RewardPlacement> = serde_json::from_str(&reward_map)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;

    Ok(Session {
        id: row.get(0)?,
        role: status(1, row.get(1)?, SessionRole::from_i64)?,
        file_identifier: row.get(2)?,
        file_size_bytes: file_size_bytes as u64,
        chunk_count: chunk_count as u64,
        storage_years: storage_years as u32,
        escrow_address: row.get(6)?,
        sealed_escrow_key: row.get(7)?,
        peer_escrow_address: row.get(8)?,
        total_cost: total_cost as u64,
        payment_status: status(10, row.get(10)?, PaymentStatus::from_i64)?,
        reward_status: status(11, row.get(11)?, RewardBurialStatus::from_i64)?,
        placement_map,
        reward_map,
        all_data_ready: row.get(14)?,
        version: version as u32,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn chunk_from_row(row: &Row<'_>) -> rusqlite::Result<Chunk> {
    let physical_index: i64 = row.get(2)?;
    let created_at: String = row.get(9)?;
    let updated_at: String = row.get(10)?;

    Ok(Chunk {
        id: row.get(0)?,
        file_identifier: row.get(1)?,
        physical_index: physical_index as u64,
        address: row.get(3)?,
        payload_hash: row.get(4)?,
        status: status(5, row.get(5)?, ChunkStatus::from_i64)?,
        has_payload: row.get(6)?,
        branch: row.get(7)?,
        trunk: row.get(8)?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn reward_from_row(row: &Row<'_>) -> rusqlite::Result<Reward> {
    let sector: i64 = row.get(3)?;
    let physical_index: i64 = row.get(4)?;
    let amount: i64 = row.get(7)?;
    let created_at: String = row.get(12)?;
    let updated_at: String = row.get(13)?;

    Ok(Reward {
        id: row.get(0)?,
        session_id: row.get(1)?,
        file_identifier: row.get(2)?,
        sector: sector as u64,
        physical_index: physical_index as u64,
        escrow_address: row.get(5)?,
        sealed_escrow_key: row.get(6)?,
        amount: amount as u64,
        funding_status: status(8, row.get(8)?, FundingStatus::from_i64)?,
        attachment_status: status(9, row.get(9)?, AttachmentStatus::from_i64)?,
        ledger_address: row.get(10)?,
        ledger_message: row.get(11)?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}
