//! Command audit log
//!
//! Append-only SQLite table holding every `ResolvedCommand` with its
//! `CommandOutcome`:
//! - keyed by gate sequence number, strictly increasing
//! - each row carries the BLAKE3 hash of the previous row (zeros for the first)
//! - WAL journal for crash durability
//! - chain verified on open and on demand

#![warn(missing_docs)]

use crate::command_types::{CommandOutcome, ResolvedCommand};
use blake3::Hasher;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, error, info};

const GENESIS_HASH: [u8; 32] = [0u8; 32];

/// Audit log errors
#[derive(Debug, Error)]
pub enum AuditError {
    /// SQLite failure
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Record could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Sequence number already recorded
    #[error("Duplicate sequence number: {seq}")]
    DuplicateSequence {
        /// Offending sequence number
        seq: u64,
    },

    /// Sequence number lower than the newest recorded one
    #[error("Sequence number {got} precedes last recorded {last}")]
    OutOfOrder {
        /// Newest recorded sequence number
        last: u64,
        /// Offending sequence number
        got: u64,
    },

    /// Outcome belongs to another command
    #[error("Outcome seq {outcome_seq} does not match command seq {command_seq}")]
    OutcomeMismatch {
        /// Command sequence number
        command_seq: u64,
        /// Outcome sequence number
        outcome_seq: u64,
    },

    /// Stored chain does not verify
    #[error("Audit chain corrupted: {0}")]
    CorruptionDetected(String),

    /// Filesystem failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for audit operations
pub type Result<T> = std::result::Result<T, AuditError>;

/// One audit row
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    /// Resolved command
    pub resolved: ResolvedCommand,
    /// Dispatch outcome
    pub outcome: CommandOutcome,
    /// Hash of the previous entry
    pub prev_hash: [u8; 32],
    /// Hash of this entry
    pub entry_hash: [u8; 32],
}

/// Append-only command audit log
pub struct AuditLog {
    conn: Connection,
    /// Newest (seq, entry_hash)
    head: Option<(u64, [u8; 32])>,
    appended: u64,
}

impl AuditLog {
    /// Open or create the log at `path` and verify its chain
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Opening audit log");

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        Self::from_connection(conn)
    }

    /// Open a log that lives only as long as the returned value
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        Self::init_schema(&conn)?;
        let mut log = Self {
            conn,
            head: None,
            appended: 0,
        };
        let count = log.verify_chain()?;
        log.head = log.load_head()?;
        info!(entries = count, "Audit log chain verified");
        Ok(log)
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS command_audit (
                seq INTEGER PRIMARY KEY,
                cycle INTEGER NOT NULL,
                resolved_at_ns INTEGER NOT NULL,
                source TEXT NOT NULL,
                command TEXT NOT NULL,
                outcome TEXT NOT NULL,
                resolved_json TEXT NOT NULL,
                outcome_json TEXT NOT NULL,
                prev_hash BLOB NOT NULL,
                entry_hash BLOB NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_audit_resolved_at ON command_audit(resolved_at_ns);
            "#,
        )?;
        Ok(())
    }

    /// Append a resolved command and its outcome
    pub fn append(&mut self, resolved: &ResolvedCommand, outcome: &CommandOutcome) -> Result<AuditEntry> {
        let seq = resolved.seq;
        if outcome.seq() != seq {
            return Err(AuditError::OutcomeMismatch {
                command_seq: seq,
                outcome_seq: outcome.seq(),
            });
        }
        if let Some((last, _)) = self.head {
            if seq == last {
                return Err(AuditError::DuplicateSequence { seq });
            }
            if seq < last {
                return Err(AuditError::OutOfOrder { last, got: seq });
            }
        }

        let resolved_json = encode(resolved)?;
        let outcome_json = encode(outcome)?;
        let prev_hash = self.head.map(|(_, hash)| hash).unwrap_or(GENESIS_HASH);
        let entry_hash = compute_entry_hash(&prev_hash, &resolved_json, &outcome_json);

        let inserted = self.conn.execute(
            r#"
            INSERT INTO command_audit (
                seq, cycle, resolved_at_ns, source, command, outcome,
                resolved_json, outcome_json, prev_hash, entry_hash
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                seq as i64,
                resolved.cycle as i64,
                resolved.resolved_at_ns as i64,
                format!("{:?}", resolved.source),
                resolved.command.name(),
                outcome.class(),
                resolved_json,
                outcome_json,
                prev_hash.as_slice(),
                entry_hash.as_slice(),
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(AuditError::DuplicateSequence { seq });
            }
            Err(e) => return Err(e.into()),
        }

        self.head = Some((seq, entry_hash));
        self.appended += 1;
        debug!(seq, entry_hash = %hex::encode(entry_hash), "Audit entry appended");

        Ok(AuditEntry {
            resolved: resolved.clone(),
            outcome: outcome.clone(),
            prev_hash,
            entry_hash,
        })
    }

    /// Entry by sequence number
    pub fn get(&self, seq: u64) -> Result<Option<AuditEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT seq, resolved_json, outcome_json, prev_hash, entry_hash \
             FROM command_audit WHERE seq = ?1",
        )?;
        let row = stmt
            .query_row([seq as i64], StoredRow::from_row)
            .optional()?;
        row.map(StoredRow::into_entry).transpose()
    }

    /// Up to `limit` entries starting at `from_seq`, ascending
    pub fn entries(&self, from_seq: u64, limit: usize) -> Result<Vec<AuditEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT seq, resolved_json, outcome_json, prev_hash, entry_hash \
             FROM command_audit WHERE seq >= ?1 ORDER BY seq ASC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![from_seq as i64, limit as i64], StoredRow::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(StoredRow::into_entry).collect()
    }

    /// Recompute the whole chain, returning the number of entries
    pub fn verify_chain(&self) -> Result<usize> {
        let mut stmt = self.conn.prepare(
            "SELECT seq, resolved_json, outcome_json, prev_hash, entry_hash \
             FROM command_audit ORDER BY seq ASC",
        )?;
        let rows = stmt
            .query_map([], StoredRow::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut expected_prev = GENESIS_HASH;
        for row in &rows {
            if row.prev_hash.as_slice() != expected_prev.as_slice() {
                return Err(corrupted(format!(
                    "prev_hash mismatch at seq {}: expected {}, got {}",
                    row.seq,
                    hex::encode(expected_prev),
                    hex::encode(&row.prev_hash)
                )));
            }
            let recomputed = compute_entry_hash(&expected_prev, &row.resolved_json, &row.outcome_json);
            if row.entry_hash.as_slice() != recomputed.as_slice() {
                return Err(corrupted(format!("entry_hash mismatch at seq {}", row.seq)));
            }
            expected_prev = recomputed;
        }
        Ok(rows.len())
    }

    /// Number of stored entries
    pub fn len(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM command_audit", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Whether the log holds no entries
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Entries appended through this handle
    pub fn appended(&self) -> u64 {
        self.appended
    }

    fn load_head(&self) -> Result<Option<(u64, [u8; 32])>> {
        let head = self
            .conn
            .query_row(
                "SELECT seq, entry_hash FROM command_audit ORDER BY seq DESC LIMIT 1",
                [],
                |row| Ok((row.get::<_, i64>(0)? as u64, row.get::<_, Vec<u8>>(1)?)),
            )
            .optional()?;
        head.map(|(seq, hash)| Ok((seq, to_hash(&hash, seq)?)))
            .transpose()
    }

    #[cfg(test)]
    fn execute_raw(&self, sql: &str) -> Result<usize> {
        Ok(self.conn.execute(sql, [])?)
    }
}

struct StoredRow {
    seq: u64,
    resolved_json: String,
    outcome_json: String,
    prev_hash: Vec<u8>,
    entry_hash: Vec<u8>,
}

impl StoredRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get::<_, i64>(0)? as u64,
            resolved_json: row.get(1)?,
            outcome_json: row.get(2)?,
            prev_hash: row.get(3)?,
            entry_hash: row.get(4)?,
        })
    }

    fn into_entry(self) -> Result<AuditEntry> {
        Ok(AuditEntry {
            resolved: decode(&self.resolved_json)?,
            outcome: decode(&self.outcome_json)?,
            prev_hash: to_hash(&self.prev_hash, self.seq)?,
            entry_hash: to_hash(&self.entry_hash, self.seq)?,
        })
    }
}

fn compute_entry_hash(prev_hash: &[u8; 32], resolved_json: &str, outcome_json: &str) -> [u8; 32] {
    let mut hasher = Hasher::new();
    hasher.update(prev_hash);
    hasher.update(resolved_json.as_bytes());
    hasher.update(outcome_json.as_bytes());
    *hasher.finalize().as_bytes()
}

fn to_hash(bytes: &[u8], seq: u64) -> Result<[u8; 32]> {
    bytes
        .try_into()
        .map_err(|_| corrupted(format!("hash at seq {seq} has {} bytes", bytes.len())))
}

fn corrupted(reason: String) -> AuditError {
    error!(%reason, "Audit chain corruption detected");
    AuditError::CorruptionDetected(reason)
}

fn encode<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| AuditError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(json: &str) -> Result<T> {
    serde_json::from_str(json).map_err(|e| AuditError::Serialization(e.to_string()))
}
