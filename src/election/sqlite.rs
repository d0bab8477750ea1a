use std::{
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, error};

use super::{
    lease::{from_millis, lease_expired, Clock},
    store::{ElectionRecord, ElectionStore, ElectionView, LeaseStatus},
};
use crate::error::{ElectionError, Result};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS leader_election (
    elect_key TEXT PRIMARY KEY NOT NULL,
    leader TEXT NOT NULL DEFAULT '',
    version INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    modified_at INTEGER
)";

/// Election records kept in a SQLite database. Several processes may point
/// at the same file; SQLite's write lock serializes their updates.
pub struct SqliteElectionStore {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
}

impl SqliteElectionStore {
    pub fn open(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self> {
        Self::from_connection(Connection::open(path)?, clock)
    }

    pub fn open_in_memory(clock: Arc<dyn Clock>) -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, clock)
    }

    fn from_connection(conn: Connection, clock: Arc<dyn Clock>) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute(SCHEMA, [])?;

        Ok(Self {
            conn: Mutex::new(conn),
            clock,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| ElectionError::LockPoisoned)
    }

    pub fn get_election(&self, key: &str) -> Result<ElectionRecord> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT elect_key, leader, version, created_at, modified_at
             FROM leader_election WHERE elect_key = ?1",
            params![key],
            record_from_row,
        )
        .optional()?
        .ok_or_else(|| ElectionError::NotFound(key.to_string()))
    }

    #[cfg(test)]
    pub(crate) fn delete_election(&self, key: &str) -> Result<bool> {
        let conn = self.lock()?;
        let rows = conn.execute(
            "DELETE FROM leader_election WHERE elect_key = ?1",
            params![key],
        )?;
        Ok(rows > 0)
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<ElectionRecord> {
    let created_at: i64 = row.get(3)?;
    let modified_at: Option<i64> = row.get(4)?;

    Ok(ElectionRecord {
        key: row.get(0)?,
        leader: row.get(1)?,
        version: row.get(2)?,
        created_at: from_millis(created_at),
        modified_at: modified_at.map(from_millis),
    })
}

impl ElectionStore for SqliteElectionStore {
    fn create_election(&self, key: &str) -> Result<()> {
        debug!(key, "create leader election");

        let now = self.clock.now().timestamp_millis();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO leader_election (elect_key, leader, version, created_at)
             VALUES (?1, '', 0, ?2)
             ON CONFLICT(elect_key) DO NOTHING",
            params![key, now],
        )
        .map_err(|err| {
            error!(key, error = %err, "create leader election failed");
            err
        })?;
        tx.commit()?;

        Ok(())
    }

    fn get_version(&self, key: &str) -> Result<i64> {
        debug!(key, "get version");

        let conn = self.lock()?;
        conn.query_row(
            "SELECT version FROM leader_election WHERE elect_key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| ElectionError::NotFound(key.to_string()))
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected_version: i64,
        new_version: i64,
        leader: &str,
    ) -> Result<bool> {
        debug!(key, expected_version, new_version, leader, "compare and swap version");

        let now = self.clock.now().timestamp_millis();
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let rows = tx
            .execute(
                "UPDATE leader_election SET leader = ?1, version = ?2, modified_at = ?3
                 WHERE elect_key = ?4 AND version = ?5",
                params![leader, new_version, now, key, expected_version],
            )
            .map_err(|err| {
                error!(key, error = %err, "compare and swap version failed");
                err
            })?;
        tx.commit()?;

        Ok(rows > 0)
    }

    fn check_lease_expired(&self, key: &str, lease: Duration) -> Result<LeaseStatus> {
        debug!(key, lease_ms = lease.as_millis() as u64, "check mtime expired");

        let row: Option<(String, i64, Option<i64>)> = {
            let conn = self.lock()?;
            conn.query_row(
                "SELECT leader, version, modified_at FROM leader_election WHERE elect_key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?
        };
        let (leader, version, modified_at) =
            row.ok_or_else(|| ElectionError::NotFound(key.to_string()))?;

        Ok(LeaseStatus {
            leader,
            version,
            expired: lease_expired(modified_at.map(from_millis), self.clock.now(), lease),
        })
    }

    fn list_elections(&self, lease: Duration) -> Result<Vec<ElectionView>> {
        let records = {
            let conn = self.lock()?;
            let mut stmt = conn.prepare(
                "SELECT elect_key, leader, version, created_at, modified_at
                 FROM leader_election ORDER BY elect_key",
            )?;
            let rows = stmt.query_map([], record_from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let now = self.clock.now();
        Ok(records.iter().map(|record| record.view(now, lease)).collect())
    }
}
