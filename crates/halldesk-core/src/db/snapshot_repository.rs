//! Snapshot cache repository

use crate::error::Result;
use crate::models::CachedSnapshot;
use libsql::{Connection, Value};

use super::connection::run_in_transaction;

/// libSQL-backed cache holding at most one reference-data snapshot
pub struct LibSqlSnapshotRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlSnapshotRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Version of the cached snapshot, 0 when nothing is cached
    pub async fn local_version(&self) -> Result<i64> {
        let mut rows = self
            .conn
            .query("SELECT COALESCE(MAX(version), 0) FROM snapshot_cache", ())
            .await?;
        match rows.next().await? {
            Some(row) => Ok(row.get(0)?),
            None => Ok(0),
        }
    }

    /// The cached snapshot, if any
    pub async fn load(&self) -> Result<Option<CachedSnapshot>> {
        let mut rows = self
            .conn
            .query(
                "SELECT version, last_updated, dataset, fetched_at
                 FROM snapshot_cache ORDER BY version DESC LIMIT 1",
                (),
            )
            .await?;

        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        let dataset: String = row.get(2)?;
        Ok(Some(CachedSnapshot {
            version: row.get(0)?,
            last_updated: row.get(1)?,
            dataset: serde_json::from_str(&dataset)?,
            fetched_at: row.get(3)?,
        }))
    }

    /// Replace the cached snapshot in one transaction, only moving forward.
    ///
    /// Returns `false` and leaves the cache untouched when a snapshot of the
    /// same or a newer version is already stored.
    pub async fn replace(&self, snapshot: &CachedSnapshot) -> Result<bool> {
        let dataset = serde_json::to_string(&snapshot.dataset)?;
        let affected = run_in_transaction(
            self.conn,
            vec![
                (
                    "DELETE FROM snapshot_cache WHERE version < ?",
                    vec![Value::Integer(snapshot.version)],
                ),
                (
                    "INSERT INTO snapshot_cache (version, last_updated, dataset, fetched_at)
                     SELECT ?, ?, ?, ?
                     WHERE NOT EXISTS (SELECT 1 FROM snapshot_cache WHERE version >= ?)",
                    vec![
                        Value::Integer(snapshot.version),
                        Value::Text(snapshot.last_updated.clone()),
                        Value::Text(dataset),
                        Value::Integer(snapshot.fetched_at),
                        Value::Integer(snapshot.version),
                    ],
                ),
            ],
        )
        .await?;
        Ok(affected.get(1).copied() == Some(1))
    }
}
