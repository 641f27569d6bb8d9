//! Outbox repository implementation

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use crate::error::{Error, Result};
use crate::models::{OutboxRecord, OutboxRecordId};
use libsql::{params, Connection};

use super::connection::{count_from, int_or_null, optional_int, optional_text, text_or_null};

/// Error stored on records whose retry budget ran out
pub const MAX_RETRIES_EXCEEDED: &str = "max retries exceeded";

/// Trait for outbox storage operations (async)
#[allow(async_fn_in_trait)]
pub trait OutboxRepository {
    /// Persist a new record
    async fn insert(&self, record: &OutboxRecord) -> Result<()>;

    /// Get a record by ID
    async fn get(&self, id: &OutboxRecordId) -> Result<Option<OutboxRecord>>;

    /// All records that are neither processed nor terminal-failed, oldest first
    async fn list_pending(&self) -> Result<Vec<OutboxRecord>>;

    /// Most recently created records of any state, newest first
    async fn list_recent(&self, limit: usize) -> Result<Vec<OutboxRecord>>;

    /// Mark a record as successfully dispatched
    async fn mark_processed(&self, id: &OutboxRecordId, now: i64) -> Result<()>;

    /// Mark a record as permanently failed
    async fn mark_failed(&self, id: &OutboxRecordId, error: &str, now: i64) -> Result<()>;

    /// Record a retryable failure and the earliest time of the next attempt
    async fn record_failure(
        &self,
        id: &OutboxRecordId,
        retry_count: u32,
        error: &str,
        next_attempt_at: i64,
    ) -> Result<()>;
}

/// libSQL implementation of `OutboxRepository`
pub struct LibSqlOutboxRepository<'a> {
    conn: &'a Connection,
}

const SELECT_COLUMNS: &str = "SELECT id, operation_type, payload, retry_count, max_retries,
        last_error, next_attempt_at, created_at, processed_at, failed_at
     FROM outbox_records";

impl<'a> LibSqlOutboxRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_record(row: &libsql::Row) -> Result<OutboxRecord> {
        let id: String = row.get(0)?;
        Ok(OutboxRecord {
            id: id
                .parse()
                .map_err(|_| Error::Database(format!("invalid outbox record id '{id}'")))?,
            operation_type: row.get(1)?,
            payload: row.get(2)?,
            retry_count: count_from(row.get(3)?),
            max_retries: count_from(row.get(4)?),
            last_error: optional_text(row, 5)?,
            next_attempt_at: optional_int(row, 6)?,
            created_at: row.get(7)?,
            processed_at: optional_int(row, 8)?,
            failed_at: optional_int(row, 9)?,
        })
    }

    async fn collect(mut rows: libsql::Rows) -> Result<Vec<OutboxRecord>> {
        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(Self::parse_record(&row)?);
        }
        Ok(records)
    }

    fn expect_one(id: &OutboxRecordId, rows: u64) -> Result<()> {
        if rows == 0 {
            return Err(Error::NotFound(format!("outbox record {id}")));
        }
        Ok(())
    }
}

impl OutboxRepository for LibSqlOutboxRepository<'_> {
    async fn insert(&self, record: &OutboxRecord) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO outbox_records (
                    id, operation_type, payload, retry_count, max_retries,
                    last_error, next_attempt_at, created_at, processed_at, failed_at
                 ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    record.id.as_str(),
                    record.operation_type.as_str(),
                    record.payload.as_str(),
                    i64::from(record.retry_count),
                    i64::from(record.max_retries),
                    text_or_null(record.last_error.as_deref()),
                    int_or_null(record.next_attempt_at),
                    record.created_at,
                    int_or_null(record.processed_at),
                    int_or_null(record.failed_at),
                ],
            )
            .await?;
        Ok(())
    }

    async fn get(&self, id: &OutboxRecordId) -> Result<Option<OutboxRecord>> {
        let mut rows = self
            .conn
            .query(&format!("{SELECT_COLUMNS} WHERE id = ?"), [id.as_str()])
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_record(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_pending(&self) -> Result<Vec<OutboxRecord>> {
        let rows = self
            .conn
            .query(
                &format!(
                    "{SELECT_COLUMNS}
                     WHERE processed_at IS NULL AND failed_at IS NULL
                     ORDER BY created_at ASC, id ASC"
                ),
                (),
            )
            .await?;
        Self::collect(rows).await
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        let rows = self
            .conn
            .query(
                &format!("{SELECT_COLUMNS} ORDER BY created_at DESC, id DESC LIMIT ?"),
                params![limit as i64],
            )
            .await?;
        Self::collect(rows).await
    }

    async fn mark_processed(&self, id: &OutboxRecordId, now: i64) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE outbox_records
                 SET processed_at = ?, next_attempt_at = NULL
                 WHERE id = ? AND processed_at IS NULL AND failed_at IS NULL",
                params![now, id.as_str()],
            )
            .await?;
        Self::expect_one(id, rows)
    }

    async fn mark_failed(&self, id: &OutboxRecordId, error: &str, now: i64) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE outbox_records
                 SET failed_at = ?, last_error = ?, next_attempt_at = NULL,
                     retry_count = MAX(retry_count, max_retries)
                 WHERE id = ? AND processed_at IS NULL AND failed_at IS NULL",
                params![now, error, id.as_str()],
            )
            .await?;
        Self::expect_one(id, rows)
    }

    async fn record_failure(
        &self,
        id: &OutboxRecordId,
        retry_count: u32,
        error: &str,
        next_attempt_at: i64,
    ) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE outbox_records
                 SET retry_count = ?, last_error = ?, next_attempt_at = ?
                 WHERE id = ? AND processed_at IS NULL AND failed_at IS NULL",
                params![
                    i64::from(retry_count),
                    error,
                    next_attempt_at,
                    id.as_str()
                ],
            )
            .await?;
        Self::expect_one(id, rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::OperationType;
    use serde_json::json;

    async fn setup() -> Database {
        Database::open_in_memory().await.unwrap()
    }

    fn record(operation: OperationType, created_at: i64) -> OutboxRecord {
        let mut record = OutboxRecord::new(operation, &json!({"n": created_at})).unwrap();
        record.created_at = created_at;
        record
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_insert_and_get() {
        let db = setup().await;
        let repo = LibSqlOutboxRepository::new(db.connection());

        let original = record(OperationType::Notify, 10);
        repo.insert(&original).await.unwrap();

        let fetched = repo.get(&original.id).await.unwrap().unwrap();
        assert_eq!(fetched, original);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_list_pending_is_fifo_across_types() {
        let db = setup().await;
        let repo = LibSqlOutboxRepository::new(db.connection());

        let late = record(OperationType::Notify, 30);
        let early = record(OperationType::SendMessage, 10);
        let middle = record(OperationType::LogEventA, 20);
        for item in [&late, &early, &middle] {
            repo.insert(item).await.unwrap();
        }

        let pending = repo.list_pending().await.unwrap();
        let ids: Vec<_> = pending.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![early.id, middle.id, late.id]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_terminal_records_leave_pending_list() {
        let db = setup().await;
        let repo = LibSqlOutboxRepository::new(db.connection());

        let done = record(OperationType::Notify, 1);
        let dead = record(OperationType::LogEventB, 2);
        repo.insert(&done).await.unwrap();
        repo.insert(&dead).await.unwrap();

        repo.mark_processed(&done.id, 100).await.unwrap();
        repo.mark_failed(&dead.id, MAX_RETRIES_EXCEEDED, 100)
            .await
            .unwrap();

        assert!(repo.list_pending().await.unwrap().is_empty());

        let dead = repo.get(&dead.id).await.unwrap().unwrap();
        assert_eq!(dead.retry_count, dead.max_retries);
        assert_eq!(dead.last_error.as_deref(), Some(MAX_RETRIES_EXCEEDED));
        assert!(dead.is_terminal());

        // Terminal records are never touched again
        assert!(repo.mark_processed(&dead.id, 200).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_record_failure_sets_backoff() {
        let db = setup().await;
        let repo = LibSqlOutboxRepository::new(db.connection());

        let item = record(OperationType::Notify, 1);
        repo.insert(&item).await.unwrap();
        repo.record_failure(&item.id, 1, "HTTP 503", 5_000)
            .await
            .unwrap();

        let fetched = repo.get(&item.id).await.unwrap().unwrap();
        assert_eq!(fetched.retry_count, 1);
        assert_eq!(fetched.next_attempt_at, Some(5_000));
        assert_eq!(fetched.last_error.as_deref(), Some("HTTP 503"));
        assert!(fetched.processed_at.is_none());
    }
}
