//! Database connection management

use crate::error::{Error, Result};
use libsql::{Builder, Connection, Database as LibSqlDatabase, Value};
use std::path::Path;

use super::migrations;

/// Database wrapper for the single local libSQL store
pub struct Database {
    _db: LibSqlDatabase,
    conn: Connection,
}

impl Database {
    /// Open a local database at the given path, creating it if it doesn't exist
    ///
    /// Runs migrations automatically.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        Self::build(&path_str, true).await
    }

    /// Open an in-memory database (useful for testing)
    pub async fn open_in_memory() -> Result<Self> {
        Self::build(":memory:", true).await
    }

    /// Open an in-memory database without running migrations.
    ///
    /// Models a store whose schema has not been provisioned yet.
    pub async fn open_unmigrated_in_memory() -> Result<Self> {
        Self::build(":memory:", false).await
    }

    async fn build(path: &str, migrate: bool) -> Result<Self> {
        let db = Builder::new_local(path).build().await?;
        let conn = db.connect()?;

        let database = Self { _db: db, conn };
        database.configure().await?;
        if migrate {
            migrations::run(&database.conn).await?;
        }
        Ok(database)
    }

    /// Configure `SQLite` for a single-writer local store
    async fn configure(&self) -> Result<()> {
        // WAL is unavailable for in-memory databases
        self.conn
            .execute("PRAGMA journal_mode = WAL;", ())
            .await
            .ok();
        self.conn
            .execute("PRAGMA synchronous = NORMAL;", ())
            .await
            .ok();
        self.conn.execute("PRAGMA foreign_keys = ON;", ()).await?;
        self.conn
            .execute("PRAGMA busy_timeout = 5000;", ())
            .await
            .ok();
        Ok(())
    }

    /// Get a reference to the underlying connection
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// Run statements as one transaction, rolling back on the first error.
///
/// Returns the affected row count of each statement.
pub(crate) async fn run_in_transaction(
    conn: &Connection,
    statements: Vec<(&str, Vec<Value>)>,
) -> Result<Vec<u64>> {
    conn.execute("BEGIN IMMEDIATE", ()).await?;

    let mut affected = Vec::with_capacity(statements.len());
    for (sql, params) in statements {
        match conn.execute(sql, params).await {
            Ok(rows) => affected.push(rows),
            Err(e) => {
                conn.execute("ROLLBACK", ()).await.ok();
                return Err(e.into());
            }
        }
    }

    if let Err(e) = conn.execute("COMMIT", ()).await {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    Ok(affected)
}

pub(crate) fn text_or_null(value: Option<&str>) -> Value {
    value.map_or(Value::Null, |text| Value::Text(text.to_string()))
}

pub(crate) fn int_or_null(value: Option<i64>) -> Value {
    value.map_or(Value::Null, Value::Integer)
}

pub(crate) fn optional_text(row: &libsql::Row, idx: i32) -> Result<Option<String>> {
    match row.get_value(idx)? {
        Value::Null => Ok(None),
        Value::Text(text) => Ok(Some(text)),
        other => Err(Error::Database(format!(
            "expected text in column {idx}, found {other:?}"
        ))),
    }
}

pub(crate) fn optional_int(row: &libsql::Row, idx: i32) -> Result<Option<i64>> {
    match row.get_value(idx)? {
        Value::Null => Ok(None),
        Value::Integer(value) => Ok(Some(value)),
        other => Err(Error::Database(format!(
            "expected integer in column {idx}, found {other:?}"
        ))),
    }
}

/// Stored counters are non-negative; clamp anything else to zero.
pub(crate) fn count_from(value: i64) -> u32 {
    u32::try_from(value).unwrap_or(0)
}
