//! Database migrations

use crate::error::Result;
use libsql::Connection;

use super::connection::run_in_transaction;

/// Current schema version
const CURRENT_VERSION: i32 = 3;

/// Run all pending migrations
pub async fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn).await?;

    if version < 1 {
        apply(conn, 1, &V1_QUEUES).await?;
    }
    if version < 2 {
        apply(conn, 2, &V2_SNAPSHOT).await?;
    }
    if version < 3 {
        apply(conn, 3, &V3_NUMBERING).await?;
    }

    Ok(())
}

/// Get the current schema version
async fn get_version(conn: &Connection) -> Result<i32> {
    // Check if schema_version table exists
    let mut rows = conn
        .query(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            (),
        )
        .await?;

    let exists: bool = if let Some(row) = rows.next().await? {
        row.get::<i32>(0)? != 0
    } else {
        false
    };

    if !exists {
        return Ok(0);
    }

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await?;

    let version: i32 = if let Some(row) = rows.next().await? {
        row.get(0)?
    } else {
        0
    };

    Ok(version)
}

async fn apply(conn: &Connection, version: i32, statements: &[&str]) -> Result<()> {
    let mut batch: Vec<(&str, Vec<libsql::Value>)> =
        statements.iter().map(|sql| (*sql, Vec::new())).collect();
    batch.push((
        "INSERT INTO schema_version (version) VALUES (?)",
        vec![libsql::Value::Integer(i64::from(version))],
    ));

    run_in_transaction(conn, batch).await?;

    tracing::info!("Migrated database to version {version} (target {CURRENT_VERSION})");
    Ok(())
}

/// Version 1: outbox, outbound mail queue, delivery history, accounts, settings
const V1_QUEUES: [&str; 10] = [
    "CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER PRIMARY KEY
    )",
    "CREATE TABLE IF NOT EXISTS outbox_records (
        id TEXT PRIMARY KEY,
        operation_type TEXT NOT NULL,
        payload TEXT NOT NULL,
        retry_count INTEGER NOT NULL DEFAULT 0,
        max_retries INTEGER NOT NULL DEFAULT 5,
        last_error TEXT,
        next_attempt_at INTEGER,
        created_at INTEGER NOT NULL,
        processed_at INTEGER,
        failed_at INTEGER
    )",
    "CREATE INDEX IF NOT EXISTS idx_outbox_pending
        ON outbox_records(processed_at, failed_at, created_at)",
    "CREATE TABLE IF NOT EXISTS outbound_messages (
        id TEXT PRIMARY KEY,
        sender_account_ref TEXT,
        to_addresses TEXT NOT NULL,
        cc_addresses TEXT NOT NULL DEFAULT '[]',
        bcc_addresses TEXT NOT NULL DEFAULT '[]',
        subject TEXT NOT NULL,
        text_body TEXT,
        html_body TEXT,
        attachments TEXT NOT NULL DEFAULT '[]',
        related_entity_ref TEXT,
        status TEXT NOT NULL CHECK (status IN ('queued', 'sending', 'sent', 'failed')),
        retry_count INTEGER NOT NULL DEFAULT 0,
        next_retry_at INTEGER,
        last_error TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        sent_at INTEGER
    )",
    "CREATE INDEX IF NOT EXISTS idx_outbound_messages_due
        ON outbound_messages(status, next_retry_at, created_at)",
    "CREATE TABLE IF NOT EXISTS message_history (
        id TEXT PRIMARY KEY,
        outbox_item_ref TEXT NOT NULL,
        account_ref TEXT,
        to_addresses TEXT NOT NULL,
        subject TEXT NOT NULL,
        status TEXT NOT NULL CHECK (status IN ('sent', 'failed')),
        provider_message_id TEXT,
        error TEXT,
        sent_at INTEGER,
        created_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_message_history_item ON message_history(outbox_item_ref)",
    "CREATE TABLE IF NOT EXISTS mail_accounts (
        id TEXT PRIMARY KEY,
        display_name TEXT NOT NULL,
        email TEXT NOT NULL,
        is_default INTEGER NOT NULL DEFAULT 0,
        is_active INTEGER NOT NULL DEFAULT 1
    )",
    // Settings table (local only)
    "CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_message_history_created ON message_history(created_at DESC)",
];

/// Version 2: cached reference-data snapshot
const V2_SNAPSHOT: [&str; 1] = ["CREATE TABLE IF NOT EXISTS snapshot_cache (
        version INTEGER PRIMARY KEY,
        last_updated TEXT NOT NULL,
        dataset TEXT NOT NULL,
        fetched_at INTEGER NOT NULL
    )"];

/// Version 3: sequence counters, offers and the renumbering audit trail
const V3_NUMBERING: [&str; 5] = [
    "CREATE TABLE IF NOT EXISTS sequence_counters (
        prefix TEXT NOT NULL,
        owner_initial TEXT NOT NULL,
        year INTEGER NOT NULL,
        counter_key TEXT NOT NULL,
        next_sequence INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (prefix, owner_initial, year)
    )",
    // Owned by the quoting side; only offer_number is rewritten here
    "CREATE TABLE IF NOT EXISTS offers (
        id TEXT PRIMARY KEY,
        offer_number TEXT NOT NULL,
        salesperson_initial TEXT,
        created_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_offers_number ON offers(offer_number)",
    "CREATE TABLE IF NOT EXISTS offer_renumbering (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        offer_id TEXT NOT NULL,
        old_number TEXT NOT NULL,
        new_number TEXT NOT NULL,
        renumbered_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_offer_renumbering_offer ON offer_renumbering(offer_id)",
];

#[cfg(test)]
mod tests {
    use super::*;
    use libsql::Builder;

    async fn setup() -> Connection {
        let db = Builder::new_local(":memory:").build().await.unwrap();
        db.connect().unwrap()
    }

    async fn table_exists(conn: &Connection, name: &str) -> bool {
        let mut rows = conn
            .query(
                "SELECT EXISTS(
                    SELECT 1 FROM sqlite_master
                    WHERE type = 'table' AND name = ?
                )",
                [name],
            )
            .await
            .unwrap();

        rows.next()
            .await
            .unwrap()
            .is_some_and(|row| row.get::<i32>(0).unwrap() != 0)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_migrations() {
        let conn = setup().await;
        run(&conn).await.unwrap();

        let version = get_version(&conn).await.unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_migrations_idempotent() {
        let conn = setup().await;
        run(&conn).await.unwrap();
        run(&conn).await.unwrap(); // Should not fail

        let version = get_version(&conn).await.unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_migrations_create_all_tables() {
        let conn = setup().await;
        run(&conn).await.unwrap();

        for table in [
            "outbox_records",
            "outbound_messages",
            "message_history",
            "mail_accounts",
            "settings",
            "snapshot_cache",
            "sequence_counters",
            "offers",
            "offer_renumbering",
        ] {
            assert!(table_exists(&conn, table).await, "missing table {table}");
        }
    }
}
