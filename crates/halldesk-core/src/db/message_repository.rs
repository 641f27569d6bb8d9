//! Outbound message, delivery history and mail account repository

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use crate::error::{Error, Result};
use crate::models::{
    MailAccount, MessageHistoryEntry, MessageId, MessageStatus, OutboundMessage,
};
use libsql::{params, Connection};

use super::connection::{count_from, int_or_null, optional_int, optional_text, text_or_null};

/// Trait for outbound message storage operations (async)
#[allow(async_fn_in_trait)]
pub trait MessageRepository {
    /// Persist a newly queued message
    async fn insert(&self, message: &OutboundMessage) -> Result<()>;

    /// Get a message by ID
    async fn get(&self, id: &MessageId) -> Result<Option<OutboundMessage>>;

    /// Messages eligible for pickup at `now`, oldest first
    async fn list_due(&self, now: i64, max_retries: u32, limit: usize)
        -> Result<Vec<OutboundMessage>>;

    /// Retry-scheduled messages whose attempts already reached `max_retries`.
    ///
    /// `list_due` never picks these, so the worker retires them explicitly.
    async fn list_over_budget(&self, max_retries: u32) -> Result<Vec<OutboundMessage>>;

    /// Move a retry-scheduled message straight to exhausted, with its history entry
    async fn retire(&self, id: &MessageId, entry: &MessageHistoryEntry, now: i64)
        -> Result<()>;

    /// Move a queued or retryable message to `sending`.
    ///
    /// Returns `false` when another pass already claimed or finished it.
    async fn claim(&self, id: &MessageId, now: i64) -> Result<bool>;

    /// Return messages stuck in `sending` since before `cutoff` to the queue.
    ///
    /// Returns the number of released messages.
    async fn release_stale_claims(&self, cutoff: i64, now: i64) -> Result<u64>;

    /// Mark a message delivered and append its history entry atomically
    async fn mark_sent(&self, id: &MessageId, entry: &MessageHistoryEntry, now: i64)
        -> Result<()>;

    /// Record a failed attempt that will be retried at `next_retry_at`
    async fn schedule_retry(
        &self,
        id: &MessageId,
        retry_count: u32,
        error: &str,
        next_retry_at: i64,
        now: i64,
    ) -> Result<()>;

    /// Record the final failed attempt and append its history entry atomically
    async fn mark_exhausted(
        &self,
        id: &MessageId,
        retry_count: u32,
        entry: &MessageHistoryEntry,
        now: i64,
    ) -> Result<()>;

    /// History entries, newest first
    async fn list_history(&self, limit: usize) -> Result<Vec<MessageHistoryEntry>>;

    /// History entries for one message
    async fn history_for(&self, id: &MessageId) -> Result<Vec<MessageHistoryEntry>>;

    /// Active account by ID
    async fn find_active_account(&self, account_id: &str) -> Result<Option<MailAccount>>;

    /// The active account flagged as default
    async fn default_account(&self) -> Result<Option<MailAccount>>;

    /// Insert or replace an account
    async fn save_account(&self, account: &MailAccount) -> Result<()>;
}

/// libSQL implementation of `MessageRepository`
pub struct LibSqlMessageRepository<'a> {
    conn: &'a Connection,
}

const MESSAGE_COLUMNS: &str = "SELECT id, sender_account_ref, to_addresses, cc_addresses,
        bcc_addresses, subject, text_body, html_body, attachments, related_entity_ref,
        status, retry_count, next_retry_at, last_error, created_at, updated_at, sent_at
     FROM outbound_messages";

const HISTORY_COLUMNS: &str = "SELECT id, outbox_item_ref, account_ref, to_addresses, subject,
        status, provider_message_id, error, sent_at, created_at
     FROM message_history";

const ACCOUNT_COLUMNS: &str =
    "SELECT id, display_name, email, is_default, is_active FROM mail_accounts";

const INSERT_HISTORY: &str = "INSERT INTO message_history (
        id, outbox_item_ref, account_ref, to_addresses, subject,
        status, provider_message_id, error, sent_at, created_at
     ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

impl<'a> LibSqlMessageRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_list(raw: &str) -> Result<Vec<String>> {
        Ok(serde_json::from_str(raw)?)
    }

    fn parse_message(row: &libsql::Row) -> Result<OutboundMessage> {
        let id: String = row.get(0)?;
        let status: String = row.get(10)?;
        Ok(OutboundMessage {
            id: id
                .parse()
                .map_err(|_| Error::Database(format!("invalid message id '{id}'")))?,
            sender_account_ref: optional_text(row, 1)?,
            to: Self::parse_list(&row.get::<String>(2)?)?,
            cc: Self::parse_list(&row.get::<String>(3)?)?,
            bcc: Self::parse_list(&row.get::<String>(4)?)?,
            subject: row.get(5)?,
            text_body: optional_text(row, 6)?,
            html_body: optional_text(row, 7)?,
            attachments: Self::parse_list(&row.get::<String>(8)?)?,
            related_entity_ref: optional_text(row, 9)?,
            status: MessageStatus::from_columns(
                &status,
                optional_int(row, 12)?,
                optional_int(row, 16)?,
            )?,
            retry_count: count_from(row.get(11)?),
            last_error: optional_text(row, 13)?,
            created_at: row.get(14)?,
            updated_at: row.get(15)?,
        })
    }

    fn parse_history(row: &libsql::Row) -> Result<MessageHistoryEntry> {
        let item: String = row.get(1)?;
        let status: String = row.get(5)?;
        Ok(MessageHistoryEntry {
            id: row.get(0)?,
            outbox_item_ref: item
                .parse()
                .map_err(|_| Error::Database(format!("invalid message id '{item}'")))?,
            account_ref: optional_text(row, 2)?,
            to: Self::parse_list(&row.get::<String>(3)?)?,
            subject: row.get(4)?,
            status: status.parse()?,
            provider_message_id: optional_text(row, 6)?,
            error: optional_text(row, 7)?,
            sent_at: optional_int(row, 8)?,
            created_at: row.get(9)?,
        })
    }

    fn parse_account(row: &libsql::Row) -> Result<MailAccount> {
        Ok(MailAccount {
            id: row.get(0)?,
            display_name: row.get(1)?,
            email: row.get(2)?,
            is_default: row.get::<i64>(3)? != 0,
            is_active: row.get::<i64>(4)? != 0,
        })
    }

    fn history_params(entry: &MessageHistoryEntry) -> Result<Vec<libsql::Value>> {
        Ok(vec![
            entry.id.clone().into(),
            entry.outbox_item_ref.as_str().into(),
            text_or_null(entry.account_ref.as_deref()),
            serde_json::to_string(&entry.to)?.into(),
            entry.subject.clone().into(),
            entry.status.as_str().into(),
            text_or_null(entry.provider_message_id.as_deref()),
            text_or_null(entry.error.as_deref()),
            int_or_null(entry.sent_at),
            entry.created_at.into(),
        ])
    }

    async fn query_history(mut rows: libsql::Rows) -> Result<Vec<MessageHistoryEntry>> {
        let mut entries = Vec::new();
        while let Some(row) = rows.next().await? {
            entries.push(Self::parse_history(&row)?);
        }
        Ok(entries)
    }

    async fn first_account(mut rows: libsql::Rows) -> Result<Option<MailAccount>> {
        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_account(&row)?)),
            None => Ok(None),
        }
    }

    async fn transition_with_history(
        &self,
        id: &MessageId,
        update_sql: &str,
        update_params: Vec<libsql::Value>,
        entry: &MessageHistoryEntry,
    ) -> Result<()> {
        let history_params = Self::history_params(entry)?;

        self.conn.execute("BEGIN IMMEDIATE", ()).await?;

        let updated = match self.conn.execute(update_sql, update_params).await {
            Ok(rows) => rows,
            Err(e) => {
                self.conn.execute("ROLLBACK", ()).await.ok();
                return Err(e.into());
            }
        };
        if updated == 0 {
            self.conn.execute("ROLLBACK", ()).await.ok();
            return Err(Error::NotFound(format!("message {id} in expected state")));
        }

        if let Err(e) = self.conn.execute(INSERT_HISTORY, history_params).await {
            self.conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }

        if let Err(e) = self.conn.execute("COMMIT", ()).await {
            self.conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
        Ok(())
    }
}

impl MessageRepository for LibSqlMessageRepository<'_> {
    async fn insert(&self, message: &OutboundMessage) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO outbound_messages (
                    id, sender_account_ref, to_addresses, cc_addresses, bcc_addresses,
                    subject, text_body, html_body, attachments, related_entity_ref,
                    status, retry_count, next_retry_at, last_error, created_at,
                    updated_at, sent_at
                 ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    message.id.as_str(),
                    text_or_null(message.sender_account_ref.as_deref()),
                    serde_json::to_string(&message.to)?,
                    serde_json::to_string(&message.cc)?,
                    serde_json::to_string(&message.bcc)?,
                    message.subject.as_str(),
                    text_or_null(message.text_body.as_deref()),
                    text_or_null(message.html_body.as_deref()),
                    serde_json::to_string(&message.attachments)?,
                    text_or_null(message.related_entity_ref.as_deref()),
                    message.status.as_str(),
                    i64::from(message.retry_count),
                    int_or_null(message.status.next_retry_at()),
                    text_or_null(message.last_error.as_deref()),
                    message.created_at,
                    message.updated_at,
                    int_or_null(message.status.sent_at()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn get(&self, id: &MessageId) -> Result<Option<OutboundMessage>> {
        let mut rows = self
            .conn
            .query(&format!("{MESSAGE_COLUMNS} WHERE id = ?"), [id.as_str()])
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_message(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_due(
        &self,
        now: i64,
        max_retries: u32,
        limit: usize,
    ) -> Result<Vec<OutboundMessage>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "{MESSAGE_COLUMNS}
                     WHERE status IN ('queued', 'failed')
                       AND retry_count < ?
                       AND (next_retry_at IS NULL OR next_retry_at <= ?)
                     ORDER BY created_at ASC, id ASC
                     LIMIT ?"
                ),
                params![i64::from(max_retries), now, limit as i64],
            )
            .await?;

        let mut messages = Vec::new();
        while let Some(row) = rows.next().await? {
            messages.push(Self::parse_message(&row)?);
        }
        Ok(messages)
    }

    async fn list_over_budget(&self, max_retries: u32) -> Result<Vec<OutboundMessage>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "{MESSAGE_COLUMNS}
                     WHERE status = 'failed'
                       AND next_retry_at IS NOT NULL
                       AND retry_count >= ?
                     ORDER BY created_at ASC, id ASC"
                ),
                params![i64::from(max_retries)],
            )
            .await?;

        let mut messages = Vec::new();
        while let Some(row) = rows.next().await? {
            messages.push(Self::parse_message(&row)?);
        }
        Ok(messages)
    }

    async fn retire(&self, id: &MessageId, entry: &MessageHistoryEntry, now: i64) -> Result<()> {
        self.transition_with_history(
            id,
            "UPDATE outbound_messages
             SET next_retry_at = NULL, updated_at = ?
             WHERE id = ? AND status = 'failed' AND next_retry_at IS NOT NULL",
            vec![now.into(), id.as_str().into()],
            entry,
        )
        .await
    }

    async fn claim(&self, id: &MessageId, now: i64) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "UPDATE outbound_messages
                 SET status = 'sending', updated_at = ?
                 WHERE id = ? AND status IN ('queued', 'failed')",
                params![now, id.as_str()],
            )
            .await?;
        Ok(rows == 1)
    }

    async fn release_stale_claims(&self, cutoff: i64, now: i64) -> Result<u64> {
        // A released retry keeps a due next_retry_at so it still reads as retryable
        let rows = self
            .conn
            .execute(
                "UPDATE outbound_messages
                 SET status = CASE WHEN retry_count = 0 THEN 'queued' ELSE 'failed' END,
                     next_retry_at = CASE WHEN retry_count = 0 THEN NULL ELSE ? END,
                     updated_at = ?
                 WHERE status = 'sending' AND updated_at < ?",
                params![now, now, cutoff],
            )
            .await?;
        Ok(rows)
    }

    async fn mark_sent(
        &self,
        id: &MessageId,
        entry: &MessageHistoryEntry,
        now: i64,
    ) -> Result<()> {
        self.transition_with_history(
            id,
            "UPDATE outbound_messages
             SET status = 'sent', sent_at = ?, updated_at = ?, next_retry_at = NULL,
                 last_error = NULL
             WHERE id = ? AND status = 'sending'",
            vec![now.into(), now.into(), id.as_str().into()],
            entry,
        )
        .await
    }

    async fn schedule_retry(
        &self,
        id: &MessageId,
        retry_count: u32,
        error: &str,
        next_retry_at: i64,
        now: i64,
    ) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE outbound_messages
                 SET status = 'failed', retry_count = ?, last_error = ?,
                     next_retry_at = ?, updated_at = ?
                 WHERE id = ? AND status = 'sending'",
                params![
                    i64::from(retry_count),
                    error,
                    next_retry_at,
                    now,
                    id.as_str()
                ],
            )
            .await?;
        if rows == 0 {
            return Err(Error::NotFound(format!("sending message {id}")));
        }
        Ok(())
    }

    async fn mark_exhausted(
        &self,
        id: &MessageId,
        retry_count: u32,
        entry: &MessageHistoryEntry,
        now: i64,
    ) -> Result<()> {
        self.transition_with_history(
            id,
            "UPDATE outbound_messages
             SET status = 'failed', retry_count = ?, last_error = ?,
                 next_retry_at = NULL, updated_at = ?
             WHERE id = ? AND status = 'sending'",
            vec![
                i64::from(retry_count).into(),
                text_or_null(entry.error.as_deref()),
                now.into(),
                id.as_str().into(),
            ],
            entry,
        )
        .await
    }

    async fn list_history(&self, limit: usize) -> Result<Vec<MessageHistoryEntry>> {
        let rows = self
            .conn
            .query(
                &format!("{HISTORY_COLUMNS} ORDER BY created_at DESC, id DESC LIMIT ?"),
                params![limit as i64],
            )
            .await?;
        Self::query_history(rows).await
    }

    async fn history_for(&self, id: &MessageId) -> Result<Vec<MessageHistoryEntry>> {
        let rows = self
            .conn
            .query(
                &format!("{HISTORY_COLUMNS} WHERE outbox_item_ref = ? ORDER BY created_at ASC"),
                [id.as_str()],
            )
            .await?;
        Self::query_history(rows).await
    }

    async fn find_active_account(&self, account_id: &str) -> Result<Option<MailAccount>> {
        let rows = self
            .conn
            .query(
                &format!("{ACCOUNT_COLUMNS} WHERE id = ? AND is_active = 1"),
                [account_id],
            )
            .await?;
        Self::first_account(rows).await
    }

    async fn default_account(&self) -> Result<Option<MailAccount>> {
        let rows = self
            .conn
            .query(
                &format!(
                    "{ACCOUNT_COLUMNS} WHERE is_default = 1 AND is_active = 1 ORDER BY id LIMIT 1"
                ),
                (),
            )
            .await?;
        Self::first_account(rows).await
    }

    async fn save_account(&self, account: &MailAccount) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO mail_accounts (id, display_name, email, is_default, is_active)
                 VALUES (?, ?, ?, ?, ?)",
                params![
                    account.id.as_str(),
                    account.display_name.as_str(),
                    account.email.as_str(),
                    i64::from(account.is_default),
                    i64::from(account.is_active),
                ],
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{HistoryStatus, NewOutboundMessage};
    use pretty_assertions::assert_eq;

    async fn setup() -> Database {
        Database::open_in_memory().await.unwrap()
    }

    fn message(created_at: i64) -> OutboundMessage {
        NewOutboundMessage {
            to: vec!["buyer@example.com".to_string()],
            cc: vec!["office@example.com".to_string()],
            subject: format!("Offer {created_at}"),
            html_body: Some("<p>Offer</p>".to_string()),
            attachments: vec!["offer.pdf".to_string()],
            related_entity_ref: Some("offer-1".to_string()),
            ..NewOutboundMessage::default()
        }
        .into_message(created_at)
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_insert_and_get_roundtrip() {
        let db = setup().await;
        let repo = LibSqlMessageRepository::new(db.connection());

        let original = message(100);
        repo.insert(&original).await.unwrap();
        assert_eq!(repo.get(&original.id).await.unwrap(), Some(original));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_claim_is_compare_and_set() {
        let db = setup().await;
        let repo = LibSqlMessageRepository::new(db.connection());

        let queued = message(1);
        repo.insert(&queued).await.unwrap();

        assert!(repo.claim(&queued.id, 10).await.unwrap());
        assert!(!repo.claim(&queued.id, 11).await.unwrap());

        let stored = repo.get(&queued.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Sending);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_list_due_respects_schedule_and_budget() {
        let db = setup().await;
        let repo = LibSqlMessageRepository::new(db.connection());

        let fresh = message(1);
        let waiting = message(2);
        let ready = message(3);
        for item in [&fresh, &waiting, &ready] {
            repo.insert(item).await.unwrap();
        }

        for (item, next_retry_at) in [(&waiting, 5_000), (&ready, 500)] {
            repo.claim(&item.id, 100).await.unwrap();
            repo.schedule_retry(&item.id, 1, "timeout", next_retry_at, 100)
                .await
                .unwrap();
        }

        let due = repo.list_due(1_000, 6, 20).await.unwrap();
        let ids: Vec<_> = due.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![fresh.id, ready.id]);

        // A retry budget of one excludes anything that already failed once
        let due = repo.list_due(10_000, 1, 20).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, fresh.id);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_retire_over_budget_messages() {
        let db = setup().await;
        let repo = LibSqlMessageRepository::new(db.connection());

        let spent = message(1);
        let within = message(2);
        for item in [&spent, &within] {
            repo.insert(item).await.unwrap();
        }
        repo.claim(&spent.id, 5).await.unwrap();
        repo.schedule_retry(&spent.id, 6, "timeout", 60, 5).await.unwrap();
        repo.claim(&within.id, 5).await.unwrap();
        repo.schedule_retry(&within.id, 2, "timeout", 60, 5).await.unwrap();

        let over = repo.list_over_budget(3).await.unwrap();
        assert_eq!(over.len(), 1);
        assert_eq!(over[0].id, spent.id);

        let entry = MessageHistoryEntry::exhausted(&over[0], None, "timeout", 10);
        repo.retire(&spent.id, &entry, 10).await.unwrap();

        let stored = repo.get(&spent.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Exhausted);
        assert_eq!(stored.retry_count, 6);
        assert!(repo.list_over_budget(3).await.unwrap().is_empty());

        // Retiring twice is rejected and writes no second entry
        assert!(repo.retire(&spent.id, &entry, 11).await.is_err());
        assert_eq!(repo.history_for(&spent.id).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_release_stale_claims() {
        let db = setup().await;
        let repo = LibSqlMessageRepository::new(db.connection());

        let first_try = message(1);
        let retried = message(2);
        let recent = message(3);
        for item in [&first_try, &retried, &recent] {
            repo.insert(item).await.unwrap();
        }
        repo.claim(&retried.id, 5).await.unwrap();
        repo.schedule_retry(&retried.id, 2, "timeout", 6, 5).await.unwrap();

        repo.claim(&first_try.id, 10).await.unwrap();
        repo.claim(&retried.id, 10).await.unwrap();
        repo.claim(&recent.id, 900).await.unwrap();

        assert_eq!(repo.release_stale_claims(500, 1_000).await.unwrap(), 2);

        let first_try = repo.get(&first_try.id).await.unwrap().unwrap();
        assert_eq!(first_try.status, MessageStatus::Queued);
        let retried = repo.get(&retried.id).await.unwrap().unwrap();
        assert_eq!(
            retried.status,
            MessageStatus::RetryScheduled {
                next_retry_at: 1_000
            }
        );
        assert_eq!(retried.retry_count, 2);
        let recent = repo.get(&recent.id).await.unwrap().unwrap();
        assert_eq!(recent.status, MessageStatus::Sending);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_mark_sent_appends_history() {
        let db = setup().await;
        let repo = LibSqlMessageRepository::new(db.connection());

        let item = message(1);
        repo.insert(&item).await.unwrap();
        repo.claim(&item.id, 10).await.unwrap();

        let entry = MessageHistoryEntry::sent(&item, "acc-1", Some("<abc@relay>".to_string()), 20);
        repo.mark_sent(&item.id, &entry, 20).await.unwrap();

        let stored = repo.get(&item.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Sent { sent_at: 20 });

        let history = repo.history_for(&item.id).await.unwrap();
        assert_eq!(history, vec![entry]);
        assert_eq!(history[0].status, HistoryStatus::Sent);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_account_lookup_skips_inactive() {
        let db = setup().await;
        let repo = LibSqlMessageRepository::new(db.connection());

        let inactive_default = MailAccount {
            id: "a-old".to_string(),
            display_name: "Old".to_string(),
            email: "old@example.com".to_string(),
            is_default: true,
            is_active: false,
        };
        let active = MailAccount {
            id: "b-sales".to_string(),
            display_name: "Sales".to_string(),
            email: "sales@example.com".to_string(),
            is_default: true,
            is_active: true,
        };
        repo.save_account(&inactive_default).await.unwrap();
        repo.save_account(&active).await.unwrap();

        assert_eq!(repo.default_account().await.unwrap(), Some(active.clone()));
        assert_eq!(repo.find_active_account("a-old").await.unwrap(), None);
        assert_eq!(
            repo.find_active_account("b-sales").await.unwrap(),
            Some(active)
        );
    }
}
