//! Outbound-message worker.
//!
//! Drains `outbound_messages` in creation order while the probe reports
//! connectivity. Each picked message is claimed (`sending`), handed to the
//! [`MailTransport`], and then either delivered, scheduled for a retry on
//! the [`MAIL_TIERS`](crate::backoff::MAIL_TIERS) ladder, or exhausted. Only
//! terminal outcomes reach the history table.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::{next_attempt_at, MAIL_TIERS};
use crate::connectivity::ConnectivityProbe;
use crate::db::{LibSqlMessageRepository, MessageRepository};
use crate::models::{MailAccount, MessageHistoryEntry, MessageId, NewOutboundMessage, OutboundMessage};
use crate::services::StoreService;
use crate::util::{compact_text, duration_ms, now_ms};
use crate::Result;

/// Fixed error recorded when no sending account resolves
pub const NO_ACTIVE_ACCOUNT: &str = "no active mail account";
const RETRIES_EXCEEDED: &str = "max retries exceeded";

/// Fully resolved message handed to the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMail {
    /// Sender mailbox, e.g. `Sales <sales@example.com>`
    pub from: String,
    #[serde(default)]
    pub account_ref: Option<String>,
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    pub subject: String,
    #[serde(default)]
    pub text_body: Option<String>,
    #[serde(default)]
    pub html_body: Option<String>,
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default)]
    pub related_entity_ref: Option<String>,
}

impl OutgoingMail {
    pub fn from_message(message: &OutboundMessage, account: &MailAccount) -> Self {
        Self {
            from: account.mailbox(),
            account_ref: Some(account.id.clone()),
            to: message.to.clone(),
            cc: message.cc.clone(),
            bcc: message.bcc.clone(),
            subject: message.subject.clone(),
            text_body: message.text_body.clone(),
            html_body: message.html_body.clone(),
            attachments: message.attachments.clone(),
            related_entity_ref: message.related_entity_ref.clone(),
        }
    }
}

/// What the transport reports back for one send
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    #[serde(default)]
    pub accepted: Vec<String>,
    #[serde(default)]
    pub rejected: Vec<String>,
    #[serde(default, alias = "messageId")]
    pub provider_message_id: Option<String>,
    #[serde(default, alias = "response")]
    pub response_text: Option<String>,
}

impl SendReceipt {
    /// Delivered means at least one accepted and no rejected recipient
    pub fn is_success(&self) -> bool {
        !self.accepted.is_empty() && self.rejected.is_empty()
    }

    /// Error text recorded for an unsuccessful receipt
    pub fn failure_message(&self) -> String {
        let reason = if self.rejected.is_empty() {
            "no recipient accepted".to_string()
        } else {
            format!("rejected recipients: {}", self.rejected.join(", "))
        };
        match self.response_text.as_deref().map(compact_text) {
            Some(response) if !response.is_empty() => format!("{reason} ({response})"),
            _ => reason,
        }
    }
}

/// Delivery capability for outbound messages
#[async_trait::async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, mail: &OutgoingMail) -> std::result::Result<SendReceipt, String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailWorkerConfig {
    /// Messages picked per tick
    pub batch_size: usize,
    /// Failed attempts before a message is exhausted
    pub max_retries: u32,
    /// Age after which a message still in `sending` is released back to the queue
    pub claim_timeout: Duration,
}

impl Default for MailWorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            max_retries: 6,
            claim_timeout: Duration::from_secs(10 * 60),
        }
    }
}

/// Counts of one worker tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    /// Whether the probe reported connectivity; nothing is picked otherwise
    pub online: bool,
    pub picked: usize,
    pub sent: usize,
    pub retry_scheduled: usize,
    pub exhausted: usize,
    /// Rows another pass claimed first, or whose bookkeeping failed
    pub skipped: usize,
}

enum Attempt {
    Delivered {
        account: MailAccount,
        receipt: SendReceipt,
    },
    Failed {
        account_ref: Option<String>,
        error: String,
    },
}

/// Periodic drain of the outbound message queue
pub struct MailWorker {
    store: StoreService,
    transport: Arc<dyn MailTransport>,
    probe: Arc<dyn ConnectivityProbe>,
    config: MailWorkerConfig,
}

impl MailWorker {
    pub fn new(
        store: StoreService,
        transport: Arc<dyn MailTransport>,
        probe: Arc<dyn ConnectivityProbe>,
        config: MailWorkerConfig,
    ) -> Self {
        Self {
            store,
            transport,
            probe,
            config,
        }
    }

    pub const fn config(&self) -> &MailWorkerConfig {
        &self.config
    }

    /// Queue a message for delivery
    pub async fn enqueue(&self, input: NewOutboundMessage) -> Result<OutboundMessage> {
        let message = input.into_message(now_ms())?;
        let db = self.store.lock().await;
        LibSqlMessageRepository::new(db.connection())
            .insert(&message)
            .await?;
        tracing::info!(
            "Queued message {} to {} recipient(s)",
            message.id,
            message.to.len()
        );
        Ok(message)
    }

    pub async fn get(&self, id: &MessageId) -> Result<Option<OutboundMessage>> {
        let db = self.store.lock().await;
        LibSqlMessageRepository::new(db.connection()).get(id).await
    }

    /// Delivery history, newest first
    pub async fn history(&self, limit: usize) -> Result<Vec<MessageHistoryEntry>> {
        let db = self.store.lock().await;
        LibSqlMessageRepository::new(db.connection())
            .list_history(limit)
            .await
    }

    pub async fn save_account(&self, account: &MailAccount) -> Result<()> {
        let db = self.store.lock().await;
        LibSqlMessageRepository::new(db.connection())
            .save_account(account)
            .await
    }

    pub async fn tick(&self) -> Result<TickSummary> {
        self.tick_at(now_ms()).await
    }

    /// Run one pass with an injected clock.
    ///
    /// Only the initial selection can fail the tick; per-message storage
    /// errors are logged and the message counted as skipped.
    pub async fn tick_at(&self, now: i64) -> Result<TickSummary> {
        if !self.probe.is_reachable().await {
            tracing::debug!("Mail tick skipped: offline");
            return Ok(TickSummary::default());
        }

        let mut summary = TickSummary {
            online: true,
            ..TickSummary::default()
        };

        let due = {
            let db = self.store.lock().await;
            let repo = LibSqlMessageRepository::new(db.connection());
            let cutoff = now.saturating_sub(duration_ms(self.config.claim_timeout));
            let released = repo.release_stale_claims(cutoff, now).await?;
            if released > 0 {
                tracing::warn!("Released {released} message(s) stuck in sending");
            }
            // Rows already past the budget, e.g. after max_retries was lowered
            for message in repo.list_over_budget(self.config.max_retries).await? {
                let error = message.last_error.as_deref().unwrap_or(RETRIES_EXCEEDED);
                let entry = MessageHistoryEntry::exhausted(
                    &message,
                    message.sender_account_ref.as_deref(),
                    error,
                    now,
                );
                match repo.retire(&message.id, &entry, now).await {
                    Ok(()) => {
                        tracing::warn!(
                            "Message {} retired after {} attempts: {error}",
                            message.id,
                            message.retry_count
                        );
                        summary.exhausted += 1;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to retire message {}: {e}", message.id);
                        summary.skipped += 1;
                    }
                }
            }
            repo.list_due(now, self.config.max_retries, self.config.batch_size)
                .await?
        };

        for message in due {
            match self.claim(&message, now).await {
                Ok(true) => summary.picked += 1,
                Ok(false) => {
                    tracing::debug!("Message {} was claimed elsewhere, skipping", message.id);
                    summary.skipped += 1;
                    continue;
                }
                Err(error) => {
                    tracing::warn!("Failed to claim message {}: {error}", message.id);
                    summary.skipped += 1;
                    continue;
                }
            }

            let attempt = self.attempt(&message).await;
            if let Err(error) = self.settle(&message, attempt, now, &mut summary).await {
                tracing::warn!("Failed to record outcome of message {}: {error}", message.id);
                summary.skipped += 1;
            }
        }

        if summary.picked > 0 || summary.exhausted > 0 {
            tracing::info!(
                "Mail tick: {} sent, {} retry scheduled, {} exhausted",
                summary.sent,
                summary.retry_scheduled,
                summary.exhausted
            );
        }
        Ok(summary)
    }

    async fn claim(&self, message: &OutboundMessage, now: i64) -> Result<bool> {
        let db = self.store.lock().await;
        LibSqlMessageRepository::new(db.connection())
            .claim(&message.id, now)
            .await
    }

    async fn resolve_account(&self, message: &OutboundMessage) -> Result<Option<MailAccount>> {
        let db = self.store.lock().await;
        let repo = LibSqlMessageRepository::new(db.connection());
        if let Some(account_ref) = message.sender_account_ref.as_deref() {
            if let Some(account) = repo.find_active_account(account_ref).await? {
                return Ok(Some(account));
            }
            tracing::debug!(
                "Account {account_ref} of message {} is not active, using default",
                message.id
            );
        }
        repo.default_account().await
    }

    /// Resolve the sender and call the transport; the store is not locked meanwhile
    async fn attempt(&self, message: &OutboundMessage) -> Attempt {
        let account = match self.resolve_account(message).await {
            Ok(Some(account)) => account,
            Ok(None) => {
                return Attempt::Failed {
                    account_ref: message.sender_account_ref.clone(),
                    error: NO_ACTIVE_ACCOUNT.to_string(),
                }
            }
            Err(error) => {
                return Attempt::Failed {
                    account_ref: message.sender_account_ref.clone(),
                    error: compact_text(&error.to_string()),
                }
            }
        };

        let mail = OutgoingMail::from_message(message, &account);
        match self.transport.send(&mail).await {
            Ok(receipt) if receipt.is_success() => Attempt::Delivered { account, receipt },
            Ok(receipt) => Attempt::Failed {
                account_ref: Some(account.id),
                error: receipt.failure_message(),
            },
            Err(error) => Attempt::Failed {
                account_ref: Some(account.id),
                error: compact_text(&error),
            },
        }
    }

    async fn settle(
        &self,
        message: &OutboundMessage,
        attempt: Attempt,
        now: i64,
        summary: &mut TickSummary,
    ) -> Result<()> {
        let db = self.store.lock().await;
        let repo = LibSqlMessageRepository::new(db.connection());

        match attempt {
            Attempt::Delivered { account, receipt } => {
                let entry =
                    MessageHistoryEntry::sent(message, &account.id, receipt.provider_message_id, now);
                repo.mark_sent(&message.id, &entry, now).await?;
                tracing::info!("Message {} sent via {}", message.id, account.id);
                summary.sent += 1;
            }
            Attempt::Failed { account_ref, error } => {
                let retry_count = message.retry_count.saturating_add(1);
                if retry_count >= self.config.max_retries {
                    let entry = MessageHistoryEntry::exhausted(
                        message,
                        account_ref.as_deref(),
                        &error,
                        now,
                    );
                    repo.mark_exhausted(&message.id, retry_count, &entry, now)
                        .await?;
                    tracing::warn!(
                        "Message {} gave up after {retry_count} attempts: {error}",
                        message.id
                    );
                    summary.exhausted += 1;
                } else {
                    let next_retry_at = next_attempt_at(&MAIL_TIERS, retry_count, now);
                    repo.schedule_retry(&message.id, retry_count, &error, next_retry_at, now)
                        .await?;
                    tracing::warn!(
                        "Message {} failed (attempt {retry_count}), retrying at {next_retry_at}: {error}",
                        message.id
                    );
                    summary.retry_scheduled += 1;
                }
            }
        }
        Ok(())
    }
}
