//! Outbound message, delivery history and mail account models

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};

/// A unique identifier for a queued outbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Create a new unique message ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Delivery state of an outbound message.
///
/// Both `RetryScheduled` and `Exhausted` are stored as `failed`; the
/// persisted `next_retry_at` tells them apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MessageStatus {
    /// Waiting for its first pickup
    Queued,
    /// Claimed by a worker tick
    Sending,
    /// Delivered (terminal)
    Sent { sent_at: i64 },
    /// Failed, eligible for pickup again once `next_retry_at` elapses
    RetryScheduled { next_retry_at: i64 },
    /// Failed with the retry budget spent (terminal)
    Exhausted,
}

impl MessageStatus {
    /// Stored status text
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Sending => "sending",
            Self::Sent { .. } => "sent",
            Self::RetryScheduled { .. } | Self::Exhausted => "failed",
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent { .. } | Self::Exhausted)
    }

    pub const fn next_retry_at(&self) -> Option<i64> {
        match self {
            Self::RetryScheduled { next_retry_at } => Some(*next_retry_at),
            _ => None,
        }
    }

    pub const fn sent_at(&self) -> Option<i64> {
        match self {
            Self::Sent { sent_at } => Some(*sent_at),
            _ => None,
        }
    }

    /// Rebuild the status from its stored columns
    pub fn from_columns(status: &str, next_retry_at: Option<i64>, sent_at: Option<i64>) -> Result<Self> {
        match (status, next_retry_at, sent_at) {
            ("queued", _, _) => Ok(Self::Queued),
            ("sending", _, _) => Ok(Self::Sending),
            ("sent", _, Some(sent_at)) => Ok(Self::Sent { sent_at }),
            ("failed", Some(next_retry_at), _) => Ok(Self::RetryScheduled { next_retry_at }),
            ("failed", None, _) => Ok(Self::Exhausted),
            _ => Err(Error::Database(format!(
                "invalid stored message status '{status}'"
            ))),
        }
    }
}

/// A message queued for delivery through the outbound transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub id: MessageId,
    /// Explicit sending account; falls back to the default account when unset
    pub sender_account_ref: Option<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub text_body: Option<String>,
    pub html_body: Option<String>,
    /// File references handed to the transport
    pub attachments: Vec<String>,
    /// Owning entity, e.g. an offer id
    pub related_entity_ref: Option<String>,
    pub status: MessageStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Last state change (Unix ms)
    pub updated_at: i64,
}

/// Producer-side input for queueing a message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOutboundMessage {
    #[serde(default)]
    pub sender_account_ref: Option<String>,
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

impl NewOutboundMessage {
    /// Turn the input into a queued message created at `now`
    pub fn into_message(self, now: i64) -> Result<OutboundMessage> {
        let to = clean_addresses(self.to);
        if to.is_empty() {
            return Err(Error::InvalidInput(
                "message needs at least one recipient".into(),
            ));
        }
        let text_body = crate::util::normalize_text_option(self.text_body);
        let html_body = crate::util::normalize_text_option(self.html_body);
        if text_body.is_none() && html_body.is_none() {
            return Err(Error::InvalidInput(
                "message needs a text or html body".into(),
            ));
        }

        Ok(OutboundMessage {
            id: MessageId::new(),
            sender_account_ref: crate::util::normalize_text_option(self.sender_account_ref),
            to,
            cc: clean_addresses(self.cc),
            bcc: clean_addresses(self.bcc),
            subject: self.subject.trim().to_string(),
            text_body,
            html_body,
            attachments: self.attachments,
            related_entity_ref: crate::util::normalize_text_option(self.related_entity_ref),
            status: MessageStatus::Queued,
            retry_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        })
    }
}

fn clean_addresses(addresses: Vec<String>) -> Vec<String> {
    addresses
        .into_iter()
        .filter_map(|address| crate::util::normalize_text_option(Some(address)))
        .collect()
}

/// Outcome recorded in the delivery history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryStatus {
    Sent,
    Failed,
}

impl HistoryStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for HistoryStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            other => Err(Error::Database(format!("invalid history status '{other}'"))),
        }
    }
}

/// Append-only record of a terminal delivery outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHistoryEntry {
    pub id: String,
    pub outbox_item_ref: MessageId,
    pub account_ref: Option<String>,
    pub to: Vec<String>,
    pub subject: String,
    pub status: HistoryStatus,
    pub provider_message_id: Option<String>,
    pub error: Option<String>,
    pub sent_at: Option<i64>,
    pub created_at: i64,
}

impl MessageHistoryEntry {
    /// History entry for a delivered message
    pub fn sent(
        message: &OutboundMessage,
        account_ref: &str,
        provider_message_id: Option<String>,
        now: i64,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            outbox_item_ref: message.id,
            account_ref: Some(account_ref.to_string()),
            to: message.to.clone(),
            subject: message.subject.clone(),
            status: HistoryStatus::Sent,
            provider_message_id,
            error: None,
            sent_at: Some(now),
            created_at: now,
        }
    }

    /// History entry for a message whose retries are exhausted
    pub fn exhausted(
        message: &OutboundMessage,
        account_ref: Option<&str>,
        error: &str,
        now: i64,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            outbox_item_ref: message.id,
            account_ref: account_ref.map(ToString::to_string),
            to: message.to.clone(),
            subject: message.subject.clone(),
            status: HistoryStatus::Failed,
            provider_message_id: None,
            error: Some(error.to_string()),
            sent_at: None,
            created_at: now,
        }
    }
}

/// A configured sending account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailAccount {
    pub id: String,
    pub display_name: String,
    pub email: String,
    pub is_default: bool,
    pub is_active: bool,
}

impl MailAccount {
    /// RFC 5322 style mailbox, e.g. `Sales <sales@example.com>`
    pub fn mailbox(&self) -> String {
        let name = self.display_name.trim();
        if name.is_empty() {
            self.email.clone()
        } else {
            format!("{name} <{}>", self.email)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn input() -> NewOutboundMessage {
        NewOutboundMessage {
            to: vec![" buyer@example.com ".to_string(), "  ".to_string()],
            subject: " Offer PLX-E0001/2026 ".to_string(),
            text_body: Some("Please find the offer attached.".to_string()),
            attachments: vec!["offers/PLX-E0001-2026.pdf".to_string()],
            ..NewOutboundMessage::default()
        }
    }

    #[test]
    fn into_message_cleans_recipients_and_queues() {
        let message = input().into_message(1_000).unwrap();
        assert_eq!(message.to, vec!["buyer@example.com".to_string()]);
        assert_eq!(message.subject, "Offer PLX-E0001/2026");
        assert_eq!(message.status, MessageStatus::Queued);
        assert_eq!(message.created_at, 1_000);
    }

    #[test]
    fn into_message_requires_recipient_and_body() {
        let no_recipient = NewOutboundMessage {
            to: vec![],
            ..input()
        };
        assert!(no_recipient.into_message(0).is_err());

        let no_body = NewOutboundMessage {
            text_body: Some("   ".to_string()),
            html_body: None,
            ..input()
        };
        assert!(no_body.into_message(0).is_err());
    }

    #[test]
    fn failed_status_maps_by_next_retry_at() {
        assert_eq!(
            MessageStatus::from_columns("failed", Some(42), None).unwrap(),
            MessageStatus::RetryScheduled { next_retry_at: 42 }
        );
        assert_eq!(
            MessageStatus::from_columns("failed", None, None).unwrap(),
            MessageStatus::Exhausted
        );
        assert_eq!(MessageStatus::Exhausted.as_str(), "failed");
        assert!(MessageStatus::from_columns("sent", None, None).is_err());
        assert!(MessageStatus::from_columns("bounced", None, None).is_err());
    }

    #[test]
    fn mailbox_includes_display_name() {
        let account = MailAccount {
            id: "acc-1".to_string(),
            display_name: "Sales Desk".to_string(),
            email: "sales@example.com".to_string(),
            is_default: true,
            is_active: true,
        };
        assert_eq!(account.mailbox(), "Sales Desk <sales@example.com>");
    }
}
