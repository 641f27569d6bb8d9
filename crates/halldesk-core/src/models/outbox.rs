//! Outbox record model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Retry budget given to new outbox records.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// A unique identifier for an outbox record, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutboxRecordId(Uuid);

impl OutboxRecordId {
    /// Create a new unique record ID using UUID v7
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

impl Default for OutboxRecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OutboxRecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OutboxRecordId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Kinds of deferred remote operations the outbox knows how to dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    /// Remote notification call
    Notify,
    /// First remote logging call
    LogEventA,
    /// Second remote logging call
    LogEventB,
    /// Send a message through the outbound transport
    SendMessage,
    /// Reconcile temporary offer numbers
    TriggerReconcile,
}

impl OperationType {
    pub const ALL: [Self; 5] = [
        Self::Notify,
        Self::LogEventA,
        Self::LogEventB,
        Self::SendMessage,
        Self::TriggerReconcile,
    ];

    /// Stored text form
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Notify => "NOTIFY",
            Self::LogEventA => "LOG_EVENT_A",
            Self::LogEventB => "LOG_EVENT_B",
            Self::SendMessage => "SEND_MESSAGE",
            Self::TriggerReconcile => "TRIGGER_RECONCILE",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim();
        Self::ALL
            .into_iter()
            .find(|operation| operation.as_str().eq_ignore_ascii_case(needle))
            .ok_or_else(|| format!("unknown operation type: {needle}"))
    }
}

/// A deferred remote operation waiting in the outbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxRecord {
    /// Unique identifier
    pub id: OutboxRecordId,
    /// Operation type as stored; may not parse if written by a newer producer
    pub operation_type: String,
    /// Serialized payload, interpreted only by the handler
    pub payload: String,
    /// Failed attempts so far
    pub retry_count: u32,
    /// Retry budget
    pub max_retries: u32,
    /// Most recent failure message
    pub last_error: Option<String>,
    /// Earliest time of the next attempt after a failure (Unix ms)
    pub next_attempt_at: Option<i64>,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Success timestamp (Unix ms), terminal
    pub processed_at: Option<i64>,
    /// Permanent failure timestamp (Unix ms), terminal
    pub failed_at: Option<i64>,
}

impl OutboxRecord {
    /// Create a new pending record for the given operation
    pub fn new(operation: OperationType, payload: &serde_json::Value) -> crate::Result<Self> {
        Ok(Self {
            id: OutboxRecordId::new(),
            operation_type: operation.as_str().to_string(),
            payload: serde_json::to_string(payload)?,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            last_error: None,
            next_attempt_at: None,
            created_at: chrono::Utc::now().timestamp_millis(),
            processed_at: None,
            failed_at: None,
        })
    }

    /// Parsed operation type, `None` when the stored value is unknown
    pub fn operation(&self) -> Option<OperationType> {
        self.operation_type.parse().ok()
    }

    pub const fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// Whether no further automatic attempt will ever happen
    pub const fn is_terminal(&self) -> bool {
        self.processed_at.is_some() || self.failed_at.is_some() || self.retries_exhausted()
    }

    /// Whether a previous failure's backoff has not yet elapsed
    pub fn is_backing_off(&self, now: i64) -> bool {
        self.next_attempt_at.is_some_and(|at| at > now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_type_parses_stored_names() {
        for operation in OperationType::ALL {
            assert_eq!(operation.as_str().parse::<OperationType>(), Ok(operation));
        }
        assert_eq!(
            "log_event_b".parse::<OperationType>(),
            Ok(OperationType::LogEventB)
        );
        assert!("ARCHIVE_OFFER".parse::<OperationType>().is_err());
    }

    #[test]
    fn new_record_is_pending() {
        let record =
            OutboxRecord::new(OperationType::Notify, &serde_json::json!({"offer": "o-1"})).unwrap();
        assert_eq!(record.operation(), Some(OperationType::Notify));
        assert_eq!(record.max_retries, DEFAULT_MAX_RETRIES);
        assert!(!record.is_terminal());
        assert!(!record.is_backing_off(record.created_at));
    }

    #[test]
    fn exhausted_record_is_terminal_without_processed_at() {
        let mut record =
            OutboxRecord::new(OperationType::LogEventA, &serde_json::Value::Null).unwrap();
        record.retry_count = record.max_retries;
        assert!(record.processed_at.is_none());
        assert!(record.is_terminal());
    }
}
