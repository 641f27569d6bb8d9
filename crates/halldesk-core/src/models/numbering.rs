//! Offer numbering models: sequence keys, temporary identifiers and
//! reconciliation results

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Marker that starts every temporary identifier.
///
/// Canonical prefixes and initials are alphanumeric, so they can never
/// contain `#`.
pub const TEMPORARY_MARKER: &str = "TMP#";

/// Counter key: one independent sequence per prefix, owner initial and year
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SequenceKey {
    prefix: String,
    initial: String,
    year: i32,
}

impl SequenceKey {
    pub fn new(prefix: &str, year: i32, initial: &str) -> Result<Self> {
        let prefix = prefix.trim();
        let initial = initial.trim();
        if prefix.is_empty() || !prefix.chars().all(char::is_alphanumeric) {
            return Err(Error::InvalidInput(format!(
                "number prefix must be non-empty and alphanumeric, got '{prefix}'"
            )));
        }
        if initial.is_empty() || !initial.chars().all(char::is_alphanumeric) {
            return Err(Error::InvalidInput(format!(
                "owner initial must be non-empty and alphanumeric, got '{initial}'"
            )));
        }
        if !(1..=9999).contains(&year) {
            return Err(Error::InvalidInput(format!(
                "year must be between 1 and 9999, got {year}"
            )));
        }
        Ok(Self {
            prefix: prefix.to_string(),
            initial: initial.to_string(),
            year,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn initial(&self) -> &str {
        &self.initial
    }

    pub const fn year(&self) -> i32 {
        self.year
    }

    /// Display form of the key, `prefix + initial + year`
    pub fn counter_key(&self) -> String {
        format!("{}{}{}", self.prefix, self.initial, self.year)
    }

    /// Canonical identifier for `sequence`, e.g. `PLX-E0001/2026`.
    ///
    /// Sequences past 9999 print wider; the value is never truncated.
    pub fn format(&self, sequence: i64) -> String {
        format!(
            "{}-{}{:04}/{}",
            self.prefix, self.initial, sequence, self.year
        )
    }
}

/// Validated device identifier embedded in temporary numbers
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    const MAX_LENGTH: usize = 64;

    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into().trim().to_string();
        if id.is_empty() {
            return Err(Error::InvalidInput("device id cannot be empty".into()));
        }
        if id.len() > Self::MAX_LENGTH {
            return Err(Error::InvalidInput(format!(
                "device id exceeds {} characters",
                Self::MAX_LENGTH
            )));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::InvalidInput(
                "device id contains invalid characters (allowed: a-z, A-Z, 0-9, -, _)".into(),
            ));
        }
        Ok(Self(id))
    }

    /// Fresh random device id
    pub fn generate() -> Self {
        Self(format!("dev-{}", Uuid::now_v7().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Build a temporary identifier: `TMP#{device}#{unix_ms}#{nonce}`
pub fn temporary_identifier(device: &DeviceId, now_ms: i64) -> String {
    let random = Uuid::now_v7().simple().to_string();
    let nonce = &random[random.len() - 8..];
    format!("{TEMPORARY_MARKER}{device}#{now_ms}#{nonce}")
}

pub fn is_temporary(identifier: &str) -> bool {
    identifier.starts_with(TEMPORARY_MARKER)
}

/// An offer still carrying a temporary number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOfferNumber {
    pub offer_id: String,
    pub offer_number: String,
    pub salesperson_initial: Option<String>,
    /// Offer creation timestamp (Unix ms), decides the numbering year
    pub created_at: i64,
}

/// A successful temporary-to-canonical rewrite
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Renumbered {
    pub offer_id: String,
    pub old_number: String,
    pub new_number: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileFailure {
    pub offer_id: String,
    pub error: String,
}

/// Result of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub succeeded: Vec<Renumbered>,
    pub failed: Vec<ReconcileFailure>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.succeeded.is_empty() && self.failed.is_empty()
    }
}
