//! Reference-data snapshot models

use serde::{Deserialize, Serialize};

/// Lightweight remote description of the newest snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub version: i64,
    #[serde(default, alias = "lastUpdated")]
    pub last_updated: String,
}

/// Full snapshot as returned by the remote source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteSnapshot {
    /// Explicit success marker set by the remote side
    #[serde(default, alias = "success")]
    pub ok: bool,
    pub version: i64,
    #[serde(default, alias = "lastUpdated")]
    pub last_updated: String,
    /// Primary dataset, opaque to this crate
    #[serde(default, alias = "data")]
    pub dataset: serde_json::Value,
}

impl RemoteSnapshot {
    /// Basic shape check before the snapshot may replace the cache
    pub fn validate(&self) -> Result<(), String> {
        if !self.ok {
            return Err("snapshot response is missing its success marker".to_string());
        }
        let empty = match &self.dataset {
            serde_json::Value::Null => true,
            serde_json::Value::Array(items) => items.is_empty(),
            serde_json::Value::Object(fields) => fields.is_empty(),
            _ => false,
        };
        if empty {
            return Err("snapshot dataset is empty".to_string());
        }
        Ok(())
    }
}

/// Locally cached snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedSnapshot {
    pub version: i64,
    pub last_updated: String,
    pub dataset: serde_json::Value,
    /// When the snapshot was stored (Unix ms)
    pub fetched_at: i64,
}
