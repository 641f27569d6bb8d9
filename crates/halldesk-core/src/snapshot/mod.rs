//! Version-gated reference-data synchronization.
//!
//! A pass first asks the remote side for lightweight metadata. Only when the
//! remote version is newer than the cached one is the full snapshot fetched,
//! validated and swapped in atomically. Outcomes are classified so callers
//! can tell "nothing to do" from "no network" and from "broken payload".

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::db::LibSqlSnapshotRepository;
use crate::models::{CachedSnapshot, RemoteSnapshot, SnapshotMetadata};
use crate::services::StoreService;
use crate::util::{compact_text, now_ms};
use crate::Result;

/// Remote side of the reference data
#[async_trait::async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch_metadata(&self) -> std::result::Result<SnapshotMetadata, String>;
    async fn fetch_snapshot(&self) -> std::result::Result<RemoteSnapshot, String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// A newer snapshot was stored
    Synced,
    /// The cache is already current
    Unchanged,
    /// Metadata was reachable but the full snapshot was not usable
    Error,
    /// Metadata could not be fetched
    Offline,
}

/// Outcome of one `sync_if_newer` call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub status: SyncStatus,
    /// Version cached after the call
    pub version: i64,
    pub last_updated: Option<String>,
    pub error: Option<String>,
}

impl SyncReport {
    fn new(status: SyncStatus, version: i64) -> Self {
        Self {
            status,
            version,
            last_updated: None,
            error: None,
        }
    }

    fn failed(version: i64, error: &str) -> Self {
        Self {
            error: Some(compact_text(error)),
            ..Self::new(SyncStatus::Error, version)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncTimeouts {
    pub metadata: Duration,
    pub snapshot: Duration,
}

impl Default for SyncTimeouts {
    fn default() -> Self {
        Self {
            metadata: Duration::from_secs(5),
            snapshot: Duration::from_secs(30),
        }
    }
}

pub struct SnapshotSynchronizer {
    store: StoreService,
    source: Arc<dyn SnapshotSource>,
    timeouts: SyncTimeouts,
}

impl SnapshotSynchronizer {
    pub fn new(store: StoreService, source: Arc<dyn SnapshotSource>, timeouts: SyncTimeouts) -> Self {
        Self {
            store,
            source,
            timeouts,
        }
    }

    /// Cached snapshot for the pricing side, if any
    pub async fn cached(&self) -> Result<Option<CachedSnapshot>> {
        let db = self.store.lock().await;
        LibSqlSnapshotRepository::new(db.connection()).load().await
    }

    pub async fn local_version(&self) -> Result<i64> {
        let db = self.store.lock().await;
        LibSqlSnapshotRepository::new(db.connection())
            .local_version()
            .await
    }

    /// Fetch and store the remote snapshot when it is newer than the cache.
    ///
    /// Only local store failures are returned as `Err`.
    pub async fn sync_if_newer(&self) -> Result<SyncReport> {
        let local = self.local_version().await?;

        let metadata =
            match tokio::time::timeout(self.timeouts.metadata, self.source.fetch_metadata()).await {
                Ok(Ok(metadata)) => metadata,
                Ok(Err(error)) => {
                    tracing::debug!("Snapshot metadata unavailable: {error}");
                    return Ok(SyncReport::new(SyncStatus::Offline, local));
                }
                Err(_) => {
                    tracing::debug!(
                        "Snapshot metadata timed out after {:?}",
                        self.timeouts.metadata
                    );
                    return Ok(SyncReport::new(SyncStatus::Offline, local));
                }
            };

        if metadata.version <= local {
            return Ok(SyncReport {
                last_updated: Some(metadata.last_updated),
                ..SyncReport::new(SyncStatus::Unchanged, local)
            });
        }

        let snapshot =
            match tokio::time::timeout(self.timeouts.snapshot, self.source.fetch_snapshot()).await {
                Ok(Ok(snapshot)) => snapshot,
                Ok(Err(error)) => {
                    tracing::warn!("Snapshot fetch failed: {error}");
                    return Ok(SyncReport::failed(local, &format!("snapshot fetch failed: {error}")));
                }
                Err(_) => {
                    tracing::warn!("Snapshot fetch timed out after {:?}", self.timeouts.snapshot);
                    return Ok(SyncReport::failed(local, "snapshot fetch timed out"));
                }
            };

        if let Err(error) = snapshot.validate() {
            tracing::warn!("Rejected snapshot version {}: {error}", snapshot.version);
            return Ok(SyncReport::failed(local, &error));
        }
        if snapshot.version <= local {
            return Ok(SyncReport::failed(
                local,
                &format!(
                    "snapshot version {} is not newer than cached version {local}",
                    snapshot.version
                ),
            ));
        }

        let cached = CachedSnapshot {
            version: snapshot.version,
            last_updated: snapshot.last_updated,
            dataset: snapshot.dataset,
            fetched_at: now_ms(),
        };
        let current = {
            let db = self.store.lock().await;
            let repo = LibSqlSnapshotRepository::new(db.connection());
            if repo.replace(&cached).await? {
                None
            } else {
                Some(repo.local_version().await?)
            }
        };
        // Another sync stored an equal or newer version while this one fetched
        if let Some(current) = current {
            tracing::debug!(
                "Snapshot version {} superseded by cached version {current}",
                cached.version
            );
            return Ok(SyncReport::new(SyncStatus::Unchanged, current));
        }
        tracing::info!("Reference snapshot updated from version {local} to {}", cached.version);

        Ok(SyncReport {
            last_updated: Some(cached.last_updated),
            ..SyncReport::new(SyncStatus::Synced, cached.version)
        })
    }
}

/// Reference data served by the remote API under `/v1/reference`
pub struct HttpSnapshotSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSnapshotSource {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> std::result::Result<T, String> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|error| format!("request to {url} failed: {error}"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(format!("HTTP {}: {}", status.as_u16(), compact_text(&body)));
        }

        response
            .json::<T>()
            .await
            .map_err(|error| format!("invalid response from {url}: {error}"))
    }
}

#[async_trait::async_trait]
impl SnapshotSource for HttpSnapshotSource {
    async fn fetch_metadata(&self) -> std::result::Result<SnapshotMetadata, String> {
        self.get_json("/v1/reference/meta").await
    }

    async fn fetch_snapshot(&self) -> std::result::Result<RemoteSnapshot, String> {
        self.get_json("/v1/reference/snapshot").await
    }
}
