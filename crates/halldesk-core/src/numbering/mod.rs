//! Offer number allocation and reconciliation of temporary numbers.

use std::sync::Arc;

use chrono::{DateTime, Datelike};

use crate::db::LibSqlSequenceRepository;
use crate::models::{
    temporary_identifier, DeviceId, PendingOfferNumber, ReconcileFailure, ReconcileReport,
    Renumbered, SequenceKey,
};
use crate::services::StoreService;
use crate::util::{compact_text, now_ms};
use crate::{Error, Result};

/// Prefix of canonical offer numbers unless configured otherwise
pub const DEFAULT_OFFER_PREFIX: &str = "PLX";

/// Remote source of truth for canonical sequences.
///
/// When configured, reconciliation takes its sequence from `reserve`, so two
/// devices reconciling the same key can never both claim one number.
#[async_trait::async_trait]
pub trait NumberingAuthority: Send + Sync {
    /// Reserve and return the next sequence for `key`
    async fn reserve(&self, key: &SequenceKey) -> std::result::Result<i64, String>;
}

/// Local sequence allocator backed by the `sequence_counters` table
pub struct SequenceAllocator {
    store: StoreService,
    device: DeviceId,
    offer_prefix: String,
    authority: Option<Arc<dyn NumberingAuthority>>,
}

impl SequenceAllocator {
    pub fn new(store: StoreService, device: DeviceId) -> Self {
        Self {
            store,
            device,
            offer_prefix: DEFAULT_OFFER_PREFIX.to_string(),
            authority: None,
        }
    }

    #[must_use]
    pub fn with_offer_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.offer_prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn with_authority(mut self, authority: Arc<dyn NumberingAuthority>) -> Self {
        self.authority = Some(authority);
        self
    }

    pub const fn device(&self) -> &DeviceId {
        &self.device
    }

    /// Allocate the next canonical number, e.g. `PLX-E0001/2026`
    pub async fn allocate(&self, prefix: &str, year: i32, initial: &str) -> Result<String> {
        let key = SequenceKey::new(prefix, year, initial)?;
        let db = self.store.lock().await;
        let sequence = LibSqlSequenceRepository::new(db.connection())
            .next_sequence(&key, now_ms())
            .await?;
        Ok(key.format(sequence))
    }

    /// The number `allocate` would hand out next, without consuming it
    pub async fn peek(&self, prefix: &str, year: i32, initial: &str) -> Result<String> {
        let key = SequenceKey::new(prefix, year, initial)?;
        let db = self.store.lock().await;
        let next = LibSqlSequenceRepository::new(db.connection())
            .peek(&key)
            .await?
            .unwrap_or(1);
        Ok(key.format(next))
    }

    /// Offers renumbered so far, oldest first
    pub async fn renumbering_log(&self) -> Result<Vec<Renumbered>> {
        let db = self.store.lock().await;
        LibSqlSequenceRepository::new(db.connection())
            .renumbering_log()
            .await
    }

    /// Device-local placeholder that can never collide with a canonical number
    pub fn allocate_temporary(&self, device: &DeviceId) -> String {
        temporary_identifier(device, now_ms())
    }

    /// Canonical number when the counter store works, else a temporary one
    pub async fn allocate_or_temporary(&self, prefix: &str, year: i32, initial: &str) -> String {
        match self.allocate(prefix, year, initial).await {
            Ok(number) => number,
            Err(error) => {
                let temporary = self.allocate_temporary(&self.device);
                tracing::warn!("Sequence allocation failed ({error}), using {temporary}");
                temporary
            }
        }
    }

    /// Offers still carrying a temporary number
    pub async fn pending(&self) -> Result<Vec<PendingOfferNumber>> {
        let db = self.store.lock().await;
        LibSqlSequenceRepository::new(db.connection())
            .pending_offers()
            .await
    }

    /// Replace every temporary offer number with a canonical one.
    ///
    /// Works on the set of offers pending when the scan starts. Per-offer
    /// failures are collected in the report; only the initial scan can fail.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let pending = self.pending().await?;
        let mut report = ReconcileReport::default();

        for offer in pending {
            match self.renumber(&offer).await {
                Ok(new_number) => {
                    tracing::info!(
                        "Renumbered offer {} from {} to {new_number}",
                        offer.offer_id,
                        offer.offer_number
                    );
                    report.succeeded.push(Renumbered {
                        offer_id: offer.offer_id,
                        old_number: offer.offer_number,
                        new_number,
                    });
                }
                Err(error) => {
                    tracing::warn!("Could not renumber offer {}: {error}", offer.offer_id);
                    report.failed.push(ReconcileFailure {
                        offer_id: offer.offer_id,
                        error: compact_text(&error.to_string()),
                    });
                }
            }
        }

        Ok(report)
    }

    fn key_for(&self, offer: &PendingOfferNumber) -> Result<SequenceKey> {
        let initial = offer.salesperson_initial.as_deref().ok_or_else(|| {
            Error::InvalidInput(format!("offer {} has no salesperson initial", offer.offer_id))
        })?;
        let year = DateTime::from_timestamp_millis(offer.created_at)
            .map(|created| created.year())
            .ok_or_else(|| {
                Error::InvalidInput(format!(
                    "offer {} has an invalid creation time {}",
                    offer.offer_id, offer.created_at
                ))
            })?;
        SequenceKey::new(&self.offer_prefix, year, initial)
    }

    async fn renumber(&self, offer: &PendingOfferNumber) -> Result<String> {
        let key = self.key_for(offer)?;
        let now = now_ms();

        // Ask the authority before taking the store lock
        let reserved = match &self.authority {
            Some(authority) => Some(
                authority
                    .reserve(&key)
                    .await
                    .map_err(|error| Error::Database(format!("numbering authority: {error}")))?,
            ),
            None => None,
        };

        let db = self.store.lock().await;
        let repo = LibSqlSequenceRepository::new(db.connection());
        let sequence = match reserved {
            Some(sequence) => {
                repo.fast_forward(&key, sequence.saturating_add(1), now)
                    .await?;
                sequence
            }
            None => repo.next_sequence(&key, now).await?,
        };

        let new_number = key.format(sequence);
        repo.apply_renumbering(&offer.offer_id, &offer.offer_number, &new_number, now)
            .await?;
        Ok(new_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::is_temporary;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicI64, Ordering};

    // 2026-03-01T00:00:00Z
    const MARCH_2026: i64 = 1_772_323_200_000;

    async fn allocator() -> SequenceAllocator {
        let store = StoreService::open_in_memory().await.unwrap();
        SequenceAllocator::new(store, DeviceId::new("laptop-1").unwrap())
    }

    async fn insert_offer(
        allocator: &SequenceAllocator,
        id: &str,
        number: &str,
        initial: Option<&str>,
        created_at: i64,
    ) {
        let initial = initial.map_or(libsql::Value::Null, |value| value.into());
        let db = allocator.store.lock().await;
        db.connection()
            .execute(
                "INSERT INTO offers (id, offer_number, salesperson_initial, created_at)
                 VALUES (?, ?, ?, ?)",
                libsql::params![id, number, initial, created_at],
            )
            .await
            .unwrap();
    }

    async fn offer_number(allocator: &SequenceAllocator, id: &str) -> String {
        let db = allocator.store.lock().await;
        let mut rows = db
            .connection()
            .query("SELECT offer_number FROM offers WHERE id = ?", [id])
            .await
            .unwrap();
        rows.next().await.unwrap().unwrap().get(0).unwrap()
    }

    struct FixedAuthority {
        next: AtomicI64,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl NumberingAuthority for FixedAuthority {
        async fn reserve(&self, _key: &SequenceKey) -> std::result::Result<i64, String> {
            if self.fail {
                return Err("authority unreachable".to_string());
            }
            Ok(self.next.fetch_add(1, Ordering::SeqCst))
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn allocate_three_in_a_row() {
        let allocator = allocator().await;
        let mut numbers = Vec::new();
        for _ in 0..3 {
            numbers.push(allocator.allocate("PLX", 2026, "E").await.unwrap());
        }
        assert_eq!(
            numbers,
            vec!["PLX-E0001/2026", "PLX-E0002/2026", "PLX-E0003/2026"]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn allocate_counts_non_ascii_initials_separately() {
        let allocator = allocator().await;
        assert_eq!(allocator.allocate("PLX", 2026, "Ł").await.unwrap(), "PLX-Ł0001/2026");
        assert_eq!(allocator.allocate("PLX", 2026, "L").await.unwrap(), "PLX-L0001/2026");
        assert_eq!(allocator.allocate("PLX", 2026, "Ł").await.unwrap(), "PLX-Ł0002/2026");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn peek_does_not_consume_the_sequence() {
        let allocator = allocator().await;
        assert_eq!(allocator.peek("PLX", 2026, "E").await.unwrap(), "PLX-E0001/2026");
        assert_eq!(allocator.peek("PLX", 2026, "E").await.unwrap(), "PLX-E0001/2026");
        allocator.allocate("PLX", 2026, "E").await.unwrap();
        assert_eq!(allocator.peek("PLX", 2026, "E").await.unwrap(), "PLX-E0002/2026");
        assert!(allocator.peek("PLX", 2026, "#").await.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn allocate_rejects_invalid_key() {
        let allocator = allocator().await;
        assert!(allocator.allocate("PL#X", 2026, "E").await.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn allocate_or_temporary_falls_back_without_counter_table() {
        let db = Database::open_unmigrated_in_memory().await.unwrap();
        let allocator = SequenceAllocator::new(
            StoreService::from_database(db),
            DeviceId::new("tablet-7").unwrap(),
        );

        let number = allocator.allocate_or_temporary("PLX", 2026, "E").await;
        assert!(is_temporary(&number));
        assert!(number.starts_with("TMP#tablet-7#"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn temporaries_from_two_devices_never_collide() {
        let allocator = allocator().await;
        let first = allocator.allocate_temporary(&DeviceId::new("device-a").unwrap());
        let second = allocator.allocate_temporary(&DeviceId::new("device-b").unwrap());
        let canonical = allocator.allocate("PLX", 2026, "E").await.unwrap();

        assert_ne!(first, second);
        assert!(is_temporary(&first) && is_temporary(&second));
        assert!(!is_temporary(&canonical));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reconcile_renumbers_and_is_idempotent() {
        let allocator = allocator().await;
        allocator.allocate("PLX", 2026, "E").await.unwrap();
        insert_offer(&allocator, "o-1", "TMP#laptop-1#1#0000aaaa", Some("E"), MARCH_2026).await;
        insert_offer(&allocator, "o-2", "TMP#laptop-1#2#0000bbbb", Some("K"), MARCH_2026 + 1).await;
        insert_offer(&allocator, "o-3", "PLX-E0001/2026", Some("E"), MARCH_2026).await;

        let report = allocator.reconcile().await.unwrap();
        assert_eq!(
            report.succeeded,
            vec![
                Renumbered {
                    offer_id: "o-1".to_string(),
                    old_number: "TMP#laptop-1#1#0000aaaa".to_string(),
                    new_number: "PLX-E0002/2026".to_string(),
                },
                Renumbered {
                    offer_id: "o-2".to_string(),
                    old_number: "TMP#laptop-1#2#0000bbbb".to_string(),
                    new_number: "PLX-K0001/2026".to_string(),
                },
            ]
        );
        assert!(report.failed.is_empty());
        assert_eq!(offer_number(&allocator, "o-1").await, "PLX-E0002/2026");
        assert_eq!(allocator.renumbering_log().await.unwrap(), report.succeeded);

        let again = allocator.reconcile().await.unwrap();
        assert!(again.succeeded.is_empty());
        assert!(again.failed.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reconcile_collects_failures_without_aborting() {
        let allocator = allocator().await;
        insert_offer(&allocator, "o-1", "TMP#laptop-1#1#0000aaaa", None, MARCH_2026).await;
        insert_offer(&allocator, "o-2", "TMP#laptop-1#2#0000bbbb", Some("E"), MARCH_2026).await;

        let report = allocator.reconcile().await.unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].offer_id, "o-1");
        assert!(report.failed[0].error.contains("no salesperson initial"));
        assert_eq!(report.succeeded.len(), 1);
        assert_eq!(offer_number(&allocator, "o-1").await, "TMP#laptop-1#1#0000aaaa");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn authority_decides_sequence_and_local_counter_follows() {
        let allocator = allocator().await.with_authority(Arc::new(FixedAuthority {
            next: AtomicI64::new(40),
            fail: false,
        }));
        insert_offer(&allocator, "o-1", "TMP#laptop-1#1#0000aaaa", Some("E"), MARCH_2026).await;

        let report = allocator.reconcile().await.unwrap();
        assert_eq!(report.succeeded[0].new_number, "PLX-E0040/2026");
        assert_eq!(
            allocator.allocate("PLX", 2026, "E").await.unwrap(),
            "PLX-E0041/2026"
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unreachable_authority_leaves_offer_untouched() {
        let allocator = allocator().await.with_authority(Arc::new(FixedAuthority {
            next: AtomicI64::new(1),
            fail: true,
        }));
        insert_offer(&allocator, "o-1", "TMP#laptop-1#1#0000aaaa", Some("E"), MARCH_2026).await;

        let report = allocator.reconcile().await.unwrap();
        assert!(report.succeeded.is_empty());
        assert!(report.failed[0].error.contains("authority unreachable"));
        assert_eq!(offer_number(&allocator, "o-1").await, "TMP#laptop-1#1#0000aaaa");
        // The counter was not consumed
        assert_eq!(
            allocator.allocate("PLX", 2026, "E").await.unwrap(),
            "PLX-E0001/2026"
        );
    }
}
