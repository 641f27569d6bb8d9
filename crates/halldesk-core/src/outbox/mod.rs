//! Generic outbox dispatcher.
//!
//! Deferred remote operations are stored as [`OutboxRecord`]s and flushed
//! in creation order, across operation types. A failing record gets its own
//! `next_attempt_at` on the [`OUTBOX_TIERS`] ladder and is skipped until then;
//! a flush pass never sleeps.

mod handlers;

pub use handlers::{ReconcileHandler, SendMessageHandler, WebhookHandler};

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::backoff::{next_attempt_at, OUTBOX_TIERS};
use crate::db::{LibSqlOutboxRepository, OutboxRepository, MAX_RETRIES_EXCEEDED};
use crate::models::{OperationType, OutboxRecord};
use crate::services::StoreService;
use crate::util::{compact_text, now_ms};
use crate::Result;

/// What a handler did with a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The remote side effect happened; the record is done
    Completed,
    /// A required capability or connectivity is missing; try again next pass
    /// without spending a retry
    Deferred,
}

/// Executes one operation type
#[async_trait::async_trait]
pub trait OutboxHandler: Send + Sync {
    async fn handle(&self, record: &OutboxRecord) -> std::result::Result<Dispatch, String>;
}

/// Handlers keyed by operation type
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<OperationType, Arc<dyn OutboxHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, operation: OperationType, handler: Arc<dyn OutboxHandler>) {
        self.handlers.insert(operation, handler);
    }

    #[must_use]
    pub fn with(mut self, operation: OperationType, handler: Arc<dyn OutboxHandler>) -> Self {
        self.register(operation, handler);
        self
    }

    pub fn get(&self, operation: OperationType) -> Option<&Arc<dyn OutboxHandler>> {
        self.handlers.get(&operation)
    }
}

/// Counts of one flush pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushSummary {
    pub processed: usize,
    pub failed: usize,
    /// Left untouched for a later pass
    pub deferred: usize,
    /// Still backing off from an earlier failure
    pub waiting: usize,
}

enum Outcome {
    Processed,
    Failed,
    Deferred,
    Waiting,
}

pub struct OutboxDispatcher {
    store: StoreService,
    handlers: HandlerRegistry,
}

impl OutboxDispatcher {
    pub fn new(store: StoreService, handlers: HandlerRegistry) -> Self {
        Self { store, handlers }
    }

    /// Queue an operation for the next flush
    pub async fn enqueue(
        &self,
        operation: OperationType,
        payload: &serde_json::Value,
    ) -> Result<OutboxRecord> {
        let record = OutboxRecord::new(operation, payload)?;
        let db = self.store.lock().await;
        LibSqlOutboxRepository::new(db.connection())
            .insert(&record)
            .await?;
        tracing::info!("Queued {operation} operation {}", record.id);
        Ok(record)
    }

    /// Most recent records of any state, newest first
    pub async fn list_recent(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        let db = self.store.lock().await;
        LibSqlOutboxRepository::new(db.connection())
            .list_recent(limit)
            .await
    }

    pub async fn flush(&self) -> Result<FlushSummary> {
        self.flush_at(now_ms()).await
    }

    /// One pass over every non-terminal record with an injected clock.
    ///
    /// Only reading the pending set can fail the pass; a storage error on a
    /// single record is logged and counted as failed.
    pub async fn flush_at(&self, now: i64) -> Result<FlushSummary> {
        let pending = {
            let db = self.store.lock().await;
            LibSqlOutboxRepository::new(db.connection())
                .list_pending()
                .await?
        };

        let mut summary = FlushSummary::default();
        for record in pending {
            let outcome = match self.dispatch(&record, now).await {
                Ok(outcome) => outcome,
                Err(error) => {
                    tracing::warn!("Outbox record {} could not be updated: {error}", record.id);
                    Outcome::Failed
                }
            };
            match outcome {
                Outcome::Processed => summary.processed += 1,
                Outcome::Failed => summary.failed += 1,
                Outcome::Deferred => summary.deferred += 1,
                Outcome::Waiting => summary.waiting += 1,
            }
        }

        if summary.processed + summary.failed > 0 {
            tracing::info!(
                "Outbox flush: {} processed, {} failed, {} deferred, {} waiting",
                summary.processed,
                summary.failed,
                summary.deferred,
                summary.waiting
            );
        }
        Ok(summary)
    }

    async fn dispatch(&self, record: &OutboxRecord, now: i64) -> Result<Outcome> {
        if record.retries_exhausted() {
            self.give_up(record, MAX_RETRIES_EXCEEDED, now).await?;
            return Ok(Outcome::Failed);
        }

        let Some(operation) = record.operation() else {
            let error = format!("unknown operation type: {}", record.operation_type);
            self.give_up(record, &error, now).await?;
            return Ok(Outcome::Failed);
        };

        if record.is_backing_off(now) {
            return Ok(Outcome::Waiting);
        }

        let Some(handler) = self.handlers.get(operation) else {
            tracing::debug!("No handler for {operation}, deferring {}", record.id);
            return Ok(Outcome::Deferred);
        };

        // The store is not locked while the handler runs
        let result = handler.handle(record).await;

        let db = self.store.lock().await;
        let repo = LibSqlOutboxRepository::new(db.connection());
        match result {
            Ok(Dispatch::Completed) => {
                repo.mark_processed(&record.id, now).await?;
                tracing::debug!("Dispatched {operation} operation {}", record.id);
                Ok(Outcome::Processed)
            }
            Ok(Dispatch::Deferred) => {
                tracing::debug!("Deferred {operation} operation {}", record.id);
                Ok(Outcome::Deferred)
            }
            Err(error) => {
                let error = compact_text(&error);
                let retry_count = record.retry_count.saturating_add(1);
                let next = next_attempt_at(&OUTBOX_TIERS, retry_count, now);
                repo.record_failure(&record.id, retry_count, &error, next)
                    .await?;
                tracing::warn!(
                    "{operation} operation {} failed (attempt {retry_count}/{}): {error}",
                    record.id,
                    record.max_retries
                );
                Ok(Outcome::Failed)
            }
        }
    }

    async fn give_up(&self, record: &OutboxRecord, error: &str, now: i64) -> Result<()> {
        let db = self.store.lock().await;
        LibSqlOutboxRepository::new(db.connection())
            .mark_failed(&record.id, error, now)
            .await?;
        tracing::warn!("Outbox record {} failed permanently: {error}", record.id);
        Ok(())
    }
}
