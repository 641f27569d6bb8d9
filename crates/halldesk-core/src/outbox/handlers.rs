//! Built-in outbox handlers

use std::sync::Arc;

use crate::connectivity::ConnectivityProbe;
use crate::mail::{MailTransport, OutgoingMail};
use crate::models::{OperationType, OutboxRecord};
use crate::numbering::SequenceAllocator;
use crate::util::compact_text;

use super::{Dispatch, OutboxHandler};

/// Plain remote call: POSTs the record payload as JSON.
///
/// Always attempts the call; the record id travels as `Idempotency-Key` so
/// the remote side can drop duplicates of an at-least-once delivery.
pub struct WebhookHandler {
    client: reqwest::Client,
    url: String,
}

impl WebhookHandler {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    /// Handler posting to `{api_base}/v1/outbox/{operation}`, e.g. `/v1/outbox/log_event_a`
    pub fn for_operation(client: reqwest::Client, api_base: &str, operation: OperationType) -> Self {
        let url = format!(
            "{}/v1/outbox/{}",
            api_base.trim_end_matches('/'),
            operation.as_str().to_ascii_lowercase()
        );
        Self::new(client, url)
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait::async_trait]
impl OutboxHandler for WebhookHandler {
    async fn handle(&self, record: &OutboxRecord) -> Result<Dispatch, String> {
        let payload: serde_json::Value = serde_json::from_str(&record.payload)
            .map_err(|error| format!("invalid payload: {error}"))?;

        let response = self
            .client
            .post(&self.url)
            .header("Idempotency-Key", record.id.as_str())
            .json(&payload)
            .send()
            .await
            .map_err(|error| format!("request to {} failed: {error}", self.url))?;

        let status = response.status();
        if status.is_success() {
            return Ok(Dispatch::Completed);
        }
        let body = response.text().await.unwrap_or_default();
        Err(format!("HTTP {}: {}", status.as_u16(), compact_text(&body)))
    }
}

/// SEND_MESSAGE: hands a fully resolved mail to the transport
pub struct SendMessageHandler {
    transport: Option<Arc<dyn MailTransport>>,
    probe: Arc<dyn ConnectivityProbe>,
}

impl SendMessageHandler {
    pub fn new(transport: Option<Arc<dyn MailTransport>>, probe: Arc<dyn ConnectivityProbe>) -> Self {
        Self { transport, probe }
    }
}

#[async_trait::async_trait]
impl OutboxHandler for SendMessageHandler {
    async fn handle(&self, record: &OutboxRecord) -> Result<Dispatch, String> {
        let Some(transport) = &self.transport else {
            return Ok(Dispatch::Deferred);
        };
        if !self.probe.is_reachable().await {
            return Ok(Dispatch::Deferred);
        }

        let mail: OutgoingMail = serde_json::from_str(&record.payload)
            .map_err(|error| format!("invalid message payload: {error}"))?;
        let receipt = transport.send(&mail).await?;
        if receipt.is_success() {
            Ok(Dispatch::Completed)
        } else {
            Err(receipt.failure_message())
        }
    }
}

/// TRIGGER_RECONCILE: runs a reconciliation pass
pub struct ReconcileHandler {
    allocator: Option<Arc<SequenceAllocator>>,
    probe: Arc<dyn ConnectivityProbe>,
}

impl ReconcileHandler {
    pub fn new(allocator: Option<Arc<SequenceAllocator>>, probe: Arc<dyn ConnectivityProbe>) -> Self {
        Self { allocator, probe }
    }
}

#[async_trait::async_trait]
impl OutboxHandler for ReconcileHandler {
    async fn handle(&self, _record: &OutboxRecord) -> Result<Dispatch, String> {
        let Some(allocator) = &self.allocator else {
            return Ok(Dispatch::Deferred);
        };
        if !self.probe.is_reachable().await {
            return Ok(Dispatch::Deferred);
        }

        let report = allocator
            .reconcile()
            .await
            .map_err(|error| error.to_string())?;
        if report.failed.is_empty() {
            return Ok(Dispatch::Completed);
        }
        // Failed offers are retried with the record
        let offers: Vec<&str> = report
            .failed
            .iter()
            .map(|failure| failure.offer_id.as_str())
            .collect();
        Err(format!(
            "{} offer(s) not renumbered: {}",
            offers.len(),
            offers.join(", ")
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::StaticProbe;
    use crate::db::{LibSqlOutboxRepository, OutboxRepository};
    use crate::mail::SendReceipt;
    use crate::models::DeviceId;
    use crate::outbox::{HandlerRegistry, OutboxDispatcher};
    use crate::services::StoreService;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingTransport {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl MailTransport for CountingTransport {
        async fn send(&self, mail: &OutgoingMail) -> Result<SendReceipt, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(SendReceipt {
                accepted: mail.to.clone(),
                ..SendReceipt::default()
            })
        }
    }

    fn mail_payload() -> serde_json::Value {
        json!({
            "from": "Sales <sales@example.com>",
            "to": ["buyer@example.com"],
            "subject": "Offer PLX-E0001/2026",
            "text_body": "Attached."
        })
    }

    async fn flush_once(
        store: &StoreService,
        registry: HandlerRegistry,
        operation: OperationType,
        payload: &serde_json::Value,
    ) -> (OutboxRecord, OutboxRecord) {
        let dispatcher = OutboxDispatcher::new(store.clone(), registry);
        let record = dispatcher.enqueue(operation, payload).await.unwrap();
        dispatcher.flush_at(record.created_at + 1).await.unwrap();
        let db = store.lock().await;
        let after = LibSqlOutboxRepository::new(db.connection())
            .get(&record.id)
            .await
            .unwrap()
            .unwrap();
        (record, after)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn send_message_defers_while_offline() {
        let store = StoreService::open_in_memory().await.unwrap();
        let transport = Arc::new(CountingTransport::default());
        let registry = HandlerRegistry::new().with(
            OperationType::SendMessage,
            Arc::new(SendMessageHandler::new(
                Some(transport.clone()),
                Arc::new(StaticProbe::new(false)),
            )),
        );

        let (before, after) =
            flush_once(&store, registry, OperationType::SendMessage, &mail_payload()).await;
        assert_eq!(after.retry_count, before.retry_count);
        assert_eq!(after.processed_at, None);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn send_message_defers_without_transport() {
        let store = StoreService::open_in_memory().await.unwrap();
        let registry = HandlerRegistry::new().with(
            OperationType::SendMessage,
            Arc::new(SendMessageHandler::new(None, Arc::new(StaticProbe::new(true)))),
        );

        let (before, after) =
            flush_once(&store, registry, OperationType::SendMessage, &mail_payload()).await;
        assert_eq!(after, before);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn send_message_completes_when_online() {
        let store = StoreService::open_in_memory().await.unwrap();
        let transport = Arc::new(CountingTransport::default());
        let registry = HandlerRegistry::new().with(
            OperationType::SendMessage,
            Arc::new(SendMessageHandler::new(
                Some(transport.clone()),
                Arc::new(StaticProbe::new(true)),
            )),
        );

        let (_, after) =
            flush_once(&store, registry, OperationType::SendMessage, &mail_payload()).await;
        assert!(after.processed_at.is_some());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reconcile_defers_while_offline() {
        let store = StoreService::open_in_memory().await.unwrap();
        let allocator = Arc::new(SequenceAllocator::new(
            store.clone(),
            DeviceId::new("laptop-1").unwrap(),
        ));
        let registry = HandlerRegistry::new().with(
            OperationType::TriggerReconcile,
            Arc::new(ReconcileHandler::new(
                Some(allocator),
                Arc::new(StaticProbe::new(false)),
            )),
        );

        let (before, after) =
            flush_once(&store, registry, OperationType::TriggerReconcile, &json!({})).await;
        assert_eq!(after, before);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reconcile_completes_with_nothing_pending() {
        let store = StoreService::open_in_memory().await.unwrap();
        let allocator = Arc::new(SequenceAllocator::new(
            store.clone(),
            DeviceId::new("laptop-1").unwrap(),
        ));
        let registry = HandlerRegistry::new().with(
            OperationType::TriggerReconcile,
            Arc::new(ReconcileHandler::new(
                Some(allocator),
                Arc::new(StaticProbe::new(true)),
            )),
        );

        let (_, after) =
            flush_once(&store, registry, OperationType::TriggerReconcile, &json!({})).await;
        assert!(after.processed_at.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn webhook_failure_is_retryable_error() {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(500))
            .build()
            .unwrap();
        let handler =
            WebhookHandler::for_operation(client, "http://127.0.0.1:9/", OperationType::LogEventA);
        assert_eq!(handler.url(), "http://127.0.0.1:9/v1/outbox/log_event_a");

        let record = OutboxRecord::new(OperationType::LogEventA, &json!({"event": "opened"})).unwrap();
        let error = handler.handle(&record).await.unwrap_err();
        assert!(error.contains("request to http://127.0.0.1:9/v1/outbox/log_event_a failed"));
    }
}
