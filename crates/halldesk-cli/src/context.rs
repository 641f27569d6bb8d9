//! Wires the core services to their HTTP collaborators for one invocation.

use std::path::Path;
use std::sync::Arc;

use halldesk_core::config::EngineConfig;
use halldesk_core::connectivity::{ConnectivityProbe, HttpConnectivityProbe};
use halldesk_core::db::{LibSqlSettingsRepository, SettingsRepository};
use halldesk_core::mail::{MailTransport, MailWorker};
use halldesk_core::models::{DeviceId, OperationType};
use halldesk_core::numbering::SequenceAllocator;
use halldesk_core::outbox::{
    HandlerRegistry, OutboxDispatcher, ReconcileHandler, SendMessageHandler, WebhookHandler,
};
use halldesk_core::snapshot::{HttpSnapshotSource, SnapshotSynchronizer};
use halldesk_core::StoreService;

use crate::error::CliError;
use crate::remote::{build_http_client, HttpMailRelay, HttpNumberingAuthority, UnconfiguredRelay};

/// Operations forwarded verbatim to the remote API
pub const WEBHOOK_OPERATIONS: [OperationType; 3] = [
    OperationType::Notify,
    OperationType::LogEventA,
    OperationType::LogEventB,
];

pub struct AppContext {
    pub config: EngineConfig,
    pub store: StoreService,
    pub device: DeviceId,
    client: reqwest::Client,
    /// Same credentials, bounded by the longer full-snapshot timeout
    snapshot_client: reqwest::Client,
    probe: Arc<dyn ConnectivityProbe>,
}

impl AppContext {
    pub async fn open(db_path: &Path, config: EngineConfig) -> Result<Self, CliError> {
        let store = StoreService::open_path(db_path).await?;
        let device = match config.device_id.clone() {
            Some(device) => device,
            None => {
                let db = store.lock().await;
                LibSqlSettingsRepository::new(db.connection())
                    .load_or_create_device_id()
                    .await?
            }
        };
        let client = build_http_client(config.api_token.as_deref(), config.http_timeout)?;
        let snapshot_client =
            build_http_client(config.api_token.as_deref(), config.snapshot_timeout)?;
        let probe: Arc<dyn ConnectivityProbe> = Arc::new(HttpConnectivityProbe::new(
            config.connectivity_url.clone(),
            config.probe_timeout,
        )?);

        tracing::debug!("Opened {} as device {device}", db_path.display());
        Ok(Self {
            config,
            store,
            device,
            client,
            snapshot_client,
            probe,
        })
    }

    pub fn probe(&self) -> Arc<dyn ConnectivityProbe> {
        Arc::clone(&self.probe)
    }

    pub fn allocator(&self) -> Arc<SequenceAllocator> {
        let mut allocator = SequenceAllocator::new(self.store.clone(), self.device.clone())
            .with_offer_prefix(self.config.offer_prefix.clone());
        if let Some(api_base) = &self.config.api_base_url {
            allocator = allocator.with_authority(Arc::new(HttpNumberingAuthority::new(
                self.client.clone(),
                api_base,
            )));
        }
        Arc::new(allocator)
    }

    pub fn mail_transport(&self) -> Option<Arc<dyn MailTransport>> {
        self.config.mail_relay_url.as_ref().map(|url| {
            Arc::new(HttpMailRelay::new(self.client.clone(), url.clone())) as Arc<dyn MailTransport>
        })
    }

    /// Worker for queueing and inspection; delivery needs [`Self::delivery_worker`]
    pub fn mail_worker(&self) -> Arc<MailWorker> {
        let transport = self
            .mail_transport()
            .unwrap_or_else(|| Arc::new(UnconfiguredRelay));
        Arc::new(self.build_worker(transport))
    }

    pub fn delivery_worker(&self) -> Result<Arc<MailWorker>, CliError> {
        let transport = self
            .mail_transport()
            .ok_or(CliError::MailRelayNotConfigured)?;
        Ok(Arc::new(self.build_worker(transport)))
    }

    fn build_worker(&self, transport: Arc<dyn MailTransport>) -> MailWorker {
        MailWorker::new(
            self.store.clone(),
            transport,
            self.probe(),
            self.config.mail_worker(),
        )
    }

    pub fn dispatcher(&self, allocator: Arc<SequenceAllocator>) -> Arc<OutboxDispatcher> {
        let handlers = handler_registry(
            self.config.api_base_url.as_deref(),
            &self.client,
            self.mail_transport(),
            Some(allocator),
            &self.probe(),
        );
        Arc::new(OutboxDispatcher::new(self.store.clone(), handlers))
    }

    pub fn snapshot_sync(&self) -> Option<Arc<SnapshotSynchronizer>> {
        let api_base = self.config.api_base_url.as_deref()?;
        let source = Arc::new(HttpSnapshotSource::new(self.snapshot_client.clone(), api_base));
        Some(Arc::new(SnapshotSynchronizer::new(
            self.store.clone(),
            source,
            self.config.sync_timeouts(),
        )))
    }
}

/// Handlers for every operation the current configuration can dispatch.
///
/// Webhook operations get no handler without an API base URL, so their
/// records stay deferred until one is configured.
pub fn handler_registry(
    api_base: Option<&str>,
    client: &reqwest::Client,
    transport: Option<Arc<dyn MailTransport>>,
    allocator: Option<Arc<SequenceAllocator>>,
    probe: &Arc<dyn ConnectivityProbe>,
) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new()
        .with(
            OperationType::SendMessage,
            Arc::new(SendMessageHandler::new(transport, Arc::clone(probe))),
        )
        .with(
            OperationType::TriggerReconcile,
            Arc::new(ReconcileHandler::new(allocator, Arc::clone(probe))),
        );

    if let Some(api_base) = api_base {
        for operation in WEBHOOK_OPERATIONS {
            registry.register(
                operation,
                Arc::new(WebhookHandler::for_operation(
                    client.clone(),
                    api_base,
                    operation,
                )),
            );
        }
    }
    registry
}
