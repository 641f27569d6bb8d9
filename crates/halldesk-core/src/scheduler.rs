//! Owned periodic loops.
//!
//! Each [`PeriodicTask`] drives one [`ScheduledJob`] from its own tokio task.
//! A pass always runs to completion before the next tick is awaited, and
//! missed ticks are delayed rather than bursted, so two passes of the same
//! loop never overlap. Stopping only prevents future passes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::connectivity::ConnectivityProbe;
use crate::mail::MailWorker;
use crate::numbering::SequenceAllocator;
use crate::outbox::OutboxDispatcher;
use crate::snapshot::{SnapshotSynchronizer, SyncStatus};

/// One pass of periodic work. Failures are handled inside the pass.
#[async_trait::async_trait]
pub trait ScheduledJob: Send + Sync + 'static {
    fn name(&self) -> &str;
    async fn run_once(&self);
}

/// A running loop; dropping it stops future passes as well
pub struct PeriodicTask {
    name: String,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Spawn the loop; the first pass runs immediately
    pub fn start(job: Arc<dyn ScheduledJob>, period: Duration) -> Self {
        let name = job.name().to_string();
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let loop_name = name.clone();
        let handle = tokio::spawn(async move {
            tracing::info!("Starting {loop_name} loop (every {period:?})");
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                        job.run_once().await;
                    }
                }
            }

            tracing::info!("{loop_name} loop stopped");
        });

        Self {
            name,
            stop_tx,
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop scheduling passes; an in-flight pass still completes
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the loop to exit
    pub async fn join(self) {
        if let Err(error) = self.handle.await {
            tracing::error!("{} loop ended abnormally: {error}", self.name);
        }
    }
}

/// A set of loops started and stopped together
#[derive(Default)]
pub struct Scheduler {
    tasks: Vec<PeriodicTask>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn(&mut self, job: Arc<dyn ScheduledJob>, period: Duration) {
        self.tasks.push(PeriodicTask::start(job, period));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn stop(&self) {
        for task in &self.tasks {
            task.stop();
        }
    }

    /// Stop every loop and wait for in-flight passes to finish
    pub async fn shutdown(self) {
        self.stop();
        for task in self.tasks {
            task.join().await;
        }
    }
}

/// Outbox flush with opportunistic reconcile and snapshot sync.
///
/// Does nothing while the probe reports offline. Reconciles on every offline
/// to online transition (including the first online pass) and syncs the
/// snapshot on every `snapshot_every`-th pass.
pub struct OutboxLoop {
    dispatcher: Arc<OutboxDispatcher>,
    probe: Arc<dyn ConnectivityProbe>,
    allocator: Option<Arc<SequenceAllocator>>,
    synchronizer: Option<Arc<SnapshotSynchronizer>>,
    snapshot_every: u64,
    passes: AtomicU64,
    was_online: AtomicBool,
}

impl OutboxLoop {
    pub fn new(dispatcher: Arc<OutboxDispatcher>, probe: Arc<dyn ConnectivityProbe>) -> Self {
        Self {
            dispatcher,
            probe,
            allocator: None,
            synchronizer: None,
            snapshot_every: 20,
            passes: AtomicU64::new(0),
            was_online: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn with_allocator(mut self, allocator: Arc<SequenceAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    #[must_use]
    pub fn with_snapshot_sync(
        mut self,
        synchronizer: Arc<SnapshotSynchronizer>,
        every_passes: u64,
    ) -> Self {
        self.synchronizer = Some(synchronizer);
        self.snapshot_every = every_passes.max(1);
        self
    }

    async fn reconcile(&self, allocator: &SequenceAllocator) {
        match allocator.reconcile().await {
            Ok(report) if report.is_empty() => {}
            Ok(report) => tracing::info!(
                "Reconciled on reconnect: {} renumbered, {} failed",
                report.succeeded.len(),
                report.failed.len()
            ),
            Err(error) => tracing::warn!("Reconcile on reconnect failed: {error}"),
        }
    }

    async fn sync_snapshot(&self, synchronizer: &SnapshotSynchronizer) {
        match synchronizer.sync_if_newer().await {
            Ok(report) => match report.status {
                SyncStatus::Synced => {
                    tracing::info!("Reference data synced to version {}", report.version);
                }
                SyncStatus::Error => tracing::warn!(
                    "Reference data sync failed: {}",
                    report.error.unwrap_or_default()
                ),
                SyncStatus::Unchanged | SyncStatus::Offline => {}
            },
            Err(error) => tracing::warn!("Reference data sync failed: {error}"),
        }
    }
}

#[async_trait::async_trait]
impl ScheduledJob for OutboxLoop {
    fn name(&self) -> &str {
        "outbox"
    }

    async fn run_once(&self) {
        let pass = self.passes.fetch_add(1, Ordering::SeqCst);
        let online = self.probe.is_reachable().await;
        let was_online = self.was_online.swap(online, Ordering::SeqCst);

        if online && !was_online {
            if let Some(allocator) = &self.allocator {
                self.reconcile(allocator).await;
            }
        }

        // Offline attempts would only burn retries
        if !online {
            tracing::debug!("Offline, outbox flush skipped");
            return;
        }

        if let Err(error) = self.dispatcher.flush().await {
            tracing::warn!("Outbox flush failed: {error}");
        }

        if pass % self.snapshot_every == 0 {
            if let Some(synchronizer) = &self.synchronizer {
                self.sync_snapshot(synchronizer).await;
            }
        }
    }
}

/// One outbound-message worker tick per pass
pub struct MailLoop {
    worker: Arc<MailWorker>,
}

impl MailLoop {
    pub const fn new(worker: Arc<MailWorker>) -> Self {
        Self { worker }
    }
}

#[async_trait::async_trait]
impl ScheduledJob for MailLoop {
    fn name(&self) -> &str {
        "mail"
    }

    async fn run_once(&self) {
        if let Err(error) = self.worker.tick().await {
            tracing::warn!("Mail tick failed: {error}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::StaticProbe;
    use crate::models::{DeviceId, OperationType, RemoteSnapshot, SnapshotMetadata};
    use crate::outbox::HandlerRegistry;
    use crate::services::StoreService;
    use crate::snapshot::{SnapshotSource, SyncTimeouts};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingJob {
        started: AtomicUsize,
        finished: AtomicUsize,
        pass_duration: Duration,
    }

    #[async_trait::async_trait]
    impl ScheduledJob for CountingJob {
        fn name(&self) -> &str {
            "counting"
        }

        async fn run_once(&self) {
            self.started.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.pass_duration).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_prevents_further_passes() {
        let job = Arc::new(CountingJob::default());
        let task = PeriodicTask::start(job.clone(), Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(80)).await;
        task.stop();
        task.join().await;

        let passes = job.finished.load(Ordering::SeqCst);
        assert!(passes >= 2, "expected repeated passes, got {passes}");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(job.finished.load(Ordering::SeqCst), passes);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn in_flight_pass_completes_after_stop() {
        let job = Arc::new(CountingJob {
            pass_duration: Duration::from_millis(100),
            ..CountingJob::default()
        });
        let task = PeriodicTask::start(job.clone(), Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(job.started.load(Ordering::SeqCst), 1);
        task.stop();
        task.join().await;

        assert_eq!(job.started.load(Ordering::SeqCst), 1);
        assert_eq!(job.finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn independent_schedulers_do_not_interfere() {
        let first_job = Arc::new(CountingJob::default());
        let second_job = Arc::new(CountingJob::default());
        let mut first = Scheduler::new();
        let mut second = Scheduler::new();
        first.spawn(first_job.clone(), Duration::from_millis(10));
        second.spawn(second_job.clone(), Duration::from_millis(10));
        assert_eq!(first.len(), 1);

        first.shutdown().await;
        let stopped_at = first_job.finished.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(first_job.finished.load(Ordering::SeqCst), stopped_at);
        assert!(second_job.finished.load(Ordering::SeqCst) >= 2);
        second.shutdown().await;
    }

    struct CountingSource {
        metadata_calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl SnapshotSource for CountingSource {
        async fn fetch_metadata(&self) -> std::result::Result<SnapshotMetadata, String> {
            self.metadata_calls.fetch_add(1, Ordering::SeqCst);
            Ok(SnapshotMetadata {
                version: 0,
                last_updated: String::new(),
            })
        }

        async fn fetch_snapshot(&self) -> std::result::Result<RemoteSnapshot, String> {
            Err("not expected".to_string())
        }
    }

    #[derive(Default)]
    struct FailingHandler {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl crate::outbox::OutboxHandler for FailingHandler {
        async fn handle(
            &self,
            _record: &crate::models::OutboxRecord,
        ) -> std::result::Result<crate::outbox::Dispatch, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err("HTTP 503: upstream unavailable".to_string())
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn outbox_loop_keeps_retry_budget_while_offline() {
        let store = StoreService::open_in_memory().await.unwrap();
        let handler = Arc::new(FailingHandler::default());
        let dispatcher = Arc::new(OutboxDispatcher::new(
            store,
            HandlerRegistry::new().with(OperationType::Notify, handler.clone()),
        ));
        dispatcher
            .enqueue(OperationType::Notify, &serde_json::json!({"offer": "o-1"}))
            .await
            .unwrap();

        let probe = Arc::new(StaticProbe::new(false));
        let job = OutboxLoop::new(dispatcher.clone(), probe.clone());

        job.run_once().await;
        job.run_once().await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        let record = &dispatcher.list_recent(1).await.unwrap()[0];
        assert_eq!(record.retry_count, 0);
        assert!(record.last_error.is_none());

        probe.set_online(true);
        job.run_once().await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.list_recent(1).await.unwrap()[0].retry_count, 1);
    }

    async fn pending_offers(allocator: &SequenceAllocator) -> usize {
        allocator.pending().await.unwrap().len()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn outbox_loop_reconciles_on_reconnect_and_syncs_periodically() {
        let store = StoreService::open_in_memory().await.unwrap();
        {
            let db = store.lock().await;
            db.connection()
                .execute(
                    "INSERT INTO offers (id, offer_number, salesperson_initial, created_at)
                     VALUES ('o-1', 'TMP#laptop-1#1#0000aaaa', 'E', 1772323200000)",
                    (),
                )
                .await
                .unwrap();
        }

        let probe = Arc::new(StaticProbe::new(false));
        let allocator = Arc::new(SequenceAllocator::new(
            store.clone(),
            DeviceId::new("laptop-1").unwrap(),
        ));
        let source = Arc::new(CountingSource {
            metadata_calls: AtomicUsize::new(0),
        });
        let synchronizer = Arc::new(SnapshotSynchronizer::new(
            store.clone(),
            source.clone(),
            SyncTimeouts::default(),
        ));
        let job = OutboxLoop::new(
            Arc::new(OutboxDispatcher::new(store.clone(), HandlerRegistry::new())),
            probe.clone(),
        )
        .with_allocator(allocator.clone())
        .with_snapshot_sync(synchronizer, 2);

        // Offline: nothing reconciled, no snapshot traffic
        job.run_once().await;
        assert_eq!(pending_offers(&allocator).await, 1);
        assert_eq!(source.metadata_calls.load(Ordering::SeqCst), 0);

        // Back online: reconcile runs; pass index 1 skips the snapshot
        probe.set_online(true);
        job.run_once().await;
        assert_eq!(pending_offers(&allocator).await, 0);
        assert_eq!(source.metadata_calls.load(Ordering::SeqCst), 0);

        // Pass index 2 syncs
        job.run_once().await;
        assert_eq!(source.metadata_calls.load(Ordering::SeqCst), 1);
    }
}
