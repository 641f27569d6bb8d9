use std::sync::Arc;

use halldesk_core::scheduler::{MailLoop, OutboxLoop, Scheduler};

use crate::context::AppContext;
use crate::error::CliError;

pub async fn run_loops(ctx: &AppContext) -> Result<(), CliError> {
    let allocator = ctx.allocator();
    let mut outbox_loop = OutboxLoop::new(ctx.dispatcher(Arc::clone(&allocator)), ctx.probe())
        .with_allocator(allocator);
    if let Some(sync) = ctx.snapshot_sync() {
        outbox_loop = outbox_loop.with_snapshot_sync(sync, ctx.config.snapshot_every_passes);
    } else {
        tracing::info!("HALLDESK_API_BASE_URL unset, reference data sync disabled");
    }

    let mut scheduler = Scheduler::new();
    scheduler.spawn(Arc::new(outbox_loop), ctx.config.outbox_interval);

    match ctx.delivery_worker() {
        Ok(worker) => scheduler.spawn(Arc::new(MailLoop::new(worker)), ctx.config.mail_interval),
        Err(_) => tracing::warn!("HALLDESK_MAIL_RELAY_URL unset, mail delivery disabled"),
    }

    tracing::info!(
        "Running {} loop(s) as device {}; press Ctrl-C to stop",
        scheduler.len(),
        ctx.device
    );
    tokio::signal::ctrl_c().await?;

    tracing::info!("Stopping, waiting for in-flight passes");
    scheduler.shutdown().await;
    Ok(())
}
