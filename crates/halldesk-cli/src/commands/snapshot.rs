use halldesk_core::db::LibSqlSnapshotRepository;
use halldesk_core::snapshot::SyncStatus;

use crate::commands::common::format_timestamp;
use crate::context::AppContext;
use crate::error::CliError;

pub async fn run_snapshot_sync(ctx: &AppContext) -> Result<(), CliError> {
    let sync = ctx.snapshot_sync().ok_or(CliError::ApiNotConfigured)?;
    let report = sync.sync_if_newer().await?;

    match report.status {
        SyncStatus::Synced => println!(
            "Synced reference data to version {} ({})",
            report.version,
            report.last_updated.as_deref().unwrap_or("no timestamp")
        ),
        SyncStatus::Unchanged => println!("Reference data is current (version {})", report.version),
        SyncStatus::Offline => println!("Remote unreachable, keeping version {}", report.version),
        SyncStatus::Error => println!(
            "Sync failed, keeping version {}: {}",
            report.version,
            report.error.as_deref().unwrap_or("unknown error")
        ),
    }
    Ok(())
}

pub async fn run_snapshot_status(ctx: &AppContext) -> Result<(), CliError> {
    // Reading the cache needs no remote source
    let cached = {
        let db = ctx.store.lock().await;
        LibSqlSnapshotRepository::new(db.connection()).load().await?
    };

    match cached {
        Some(snapshot) => println!(
            "version={} last_updated={} fetched={}",
            snapshot.version,
            snapshot.last_updated,
            format_timestamp(snapshot.fetched_at)
        ),
        None => println!("No reference data cached."),
    }
    Ok(())
}
