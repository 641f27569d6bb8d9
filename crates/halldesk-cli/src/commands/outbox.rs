use halldesk_core::util::now_ms;

use crate::commands::common::{format_outbox_lines, parse_operation, parse_payload};
use crate::context::AppContext;
use crate::error::CliError;

pub async fn run_outbox_enqueue(
    operation: &str,
    payload: &str,
    ctx: &AppContext,
) -> Result<(), CliError> {
    let operation = parse_operation(operation)?;
    let payload = parse_payload(payload)?;

    let record = ctx.dispatcher(ctx.allocator()).enqueue(operation, &payload).await?;
    println!("Queued {operation} {}", record.id);
    Ok(())
}

pub async fn run_outbox_flush(ctx: &AppContext) -> Result<(), CliError> {
    let summary = ctx.dispatcher(ctx.allocator()).flush().await?;
    println!(
        "processed={} failed={} deferred={} waiting={}",
        summary.processed, summary.failed, summary.deferred, summary.waiting
    );
    Ok(())
}

pub async fn run_outbox_list(limit: usize, as_json: bool, ctx: &AppContext) -> Result<(), CliError> {
    let records = ctx.dispatcher(ctx.allocator()).list_recent(limit).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("Outbox is empty.");
        return Ok(());
    }
    for line in format_outbox_lines(&records, now_ms()) {
        println!("{line}");
    }
    Ok(())
}
