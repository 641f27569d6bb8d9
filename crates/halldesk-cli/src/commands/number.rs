use crate::commands::common::current_year;
use crate::context::AppContext;
use crate::error::CliError;

pub async fn run_number_allocate(
    prefix: Option<&str>,
    year: Option<i32>,
    initial: &str,
    ctx: &AppContext,
) -> Result<(), CliError> {
    let prefix = prefix.unwrap_or(&ctx.config.offer_prefix);
    let year = year.unwrap_or_else(current_year);

    let number = ctx.allocator().allocate(prefix, year, initial).await?;
    println!("{number}");
    Ok(())
}

pub async fn run_number_peek(
    prefix: Option<&str>,
    year: Option<i32>,
    initial: &str,
    ctx: &AppContext,
) -> Result<(), CliError> {
    let prefix = prefix.unwrap_or(&ctx.config.offer_prefix);
    let year = year.unwrap_or_else(current_year);

    println!("{}", ctx.allocator().peek(prefix, year, initial).await?);
    Ok(())
}

pub fn run_number_temp(ctx: &AppContext) {
    println!("{}", ctx.allocator().allocate_temporary(&ctx.device));
}

pub async fn run_number_reconcile(as_json: bool, ctx: &AppContext) -> Result<(), CliError> {
    let report = ctx.allocator().reconcile().await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    if report.is_empty() {
        println!("No temporary offer numbers pending.");
        return Ok(());
    }
    for renumbered in &report.succeeded {
        println!(
            "{}  {} -> {}",
            renumbered.offer_id, renumbered.old_number, renumbered.new_number
        );
    }
    for failure in &report.failed {
        println!("{}  not renumbered: {}", failure.offer_id, failure.error);
    }
    Ok(())
}

pub async fn run_number_log(as_json: bool, ctx: &AppContext) -> Result<(), CliError> {
    let log = ctx.allocator().renumbering_log().await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&log)?);
        return Ok(());
    }

    if log.is_empty() {
        println!("No offers renumbered yet.");
        return Ok(());
    }
    for entry in &log {
        println!("{}  {} -> {}", entry.offer_id, entry.old_number, entry.new_number);
    }
    Ok(())
}
