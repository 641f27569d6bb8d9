use halldesk_core::models::{MailAccount, NewOutboundMessage};

use crate::commands::common::format_history_lines;
use crate::context::AppContext;
use crate::error::CliError;

pub async fn run_mail_enqueue(input: NewOutboundMessage, ctx: &AppContext) -> Result<(), CliError> {
    let message = ctx.mail_worker().enqueue(input).await?;
    println!("Queued message {} to {}", message.id, message.to.join(", "));
    Ok(())
}

pub async fn run_mail_tick(ctx: &AppContext) -> Result<(), CliError> {
    let summary = ctx.delivery_worker()?.tick().await?;
    if !summary.online {
        println!("Offline, nothing picked.");
        return Ok(());
    }
    println!(
        "picked={} sent={} retry_scheduled={} exhausted={} skipped={}",
        summary.picked, summary.sent, summary.retry_scheduled, summary.exhausted, summary.skipped
    );
    Ok(())
}

pub async fn run_mail_history(limit: usize, as_json: bool, ctx: &AppContext) -> Result<(), CliError> {
    let entries = ctx.mail_worker().history(limit).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("No deliveries recorded.");
        return Ok(());
    }
    for line in format_history_lines(&entries) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_mail_account(account: MailAccount, ctx: &AppContext) -> Result<(), CliError> {
    if !account.email.contains('@') {
        return Err(CliError::InvalidArgument(format!(
            "'{}' is not an email address",
            account.email
        )));
    }
    ctx.mail_worker().save_account(&account).await?;
    println!("Saved account {} ({})", account.id, account.mailbox());
    Ok(())
}
