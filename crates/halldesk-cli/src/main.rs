//! halldesk CLI - operator front end for the dispatch engine
//!
//! Queues work, runs single passes by hand, and hosts the periodic loops.

mod cli;
mod commands;
mod context;
mod error;
mod remote;


use clap::Parser;
use halldesk_core::config::EngineConfig;
use halldesk_core::models::{MailAccount, NewOutboundMessage};

use crate::cli::{Cli, Commands, MailCommands, NumberCommands, OutboxCommands, SnapshotCommands};
use crate::commands::common::resolve_db_path;
use crate::commands::mail::{run_mail_account, run_mail_enqueue, run_mail_history, run_mail_tick};
use crate::commands::number::{
    run_number_allocate, run_number_log, run_number_peek, run_number_reconcile, run_number_temp,
};
use crate::commands::outbox::{run_outbox_enqueue, run_outbox_flush, run_outbox_list};
use crate::commands::run::run_loops;
use crate::commands::snapshot::{run_snapshot_status, run_snapshot_sync};
use crate::context::AppContext;
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("halldesk=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = EngineConfig::from_env()?;
    let db_path = resolve_db_path(cli.db_path);
    let ctx = AppContext::open(&db_path, config).await?;

    match cli.command {
        Commands::Outbox { command } => match command {
            OutboxCommands::Enqueue { operation, payload } => {
                run_outbox_enqueue(&operation, &payload, &ctx).await?;
            }
            OutboxCommands::Flush => run_outbox_flush(&ctx).await?,
            OutboxCommands::List { limit, json } => run_outbox_list(limit, json, &ctx).await?,
        },
        Commands::Mail { command } => match command {
            MailCommands::Enqueue {
                to,
                cc,
                bcc,
                subject,
                text,
                html,
                attachments,
                account,
                offer,
            } => {
                let input = NewOutboundMessage {
                    sender_account_ref: account,
                    to,
                    cc,
                    bcc,
                    subject,
                    text_body: text,
                    html_body: html,
                    attachments,
                    related_entity_ref: offer,
                };
                run_mail_enqueue(input, &ctx).await?;
            }
            MailCommands::Tick => run_mail_tick(&ctx).await?,
            MailCommands::History { limit, json } => run_mail_history(limit, json, &ctx).await?,
            MailCommands::Account {
                id,
                name,
                email,
                default,
                inactive,
            } => {
                let account = MailAccount {
                    id,
                    display_name: name,
                    email,
                    is_default: default,
                    is_active: !inactive,
                };
                run_mail_account(account, &ctx).await?;
            }
        },
        Commands::Snapshot { command } => match command {
            SnapshotCommands::Sync => run_snapshot_sync(&ctx).await?,
            SnapshotCommands::Status => run_snapshot_status(&ctx).await?,
        },
        Commands::Number { command } => match command {
            NumberCommands::Allocate {
                prefix,
                year,
                initial,
            } => run_number_allocate(prefix.as_deref(), year, &initial, &ctx).await?,
            NumberCommands::Peek {
                prefix,
                year,
                initial,
            } => run_number_peek(prefix.as_deref(), year, &initial, &ctx).await?,
            NumberCommands::Temp => run_number_temp(&ctx),
            NumberCommands::Reconcile { json } => run_number_reconcile(json, &ctx).await?,
            NumberCommands::Log { json } => run_number_log(json, &ctx).await?,
        },
        Commands::Run => run_loops(&ctx).await?,
    }

    Ok(())
}
