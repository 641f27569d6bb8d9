use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "halldesk")]
#[command(about = "Offline-first dispatch and reconciliation for the sales desk")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Inspect and drain the operation outbox
    Outbox {
        #[command(subcommand)]
        command: OutboxCommands,
    },
    /// Queue and deliver outbound mail
    Mail {
        #[command(subcommand)]
        command: MailCommands,
    },
    /// Reference-data snapshot cache
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommands,
    },
    /// Offer numbers and temporary-id reconciliation
    Number {
        #[command(subcommand)]
        command: NumberCommands,
    },
    /// Run the outbox and mail loops until Ctrl-C
    Run,
}

#[derive(Subcommand)]
pub enum OutboxCommands {
    /// Queue an operation
    Enqueue {
        /// Operation type, e.g. NOTIFY or SEND_MESSAGE
        #[arg(long = "type", value_name = "TYPE")]
        operation: String,
        /// JSON payload
        #[arg(long, value_name = "JSON")]
        payload: String,
    },
    /// Run one dispatch pass
    Flush,
    /// List recent records of any state
    List {
        /// Number of records to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
pub enum MailCommands {
    /// Queue a message for delivery
    Enqueue {
        /// Recipient address (repeatable)
        #[arg(long, required = true, value_name = "ADDRESS")]
        to: Vec<String>,
        #[arg(long, value_name = "ADDRESS")]
        cc: Vec<String>,
        #[arg(long, value_name = "ADDRESS")]
        bcc: Vec<String>,
        #[arg(long)]
        subject: String,
        /// Plain-text body
        #[arg(long)]
        text: Option<String>,
        /// HTML body
        #[arg(long)]
        html: Option<String>,
        /// Attachment file reference (repeatable)
        #[arg(long = "attach", value_name = "PATH")]
        attachments: Vec<String>,
        /// Sending account id; the default account is used when omitted
        #[arg(long, value_name = "ID")]
        account: Option<String>,
        /// Related offer id
        #[arg(long, value_name = "ID")]
        offer: Option<String>,
    },
    /// Run one delivery tick
    Tick,
    /// Show delivery history
    History {
        /// Number of entries to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Add or update a sending account
    Account {
        #[arg(long)]
        id: String,
        /// Display name shown to recipients
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        /// Use this account when a message names none
        #[arg(long)]
        default: bool,
        /// Keep the account but stop sending from it
        #[arg(long)]
        inactive: bool,
    },
}

#[derive(Subcommand)]
pub enum SnapshotCommands {
    /// Fetch the remote snapshot when it is newer than the cache
    Sync,
    /// Show the cached snapshot version
    Status,
}

#[derive(Subcommand)]
pub enum NumberCommands {
    /// Allocate the next canonical number
    Allocate {
        #[arg(long)]
        prefix: Option<String>,
        /// Numbering year; the current UTC year when omitted
        #[arg(long)]
        year: Option<i32>,
        /// Salesperson initial
        #[arg(long)]
        initial: String,
    },
    /// Show the next canonical number without allocating it
    Peek {
        #[arg(long)]
        prefix: Option<String>,
        /// Numbering year; the current UTC year when omitted
        #[arg(long)]
        year: Option<i32>,
        /// Salesperson initial
        #[arg(long)]
        initial: String,
    },
    /// Print a temporary identifier for this device
    Temp,
    /// Replace temporary offer numbers with canonical ones
    Reconcile {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the renumbering audit trail
    Log {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}
