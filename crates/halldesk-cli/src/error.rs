use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] halldesk_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Mail relay is not configured. Set HALLDESK_MAIL_RELAY_URL to deliver mail.")]
    MailRelayNotConfigured,
    #[error("Remote API is not configured. Set HALLDESK_API_BASE_URL to sync reference data.")]
    ApiNotConfigured,
}
