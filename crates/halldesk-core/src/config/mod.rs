//! Engine configuration read from `HALLDESK_*` environment variables.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::ops::RangeInclusive;
use std::time::Duration;

use crate::connectivity::DEFAULT_PROBE_URL;
use crate::mail::MailWorkerConfig;
use crate::models::DeviceId;
use crate::numbering::DEFAULT_OFFER_PREFIX;
use crate::snapshot::SyncTimeouts;
use crate::util::{is_http_url, normalize_text_option};
use crate::{Error, Result};

#[derive(Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Explicit device id; generated and persisted when unset
    pub device_id: Option<DeviceId>,
    pub api_base_url: Option<String>,
    /// Bearer token for the remote API
    pub api_token: Option<String>,
    pub mail_relay_url: Option<String>,
    pub connectivity_url: String,
    pub offer_prefix: String,
    pub probe_timeout: Duration,
    /// Per-request bound for relay, webhook and numbering calls
    pub http_timeout: Duration,
    pub metadata_timeout: Duration,
    pub snapshot_timeout: Duration,
    pub outbox_interval: Duration,
    pub mail_interval: Duration,
    pub snapshot_every_passes: u64,
    pub mail_batch_size: usize,
    pub mail_max_retries: u32,
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("EngineConfig")
            .field("device_id", &self.device_id)
            .field("api_base_url", &self.api_base_url)
            .field("api_token", &self.api_token.as_ref().map(|_| "[REDACTED]"))
            .field("mail_relay_url", &self.mail_relay_url)
            .field("connectivity_url", &self.connectivity_url)
            .field("offer_prefix", &self.offer_prefix)
            .field("probe_timeout", &self.probe_timeout)
            .field("http_timeout", &self.http_timeout)
            .field("metadata_timeout", &self.metadata_timeout)
            .field("snapshot_timeout", &self.snapshot_timeout)
            .field("outbox_interval", &self.outbox_interval)
            .field("mail_interval", &self.mail_interval)
            .field("snapshot_every_passes", &self.snapshot_every_passes)
            .field("mail_batch_size", &self.mail_batch_size)
            .field("mail_max_retries", &self.mail_max_retries)
            .finish()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device_id: None,
            api_base_url: None,
            api_token: None,
            mail_relay_url: None,
            connectivity_url: DEFAULT_PROBE_URL.to_string(),
            offer_prefix: DEFAULT_OFFER_PREFIX.to_string(),
            probe_timeout: Duration::from_secs(5),
            http_timeout: Duration::from_secs(20),
            metadata_timeout: Duration::from_secs(5),
            snapshot_timeout: Duration::from_secs(30),
            outbox_interval: Duration::from_secs(30),
            mail_interval: Duration::from_secs(60),
            snapshot_every_passes: 20,
            mail_batch_size: 20,
            mail_max_retries: 6,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let device_id = optional_trimmed(&lookup, "HALLDESK_DEVICE_ID")
            .map(DeviceId::new)
            .transpose()
            .map_err(|error| Error::Config(format!("HALLDESK_DEVICE_ID: {error}")))?;

        let api_base_url = optional_url(&lookup, "HALLDESK_API_BASE_URL")?;
        let api_token = optional_trimmed(&lookup, "HALLDESK_API_TOKEN");
        let mail_relay_url = optional_url(&lookup, "HALLDESK_MAIL_RELAY_URL")?;
        let connectivity_url = optional_url(&lookup, "HALLDESK_CONNECTIVITY_URL")?
            .unwrap_or(defaults.connectivity_url);

        let offer_prefix = optional_trimmed(&lookup, "HALLDESK_OFFER_PREFIX")
            .unwrap_or(defaults.offer_prefix);
        if !offer_prefix.chars().all(char::is_alphanumeric) {
            return Err(Error::Config(
                "HALLDESK_OFFER_PREFIX must be alphanumeric".to_string(),
            ));
        }

        let probe_timeout = seconds(&lookup, "HALLDESK_PROBE_TIMEOUT_SECS", 5, 1..=30)?;
        let http_timeout = seconds(&lookup, "HALLDESK_HTTP_TIMEOUT_SECS", 20, 1..=60)?;
        let metadata_timeout = seconds(&lookup, "HALLDESK_METADATA_TIMEOUT_SECS", 5, 1..=30)?;
        let snapshot_timeout = seconds(&lookup, "HALLDESK_SNAPSHOT_TIMEOUT_SECS", 30, 1..=300)?;
        let outbox_interval = seconds(&lookup, "HALLDESK_OUTBOX_INTERVAL_SECS", 30, 1..=3_600)?;
        let mail_interval = seconds(&lookup, "HALLDESK_MAIL_INTERVAL_SECS", 60, 1..=3_600)?;
        let snapshot_every_passes =
            bounded(&lookup, "HALLDESK_SNAPSHOT_EVERY_PASSES", 20, 1..=1_000)?;
        let mail_batch_size = bounded(&lookup, "HALLDESK_MAIL_BATCH_SIZE", 20, 1..=500)?;
        let mail_max_retries = bounded(&lookup, "HALLDESK_MAIL_MAX_RETRIES", 6, 1..=50)?;

        Ok(Self {
            device_id,
            api_base_url,
            api_token,
            mail_relay_url,
            connectivity_url,
            offer_prefix,
            probe_timeout,
            http_timeout,
            metadata_timeout,
            snapshot_timeout,
            outbox_interval,
            mail_interval,
            snapshot_every_passes,
            mail_batch_size: usize::try_from(mail_batch_size).unwrap_or(usize::MAX),
            mail_max_retries: u32::try_from(mail_max_retries).unwrap_or(u32::MAX),
        })
    }

    pub fn mail_worker(&self) -> MailWorkerConfig {
        MailWorkerConfig {
            batch_size: self.mail_batch_size,
            max_retries: self.mail_max_retries,
            ..MailWorkerConfig::default()
        }
    }

    pub const fn sync_timeouts(&self) -> SyncTimeouts {
        SyncTimeouts {
            metadata: self.metadata_timeout,
            snapshot: self.snapshot_timeout,
        }
    }
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    normalize_text_option(lookup(name))
}

fn optional_url(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<String>> {
    let Some(url) = optional_trimmed(lookup, name) else {
        return Ok(None);
    };
    if !is_http_url(&url) {
        return Err(Error::Config(format!(
            "{name} must start with http:// or https://"
        )));
    }
    Ok(Some(url.trim_end_matches('/').to_string()))
}

fn bounded(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: u64,
    range: RangeInclusive<u64>,
) -> Result<u64> {
    let invalid = || {
        Error::Config(format!(
            "{name} must be an integer in [{}, {}]",
            range.start(),
            range.end()
        ))
    };
    let value = match optional_trimmed(lookup, name) {
        Some(raw) => raw.parse::<u64>().map_err(|_| invalid())?,
        None => default,
    };
    if !range.contains(&value) {
        return Err(invalid());
    }
    Ok(value)
}

fn seconds(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: u64,
    range: RangeInclusive<u64>,
) -> Result<Duration> {
    bounded(lookup, name, default, range).map(Duration::from_secs)
}
