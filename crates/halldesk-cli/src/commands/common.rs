use std::env;
use std::path::PathBuf;

use chrono::{Datelike, Utc};
use halldesk_core::models::{MessageHistoryEntry, OperationType, OutboxRecord};

use crate::error::CliError;

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("HALLDESK_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("halldesk")
        .join("halldesk.db")
}

pub fn current_year() -> i32 {
    Utc::now().year()
}

pub fn parse_operation(value: &str) -> Result<OperationType, CliError> {
    value.parse().map_err(CliError::InvalidArgument)
}

pub fn parse_payload(value: &str) -> Result<serde_json::Value, CliError> {
    serde_json::from_str(value)
        .map_err(|error| CliError::InvalidArgument(format!("payload is not valid JSON: {error}")))
}

pub fn format_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else {
        format!("{}d ago", diff / day)
    }
}

/// Human-readable delivery state of an outbox record
pub fn outbox_state(record: &OutboxRecord, now_ms: i64) -> String {
    if record.processed_at.is_some() {
        return "processed".to_string();
    }
    if record.failed_at.is_some() {
        return format!(
            "failed: {}",
            record.last_error.as_deref().unwrap_or("unknown error")
        );
    }
    match record.next_attempt_at {
        Some(next) if next > now_ms => format!(
            "retry {}/{} in {}s",
            record.retry_count,
            record.max_retries,
            (next - now_ms + 999) / 1_000
        ),
        _ if record.retry_count > 0 => {
            format!("retry {}/{} due", record.retry_count, record.max_retries)
        }
        _ => "pending".to_string(),
    }
}

pub fn format_outbox_lines(records: &[OutboxRecord], now_ms: i64) -> Vec<String> {
    records
        .iter()
        .map(|record| {
            let id = record.id.to_string();
            let short_id = id.chars().take(13).collect::<String>();
            let relative_time = format_relative_time(record.created_at, now_ms);
            format!(
                "{short_id:<13}  {:<17}  {relative_time:<10}  {}",
                record.operation_type,
                outbox_state(record, now_ms)
            )
        })
        .collect()
}

pub fn format_history_lines(entries: &[MessageHistoryEntry]) -> Vec<String> {
    entries
        .iter()
        .map(|entry| {
            let outcome = match &entry.error {
                Some(error) => format!("failed: {error}"),
                None => "sent".to_string(),
            };
            format!(
                "{}  {:<40}  {}  {outcome}",
                format_timestamp(entry.created_at),
                entry.to.join(", "),
                entry.subject
            )
        })
        .collect()
}
