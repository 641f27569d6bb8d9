//! HTTP collaborators for the mail relay and the numbering authority.

use std::time::Duration;

use halldesk_core::mail::{MailTransport, OutgoingMail, SendReceipt};
use halldesk_core::models::SequenceKey;
use halldesk_core::numbering::NumberingAuthority;
use halldesk_core::util::compact_text;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::{Deserialize, Serialize};

use crate::error::CliError;

/// Shared client with a per-request timeout, carrying the API bearer token
/// when one is configured
pub fn build_http_client(
    api_token: Option<&str>,
    timeout: Duration,
) -> Result<reqwest::Client, CliError> {
    let mut headers = HeaderMap::new();
    if let Some(token) = api_token {
        let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| CliError::Config("HALLDESK_API_TOKEN contains invalid characters".into()))?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    }

    reqwest::Client::builder()
        .default_headers(headers)
        .timeout(timeout)
        .build()
        .map_err(|error| CliError::Config(format!("failed to build HTTP client: {error}")))
}

async fn error_from_response(response: reqwest::Response) -> String {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    format!("HTTP {status}: {}", compact_text(&body))
}

/// Posts each outgoing mail as JSON to a relay that answers with a send receipt
pub struct HttpMailRelay {
    client: reqwest::Client,
    url: String,
}

impl HttpMailRelay {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait::async_trait]
impl MailTransport for HttpMailRelay {
    async fn send(&self, mail: &OutgoingMail) -> Result<SendReceipt, String> {
        let response = self
            .client
            .post(&self.url)
            .json(mail)
            .send()
            .await
            .map_err(|error| format!("mail relay request failed: {error}"))?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        response
            .json::<SendReceipt>()
            .await
            .map_err(|error| format!("invalid mail relay receipt: {error}"))
    }
}

/// Stand-in transport for commands that only queue or inspect mail
pub struct UnconfiguredRelay;

#[async_trait::async_trait]
impl MailTransport for UnconfiguredRelay {
    async fn send(&self, _mail: &OutgoingMail) -> Result<SendReceipt, String> {
        Err("mail relay not configured".to_string())
    }
}

#[derive(Debug, Serialize)]
struct ReserveRequest<'a> {
    counter_key: String,
    prefix: &'a str,
    initial: &'a str,
    year: i32,
}

#[derive(Debug, Deserialize)]
struct ReserveResponse {
    sequence: i64,
}

/// Reserves canonical sequences at `{api_base}/v1/numbering/reserve`
pub struct HttpNumberingAuthority {
    client: reqwest::Client,
    url: String,
}

impl HttpNumberingAuthority {
    pub fn new(client: reqwest::Client, api_base: &str) -> Self {
        Self {
            client,
            url: format!("{}/v1/numbering/reserve", api_base.trim_end_matches('/')),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait::async_trait]
impl NumberingAuthority for HttpNumberingAuthority {
    async fn reserve(&self, key: &SequenceKey) -> Result<i64, String> {
        let request = ReserveRequest {
            counter_key: key.counter_key(),
            prefix: key.prefix(),
            initial: key.initial(),
            year: key.year(),
        };
        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|error| format!("numbering authority request failed: {error}"))?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        let body: ReserveResponse = response
            .json()
            .await
            .map_err(|error| format!("invalid numbering authority response: {error}"))?;
        if body.sequence < 1 {
            return Err(format!(
                "numbering authority returned invalid sequence {}",
                body.sequence
            ));
        }
        Ok(body.sequence)
    }
}
