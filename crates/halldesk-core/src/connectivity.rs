//! Reachability probe gating the network-bound loops

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Default endpoint answered with 204 by a widely available service
pub const DEFAULT_PROBE_URL: &str = "https://clients3.google.com/generate_204";

/// Answers whether the outside world is currently reachable
#[async_trait::async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

/// HEAD request against a fixed endpoint under a bounded timeout.
///
/// Any response below 500 counts as reachable; a timeout, connection
/// failure or server error does not.
pub struct HttpConnectivityProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpConnectivityProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> crate::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| crate::Error::Config(format!("failed to build HTTP client: {error}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait::async_trait]
impl ConnectivityProbe for HttpConnectivityProbe {
    async fn is_reachable(&self) -> bool {
        match self.client.head(&self.url).send().await {
            Ok(response) => {
                let reachable = !response.status().is_server_error();
                tracing::debug!(
                    "Connectivity probe {} answered {} (reachable: {reachable})",
                    self.url,
                    response.status()
                );
                reachable
            }
            Err(error) => {
                tracing::debug!("Connectivity probe {} failed: {error}", self.url);
                false
            }
        }
    }
}

/// Probe with a fixed, switchable answer; used when no endpoint is configured
#[derive(Debug, Default)]
pub struct StaticProbe {
    online: AtomicBool,
}

impl StaticProbe {
    pub const fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl ConnectivityProbe for StaticProbe {
    async fn is_reachable(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn static_probe_follows_switch() {
        let probe = StaticProbe::new(false);
        assert!(!probe.is_reachable().await);
        probe.set_online(true);
        assert!(probe.is_reachable().await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unroutable_endpoint_is_unreachable() {
        // Port 9 on localhost is not listening; the connection is refused quickly
        let probe =
            HttpConnectivityProbe::new("http://127.0.0.1:9/", Duration::from_millis(500)).unwrap();
        assert!(!probe.is_reachable().await);
    }
}
