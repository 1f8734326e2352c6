//! Single-shot HTTP health probing.

use std::time::Duration;

use tracing::{debug, warn};

use crate::http::NGROK_SKIP_WARNING_HEADER;

/// Which path of a service is probed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTarget {
    /// `GET {url}/health`
    Health,
    /// `GET {url}`, for services without a health route.
    Root,
}

impl HealthTarget {
    fn url_for(self, base: &str) -> String {
        match self {
            Self::Health => format!("{}/health", base.trim_end_matches('/')),
            Self::Root => base.to_string(),
        }
    }
}

/// Something that can tell whether an endpoint is alive.
pub trait EndpointProbe: Send + Sync {
    /// `true` if `url` answered successfully. Never fails.
    fn probe(&self, url: &str, target: HealthTarget) -> impl Future<Output = bool> + Send;

    /// Probe two URLs concurrently and wait for both.
    fn probe_pair(
        &self,
        first: &str,
        second: &str,
        target: HealthTarget,
    ) -> impl Future<Output = (bool, bool)> + Send {
        async move { tokio::join!(self.probe(first, target), self.probe(second, target)) }
    }
}

/// Reports whether an endpoint is alive over HTTP. Never fails: every error
/// becomes `false`. Retrying is up to the caller.
#[derive(Debug, Clone)]
pub struct HealthProber {
    http: reqwest::Client,
    timeout: Duration,
}

impl HealthProber {
    pub const fn new(http: reqwest::Client, timeout: Duration) -> Self {
        Self { http, timeout }
    }

    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Probe `url` once. `true` only for a 2xx response within the timeout.
    pub async fn probe(&self, url: &str, target: HealthTarget) -> bool {
        let probe_url = target.url_for(url);
        let result = self
            .http
            .get(&probe_url)
            .header(NGROK_SKIP_WARNING_HEADER, "true")
            .timeout(self.timeout)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                debug!(url = %probe_url, status = resp.status().as_u16(), "Probe succeeded");
                true
            }
            Ok(resp) => {
                warn!(
                    url = %probe_url,
                    status = resp.status().as_u16(),
                    "Probe returned non-success status"
                );
                false
            }
            Err(e) => {
                warn!(url = %probe_url, error = %e, timeout = e.is_timeout(), "Probe failed");
                false
            }
        }
    }
}

impl EndpointProbe for HealthProber {
    async fn probe(&self, url: &str, target: HealthTarget) -> bool {
        Self::probe(self, url, target).await
    }
}
