//! DuckDNS publishing.
//!
//! The current URL pair is stored as the TXT record of the configured DuckDNS
//! domain, as a small JSON document.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use tunnelsync_core::config::DuckDnsConfig;

use crate::discovery::TunnelEndpoints;
use crate::events::{Event, EventBus};

/// Schema version stamped on every published record.
pub const RECORD_VERSION: &str = "1.0";

/// Marker DuckDNS puts in the body of a successful update.
const SUCCESS_MARKER: &str = "OK";

/// Payload of the TXT record. Built fresh for every publish attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecord {
    pub frontend: String,
    pub backend: String,
    /// RFC 3339 UTC timestamp.
    pub updated_at: String,
    pub version: String,
}

impl DnsRecord {
    pub fn from_endpoints(endpoints: &TunnelEndpoints) -> Self {
        Self {
            frontend: endpoints.frontend.clone().unwrap_or_default(),
            backend: endpoints.backend.clone().unwrap_or_default(),
            updated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            version: RECORD_VERSION.to_string(),
        }
    }
}

/// Errors from DuckDNS publishing.
#[derive(Debug, thiserror::Error)]
pub enum DnsError {
    /// Credentials are absent. Never worth retrying.
    #[error("DuckDNS credentials not configured: {0}")]
    Configuration(String),

    #[error("DuckDNS update failed: {0}")]
    Publish(String),
}

impl DnsError {
    /// Whether retrying could change the outcome.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Publish(_))
    }
}

/// Destination for validated endpoints.
pub trait RecordPublisher: Send + Sync {
    fn publish(
        &self,
        endpoints: &TunnelEndpoints,
    ) -> impl Future<Output = Result<DnsRecord, DnsError>> + Send;
}

/// Publishes [`DnsRecord`]s to DuckDNS.
#[derive(Debug, Clone)]
pub struct DnsPublisher {
    http: reqwest::Client,
    config: DuckDnsConfig,
    events: EventBus,
}

impl DnsPublisher {
    pub const fn new(http: reqwest::Client, config: DuckDnsConfig, events: EventBus) -> Self {
        Self {
            http,
            config,
            events,
        }
    }

    fn update_url(&self) -> String {
        format!("{}/update", self.config.base_url.trim_end_matches('/'))
    }

    fn credentials(&self) -> Result<(&str, &str), DnsError> {
        let domain = self
            .config
            .domain
            .as_deref()
            .filter(|d| !d.is_empty())
            .ok_or_else(|| DnsError::Configuration("DUCKDNS_DOMAIN is not set".into()))?;
        let token = self
            .config
            .token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| DnsError::Configuration("DUCKDNS_TOKEN is not set".into()))?;
        Ok((domain, token))
    }

    /// Publish `endpoints` as the TXT record of the configured domain.
    ///
    /// Credentials are checked before anything goes over the wire. The
    /// update counts as accepted only if the response body contains `OK`.
    pub async fn publish(&self, endpoints: &TunnelEndpoints) -> Result<DnsRecord, DnsError> {
        let (domain, token) = self.credentials()?;

        let record = DnsRecord::from_endpoints(endpoints);
        let txt = serde_json::to_string(&record)
            .map_err(|e| DnsError::Publish(format!("failed to encode record: {e}")))?;

        debug!(domain, "Sending DuckDNS update");
        let resp = self
            .http
            .get(self.update_url())
            .query(&[("domains", domain), ("token", token), ("txt", txt.as_str())])
            .send()
            .await
            .map_err(|e| DnsError::Publish(e.without_url().to_string()))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| DnsError::Publish(e.without_url().to_string()))?;

        if !body.contains(SUCCESS_MARKER) {
            warn!(
                domain,
                status = status.as_u16(),
                body = %body.trim(),
                "DuckDNS rejected update"
            );
            return Err(DnsError::Publish(format!(
                "provider answered HTTP {} with {:?}",
                status.as_u16(),
                body.trim()
            )));
        }

        info!(
            domain,
            frontend = %record.frontend,
            backend = %record.backend,
            "DuckDNS record updated"
        );
        self.events.emit(&Event::DuckDnsUpdated(record.clone()));
        Ok(record)
    }
}

impl RecordPublisher for DnsPublisher {
    async fn publish(&self, endpoints: &TunnelEndpoints) -> Result<DnsRecord, DnsError> {
        Self::publish(self, endpoints).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn publisher(domain: Option<&str>, token: Option<&str>) -> DnsPublisher {
        let config = DuckDnsConfig {
            enabled: true,
            domain: domain.map(Into::into),
            token: token.map(Into::into),
            // Nothing listens here; these tests must fail before any request.
            base_url: "http://127.0.0.1:9".into(),
        };
        DnsPublisher::new(crate::http::build_client().unwrap(), config, EventBus::new())
    }

    #[test]
    fn record_carries_endpoints_and_version() {
        let endpoints = TunnelEndpoints::new("https://a.ngrok.io", "https://b.ngrok.io");
        let record = DnsRecord::from_endpoints(&endpoints);
        assert_eq!(record.frontend, "https://a.ngrok.io");
        assert_eq!(record.backend, "https://b.ngrok.io");
        assert_eq!(record.version, "1.0");
        assert!(chrono::DateTime::parse_from_rfc3339(&record.updated_at).is_ok());
    }

    #[tokio::test]
    async fn missing_domain_is_configuration_error() {
        let endpoints = TunnelEndpoints::new("https://a.ngrok.io", "https://b.ngrok.io");
        let err = publisher(None, Some("tok")).publish(&endpoints).await.unwrap_err();
        assert!(matches!(err, DnsError::Configuration(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn empty_token_is_configuration_error() {
        let endpoints = TunnelEndpoints::new("https://a.ngrok.io", "https://b.ngrok.io");
        let err = publisher(Some("inventory"), Some("")).publish(&endpoints).await.unwrap_err();
        assert!(matches!(err, DnsError::Configuration(_)));
    }

    #[tokio::test]
    async fn transport_failure_is_publish_error() {
        let endpoints = TunnelEndpoints::new("https://a.ngrok.io", "https://b.ngrok.io");
        let err = publisher(Some("inventory"), Some("tok"))
            .publish(&endpoints)
            .await
            .unwrap_err();
        assert!(matches!(err, DnsError::Publish(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn update_url_strips_trailing_slash() {
        let mut p = publisher(Some("d"), Some("t"));
        p.config.base_url = "https://www.duckdns.org/".into();
        assert_eq!(p.update_url(), "https://www.duckdns.org/update");
    }
}
