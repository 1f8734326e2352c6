//! ngrok tunnel discovery.
//!
//! Reads the broker's local introspection API (`/api/tunnels`) and maps each
//! tunnel to a role (frontend or backend) by the local port it forwards to.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use tunnelsync_core::Config;

const SECURE_SCHEME: &str = "https://";

/// Public URLs of the two roles, produced fresh by each discovery run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelEndpoints {
    pub frontend: Option<String>,
    pub backend: Option<String>,
}

impl TunnelEndpoints {
    pub fn new(frontend: impl Into<String>, backend: impl Into<String>) -> Self {
        Self {
            frontend: Some(frontend.into()),
            backend: Some(backend.into()),
        }
    }

    /// Both roles resolved.
    pub const fn is_complete(&self) -> bool {
        self.frontend.is_some() && self.backend.is_some()
    }
}

/// One entry of the broker's tunnel list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tunnel {
    pub public_url: String,
    #[serde(default)]
    pub config: TunnelForward,
}

/// Local forwarding target of a tunnel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TunnelForward {
    #[serde(default)]
    pub addr: String,
}

#[derive(Debug, Deserialize)]
struct TunnelList {
    #[serde(default)]
    tunnels: Vec<Tunnel>,
}

/// Errors from tunnel discovery.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Tunnel broker unreachable at {url}: {reason}")]
    Unreachable { url: String, reason: String },

    #[error("Tunnel broker returned HTTP {status}")]
    BrokerStatus { status: u16 },

    #[error("Invalid tunnel list from broker: {0}")]
    InvalidResponse(String),

    #[error("Tunnel public URL is not HTTPS: {0}")]
    InsecureUrl(String),

    #[error("No tunnel found for role(s): {}", .missing.join(", "))]
    MissingRole { missing: Vec<&'static str> },
}

/// `true` when `addr` contains `:<port>` not followed by another digit.
fn forwards_to_port(addr: &str, port: u16) -> bool {
    let needle = format!(":{port}");
    addr.match_indices(&needle).any(|(idx, _)| {
        !addr[idx + needle.len()..]
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_digit())
    })
}

/// Assign roles to tunnels.
///
/// Every tunnel must have an HTTPS public URL; a single insecure one aborts
/// discovery. The first tunnel forwarding to a role's port wins that role.
pub fn map_tunnels(
    tunnels: &[Tunnel],
    frontend_port: u16,
    backend_port: u16,
) -> Result<TunnelEndpoints, DiscoveryError> {
    let mut endpoints = TunnelEndpoints::default();

    for tunnel in tunnels {
        if !tunnel.public_url.starts_with(SECURE_SCHEME) {
            return Err(DiscoveryError::InsecureUrl(tunnel.public_url.clone()));
        }

        let addr = tunnel.config.addr.as_str();
        if forwards_to_port(addr, frontend_port) {
            if endpoints.frontend.is_none() {
                endpoints.frontend = Some(tunnel.public_url.clone());
            }
        } else if forwards_to_port(addr, backend_port) && endpoints.backend.is_none() {
            endpoints.backend = Some(tunnel.public_url.clone());
        }
    }

    let mut missing = Vec::new();
    if endpoints.frontend.is_none() {
        missing.push("frontend");
    }
    if endpoints.backend.is_none() {
        missing.push("backend");
    }
    if !missing.is_empty() {
        return Err(DiscoveryError::MissingRole { missing });
    }

    Ok(endpoints)
}

/// Anything that can resolve the current [`TunnelEndpoints`].
pub trait TunnelSource: Send + Sync {
    fn discover(&self) -> impl Future<Output = Result<TunnelEndpoints, DiscoveryError>> + Send;
}

/// Queries the tunnel broker and resolves [`TunnelEndpoints`].
#[derive(Debug, Clone)]
pub struct TunnelDiscoverer {
    http: reqwest::Client,
    api_url: String,
    frontend_port: u16,
    backend_port: u16,
    timeout: Duration,
}

impl TunnelDiscoverer {
    pub const fn new(
        http: reqwest::Client,
        api_url: String,
        frontend_port: u16,
        backend_port: u16,
        timeout: Duration,
    ) -> Self {
        Self {
            http,
            api_url,
            frontend_port,
            backend_port,
            timeout,
        }
    }

    pub fn from_config(http: reqwest::Client, config: &Config) -> Self {
        Self::new(
            http,
            config.broker_api_url(),
            config.ports.frontend,
            config.ports.backend,
            config.timeouts.broker(),
        )
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Fetch the raw tunnel list from the broker.
    pub async fn list_tunnels(&self) -> Result<Vec<Tunnel>, DiscoveryError> {
        let resp = self
            .http
            .get(&self.api_url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| DiscoveryError::Unreachable {
                url: self.api_url.clone(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(DiscoveryError::BrokerStatus {
                status: status.as_u16(),
            });
        }

        let list: TunnelList = resp
            .json()
            .await
            .map_err(|e| DiscoveryError::InvalidResponse(e.to_string()))?;
        debug!(count = list.tunnels.len(), "Fetched tunnel list");
        Ok(list.tunnels)
    }

    /// Resolve both roles from the broker's current tunnels.
    pub async fn discover(&self) -> Result<TunnelEndpoints, DiscoveryError> {
        let tunnels = self.list_tunnels().await?;
        let endpoints = map_tunnels(&tunnels, self.frontend_port, self.backend_port)?;
        info!(
            frontend = endpoints.frontend.as_deref().unwrap_or_default(),
            backend = endpoints.backend.as_deref().unwrap_or_default(),
            "Discovered tunnels"
        );
        Ok(endpoints)
    }
}

impl TunnelSource for TunnelDiscoverer {
    async fn discover(&self) -> Result<TunnelEndpoints, DiscoveryError> {
        Self::discover(self).await
    }
}
