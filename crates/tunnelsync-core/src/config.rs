//! Configuration for tunnelsync.
//!
//! A single `Config` is built once at startup and passed by reference to
//! every component constructor. Resolution order (lowest to highest):
//! 1. Built-in defaults
//! 2. Optional JSON config file
//! 3. Environment variables / CLI arguments (applied by the binary)

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Complete tunnelsync configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub ports: PortConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Retry policy for discovery inside a monitoring tick.
    #[serde(default = "RetryPolicy::monitoring")]
    pub monitor_retry: RetryPolicy,
    /// Retry policy for startup-level operations.
    #[serde(default = "RetryPolicy::startup")]
    pub startup_retry: RetryPolicy,
    #[serde(default)]
    pub duckdns: DuckDnsConfig,
    #[serde(default)]
    pub services: ServiceConfig,
    /// Statically assigned public URL. When set, tunnel discovery is skipped.
    ///
    /// Unlike discovered tunnels, a plain `http://` URL is accepted here (for
    /// local setups) and only warned about.
    #[serde(default)]
    pub static_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ports: PortConfig::default(),
            timeouts: TimeoutConfig::default(),
            monitor_retry: RetryPolicy::monitoring(),
            startup_retry: RetryPolicy::startup(),
            duckdns: DuckDnsConfig::default(),
            services: ServiceConfig::default(),
            static_url: None,
        }
    }
}

/// Local port numbers of the managed services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortConfig {
    pub frontend: u16,
    pub backend: u16,
    /// Port of the tunnel broker's local introspection API.
    pub broker: u16,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            frontend: 3000,
            backend: 5000,
            broker: 4040,
        }
    }
}

impl PortConfig {
    /// All configured ports, in reclamation order.
    pub const fn all(&self) -> [u16; 3] {
        [self.frontend, self.backend, self.broker]
    }
}

/// Timeouts and intervals, in milliseconds unless noted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Timeout for the broker introspection request.
    pub broker_ms: u64,
    /// Timeout for a single health probe.
    pub health_check_ms: u64,
    /// Interval between monitoring ticks (seconds).
    pub monitor_interval_secs: u64,
    /// Attempts when polling a freshly spawned service until it is healthy.
    pub service_poll_attempts: u32,
    /// Delay between service health polls.
    pub service_poll_interval_ms: u64,
    /// Grace period between SIGTERM and SIGKILL for supervised processes.
    pub terminate_grace_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            broker_ms: 30_000,
            health_check_ms: 5_000,
            monitor_interval_secs: 5 * 60,
            service_poll_attempts: 60,
            service_poll_interval_ms: 1_000,
            terminate_grace_ms: 5_000,
        }
    }
}

impl TimeoutConfig {
    pub const fn broker(&self) -> Duration {
        Duration::from_millis(self.broker_ms)
    }

    pub const fn health_check(&self) -> Duration {
        Duration::from_millis(self.health_check_ms)
    }

    pub const fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    pub const fn service_poll_interval(&self) -> Duration {
        Duration::from_millis(self.service_poll_interval_ms)
    }

    pub const fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }
}

/// Fixed-delay retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first. Always >= 1.
    pub max_attempts: u32,
    /// Delay between consecutive attempts.
    pub delay_ms: u64,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, delay_ms: u64) -> Self {
        Self {
            max_attempts,
            delay_ms,
        }
    }

    /// Policy used for discovery inside a monitoring tick.
    pub const fn monitoring() -> Self {
        Self::new(10, 3_000)
    }

    /// Policy used for startup-level operations.
    pub const fn startup() -> Self {
        Self::new(3, 2_000)
    }

    pub const fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// DuckDNS credentials and endpoint.
#[derive(Clone, Serialize, Deserialize)]
pub struct DuckDnsConfig {
    /// When `true`, `domain` and `token` are required at startup.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    /// Base URL of the provider (the `/update` path is appended).
    #[serde(default = "DuckDnsConfig::default_base_url")]
    pub base_url: String,
}

impl DuckDnsConfig {
    fn default_base_url() -> String {
        "https://www.duckdns.org".to_string()
    }
}

impl Default for DuckDnsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            domain: None,
            token: None,
            base_url: Self::default_base_url(),
        }
    }
}

impl std::fmt::Debug for DuckDnsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuckDnsConfig")
            .field("enabled", &self.enabled)
            .field("domain", &self.domain)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Locations and commands of the supervised services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub backend_dir: PathBuf,
    pub frontend_dir: PathBuf,
    /// ngrok configuration file. When it exists, all tunnels defined in it
    /// are started; otherwise tunnels are opened for the two service ports.
    pub ngrok_config: PathBuf,
    /// Program used to run the backend and frontend scripts.
    pub npm_bin: PathBuf,
    pub ngrok_bin: PathBuf,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            backend_dir: PathBuf::from("./backend"),
            frontend_dir: PathBuf::from("./frontend"),
            ngrok_config: PathBuf::from("./ngrok.yml"),
            npm_bin: PathBuf::from("npm"),
            ngrok_bin: PathBuf::from("ngrok"),
        }
    }
}

impl Config {
    /// Load a JSON config file. Missing sections fall back to defaults.
    pub fn load_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let config = serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
        })?;
        tracing::debug!(path = %path.display(), "Loaded config file");
        Ok(config)
    }

    /// Check invariants that must hold before any component is built.
    pub fn validate(&self) -> Result<()> {
        for (name, policy) in [
            ("monitor_retry", &self.monitor_retry),
            ("startup_retry", &self.startup_retry),
        ] {
            if policy.max_attempts == 0 {
                return Err(Error::Config(format!(
                    "{name}.max_attempts must be at least 1"
                )));
            }
        }

        if self.timeouts.monitor_interval_secs == 0 {
            return Err(Error::Config(
                "monitor_interval_secs must be greater than zero".into(),
            ));
        }

        if self.duckdns.enabled {
            let mut missing = Vec::new();
            if self.duckdns.domain.as_deref().is_none_or(str::is_empty) {
                missing.push("DUCKDNS_DOMAIN".to_string());
            }
            if self.duckdns.token.as_deref().is_none_or(str::is_empty) {
                missing.push("DUCKDNS_TOKEN".to_string());
            }
            if !missing.is_empty() {
                return Err(Error::MissingEnv(missing));
            }
        }

        if let Some(url) = &self.static_url {
            if url.starts_with("http://") {
                tracing::warn!(url = %url, "Static URL is plain HTTP; public endpoints will not use TLS");
            } else if !url.starts_with("https://") {
                return Err(Error::Config(format!(
                    "static_url must be an http(s) URL, got {url}"
                )));
            }
        }

        Ok(())
    }

    /// Local URL of the backend service.
    pub fn local_backend_url(&self) -> String {
        format!("http://localhost:{}", self.ports.backend)
    }

    /// Local URL of the frontend service.
    pub fn local_frontend_url(&self) -> String {
        format!("http://localhost:{}", self.ports.frontend)
    }

    /// URL of the tunnel broker's introspection endpoint.
    pub fn broker_api_url(&self) -> String {
        format!("http://localhost:{}/api/tunnels", self.ports.broker)
    }
}
