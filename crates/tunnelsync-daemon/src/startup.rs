//! Bring-up and tear-down of the whole development stack.
//!
//! Ports are reclaimed, the backend and frontend are spawned and polled
//! until healthy, the tunnel is configured (static URL or ngrok), the public
//! endpoints are validated and, for dynamic tunnels, the monitoring loop is
//! started. Any failure tears everything down again.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use tunnelsync_core::Config;

use crate::discovery::{DiscoveryError, TunnelDiscoverer, TunnelEndpoints};
use crate::events::{Event, EventBus};
use crate::monitor::UrlMonitor;
use crate::ports;
use crate::probe::{EndpointProbe, HealthProber, HealthTarget};
use crate::retry::retry;
use crate::supervisor::{ProcessSpec, ProcessSupervisor, ServiceName, SupervisorError};

/// Progress of [`StartupCoordinator::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupStage {
    Idle,
    ClearingPorts,
    Spawning,
    ConfiguringTunnel,
    Validating,
    Monitoring,
    Ready,
    Failed,
}

impl std::fmt::Display for StartupStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::ClearingPorts => "clearing-ports",
            Self::Spawning => "spawning",
            Self::ConfiguringTunnel => "configuring-tunnel",
            Self::Validating => "validating",
            Self::Monitoring => "monitoring",
            Self::Ready => "ready",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Why startup failed.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("{service} did not become ready after {attempts} attempts")]
    ProcessStart {
        service: ServiceName,
        attempts: u32,
    },

    #[error("{service} project at {} is unusable: {reason}", .path.display())]
    ProjectDir {
        service: ServiceName,
        path: PathBuf,
        reason: String,
    },

    #[error("Installing {service} dependencies failed: {reason}")]
    Install {
        service: ServiceName,
        reason: String,
    },

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error("Tunnel discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error(
        "Public endpoint validation failed (frontend healthy: {frontend_healthy}, backend healthy: {backend_healthy})"
    )]
    Validation {
        frontend_healthy: bool,
        backend_healthy: bool,
    },
}

/// Poll `url` until it answers or `attempts` probes have failed.
///
/// Waits `interval` between probes, never after the last one.
pub async fn wait_for_service<P: EndpointProbe>(
    prober: &P,
    url: &str,
    target: HealthTarget,
    attempts: u32,
    interval: Duration,
) -> bool {
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        if prober.probe(url, target).await {
            debug!(url, attempt, "Service is ready");
            return true;
        }
        if attempt < attempts {
            sleep(interval).await;
        }
    }
    false
}

/// Check that `dir` is a directory holding a `package.json`.
pub fn check_project_dir(service: ServiceName, dir: &Path) -> Result<(), StartupError> {
    let fail = |reason: &str| StartupError::ProjectDir {
        service,
        path: dir.to_path_buf(),
        reason: reason.to_string(),
    };
    if !dir.is_dir() {
        return Err(fail("not a directory"));
    }
    if !dir.join("package.json").is_file() {
        return Err(fail("package.json not found"));
    }
    Ok(())
}

/// Arguments for the ngrok process: every tunnel of the config file when it
/// exists, otherwise one HTTP tunnel per service port.
pub fn broker_args(config: &Config) -> Vec<String> {
    let config_file = &config.services.ngrok_config;
    if config_file.is_file() {
        let config_file = std::fs::canonicalize(config_file).unwrap_or_else(|_| config_file.clone());
        vec![
            "start".into(),
            "--config".into(),
            config_file.display().to_string(),
            "--all".into(),
            "--log=stdout".into(),
        ]
    } else {
        vec![
            "http".into(),
            "--log=stdout".into(),
            config.ports.frontend.to_string(),
            config.ports.backend.to_string(),
        ]
    }
}

/// Owns the supervised processes and the monitoring loop of one stack.
pub struct StartupCoordinator {
    config: Config,
    http: reqwest::Client,
    prober: HealthProber,
    supervisor: ProcessSupervisor,
    events: EventBus,
    monitor: Option<UrlMonitor>,
    stage: StartupStage,
    public_urls: Option<TunnelEndpoints>,
}

impl StartupCoordinator {
    pub fn new(config: Config, http: reqwest::Client, events: EventBus) -> Self {
        Self {
            prober: HealthProber::new(http.clone(), config.timeouts.health_check()),
            supervisor: ProcessSupervisor::new(config.timeouts.terminate_grace()),
            config,
            http,
            events,
            monitor: None,
            stage: StartupStage::Idle,
            public_urls: None,
        }
    }

    pub const fn stage(&self) -> StartupStage {
        self.stage
    }

    /// Public endpoints resolved by the last successful `start`.
    pub const fn public_urls(&self) -> Option<&TunnelEndpoints> {
        self.public_urls.as_ref()
    }

    pub const fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub const fn monitor(&self) -> Option<&UrlMonitor> {
        self.monitor.as_ref()
    }

    /// Bring the whole stack up.
    ///
    /// On failure everything that was started is torn down before the error
    /// is returned, and [`Event::StartupError`] is emitted.
    pub async fn start(&mut self) -> Result<TunnelEndpoints, Arc<StartupError>> {
        match self.bring_up().await {
            Ok(endpoints) => {
                self.set_stage(StartupStage::Ready);
                self.events.emit(&Event::ServicesStarted);
                Ok(endpoints)
            }
            Err(e) => {
                self.set_stage(StartupStage::Failed);
                error!(error = %e, "Startup failed");
                self.cleanup().await;
                let e = Arc::new(e);
                self.events.emit(&Event::StartupError(Arc::clone(&e)));
                Err(e)
            }
        }
    }

    /// Stop monitoring, terminate every process and free the ports.
    pub async fn stop_services(&mut self) {
        info!("Stopping services");
        self.cleanup().await;
        self.public_urls = None;
        self.set_stage(StartupStage::Idle);
        self.events.emit(&Event::ServicesStopped);
    }

    async fn bring_up(&mut self) -> Result<TunnelEndpoints, StartupError> {
        self.set_stage(StartupStage::ClearingPorts);
        ports::reclaim_ports(&self.config.ports.all()).await;

        self.set_stage(StartupStage::Spawning);
        self.start_backend().await?;
        self.start_frontend().await?;

        self.set_stage(StartupStage::ConfiguringTunnel);
        let (endpoints, dynamic) = match &self.config.static_url {
            Some(url) => {
                info!(url = %url, "Using static tunnel URL");
                (TunnelEndpoints::new(url.clone(), url.clone()), false)
            }
            None => (self.start_tunnel().await?, true),
        };

        self.set_stage(StartupStage::Validating);
        self.validate(&endpoints).await?;

        if dynamic {
            self.set_stage(StartupStage::Monitoring);
            let monitor = UrlMonitor::from_config(&self.http, &self.config, self.events.clone());
            monitor.start().await;
            self.monitor = Some(monitor);
        }

        self.log_summary(&endpoints);
        self.public_urls = Some(endpoints.clone());
        Ok(endpoints)
    }

    async fn start_backend(&self) -> Result<(), StartupError> {
        let services = &self.config.services;
        let spec = ProcessSpec::new(&services.npm_bin)
            .args(["run", "dev"])
            .current_dir(&services.backend_dir)
            .env("PORT", self.config.ports.backend.to_string());
        self.supervisor.spawn(ServiceName::Backend, spec).await?;
        self.await_ready(
            ServiceName::Backend,
            &self.config.local_backend_url(),
            HealthTarget::Health,
        )
        .await
    }

    async fn start_frontend(&self) -> Result<(), StartupError> {
        let services = &self.config.services;
        check_project_dir(ServiceName::Frontend, &services.frontend_dir)?;
        self.install_dependencies(ServiceName::Frontend, &services.frontend_dir)
            .await?;

        let spec = ProcessSpec::new(&services.npm_bin)
            .args(["start"])
            .current_dir(&services.frontend_dir)
            .env("PORT", self.config.ports.frontend.to_string())
            .env("BROWSER", "none");
        self.supervisor.spawn(ServiceName::Frontend, spec).await?;
        self.await_ready(
            ServiceName::Frontend,
            &self.config.local_frontend_url(),
            HealthTarget::Root,
        )
        .await
    }

    /// Run `npm install` in `dir` to completion.
    async fn install_dependencies(&self, service: ServiceName, dir: &Path) -> Result<(), StartupError> {
        let npm = &self.config.services.npm_bin;
        info!(service = %service, dir = %dir.display(), "Installing dependencies");
        debug!("exec: {} install", npm.display());

        let output = Command::new(npm)
            .arg("install")
            .current_dir(dir)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| StartupError::Install {
                service,
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(service = %service, "npm install failed\nstderr: {stderr}");
            return Err(StartupError::Install {
                service,
                reason: format!("exit {}: {}", output.status, stderr.trim()),
            });
        }
        info!(service = %service, "Dependencies installed");
        Ok(())
    }

    /// Spawn ngrok, wait for its API, and discover the tunnels.
    async fn start_tunnel(&self) -> Result<TunnelEndpoints, StartupError> {
        info!("No static URL configured, starting dynamic tunnel");
        let mut spec =
            ProcessSpec::new(&self.config.services.ngrok_bin).args(broker_args(&self.config));
        // ngrok runs next to its config file.
        if let Some(dir) = self
            .config
            .services
            .ngrok_config
            .parent()
            .filter(|dir| dir.is_dir())
        {
            spec = spec.current_dir(dir);
        }
        self.supervisor.spawn(ServiceName::TunnelBroker, spec).await?;
        self.await_ready(
            ServiceName::TunnelBroker,
            &self.config.broker_api_url(),
            HealthTarget::Root,
        )
        .await?;

        let discoverer = TunnelDiscoverer::from_config(self.http.clone(), &self.config);
        Ok(retry(self.config.startup_retry, || discoverer.discover()).await?)
    }

    async fn await_ready(
        &self,
        service: ServiceName,
        url: &str,
        target: HealthTarget,
    ) -> Result<(), StartupError> {
        let attempts = self.config.timeouts.service_poll_attempts;
        info!(service = %service, url, "Waiting for service");
        let ready = wait_for_service(
            &self.prober,
            url,
            target,
            attempts,
            self.config.timeouts.service_poll_interval(),
        )
        .await;
        if !ready {
            if !self.supervisor.is_alive(service).await {
                warn!(service = %service, "Process exited before becoming ready");
            }
            return Err(StartupError::ProcessStart { service, attempts });
        }
        info!(service = %service, "Service is ready");
        Ok(())
    }

    async fn validate(&self, endpoints: &TunnelEndpoints) -> Result<(), StartupError> {
        let frontend = endpoints.frontend.as_deref().unwrap_or_default();
        let backend = endpoints.backend.as_deref().unwrap_or_default();
        let (frontend_healthy, backend_healthy) = tokio::join!(
            self.prober.probe(frontend, HealthTarget::Root),
            self.prober.probe(backend, HealthTarget::Health),
        );
        if frontend_healthy && backend_healthy {
            Ok(())
        } else {
            Err(StartupError::Validation {
                frontend_healthy,
                backend_healthy,
            })
        }
    }

    async fn cleanup(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.stop();
        }
        self.supervisor.kill_all().await;
        ports::reclaim_ports(&self.config.ports.all()).await;
    }

    fn set_stage(&mut self, stage: StartupStage) {
        debug!(from = %self.stage, to = %stage, "Startup stage transition");
        self.stage = stage;
    }

    fn log_summary(&self, endpoints: &TunnelEndpoints) {
        info!("System URLs:");
        info!("  Local frontend:  {}", self.config.local_frontend_url());
        info!("  Local backend:   {}", self.config.local_backend_url());
        match (&endpoints.frontend, &endpoints.backend) {
            (Some(frontend), Some(backend)) if frontend == backend => {
                info!("  Public URL:      {frontend}");
            }
            (frontend, backend) => {
                info!("  Public frontend: {}", frontend.as_deref().unwrap_or("-"));
                info!("  Public backend:  {}", backend.as_deref().unwrap_or("-"));
            }
        }
    }
}

impl std::fmt::Debug for StartupCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartupCoordinator")
            .field("stage", &self.stage)
            .field("public_urls", &self.public_urls)
            .field("monitoring", &self.monitor.is_some())
            .finish_non_exhaustive()
    }
}
