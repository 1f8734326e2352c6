//! Child process supervision for the backend, frontend and tunnel broker.
//!
//! The supervisor exclusively owns every child handle; nothing else signals
//! these processes. Exited processes show up as not alive in [`status`] and
//! are never restarted here.
//!
//! [`status`]: ProcessSupervisor::status

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Logical name of a supervised service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ServiceName {
    Backend,
    Frontend,
    TunnelBroker,
}

impl ServiceName {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Backend => "backend",
            Self::Frontend => "frontend",
            Self::TunnelBroker => "tunnel-broker",
        }
    }
}

impl std::fmt::Display for ServiceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How to launch a process. Arguments are passed as a list, never through a
/// shell.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
        }
    }

    #[must_use]
    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    fn command_line(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Handle returned by [`ProcessSupervisor::spawn`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub name: ServiceName,
    pub pid: Option<u32>,
}

/// Errors from process supervision.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Failed to spawn {name} ({command}): {reason}")]
    SpawnFailed {
        name: ServiceName,
        command: String,
        reason: String,
    },

    #[error("Process {name} is already running")]
    AlreadyRunning { name: ServiceName },

    #[error("Process not found: {name}")]
    NotFound { name: ServiceName },
}

struct ProcessState {
    child: Child,
    command: String,
}

/// Whether a stderr line should be surfaced at error level.
fn is_error_line(line: &str) -> bool {
    line.to_ascii_lowercase().contains("error")
}

/// Spawns and tracks the stack's child processes.
pub struct ProcessSupervisor {
    processes: Arc<RwLock<HashMap<ServiceName, ProcessState>>>,
    /// Time between SIGTERM and SIGKILL.
    terminate_grace: Duration,
}

impl ProcessSupervisor {
    pub fn new(terminate_grace: Duration) -> Self {
        Self {
            processes: Arc::new(RwLock::new(HashMap::new())),
            terminate_grace,
        }
    }

    /// Spawn `spec` under `name`, piping its output into the log.
    ///
    /// A dead entry with the same name is replaced; a live one is an error.
    pub async fn spawn(
        &self,
        name: ServiceName,
        spec: ProcessSpec,
    ) -> Result<ProcessInfo, SupervisorError> {
        let mut processes = self.processes.write().await;
        if let Some(existing) = processes.get_mut(&name) {
            if matches!(existing.child.try_wait(), Ok(None)) {
                return Err(SupervisorError::AlreadyRunning { name });
            }
        }

        let command = spec.command_line();
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        info!(service = %name, command = %command, "Spawning process");
        let mut child = cmd.spawn().map_err(|e| SupervisorError::SpawnFailed {
            name,
            command: command.clone(),
            reason: e.to_string(),
        })?;
        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        debug!(service = %name, "{}", line.trim_end());
                    }
                }
                debug!(service = %name, "stdout reader finished");
            });
        }

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.trim().is_empty() {
                        continue;
                    }
                    if is_error_line(&line) {
                        error!(service = %name, "{}", line.trim_end());
                    } else {
                        debug!(service = %name, "{}", line.trim_end());
                    }
                }
                debug!(service = %name, "stderr reader finished");
            });
        }

        processes.insert(name, ProcessState { child, command });
        drop(processes);

        debug!(service = %name, pid, "Process spawned");
        Ok(ProcessInfo { name, pid })
    }

    /// Liveness of every tracked process.
    pub async fn status(&self) -> BTreeMap<ServiceName, bool> {
        let mut processes = self.processes.write().await;
        processes
            .iter_mut()
            .map(|(name, state)| {
                let alive = match state.child.try_wait() {
                    Ok(None) => true,
                    Ok(Some(status)) => {
                        debug!(service = %name, %status, "Process has exited");
                        false
                    }
                    Err(e) => {
                        warn!(service = %name, error = %e, "Failed to query process state");
                        false
                    }
                };
                (*name, alive)
            })
            .collect()
    }

    pub async fn is_alive(&self, name: ServiceName) -> bool {
        self.status().await.get(&name).copied().unwrap_or(false)
    }

    /// Terminate a single process and forget it.
    pub async fn terminate(&self, name: ServiceName) -> Result<(), SupervisorError> {
        let state = self
            .processes
            .write()
            .await
            .remove(&name)
            .ok_or(SupervisorError::NotFound { name })?;
        self.terminate_state(name, state).await;
        Ok(())
    }

    /// Terminate every tracked process and clear the set.
    pub async fn kill_all(&self) {
        let drained: Vec<_> = self.processes.write().await.drain().collect();
        for (name, state) in drained {
            self.terminate_state(name, state).await;
        }
    }

    pub async fn active_count(&self) -> usize {
        self.status().await.values().filter(|alive| **alive).count()
    }

    /// SIGTERM, wait for the grace period, then SIGKILL.
    async fn terminate_state(&self, name: ServiceName, mut state: ProcessState) {
        if !matches!(state.child.try_wait(), Ok(None)) {
            debug!(service = %name, "Process already exited");
            return;
        }

        debug!(service = %name, command = %state.command, "Terminating process");

        #[cfg(unix)]
        {
            if let Some(pid) = state.child.id() {
                // SAFETY: pid comes from our own Child handle, which has not
                // been reaped yet (try_wait returned None above).
                #[allow(unsafe_code, clippy::cast_possible_wrap)]
                let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
                if ret != 0 {
                    let err = std::io::Error::last_os_error();
                    warn!(service = %name, pid, error = %err, "Failed to send SIGTERM");
                }
            }
        }

        match tokio::time::timeout(self.terminate_grace, state.child.wait()).await {
            Ok(Ok(status)) => info!(service = %name, %status, "Process terminated"),
            Ok(Err(e)) => {
                warn!(service = %name, error = %e, "Error waiting for process");
                let _ = state.child.kill().await;
            }
            Err(_) => {
                warn!(service = %name, "Grace period expired, sending SIGKILL");
                let _ = state.child.kill().await;
            }
        }
    }
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("terminate_grace", &self.terminate_grace)
            .finish_non_exhaustive()
    }
}
