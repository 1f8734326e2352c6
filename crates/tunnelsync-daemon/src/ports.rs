//! Best-effort reclamation of local ports before services are spawned.
//!
//! Whatever is listening on a configured port is asked for with `lsof` and
//! killed. Failures are logged and otherwise ignored; a port that cannot be
//! freed shows up later as a service that never becomes healthy.

use tokio::process::Command;
use tracing::{debug, info, warn};

/// Why a port could not be reclaimed. Never fatal.
#[derive(Debug, thiserror::Error)]
pub enum PortReclaimError {
    #[error("Failed to run lsof: {0}")]
    Lookup(#[from] std::io::Error),

    #[error("Failed to signal pid {pid}: {reason}")]
    Signal { pid: u32, reason: String },
}

/// Parse `lsof -t` output: one PID per line.
fn parse_pids(output: &str) -> Vec<u32> {
    let mut pids: Vec<u32> = output
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

/// `lsof` arguments selecting only TCP listeners on `port`. Clients merely
/// connected to the port are not matched.
fn lsof_args(port: u16) -> [String; 4] {
    [
        "-t".into(),
        "-i".into(),
        format!("TCP:{port}"),
        "-sTCP:LISTEN".into(),
    ]
}

async fn listening_pids(port: u16) -> Result<Vec<u32>, PortReclaimError> {
    let args = lsof_args(port);
    debug!("exec (capture): lsof {}", args.join(" "));
    let output = Command::new("lsof").args(&args).output().await?;
    // lsof exits 1 when nothing matches.
    Ok(parse_pids(&String::from_utf8_lossy(&output.stdout)))
}

fn kill_pid(pid: u32) -> Result<(), PortReclaimError> {
    #[cfg(unix)]
    {
        // SAFETY: kill(2) has no memory-safety preconditions.
        #[allow(unsafe_code, clippy::cast_possible_wrap)]
        let ret = unsafe { libc::kill(pid as i32, libc::SIGKILL) };
        if ret != 0 {
            return Err(PortReclaimError::Signal {
                pid,
                reason: std::io::Error::last_os_error().to_string(),
            });
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
    Ok(())
}

/// Kill every process listening on `port`. Returns the number of processes
/// killed. A PID that cannot be signalled is logged and skipped.
pub async fn reclaim_port(port: u16) -> Result<usize, PortReclaimError> {
    let own_pid = std::process::id();
    let mut killed = 0;
    for pid in listening_pids(port).await? {
        if pid == own_pid {
            continue;
        }
        match kill_pid(pid) {
            Ok(()) => killed += 1,
            Err(e) => warn!(port, error = %e, "Could not kill process holding port"),
        }
    }
    if killed > 0 {
        info!(port, killed, "Reclaimed port");
    } else {
        debug!(port, "Port already free");
    }
    Ok(killed)
}

/// Reclaim each port in turn, logging and ignoring failures.
pub async fn reclaim_ports(ports: &[u16]) {
    for &port in ports {
        if let Err(e) = reclaim_port(port).await {
            warn!(port, error = %e, "Could not reclaim port");
        }
    }
}
