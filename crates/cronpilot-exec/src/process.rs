//! Advisory process utilities keyed by pid.
//!
//! None of these fail loudly: when the state of a process cannot be
//! confirmed the answer is [`ProcessState::Unknown`] or `false`.

use std::str::FromStr;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use serde::Serialize;
use tracing::{debug, warn};

/// Result of a liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Alive,
    Dead,
    Unknown,
}

fn to_pid(pid: u32) -> Option<Pid> {
    // 0 and negative values address process groups, never a single process.
    i32::try_from(pid).ok().filter(|p| *p > 0).map(Pid::from_raw)
}

/// Probe a process with signal 0.
pub fn check_alive(pid: u32) -> ProcessState {
    let Some(target) = to_pid(pid) else {
        return ProcessState::Unknown;
    };
    match kill(target, None) {
        Ok(()) => ProcessState::Alive,
        // Exists but belongs to someone else.
        Err(Errno::EPERM) => ProcessState::Alive,
        Err(Errno::ESRCH) => ProcessState::Dead,
        Err(e) => {
            debug!(pid, "Liveness probe inconclusive: {e}");
            ProcessState::Unknown
        }
    }
}

/// Parse a signal name such as `SIGTERM`, `term` or `9`.
pub fn parse_signal(name: &str) -> Option<Signal> {
    let name = name.trim();
    if let Ok(num) = name.parse::<i32>() {
        return Signal::try_from(num).ok();
    }
    let upper = name.to_ascii_uppercase();
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    Signal::from_str(&full).ok()
}

/// Send `signal` to a process. Returns false (and logs) when delivery fails.
pub fn terminate(pid: u32, signal: Signal) -> bool {
    let Some(target) = to_pid(pid) else {
        warn!(pid, "Refusing to signal invalid pid");
        return false;
    };
    match kill(target, signal) {
        Ok(()) => {
            debug!(pid, signal = %signal, "Signal delivered");
            true
        }
        Err(e) => {
            warn!(pid, signal = %signal, "Failed to signal process: {e}");
            false
        }
    }
}

/// Send `signal` to the process group led by `pid`.
///
/// Runs are spawned as group leaders, so this also reaches whatever the job
/// started itself.
pub fn terminate_group(pid: u32, signal: Signal) -> bool {
    let Some(target) = to_pid(pid) else {
        warn!(pid, "Refusing to signal invalid process group");
        return false;
    };
    match killpg(target, signal) {
        Ok(()) => {
            debug!(pgid = pid, signal = %signal, "Signal delivered to group");
            true
        }
        Err(e) => {
            warn!(pgid = pid, signal = %signal, "Failed to signal process group: {e}");
            false
        }
    }
}

/// Command line of a process, best effort.
pub async fn describe(pid: u32) -> Option<String> {
    to_pid(pid)?;
    if let Ok(raw) = tokio::fs::read(format!("/proc/{pid}/cmdline")).await {
        let text = String::from_utf8_lossy(&raw)
            .split('\0')
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if !text.is_empty() {
            return Some(text);
        }
    }

    let output = tokio::process::Command::new("ps")
        .args(["-p", &pid.to_string(), "-o", "args="])
        .output()
        .await
        .ok()?;
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (output.status.success() && !text.is_empty()).then_some(text)
}
