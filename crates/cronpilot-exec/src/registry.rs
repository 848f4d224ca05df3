//! Tracking of background runs.

use nix::sys::signal::Signal;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::process::{self, ProcessState};

/// A background run that has been spawned and not yet reaped.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEntry {
    pub run_id: String,
    pub job_id: String,
    pub pid: u32,
    pub command: String,
    /// Unix millis.
    pub started_at: i64,
    pub log_file: String,
    pub state: ProcessState,
    /// Live command line of the process, filled in by [`RunRegistry::list`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<String>,
}

/// Registry of background runs, keyed by run id.
pub struct RunRegistry {
    runs: RwLock<Vec<RunEntry>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self {
            runs: RwLock::new(Vec::new()),
        }
    }

    pub async fn register(&self, entry: RunEntry) {
        self.runs.write().await.push(entry);
    }

    /// Tracked runs with a fresh liveness probe and process description.
    pub async fn list(&self) -> Vec<RunEntry> {
        let mut runs = self.runs.read().await.clone();
        for run in &mut runs {
            run.state = process::check_alive(run.pid);
            run.process = match run.state {
                ProcessState::Alive => process::describe(run.pid).await,
                _ => None,
            };
        }
        runs
    }

    pub async fn get(&self, run_id: &str) -> Option<RunEntry> {
        self.runs.read().await.iter().find(|r| r.run_id == run_id).cloned()
    }

    pub async fn remove(&self, run_id: &str) -> bool {
        let mut runs = self.runs.write().await;
        let len = runs.len();
        runs.retain(|r| r.run_id != run_id);
        runs.len() < len
    }

    /// Signal a tracked run and everything it started. `None` when the run id is unknown.
    pub async fn kill(&self, run_id: &str, signal: Signal) -> Option<bool> {
        let run = self.get(run_id).await?;
        Some(process::terminate_group(run.pid, signal))
    }
}

impl Default for RunRegistry {
    fn default() -> Self {
        Self::new()
    }
}
