//! cronpilot-cron: crontab synchronization.
//!
//! Reads, parses, mutates and atomically rewrites OS crontabs, either directly
//! on the host or through a bridge when running inside a container.

pub mod bridge;
pub mod commands;
pub mod crontab;
pub mod manager;
pub mod memory;
pub mod store;
pub mod wrapper;

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

pub use cronpilot_types::CronJob;

/// Errors surfaced by crontab operations.
#[derive(Debug, thiserror::Error)]
pub enum CronError {
    #[error("Job not found: {0}")]
    NotFound(String),
    #[error("Invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },
    #[error("Command failed: {message}")]
    ExecFailure { message: String, stderr: String },
    #[error("Host bridge unavailable: {0}")]
    BridgeUnavailable(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CronError {
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CronError>;

static JOB_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]{4}-[a-z0-9]{4}$").expect("job id pattern is valid"));

/// Whether `id` has the `xxxx-xxxx` shape.
pub fn is_valid_job_id(id: &str) -> bool {
    JOB_ID_RE.is_match(id)
}

/// A fresh random id in `xxxx-xxxx` form.
pub fn generate_job_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", &hex[..4], &hex[4..8])
}

/// A fresh id not present in `taken`.
pub fn unique_job_id(taken: &HashSet<String>) -> String {
    loop {
        let id = generate_job_id();
        if !taken.contains(&id) {
            return id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_have_expected_shape() {
        for _ in 0..100 {
            let id = generate_job_id();
            assert!(is_valid_job_id(&id), "bad id {id}");
        }
    }

    #[test]
    fn test_unique_job_id_skips_taken() {
        let taken: HashSet<String> = (0..50).map(|_| generate_job_id()).collect();
        let id = unique_job_id(&taken);
        assert!(!taken.contains(&id));
    }

    #[test]
    fn test_job_id_validation() {
        assert!(is_valid_job_id("ab12-cd34"));
        assert!(!is_valid_job_id("AB12-cd34"));
        assert!(!is_valid_job_id("ab12cd34"));
        assert!(!is_valid_job_id("ab12-cd345"));
    }
}
