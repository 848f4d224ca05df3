//! cronpilot-exec: on-demand job execution.
//!
//! Runs a job's command outside of cron, captures its output, tracks
//! background runs and exposes advisory process utilities.

pub mod process;
pub mod registry;
pub mod runner;

pub use process::{ProcessState, check_alive, describe, parse_signal, terminate, terminate_group};
pub use registry::{RunEntry, RunRegistry};
pub use runner::{ExecutionOutcome, ExitInfo, JobRunner};
pub use nix::sys::signal::Signal;
