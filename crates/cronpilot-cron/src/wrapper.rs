//! Logging wrapper codec.
//!
//! A wrapped command looks like
//! `/path/to/cron-log-wrapper.sh "ab12-cd34" /usr/bin/backup.sh --full`.
//! The wrapper script appends the command's output to a per-run log file
//! framed by start/exit marker lines, which [`parse_marker`] understands.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::commands::shell_quote_if_needed;

/// File name of the bundled wrapper script.
pub const WRAPPER_SCRIPT_NAME: &str = "cron-log-wrapper.sh";

/// Bundled wrapper script source. `__CRONPILOT_LOG_DIR__` is replaced on install.
pub const WRAPPER_SCRIPT: &str = include_str!("../scripts/cron-log-wrapper.sh");

/// Placeholder for the log root inside [`WRAPPER_SCRIPT`].
pub const LOG_DIR_PLACEHOLDER: &str = "__CRONPILOT_LOG_DIR__";

const MARKER_PREFIX: &str = "=== cronpilot ";

// Any path whose file name is the wrapper script, optionally single-quoted,
// then the quoted job id, then the original command.
static WRAPPED_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?s)^\s*(?:'(?:[^']*/)?cron-log-wrapper\.sh'|(?:\S*/)?cron-log-wrapper\.sh)\s+"([^"\s]+)"\s+(.*)$"#,
    )
    .expect("wrapper pattern is valid")
});

static START_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^=== cronpilot start job=(\S+) at=(\S+) ===$").expect("start pattern is valid")
});

static EXIT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^=== cronpilot exit job=(\S+) code=(-?\d+)(?: duration_ms=(\d+))? ===$")
        .expect("exit pattern is valid")
});

/// Wraps commands with the configured wrapper script path.
#[derive(Debug, Clone)]
pub struct WrapperCodec {
    script_path: String,
}

impl WrapperCodec {
    pub fn new(script_path: impl Into<String>) -> Self {
        Self {
            script_path: script_path.into(),
        }
    }

    pub fn script_path(&self) -> &str {
        &self.script_path
    }

    /// Prefix `command` with the wrapper invocation carrying `job_id`.
    ///
    /// The command is appended verbatim, even if it already looks wrapped.
    pub fn wrap(&self, job_id: &str, command: &str) -> String {
        format!(
            "{} \"{}\" {}",
            shell_quote_if_needed(&self.script_path),
            job_id,
            command.trim()
        )
    }
}

/// Strip the outermost wrapper prefix. Identity on anything unwrapped.
pub fn unwrap_command(command: &str) -> &str {
    match WRAPPED_RE.captures(command) {
        Some(caps) => caps.get(2).map_or(command, |m| m.as_str()),
        None => command,
    }
}

pub fn is_wrapped(command: &str) -> bool {
    WRAPPED_RE.is_match(command)
}

/// Job id carried by a wrapped command.
pub fn extract_job_id(command: &str) -> Option<&str> {
    WRAPPED_RE
        .captures(command)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// A framing line written around each run's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogMarker {
    Start {
        job_id: String,
        at: String,
    },
    Exit {
        job_id: String,
        code: i32,
        duration_ms: Option<u64>,
    },
}

/// Outcome of inspecting one log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogLine<'a> {
    Marker(LogMarker),
    /// Looked like a marker but did not parse.
    Malformed,
    Output(&'a str),
}

impl LogMarker {
    pub fn render(&self) -> String {
        match self {
            LogMarker::Start { job_id, at } => format!("{MARKER_PREFIX}start job={job_id} at={at} ==="),
            LogMarker::Exit {
                job_id,
                code,
                duration_ms: Some(ms),
            } => format!("{MARKER_PREFIX}exit job={job_id} code={code} duration_ms={ms} ==="),
            LogMarker::Exit {
                job_id,
                code,
                duration_ms: None,
            } => format!("{MARKER_PREFIX}exit job={job_id} code={code} ==="),
        }
    }
}

/// Classify a single line of a run log.
pub fn parse_marker(line: &str) -> LogLine<'_> {
    let trimmed = line.trim_end();
    if !trimmed.starts_with(MARKER_PREFIX) {
        return LogLine::Output(line);
    }
    if let Some(caps) = START_RE.captures(trimmed) {
        return LogLine::Marker(LogMarker::Start {
            job_id: caps[1].to_string(),
            at: caps[2].to_string(),
        });
    }
    if let Some(caps) = EXIT_RE.captures(trimmed) {
        let Ok(code) = caps[2].parse() else {
            return LogLine::Malformed;
        };
        return LogLine::Marker(LogMarker::Exit {
            job_id: caps[1].to_string(),
            code,
            duration_ms: caps.get(3).and_then(|m| m.as_str().parse().ok()),
        });
    }
    LogLine::Malformed
}

/// Render the wrapper script for a given log root.
pub fn render_wrapper_script(log_dir: &str) -> String {
    WRAPPER_SCRIPT.replace(LOG_DIR_PLACEHOLDER, log_dir)
}
