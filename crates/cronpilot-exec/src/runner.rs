//! On-demand job runs.
//!
//! Foreground runs block until the command finishes (or times out) and report
//! captured output. Background runs return as soon as the process is spawned;
//! their output goes to a run log in the wrapper's marker format, which the log
//! watcher turns into live events.

use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use cronpilot_config::{CronConfig, ExecConfig};
use cronpilot_cron::bridge::{RunAs, ShellTarget, run_shell};
use cronpilot_cron::commands::ShellCommand;
use cronpilot_cron::manager::CronManager;
use cronpilot_cron::wrapper::LogMarker;
use cronpilot_cron::{CronError, CronJob, Result};
use cronpilot_types::{EventSink, JobError, LiveEvent, now_millis};

use crate::process::{self, ProcessState};
use crate::registry::{RunEntry, RunRegistry};

const TRUNCATION_NOTICE: &str = "\n... [output truncated]";

/// How long to wait for output pipes to close once the job has exited.
const PIPE_GRACE: Duration = Duration::from_secs(2);

/// Exit details of a finished foreground run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub truncated: bool,
    pub timed_out: bool,
}

/// Structured result of [`JobRunner::execute`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOutcome {
    pub success: bool,
    pub message: String,
    pub job_id: String,
    pub run_id: String,
    pub background: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_info: Option<ExitInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

/// Runs jobs on demand and reports their lifecycle to an [`EventSink`].
pub struct JobRunner {
    manager: Arc<CronManager>,
    sink: Arc<dyn EventSink>,
    registry: Arc<RunRegistry>,
    log_dir: PathBuf,
    timeout: Duration,
    max_output_chars: usize,
}

impl JobRunner {
    pub fn new(manager: Arc<CronManager>, sink: Arc<dyn EventSink>, log_dir: impl Into<PathBuf>) -> Self {
        let defaults = ExecConfig::default();
        Self {
            manager,
            sink,
            registry: Arc::new(RunRegistry::new()),
            log_dir: log_dir.into(),
            timeout: Duration::from_secs(defaults.timeout_secs),
            max_output_chars: defaults.max_output_chars,
        }
    }

    pub fn from_config(
        manager: Arc<CronManager>,
        sink: Arc<dyn EventSink>,
        cron: &CronConfig,
        exec: &ExecConfig,
    ) -> Self {
        Self::new(manager, sink, cron.log_dir())
            .with_timeout(Duration::from_secs(exec.timeout_secs))
            .with_max_output_chars(exec.max_output_chars)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_output_chars(mut self, max: usize) -> Self {
        self.max_output_chars = max;
        self
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Run job `id` now.
    ///
    /// Only lookup errors are returned as `Err`; anything that goes wrong once
    /// the job is known is reported as a failed outcome.
    pub async fn execute(&self, id: &str, background: bool) -> Result<ExecutionOutcome> {
        let job = self.manager.get_job(id).await?;
        let run_id = uuid::Uuid::new_v4().simple().to_string();
        let run = Run {
            job: &job,
            run_id: &run_id,
            background,
        };

        let run_as = match self.resolve_run_as(&job.user).await {
            Ok(run_as) => run_as,
            Err(e) => return Ok(self.fail(&run, "Failed to start job", &e.to_string(), None, None)),
        };
        let script = match self.write_script(&run_id, &job.command).await {
            Ok(path) => path,
            Err(e) => return Ok(self.fail(&run, "Failed to start job", &e.to_string(), None, None)),
        };

        let outcome = if background {
            self.run_background(&run, script, run_as).await
        } else {
            self.run_foreground(&run, script, run_as).await
        };
        Ok(outcome)
    }

    async fn run_foreground(&self, run: &Run<'_>, script: PathBuf, run_as: Option<RunAs>) -> ExecutionOutcome {
        let job = run.job;
        let started = Instant::now();
        let mut cmd = self
            .manager
            .target()
            .command(&ShellCommand::run_script(&script).render(), run_as);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                remove_script(&script).await;
                return self.fail(run, "Failed to start job", &e.to_string(), None, None);
            }
        };
        let pid = child.id();
        info!(job_id = %job.id, run_id = %run.run_id, pid, "Job started");
        self.sink.publish(LiveEvent::JobStarted {
            job_id: job.id.clone(),
            run_id: Some(run.run_id.to_string()),
            command: Some(job.command.clone()),
            pid,
        });

        let stdout = Captured::spawn(child.stdout.take());
        let stderr = Captured::spawn(child.stderr.take());

        let result = tokio::time::timeout(self.timeout, child.wait()).await;
        if result.is_err() {
            // The job may have started processes of its own; take the whole group down.
            if let Some(pid) = pid {
                process::terminate_group(pid, Signal::SIGKILL);
            }
            if let Err(e) = child.wait().await {
                debug!(job_id = %job.id, "Failed to reap timed out job: {e}");
            }
        }
        remove_script(&script).await;
        let duration_ms = elapsed_ms(started);
        let stdout = stdout.finish().await;
        let stderr = stderr.finish().await;
        let (stdout, stdout_cut) = truncate_output(&String::from_utf8_lossy(&stdout), self.max_output_chars);
        let (stderr, stderr_cut) = truncate_output(&String::from_utf8_lossy(&stderr), self.max_output_chars);

        let status = match result {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                return self.fail(run, "Job execution failed", &e.to_string(), None, pid);
            }
            Err(_) => {
                let info = ExitInfo {
                    exit_code: None,
                    stdout,
                    stderr,
                    duration_ms,
                    truncated: stdout_cut || stderr_cut,
                    timed_out: true,
                };
                let message = format!("Job timed out after {}s", self.timeout.as_secs_f64());
                return self.fail(run, "Job timed out", &message, Some(info), pid);
            }
        };

        let exit_code = status.code();
        let info = ExitInfo {
            exit_code,
            stdout,
            stderr,
            duration_ms,
            truncated: stdout_cut || stderr_cut,
            timed_out: false,
        };

        if status.success() {
            info!(job_id = %job.id, run_id = %run.run_id, duration_ms, "Job completed");
            self.sink.publish(LiveEvent::JobCompleted {
                job_id: job.id.clone(),
                run_id: Some(run.run_id.to_string()),
                exit_code: 0,
                duration_ms: Some(duration_ms),
            });
            return ExecutionOutcome {
                success: true,
                message: format!("Job completed in {duration_ms}ms"),
                job_id: job.id.clone(),
                run_id: run.run_id.to_string(),
                background: false,
                pid,
                exit_info: Some(info),
                log_file: None,
                error: None,
            };
        }

        let message = match exit_code {
            Some(code) => format!("Job exited with code {code}"),
            None => format!(
                "Job was terminated by signal {}",
                status.signal().unwrap_or_default()
            ),
        };
        self.fail(run, "Job failed", &message, Some(info), pid)
    }

    async fn run_background(&self, run: &Run<'_>, script: PathBuf, run_as: Option<RunAs>) -> ExecutionOutcome {
        let job = run.job;
        let log_path = self.log_dir.join(&job.id).join(format!(
            "{}-{}.log",
            chrono::Utc::now().format("%Y%m%dT%H%M%S%3fZ"),
            &run.run_id[..8]
        ));

        let (stdout, stderr) = match open_run_log(&log_path, &job.id).await {
            Ok(handles) => handles,
            Err(e) => {
                remove_script(&script).await;
                return self.fail(run, "Failed to open run log", &e.to_string(), None, None);
            }
        };

        let mut cmd = self
            .manager
            .target()
            .command(&ShellCommand::run_script(&script).render(), run_as);
        cmd.stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0);

        let started = Instant::now();
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                remove_script(&script).await;
                let _ = append_line(&log_path, &exit_marker(&job.id, -1, 0)).await;
                return self.fail(run, "Failed to start job", &e.to_string(), None, None);
            }
        };
        let pid = child.id();
        let log_file = log_path.to_string_lossy().into_owned();
        info!(job_id = %job.id, run_id = %run.run_id, pid, log_file = %log_file, "Background job started");

        if let Some(pid) = pid {
            self.registry
                .register(RunEntry {
                    run_id: run.run_id.to_string(),
                    job_id: job.id.clone(),
                    pid,
                    command: job.command.clone(),
                    started_at: now_millis(),
                    log_file: log_file.clone(),
                    state: ProcessState::Alive,
                    process: None,
                })
                .await;
        }

        let registry = self.registry.clone();
        let job_id = job.id.clone();
        let run_id = run.run_id.to_string();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status
                    .code()
                    .unwrap_or_else(|| 128 + status.signal().unwrap_or_default()),
                Err(e) => {
                    warn!(job_id = %job_id, run_id = %run_id, "Lost track of background job: {e}");
                    -1
                }
            };
            let duration_ms = elapsed_ms(started);
            if let Err(e) = append_line(&log_path, &exit_marker(&job_id, code, duration_ms)).await {
                warn!(job_id = %job_id, "Failed to write exit marker: {e}");
            }
            registry.remove(&run_id).await;
            remove_script(&script).await;
            info!(job_id = %job_id, run_id = %run_id, code, duration_ms, "Background job finished");
        });

        ExecutionOutcome {
            success: true,
            message: "Job started in background".to_string(),
            job_id: job.id.clone(),
            run_id: run.run_id.to_string(),
            background: true,
            pid,
            exit_info: None,
            log_file: Some(log_file),
            error: None,
        }
    }

    /// Build a failed outcome and publish `job-failed`.
    fn fail(
        &self,
        run: &Run<'_>,
        title: &str,
        message: &str,
        info: Option<ExitInfo>,
        pid: Option<u32>,
    ) -> ExecutionOutcome {
        let job = run.job;
        let mut error = JobError::new(&job.id, title, message);
        error.command = Some(job.command.clone());
        if let Some(info) = &info {
            error.output = non_empty(&info.stdout);
            error.stderr = non_empty(&info.stderr);
        }
        let exit_code = info.as_ref().and_then(|i| i.exit_code);

        warn!(job_id = %job.id, run_id = %run.run_id, exit_code, "{title}: {message}");
        self.sink.publish(LiveEvent::JobFailed {
            job_id: job.id.clone(),
            run_id: Some(run.run_id.to_string()),
            exit_code,
            error: error.clone(),
        });

        ExecutionOutcome {
            success: false,
            message: message.to_string(),
            job_id: job.id.clone(),
            run_id: run.run_id.to_string(),
            background: run.background,
            pid,
            exit_info: info,
            log_file: None,
            error: Some(error),
        }
    }

    /// Credentials to drop to when running as root on behalf of another user.
    async fn resolve_run_as(&self, user: &str) -> Result<Option<RunAs>> {
        if !nix::unistd::geteuid().is_root() || current_user_name().as_deref() == Some(user) {
            return Ok(None);
        }
        let target = self.manager.target();
        let uid = lookup_id(target, ShellCommand::user_id(user)).await?;
        let gid = lookup_id(target, ShellCommand::group_id(user)).await?;
        debug!(user, uid, gid, "Running job as its owner");
        Ok(Some(RunAs { uid, gid }))
    }

    async fn write_script(&self, run_id: &str, command: &str) -> Result<PathBuf> {
        let dir = self.log_dir.join(".run");
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{run_id}.sh"));
        tokio::fs::write(&path, format!("#!/bin/sh\n{command}\n")).await?;
        Ok(path)
    }
}

/// Output collected from one pipe while the job runs.
struct Captured {
    buf: Arc<Mutex<Vec<u8>>>,
    task: tokio::task::JoinHandle<()>,
}

impl Captured {
    fn spawn<R>(pipe: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = buf.clone();
        let task = tokio::spawn(async move {
            let Some(mut pipe) = pipe else {
                return;
            };
            let mut chunk = [0u8; 8192];
            loop {
                match pipe.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        sink.lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .extend_from_slice(&chunk[..n]);
                    }
                }
            }
        });
        Self { buf, task }
    }

    /// Wait briefly for the pipe to close, then take what arrived.
    async fn finish(self) -> Vec<u8> {
        let mut task = self.task;
        if tokio::time::timeout(PIPE_GRACE, &mut task).await.is_err() {
            task.abort();
        }
        std::mem::take(&mut *self.buf.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

/// Borrowed identity of one run.
struct Run<'a> {
    job: &'a CronJob,
    run_id: &'a str,
    background: bool,
}

async fn lookup_id(target: ShellTarget, cmd: ShellCommand) -> Result<u32> {
    let output = run_shell(target, &cmd.render(), None).await?;
    if !output.success() {
        return Err(CronError::ExecFailure {
            message: format!("`{cmd}` failed"),
            stderr: output.stderr.trim().to_string(),
        });
    }
    output.stdout.trim().parse().map_err(|_| CronError::ExecFailure {
        message: format!("`{cmd}` returned '{}'", output.stdout.trim()),
        stderr: String::new(),
    })
}

fn current_user_name() -> Option<String> {
    nix::unistd::User::from_uid(nix::unistd::getuid())
        .ok()
        .flatten()
        .map(|u| u.name)
}

/// Create the run log with its start marker and return stdout/stderr handles.
async fn open_run_log(path: &Path, job_id: &str) -> std::io::Result<(Stdio, Stdio)> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let start = LogMarker::Start {
        job_id: job_id.to_string(),
        at: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
    };
    append_line(path, &start.render()).await?;

    let file = std::fs::OpenOptions::new().append(true).open(path)?;
    let err = file.try_clone()?;
    Ok((Stdio::from(file), Stdio::from(err)))
}

async fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(format!("{line}\n").as_bytes()).await?;
    file.flush().await
}

fn exit_marker(job_id: &str, code: i32, duration_ms: u64) -> String {
    LogMarker::Exit {
        job_id: job_id.to_string(),
        code,
        duration_ms: Some(duration_ms),
    }
    .render()
}

async fn remove_script(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        debug!(path = %path.display(), "Failed to remove run script: {e}");
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn non_empty(text: &str) -> Option<String> {
    (!text.trim().is_empty()).then(|| text.to_string())
}

/// Cap `text` at `max` bytes on a char boundary.
pub fn truncate_output(text: &str, max: usize) -> (String, bool) {
    if text.len() <= max {
        return (text.to_string(), false);
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = text[..end].to_string();
    out.push_str(TRUNCATION_NOTICE);
    (out, true)
}
