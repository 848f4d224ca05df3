//! Run-log watcher.
//!
//! Watches `<log_dir>/<job_id>/*.log` and turns newly appended lines into
//! live events: start markers become `job-started`, exit markers become
//! `job-completed` or `job-failed`, everything else becomes `log-line`.

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notify_debouncer_mini::{DebouncedEventKind, new_debouncer};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cronpilot_cron::is_valid_job_id;
use cronpilot_cron::wrapper::{LogLine, LogMarker, parse_marker};
use cronpilot_types::{EventSink, JobError, LiveEvent};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Finished run logs whose offsets are kept, so a late event does not replay them.
const FINISHED_CAP: usize = 64;

struct Running {
    token: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

/// Watches the run-log directory for the lifetime of the service.
pub struct LogWatcher {
    log_dir: PathBuf,
    sink: Arc<dyn EventSink>,
    debounce: Duration,
    running: Mutex<Option<Running>>,
}

impl LogWatcher {
    pub fn new(log_dir: impl Into<PathBuf>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            log_dir: log_dir.into(),
            sink,
            debounce: Duration::from_millis(500),
            running: Mutex::new(None),
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    fn running(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.running().is_some()
    }

    /// Start watching. A second call while running is a no-op and returns false.
    pub fn start(&self) -> bool {
        let mut running = self.running();
        if running.is_some() {
            debug!("Log watcher already running");
            return false;
        }
        if let Err(e) = std::fs::create_dir_all(&self.log_dir) {
            warn!(log_dir = %self.log_dir.display(), "Cannot create log directory: {e}");
        }

        let token = CancellationToken::new();
        let log_dir = self.log_dir.clone();
        let sink = self.sink.clone();
        let debounce = self.debounce;
        let cancel = token.clone();
        let task = tokio::task::spawn_blocking(move || {
            run_watcher(log_dir, sink, debounce, cancel);
        });

        *running = Some(Running { token, task });
        true
    }

    /// Stop watching and wait for the watcher thread to release its handles.
    pub async fn stop(&self) {
        let Some(Running { token, task }) = self.running().take() else {
            return;
        };
        token.cancel();
        if let Err(e) = task.await {
            warn!("Log watcher task ended abnormally: {e}");
        }
        info!("Log watcher stopped");
    }
}

fn run_watcher(log_dir: PathBuf, sink: Arc<dyn EventSink>, debounce: Duration, cancel: CancellationToken) {
    let (tx, rx) = std::sync::mpsc::channel();

    let mut debouncer = match new_debouncer(debounce, tx) {
        Ok(d) => d,
        Err(e) => {
            warn!("Failed to create log watcher: {e}");
            return;
        }
    };

    if let Err(e) = debouncer
        .watcher()
        .watch(&log_dir, notify::RecursiveMode::Recursive)
    {
        warn!("Failed to watch log directory {}: {e}", log_dir.display());
        return;
    }

    let mut tailer = LogTailer::new(&log_dir);
    tailer.seed();
    info!("Log watcher started: watching {}", log_dir.display());

    while !cancel.is_cancelled() {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(Ok(events)) => {
                for event in events {
                    if event.kind != DebouncedEventKind::Any {
                        continue;
                    }
                    for live in tailer.process(&event.path) {
                        sink.publish(live);
                    }
                }
            }
            Ok(Err(e)) => warn!("Log watcher error: {e:?}"),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                info!("Log watcher channel closed, stopping");
                break;
            }
        }
    }
}

/// Per-file read offsets and unterminated line fragments.
pub struct LogTailer {
    log_dir: PathBuf,
    offsets: HashMap<PathBuf, u64>,
    partial: HashMap<PathBuf, Vec<u8>>,
    finished: VecDeque<PathBuf>,
}

impl LogTailer {
    pub fn new(log_dir: &Path) -> Self {
        Self {
            log_dir: log_dir.to_path_buf(),
            offsets: HashMap::new(),
            partial: HashMap::new(),
            finished: VecDeque::new(),
        }
    }

    /// Skip content that existed before the watcher started.
    pub fn seed(&mut self) {
        let Ok(jobs) = std::fs::read_dir(&self.log_dir) else {
            return;
        };
        for job_dir in jobs.flatten() {
            let Ok(files) = std::fs::read_dir(job_dir.path()) else {
                continue;
            };
            for file in files.flatten() {
                let path = file.path();
                if self.job_id_for(&path).is_none() {
                    continue;
                }
                if let Ok(meta) = file.metadata() {
                    self.offsets.insert(path, meta.len());
                }
            }
        }
    }

    /// `<log_dir>/<job_id>/<name>.log` yields `job_id`.
    fn job_id_for(&self, path: &Path) -> Option<String> {
        if path.extension().and_then(|e| e.to_str()) != Some("log") {
            return None;
        }
        let job_dir = path.parent()?;
        if job_dir.parent()? != self.log_dir.as_path() {
            return None;
        }
        let job_id = job_dir.file_name()?.to_str()?;
        is_valid_job_id(job_id).then(|| job_id.to_string())
    }

    /// Read what was appended to `path` since the last call.
    pub fn process(&mut self, path: &Path) -> Vec<LiveEvent> {
        let Some(job_id) = self.job_id_for(path) else {
            return Vec::new();
        };
        let chunk = match self.read_new(path) {
            Ok(chunk) => chunk,
            Err(e) => {
                if e.kind() == std::io::ErrorKind::NotFound {
                    self.offsets.remove(path);
                    self.partial.remove(path);
                } else {
                    debug!(path = %path.display(), "Cannot read run log: {e}");
                }
                return Vec::new();
            }
        };
        if chunk.is_empty() {
            return Vec::new();
        }

        let mut bytes = self.partial.remove(path).unwrap_or_default();
        bytes.extend_from_slice(&chunk);
        // Splitting at a newline never cuts a UTF-8 sequence.
        let Some(pos) = bytes.iter().rposition(|b| *b == b'\n') else {
            self.partial.insert(path.to_path_buf(), bytes);
            return Vec::new();
        };
        let rest = bytes.split_off(pos + 1);
        if !rest.is_empty() {
            self.partial.insert(path.to_path_buf(), rest);
        }

        let log_file = path.to_string_lossy().into_owned();
        let events: Vec<LiveEvent> = String::from_utf8_lossy(&bytes)
            .lines()
            .filter_map(|line| line_event(&job_id, line, &log_file))
            .collect();
        if events
            .iter()
            .any(|e| matches!(e, LiveEvent::JobCompleted { .. } | LiveEvent::JobFailed { .. }))
        {
            self.retire(path);
        }
        events
    }

    /// Forget the state of a run log once its exit marker has been seen.
    fn retire(&mut self, path: &Path) {
        self.partial.remove(path);
        if !self.finished.iter().any(|p| p == path) {
            self.finished.push_back(path.to_path_buf());
        }
        while self.finished.len() > FINISHED_CAP {
            if let Some(oldest) = self.finished.pop_front() {
                self.offsets.remove(&oldest);
            }
        }
    }

    fn read_new(&mut self, path: &Path) -> std::io::Result<Vec<u8>> {
        let mut file = std::fs::File::open(path)?;
        let len = file.metadata()?.len();
        let offset = self.offsets.get(path).copied().unwrap_or(0);
        let start = if len < offset {
            // Truncated or replaced.
            self.partial.remove(path);
            0
        } else {
            offset
        };
        file.seek(SeekFrom::Start(start))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        self.offsets.insert(path.to_path_buf(), start + buf.len() as u64);
        Ok(buf)
    }
}

fn line_event(job_id: &str, line: &str, log_file: &str) -> Option<LiveEvent> {
    match parse_marker(line) {
        LogLine::Marker(LogMarker::Start { .. }) => Some(LiveEvent::JobStarted {
            job_id: job_id.to_string(),
            run_id: None,
            command: None,
            pid: None,
        }),
        LogLine::Marker(LogMarker::Exit {
            code: 0, duration_ms, ..
        }) => Some(LiveEvent::JobCompleted {
            job_id: job_id.to_string(),
            run_id: None,
            exit_code: 0,
            duration_ms,
        }),
        LogLine::Marker(LogMarker::Exit { code, .. }) => {
            let mut error = JobError::new(job_id, "Job failed", format!("Job exited with code {code}"));
            error.details = Some(format!("See {log_file}"));
            Some(LiveEvent::JobFailed {
                job_id: job_id.to_string(),
                run_id: None,
                exit_code: Some(code),
                error,
            })
        }
        LogLine::Malformed => {
            debug!(job_id, "Ignoring malformed marker line");
            None
        }
        LogLine::Output(text) => Some(LiveEvent::LogLine {
            job_id: job_id.to_string(),
            line: text.to_string(),
            log_file: Some(log_file.to_string()),
        }),
    }
}
