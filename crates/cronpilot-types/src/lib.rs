use serde::{Deserialize, Serialize};

// ──────────────────── Job Types ────────────────────

/// One scheduled crontab entry.
///
/// `command` is always the unwrapped, user-authored command. The wrapped form
/// only ever exists in persisted crontab text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJob {
    /// Short identifier in `xxxx-xxxx` form.
    pub id: String,
    /// Five cron fields (or an `@keyword` macro), stored verbatim.
    pub schedule: String,
    /// Unwrapped command.
    pub command: String,
    /// Optional annotation rendered as a comment line above the job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// OS account owning the crontab.
    pub user: String,
    /// Present in the crontab but disabled.
    #[serde(default)]
    pub paused: bool,
    /// Whether the command runs through the logging wrapper.
    #[serde(default)]
    pub logs_enabled: bool,
}

/// Fields accepted when creating a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewJob {
    pub schedule: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Target user (defaults to the first known user).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default)]
    pub logs_enabled: bool,
}

/// Partial update of an existing job. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// An empty string clears the comment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs_enabled: Option<bool>,
}

impl JobPatch {
    /// Apply the patch to a job in place.
    pub fn apply(&self, job: &mut CronJob) {
        if let Some(schedule) = &self.schedule {
            job.schedule = schedule.trim().to_string();
        }
        if let Some(command) = &self.command {
            job.command = command.trim().to_string();
        }
        if let Some(comment) = &self.comment {
            let comment = comment.trim();
            job.comment = (!comment.is_empty()).then(|| comment.to_string());
        }
        if let Some(paused) = self.paused {
            job.paused = paused;
        }
        if let Some(logs_enabled) = self.logs_enabled {
            job.logs_enabled = logs_enabled;
        }
    }
}

/// `{success, message}` answer returned by every mutating operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ActionResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

// ──────────────────── Error Reports ────────────────────

/// A client-facing report of a failed run or operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobError {
    pub id: String,
    pub title: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    /// Unix millis.
    pub timestamp: i64,
    pub job_id: String,
}

impl JobError {
    pub fn new(job_id: impl Into<String>, title: impl Into<String>, message: impl Into<String>) -> Self {
        let job_id = job_id.into();
        let timestamp = now_millis();
        Self {
            id: format!("{job_id}-{timestamp}"),
            title: title.into(),
            message: message.into(),
            details: None,
            command: None,
            output: None,
            stderr: None,
            timestamp,
            job_id,
        }
    }
}

// ──────────────────── Live Events ────────────────────

/// Events multicast to live subscribers. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum LiveEvent {
    JobStarted {
        job_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        run_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
    },
    JobCompleted {
        job_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        run_id: Option<String>,
        exit_code: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
    },
    JobFailed {
        job_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        run_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        error: JobError,
    },
    LogLine {
        job_id: String,
        line: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        log_file: Option<String>,
    },
    SystemStats {
        stats: serde_json::Value,
    },
    Heartbeat,
}

impl LiveEvent {
    /// Wire name used as the SSE `event:` field.
    pub fn name(&self) -> &'static str {
        match self {
            LiveEvent::JobStarted { .. } => "job-started",
            LiveEvent::JobCompleted { .. } => "job-completed",
            LiveEvent::JobFailed { .. } => "job-failed",
            LiveEvent::LogLine { .. } => "log-line",
            LiveEvent::SystemStats { .. } => "system-stats",
            LiveEvent::Heartbeat => "heartbeat",
        }
    }

    /// The job this event concerns, if any.
    pub fn job_id(&self) -> Option<&str> {
        match self {
            LiveEvent::JobStarted { job_id, .. }
            | LiveEvent::JobCompleted { job_id, .. }
            | LiveEvent::JobFailed { job_id, .. }
            | LiveEvent::LogLine { job_id, .. } => Some(job_id),
            LiveEvent::SystemStats { .. } | LiveEvent::Heartbeat => None,
        }
    }

    /// JSON payload stamped with the delivery time.
    pub fn to_payload(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({}));
        if let Some(obj) = value.as_object_mut() {
            obj.insert("timestamp".into(), serde_json::json!(now_millis()));
        }
        value
    }
}

/// Anything that accepts live events for fan-out.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: LiveEvent);
}

/// Sink that drops every event.
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: LiveEvent) {}
}

/// Current time in unix millis.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> CronJob {
        CronJob {
            id: "ab12-cd34".into(),
            schedule: "*/5 * * * *".into(),
            command: "/usr/bin/backup.sh".into(),
            comment: Some("nightly".into()),
            user: "root".into(),
            paused: false,
            logs_enabled: true,
        }
    }

    #[test]
    fn test_cron_job_wire_names() {
        let json = serde_json::to_value(sample_job()).unwrap();
        assert_eq!(json["logsEnabled"], true);
        assert_eq!(json["paused"], false);
        assert!(json.get("logs_enabled").is_none());
    }

    #[test]
    fn test_restore_record_defaults() {
        let json = r#"{"id":"ab12-cd34","schedule":"0 * * * *","command":"ls","user":"root"}"#;
        let job: CronJob = serde_json::from_str(json).unwrap();
        assert!(!job.paused);
        assert!(!job.logs_enabled);
        assert!(job.comment.is_none());
    }

    #[test]
    fn test_patch_apply() {
        let mut job = sample_job();
        let patch = JobPatch {
            schedule: Some(" 0 3 * * * ".into()),
            comment: Some(String::new()),
            paused: Some(true),
            ..Default::default()
        };
        patch.apply(&mut job);
        assert_eq!(job.schedule, "0 3 * * *");
        assert_eq!(job.command, "/usr/bin/backup.sh");
        assert!(job.comment.is_none());
        assert!(job.paused);
        assert!(job.logs_enabled);
    }

    #[test]
    fn test_live_event_names() {
        let event = LiveEvent::LogLine {
            job_id: "ab12-cd34".into(),
            line: "hello".into(),
            log_file: None,
        };
        assert_eq!(event.name(), "log-line");
        assert_eq!(event.job_id(), Some("ab12-cd34"));
        assert_eq!(LiveEvent::Heartbeat.name(), "heartbeat");
        assert_eq!(LiveEvent::Heartbeat.job_id(), None);
    }

    #[test]
    fn test_live_event_payload() {
        let event = LiveEvent::JobCompleted {
            job_id: "ab12-cd34".into(),
            run_id: None,
            exit_code: 0,
            duration_ms: Some(12),
        };
        let payload = event.to_payload();
        assert_eq!(payload["type"], "job-completed");
        assert_eq!(payload["jobId"], "ab12-cd34");
        assert_eq!(payload["exitCode"], 0);
        assert!(payload["timestamp"].is_i64());
        assert!(payload.get("runId").is_none());
    }

    #[test]
    fn test_job_failed_carries_error() {
        let mut error = JobError::new("ab12-cd34", "Job failed", "exit code 2");
        error.stderr = Some("boom".into());
        let event = LiveEvent::JobFailed {
            job_id: "ab12-cd34".into(),
            run_id: Some("r1".into()),
            exit_code: Some(2),
            error,
        };
        let json = serde_json::to_string(&event).unwrap();
        let parsed: LiveEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_system_stats_payload() {
        let event = LiveEvent::SystemStats {
            stats: serde_json::json!({"load": [0.1, 0.2, 0.3]}),
        };
        let payload = event.to_payload();
        assert_eq!(payload["type"], "system-stats");
        assert_eq!(payload["stats"]["load"][0], 0.1);
    }

    #[test]
    fn test_action_result() {
        let ok = ActionResult::ok("created").with_data(serde_json::json!({"id": "ab12-cd34"}));
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["id"], "ab12-cd34");

        let fail = serde_json::to_value(ActionResult::fail("nope")).unwrap();
        assert_eq!(fail["success"], false);
        assert!(fail.get("data").is_none());
    }
}
