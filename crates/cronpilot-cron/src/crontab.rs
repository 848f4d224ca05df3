//! Crontab text to job records and back.
//!
//! Each physical line is classified into a [`LineKind`]; a document keeps
//! every non-job line verbatim so a read-modify-write cycle only touches the
//! jobs that changed.

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::wrapper::{self, WrapperCodec};
use crate::{CronError, CronJob, Result, is_valid_job_id};

/// Prefix of a job line that is present but disabled.
pub const PAUSED_MARKER: &str = "# [paused] ";

const MACROS: &[&str] = &[
    "@reboot",
    "@yearly",
    "@annually",
    "@monthly",
    "@weekly",
    "@daily",
    "@midnight",
    "@hourly",
];

// One comma-separated item of a schedule field: `*`, `5`, `1-5`, `*/10`,
// `mon-fri`, `jan`, `5L`, `3#2`.
static FIELD_ITEM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?:\*|\?|L|LW|[0-9]+(?:[LW]|#[0-9]+)?|[A-Za-z]{3})(?:-(?:[0-9]+|[A-Za-z]{3}))?(?:/[0-9]+)?$",
    )
    .expect("field pattern is valid")
});

static ID_TAG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:(.*?)\s*\|\s*)?id:\s*([a-z0-9]{4}-[a-z0-9]{4})\s*$")
        .expect("id tag pattern is valid")
});

static USER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_.-]*\$?$").expect("user pattern is valid")
});

/// Schedule and raw (possibly wrapped) command of a job line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFields<'a> {
    pub schedule: String,
    pub command: &'a str,
}

/// Classification of one physical crontab line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineKind<'a> {
    Active(JobFields<'a>),
    Disabled(JobFields<'a>),
    Comment(&'a str),
    Blank,
    /// Environment assignments and anything unrecognised.
    Other(&'a str),
}

impl<'a> LineKind<'a> {
    pub fn classify(line: &'a str) -> Self {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return LineKind::Blank;
        }
        if let Some(rest) = trimmed.strip_prefix('#') {
            if let Some(job) = rest.trim_start().strip_prefix("[paused]") {
                if let Some(fields) = split_job(job) {
                    return LineKind::Disabled(fields);
                }
            }
            return LineKind::Comment(trimmed);
        }
        match split_job(trimmed) {
            Some(fields) => LineKind::Active(fields),
            None => LineKind::Other(trimmed),
        }
    }

    pub fn render(&self) -> String {
        match self {
            LineKind::Active(f) => format!("{} {}", f.schedule, f.command),
            LineKind::Disabled(f) => format!("{PAUSED_MARKER}{} {}", f.schedule, f.command),
            LineKind::Comment(c) | LineKind::Other(c) => c.to_string(),
            LineKind::Blank => String::new(),
        }
    }

    fn is_job(&self) -> bool {
        matches!(self, LineKind::Active(_) | LineKind::Disabled(_))
    }
}

fn split_job(line: &str) -> Option<JobFields<'_>> {
    let line = line.trim();
    if line.starts_with('@') {
        let (name, rest) = line.split_once(char::is_whitespace)?;
        if !MACROS.contains(&name) {
            return None;
        }
        let command = rest.trim();
        return (!command.is_empty()).then(|| JobFields {
            schedule: name.to_string(),
            command,
        });
    }

    let mut rest = line;
    let mut fields = Vec::with_capacity(5);
    for _ in 0..5 {
        rest = rest.trim_start();
        let end = rest.find(char::is_whitespace)?;
        let field = &rest[..end];
        if !is_valid_field(field) {
            return None;
        }
        fields.push(field);
        rest = &rest[end..];
    }
    let command = rest.trim();
    (!command.is_empty()).then(|| JobFields {
        schedule: fields.join(" "),
        command,
    })
}

fn is_valid_field(field: &str) -> bool {
    field.split(',').all(|item| FIELD_ITEM_RE.is_match(item))
}

/// Five cron fields, or one `@` macro.
pub fn is_valid_schedule(schedule: &str) -> bool {
    let tokens: Vec<&str> = schedule.split_whitespace().collect();
    match tokens.as_slice() {
        [name] if name.starts_with('@') => MACROS.contains(name),
        fields if fields.len() == 5 => fields.iter().all(|f| is_valid_field(f)),
        _ => false,
    }
}

/// Reject values that would corrupt the crontab when rendered.
pub fn validate_job(job: &CronJob) -> Result<()> {
    if !is_valid_job_id(&job.id) {
        return Err(CronError::validation("id", format!("'{}' is not xxxx-xxxx", job.id)));
    }
    if !is_valid_schedule(&job.schedule) {
        return Err(CronError::validation(
            "schedule",
            format!("'{}' is not a cron schedule", job.schedule),
        ));
    }
    if job.command.trim().is_empty() {
        return Err(CronError::validation("command", "must not be empty"));
    }
    if job.command.contains(['\n', '\r']) {
        return Err(CronError::validation("command", "must be a single line"));
    }
    if let Some(comment) = &job.comment {
        if comment.contains(['\n', '\r']) {
            return Err(CronError::validation("comment", "must be a single line"));
        }
    }
    // The comment line must not read back as a paused job of its own.
    if let Some(line) = comment_line(job) {
        if LineKind::classify(&line).is_job() {
            return Err(CronError::validation("comment", "must not look like a paused job line"));
        }
    }
    if !USER_RE.is_match(&job.user) {
        return Err(CronError::validation("user", format!("'{}' is not a user name", job.user)));
    }
    Ok(())
}

/// One logical element of a crontab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    /// A job together with its comment line.
    Job(CronJob),
    Comment(String),
    Blank,
    Other(String),
}

/// A parsed crontab for one user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrontabDocument {
    user: String,
    entries: Vec<Entry>,
}

impl CrontabDocument {
    pub fn empty(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            entries: Vec::new(),
        }
    }

    /// Parse raw crontab text.
    pub fn parse(user: impl Into<String>, text: &str) -> Self {
        let user = user.into();
        let lines: Vec<LineKind<'_>> = text.lines().map(LineKind::classify).collect();

        let mut entries = Vec::with_capacity(lines.len());
        let mut seen_ids = HashSet::new();
        let mut occurrences: HashMap<(String, String), usize> = HashMap::new();
        let mut pending_comment: Option<&str> = None;

        for (idx, kind) in lines.iter().enumerate() {
            match kind {
                LineKind::Comment(text) => {
                    if lines.get(idx + 1).is_some_and(LineKind::is_job) {
                        pending_comment = Some(*text);
                    } else {
                        entries.push(Entry::Comment(text.to_string()));
                    }
                }
                LineKind::Active(fields) | LineKind::Disabled(fields) => {
                    let paused = matches!(kind, LineKind::Disabled(_));
                    let mut job = build_job(&user, fields, paused, pending_comment.take());

                    let key = (job.schedule.clone(), job.command.clone());
                    let occurrence = occurrences.entry(key).or_insert(0);
                    if job.id.is_empty() || seen_ids.contains(&job.id) {
                        if !job.id.is_empty() {
                            warn!(user = %user, job_id = %job.id, "Duplicate job id in crontab, assigning a new one");
                        }
                        job.id = synthesize_id(&user, &job.schedule, &job.command, *occurrence);
                    }
                    *occurrence += 1;

                    seen_ids.insert(job.id.clone());
                    entries.push(Entry::Job(job));
                }
                LineKind::Blank => entries.push(Entry::Blank),
                LineKind::Other(text) => entries.push(Entry::Other(text.to_string())),
            }
        }

        Self { user, entries }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn jobs(&self) -> impl Iterator<Item = &CronJob> {
        self.entries.iter().filter_map(|e| match e {
            Entry::Job(job) => Some(job),
            _ => None,
        })
    }

    pub fn job_ids(&self) -> HashSet<String> {
        self.jobs().map(|j| j.id.clone()).collect()
    }

    pub fn find(&self, id: &str) -> Option<&CronJob> {
        self.jobs().find(|j| j.id == id)
    }

    /// Append a job at the end of the crontab.
    pub fn push_job(&mut self, job: CronJob) {
        // Keep a trailing standalone comment from attaching to the new job.
        if matches!(self.entries.last(), Some(Entry::Comment(_))) {
            self.entries.push(Entry::Blank);
        }
        self.entries.push(Entry::Job(job));
    }

    /// Replace the job with the same id in place.
    pub fn replace_job(&mut self, job: CronJob) -> bool {
        for entry in &mut self.entries {
            if let Entry::Job(existing) = entry {
                if existing.id == job.id {
                    *existing = job;
                    return true;
                }
            }
        }
        false
    }

    /// Remove a job and its comment line.
    pub fn remove_job(&mut self, id: &str) -> Option<CronJob> {
        let pos = self
            .entries
            .iter()
            .position(|e| matches!(e, Entry::Job(job) if job.id == id))?;
        let Entry::Job(job) = self.entries.remove(pos) else {
            return None;
        };
        // A standalone comment must not slide onto the next job.
        let comment_before = pos > 0 && matches!(self.entries[pos - 1], Entry::Comment(_));
        if comment_before && matches!(self.entries.get(pos), Some(Entry::Job(_))) {
            self.entries.insert(pos, Entry::Blank);
        }
        Some(job)
    }

    /// Render the full crontab text, normalized.
    pub fn render(&self, codec: &WrapperCodec) -> String {
        let mut lines = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            match entry {
                Entry::Job(job) => {
                    if let Some(comment) = comment_line(job) {
                        lines.push(comment);
                    }
                    lines.push(job_line(job, codec));
                }
                Entry::Comment(text) | Entry::Other(text) => lines.push(text.clone()),
                Entry::Blank => lines.push(String::new()),
            }
        }
        normalize_lines(&lines)
    }
}

fn build_job(user: &str, fields: &JobFields<'_>, paused: bool, comment_line: Option<&str>) -> CronJob {
    let raw = fields.command;
    let (comment, tagged_id) = comment_line.map(split_comment).unwrap_or((None, None));
    let id = wrapper::extract_job_id(raw)
        .map(String::from)
        .or(tagged_id)
        .unwrap_or_default();

    CronJob {
        id,
        schedule: fields.schedule.clone(),
        command: wrapper::unwrap_command(raw).to_string(),
        comment,
        user: user.to_string(),
        paused,
        logs_enabled: wrapper::is_wrapped(raw),
    }
}

/// Split a comment line into its text and an optional `| id: xxxx-xxxx` tag.
fn split_comment(line: &str) -> (Option<String>, Option<String>) {
    let text = line.trim_start_matches('#').trim();
    let (comment, id) = match ID_TAG_RE.captures(text) {
        Some(caps) => (
            caps.get(1).map_or("", |m| m.as_str()),
            caps.get(2).map(|m| m.as_str().to_string()),
        ),
        None => (text, None),
    };
    let comment = comment.trim();
    ((!comment.is_empty()).then(|| comment.to_string()), id)
}

/// Deterministic id for a line that carries none.
fn synthesize_id(user: &str, schedule: &str, command: &str, occurrence: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user.as_bytes());
    hasher.update([0]);
    hasher.update(schedule.as_bytes());
    hasher.update([0]);
    hasher.update(command.as_bytes());
    hasher.update([0]);
    hasher.update(occurrence.to_le_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{}-{}", &digest[..4], &digest[4..8])
}

fn comment_line(job: &CronJob) -> Option<String> {
    // Wrapped commands carry their id; everything else gets an id tag.
    if job.logs_enabled {
        return job.comment.as_ref().map(|c| format!("# {c}"));
    }
    Some(match &job.comment {
        Some(c) => format!("# {c} | id: {}", job.id),
        None => format!("# id: {}", job.id),
    })
}

fn job_line(job: &CronJob, codec: &WrapperCodec) -> String {
    let command = if job.logs_enabled {
        codec.wrap(&job.id, &job.command)
    } else {
        job.command.clone()
    };
    let fields = JobFields {
        schedule: job.schedule.split_whitespace().collect::<Vec<_>>().join(" "),
        command: &command,
    };
    if job.paused {
        LineKind::Disabled(fields).render()
    } else {
        LineKind::Active(fields).render()
    }
}

fn normalize_lines<S: AsRef<str>>(lines: &[S]) -> String {
    let mut out: Vec<&str> = Vec::with_capacity(lines.len());
    for line in lines {
        let line = line.as_ref().trim_end();
        if line.is_empty() && out.last().is_none_or(|prev| prev.is_empty()) {
            continue;
        }
        out.push(line);
    }
    while out.last().is_some_and(|l| l.is_empty()) {
        out.pop();
    }
    if out.is_empty() {
        String::new()
    } else {
        let mut text = out.join("\n");
        text.push('\n');
        text
    }
}

/// Collapse blank runs, trim surrounding blanks, end with one newline.
pub fn normalize_crontab(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    normalize_lines(&lines)
}
