//! In-memory crontab bridge for tests and dry runs.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::bridge::{CrontabBridge, ShellTarget};
use crate::{CronError, Result};

/// Keeps crontab text per user in a map.
#[derive(Default)]
pub struct MemoryCrontab {
    tabs: Mutex<HashMap<String, String>>,
    users: Vec<String>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryCrontab {
    pub fn new(users: Vec<String>) -> Self {
        Self {
            users,
            ..Default::default()
        }
    }

    /// Seed a user's crontab text.
    pub fn with_crontab(self, user: &str, text: &str) -> Self {
        self.tabs_lock().insert(user.to_string(), text.to_string());
        self
    }

    pub fn crontab(&self, user: &str) -> Option<String> {
        self.tabs_lock().get(user).cloned()
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn tabs_lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.tabs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl CrontabBridge for MemoryCrontab {
    async fn read(&self, user: &str) -> Result<String> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(CronError::BridgeUnavailable("reads disabled".into()));
        }
        Ok(self.crontab(user).unwrap_or_default())
    }

    async fn write(&self, user: &str, content: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CronError::ExecFailure {
                message: "crontab exited with code 1".into(),
                stderr: "writes disabled".into(),
            });
        }
        self.tabs_lock().insert(user.to_string(), content.to_string());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list_users(&self) -> Vec<String> {
        if self.users.is_empty() {
            let mut users: Vec<String> = self.tabs_lock().keys().cloned().collect();
            users.sort();
            users
        } else {
            self.users.clone()
        }
    }

    fn target(&self) -> ShellTarget {
        ShellTarget::Local
    }
}
