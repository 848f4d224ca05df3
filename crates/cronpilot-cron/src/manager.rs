//! Job CRUD on top of the crontab bridge.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use cronpilot_config::CronConfig;
use cronpilot_types::{JobPatch, NewJob};

use crate::bridge::{BridgedCrontab, CrontabBridge, HostCrontab, NsenterExecutor, ShellTarget, run_shell};
use crate::commands::ShellCommand;
use crate::crontab::{CrontabDocument, validate_job};
use crate::store::BackupStore;
use crate::wrapper::{self, WrapperCodec};
use crate::{CronError, CronJob, Result, generate_job_id, unique_job_id};

/// Reads, mutates and rewrites user crontabs.
pub struct CronManager {
    bridge: Arc<dyn CrontabBridge>,
    codec: WrapperCodec,
    backups: Option<BackupStore>,
}

impl CronManager {
    /// Create a manager over an explicit bridge.
    pub fn new(bridge: Arc<dyn CrontabBridge>, codec: WrapperCodec) -> Self {
        Self {
            bridge,
            codec,
            backups: None,
        }
    }

    /// Build the host or bridged manager described by `config`.
    pub fn from_config(config: &CronConfig) -> Self {
        let bridge: Arc<dyn CrontabBridge> = if config.is_bridged() {
            info!("Running in bridged mode, crontabs are reached through the host namespaces");
            Arc::new(BridgedCrontab::new(
                Arc::new(NsenterExecutor),
                config.users.clone(),
                config.crontab_spool_dir.clone(),
            ))
        } else {
            Arc::new(HostCrontab::new(
                config.users.clone(),
                config.crontab_spool_dir.clone(),
            ))
        };
        let codec = WrapperCodec::new(config.wrapper_path().to_string_lossy());

        let manager = Self::new(bridge, codec);
        match BackupStore::open(&config.backup_dir()) {
            Ok(store) => manager.with_backups(store),
            Err(e) => {
                warn!("Backups disabled: {e}");
                manager
            }
        }
    }

    pub fn with_backups(mut self, store: BackupStore) -> Self {
        self.backups = Some(store);
        self
    }

    pub fn codec(&self) -> &WrapperCodec {
        &self.codec
    }

    /// Where job commands should run.
    pub fn target(&self) -> ShellTarget {
        self.bridge.target()
    }

    pub async fn list_users(&self) -> Vec<String> {
        self.bridge.list_users().await
    }

    async fn default_user(&self) -> String {
        self.list_users()
            .await
            .into_iter()
            .next()
            .unwrap_or_else(|| "root".to_string())
    }

    /// Parse a user's crontab, treating read failures as an empty crontab.
    pub async fn load(&self, user: &str) -> CrontabDocument {
        match self.bridge.read(user).await {
            Ok(text) => CrontabDocument::parse(user, &text),
            Err(e) => {
                warn!(user, "Failed to read crontab, showing it as empty: {e}");
                CrontabDocument::empty(user)
            }
        }
    }

    /// Parse a user's crontab for modification. Read failures propagate so an
    /// unreadable crontab is never overwritten.
    async fn load_for_update(&self, user: &str) -> Result<CrontabDocument> {
        let text = self.bridge.read(user).await?;
        Ok(CrontabDocument::parse(user, &text))
    }

    /// Find the crontab holding job `id`.
    async fn locate(&self, id: &str) -> Result<CrontabDocument> {
        let mut first_error = None;
        for user in self.list_users().await {
            match self.load_for_update(&user).await {
                Ok(doc) if doc.find(id).is_some() => return Ok(doc),
                Ok(_) => {}
                Err(e) => {
                    warn!(user = %user, "Skipping unreadable crontab while looking up {id}: {e}");
                    first_error.get_or_insert(e);
                }
            }
        }
        Err(first_error.unwrap_or_else(|| CronError::NotFound(id.to_string())))
    }

    async fn save(&self, doc: &CrontabDocument) -> Result<()> {
        let text = doc.render(&self.codec);
        self.bridge.write(doc.user(), &text).await
    }

    /// Jobs of one user. Never fails.
    pub async fn list_jobs(&self, user: &str) -> Vec<CronJob> {
        self.load(user).await.jobs().cloned().collect()
    }

    /// Jobs of every known user. Never fails.
    pub async fn list_all_jobs(&self) -> Vec<CronJob> {
        let mut jobs = Vec::new();
        for user in self.list_users().await {
            jobs.extend(self.list_jobs(&user).await);
        }
        jobs
    }

    pub async fn get_job(&self, id: &str) -> Result<CronJob> {
        for user in self.list_users().await {
            if let Some(job) = self.load(&user).await.find(id) {
                return Ok(job.clone());
            }
        }
        Err(CronError::NotFound(id.to_string()))
    }

    /// Create a job and append it to the user's crontab.
    pub async fn create_job(&self, new: NewJob) -> Result<CronJob> {
        let user = match new.user {
            Some(user) if !user.trim().is_empty() => user.trim().to_string(),
            _ => self.default_user().await,
        };
        let comment = new
            .comment
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(String::from);
        let mut job = CronJob {
            id: generate_job_id(),
            schedule: normalize_schedule(&new.schedule),
            command: wrapper::unwrap_command(new.command.trim()).to_string(),
            comment,
            user,
            paused: false,
            logs_enabled: new.logs_enabled,
        };
        validate_job(&job)?;

        let mut doc = self.load_for_update(&job.user).await?;
        let taken = doc.job_ids();
        if taken.contains(&job.id) {
            job.id = unique_job_id(&taken);
        }
        doc.push_job(job.clone());
        self.save(&doc).await?;

        info!(job_id = %job.id, user = %job.user, schedule = %job.schedule, "Cron job created");
        Ok(job)
    }

    /// Apply a partial update to a job.
    pub async fn update_job(&self, id: &str, patch: &JobPatch) -> Result<CronJob> {
        let mut doc = self.locate(id).await?;
        let mut job = doc
            .find(id)
            .cloned()
            .ok_or_else(|| CronError::NotFound(id.to_string()))?;

        patch.apply(&mut job);
        job.schedule = normalize_schedule(&job.schedule);
        job.command = wrapper::unwrap_command(&job.command).to_string();
        validate_job(&job)?;

        doc.replace_job(job.clone());
        self.save(&doc).await?;

        info!(job_id = %id, user = %job.user, "Cron job updated");
        Ok(job)
    }

    /// Remove a job from its crontab.
    pub async fn delete_job(&self, id: &str) -> Result<CronJob> {
        let mut doc = self.locate(id).await?;
        let job = doc
            .remove_job(id)
            .ok_or_else(|| CronError::NotFound(id.to_string()))?;
        self.save(&doc).await?;

        info!(job_id = %id, user = %job.user, "Cron job deleted");
        Ok(job)
    }

    pub async fn set_paused(&self, id: &str, paused: bool) -> Result<CronJob> {
        let patch = JobPatch {
            paused: Some(paused),
            ..Default::default()
        };
        self.update_job(id, &patch).await
    }

    /// Install a job record as-is, replacing any job with the same id.
    pub async fn restore_job(&self, mut job: CronJob) -> Result<CronJob> {
        job.schedule = normalize_schedule(&job.schedule);
        job.command = wrapper::unwrap_command(job.command.trim()).to_string();
        validate_job(&job)?;

        let mut doc = self.load_for_update(&job.user).await?;
        if !doc.replace_job(job.clone()) {
            doc.push_job(job.clone());
        }
        self.save(&doc).await?;

        info!(job_id = %job.id, user = %job.user, "Cron job restored");
        Ok(job)
    }

    fn backups(&self) -> Result<&BackupStore> {
        self.backups.as_ref().ok_or_else(|| {
            CronError::Io(std::io::Error::other("backup directory is not available"))
        })
    }

    /// Snapshot one job to the backup directory.
    pub async fn backup_job(&self, id: &str) -> Result<PathBuf> {
        let job = self.get_job(id).await?;
        self.backups()?.save(&job)
    }

    /// Snapshot every job. Returns how many were written.
    pub async fn backup_all(&self) -> Result<usize> {
        let store = self.backups()?;
        let jobs = self.list_all_jobs().await;
        for job in &jobs {
            store.save(job)?;
        }
        Ok(jobs.len())
    }

    /// Snapshots currently in the backup directory.
    pub fn list_backups(&self) -> Result<Vec<CronJob>> {
        self.backups()?.list()
    }

    /// Remove a snapshot. Returns whether it existed.
    pub fn delete_backup(&self, id: &str) -> Result<bool> {
        self.backups()?.delete(id)
    }

    /// Where snapshots are written, when backups are available.
    pub fn backup_dir(&self) -> Option<&std::path::Path> {
        self.backups.as_ref().map(BackupStore::dir)
    }

    /// Reinstall a job from its snapshot.
    pub async fn restore_from_backup(&self, id: &str) -> Result<CronJob> {
        let job = self.backups()?.load(id)?;
        self.restore_job(job).await
    }

    /// Write the bundled wrapper script to its configured path.
    pub async fn install_wrapper_script(&self, log_dir: &std::path::Path) -> Result<PathBuf> {
        let path = PathBuf::from(self.codec.script_path());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let script = wrapper::render_wrapper_script(&log_dir.to_string_lossy());
        std::fs::write(&path, script)?;

        let output = run_shell(
            self.target(),
            &ShellCommand::make_executable(&path).render(),
            None,
        )
        .await?;
        if !output.success() {
            return Err(CronError::ExecFailure {
                message: format!("chmod {} failed", path.display()),
                stderr: output.stderr,
            });
        }
        info!(path = %path.display(), "Wrapper script installed");
        Ok(path)
    }
}

fn normalize_schedule(schedule: &str) -> String {
    schedule.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCrontab;

    const WRAPPER: &str = "/opt/cronpilot/cron-log-wrapper.sh";

    fn manager_with(bridge: Arc<MemoryCrontab>) -> CronManager {
        CronManager::new(bridge, WrapperCodec::new(WRAPPER))
    }

    fn new_job(schedule: &str, command: &str, logs: bool) -> NewJob {
        NewJob {
            schedule: schedule.into(),
            command: command.into(),
            comment: None,
            user: None,
            logs_enabled: logs,
        }
    }

    #[tokio::test]
    async fn test_create_wraps_and_persists() {
        let bridge = Arc::new(MemoryCrontab::new(vec!["root".into()]));
        let manager = manager_with(bridge.clone());

        let job = manager
            .create_job(new_job("*/5 * * * *", "/usr/bin/backup.sh", true))
            .await
            .unwrap();
        assert!(crate::is_valid_job_id(&job.id));
        assert_eq!(job.user, "root");

        let text = bridge.crontab("root").unwrap();
        assert_eq!(
            text,
            format!("*/5 * * * * {WRAPPER} \"{}\" /usr/bin/backup.sh\n", job.id)
        );

        let listed = manager.list_jobs("root").await;
        assert_eq!(listed, vec![job]);
    }

    #[tokio::test]
    async fn test_create_rejects_bad_schedule() {
        let bridge = Arc::new(MemoryCrontab::new(vec!["root".into()]));
        let manager = manager_with(bridge.clone());
        let err = manager
            .create_job(new_job("every minute", "date", false))
            .await
            .unwrap_err();
        assert!(matches!(err, CronError::Validation { field: "schedule", .. }));
        assert_eq!(bridge.write_count(), 0);
    }

    #[tokio::test]
    async fn test_create_strips_user_supplied_wrapper() {
        let bridge = Arc::new(MemoryCrontab::new(vec!["root".into()]));
        let manager = manager_with(bridge);
        let wrapped = format!("{WRAPPER} \"zzzz-9999\" date");
        let job = manager.create_job(new_job("0 0 * * *", &wrapped, true)).await.unwrap();
        assert_eq!(job.command, "date");
        assert_ne!(job.id, "zzzz-9999");
    }

    #[tokio::test]
    async fn test_idle_read_returns_no_jobs() {
        let bridge = Arc::new(MemoryCrontab::new(vec!["nobody".into()]));
        let manager = manager_with(bridge);
        assert!(manager.list_jobs("nobody").await.is_empty());
    }

    #[tokio::test]
    async fn test_read_failure_degrades_to_empty() {
        let bridge = Arc::new(
            MemoryCrontab::new(vec!["root".into()]).with_crontab("root", "0 0 * * * date\n"),
        );
        bridge.set_fail_reads(true);
        let manager = manager_with(bridge);
        assert!(manager.list_all_jobs().await.is_empty());
    }

    #[tokio::test]
    async fn test_update_refuses_unreadable_crontab() {
        let bridge = Arc::new(
            MemoryCrontab::new(vec!["root".into()]).with_crontab("root", "0 0 * * * date\n"),
        );
        bridge.set_fail_reads(true);
        let manager = manager_with(bridge.clone());
        let err = manager
            .create_job(new_job("0 0 * * *", "ls", false))
            .await
            .unwrap_err();
        assert!(matches!(err, CronError::BridgeUnavailable(_)));
        assert_eq!(bridge.crontab("root").unwrap(), "0 0 * * * date\n");
    }

    #[tokio::test]
    async fn test_failed_write_leaves_crontab_untouched() {
        let original = format!("0 1 * * * {WRAPPER} \"ab12-cd34\" /usr/bin/report\n");
        let bridge = Arc::new(MemoryCrontab::new(vec!["root".into()]).with_crontab("root", &original));
        bridge.set_fail_writes(true);
        let manager = manager_with(bridge.clone());

        let err = manager.set_paused("ab12-cd34", true).await.unwrap_err();
        assert!(matches!(err, CronError::ExecFailure { .. }));
        assert_eq!(bridge.crontab("root").unwrap(), original);
    }

    #[tokio::test]
    async fn test_pause_resume_edit_delete() {
        let original = format!("# report\n0 1 * * * {WRAPPER} \"ab12-cd34\" /usr/bin/report\n");
        let bridge = Arc::new(
            MemoryCrontab::new(vec!["root".into(), "deploy".into()]).with_crontab("deploy", &original),
        );
        let manager = manager_with(bridge.clone());

        let paused = manager.set_paused("ab12-cd34", true).await.unwrap();
        assert!(paused.paused);
        assert_eq!(paused.user, "deploy");
        assert!(bridge.crontab("deploy").unwrap().contains("# [paused] 0 1 * * *"));
        assert!(manager.get_job("ab12-cd34").await.unwrap().paused);

        let resumed = manager.set_paused("ab12-cd34", false).await.unwrap();
        assert!(!resumed.paused);
        assert_eq!(bridge.crontab("deploy").unwrap(), original);

        let patch = JobPatch {
            schedule: Some("30   2 * * *".into()),
            logs_enabled: Some(false),
            ..Default::default()
        };
        let edited = manager.update_job("ab12-cd34", &patch).await.unwrap();
        assert_eq!(edited.schedule, "30 2 * * *");
        assert_eq!(
            bridge.crontab("deploy").unwrap(),
            "# report | id: ab12-cd34\n30 2 * * * /usr/bin/report\n"
        );
        assert_eq!(manager.get_job("ab12-cd34").await.unwrap(), edited);

        let deleted = manager.delete_job("ab12-cd34").await.unwrap();
        assert_eq!(deleted.command, "/usr/bin/report");
        assert_eq!(bridge.crontab("deploy").unwrap(), "");
        assert!(matches!(
            manager.get_job("ab12-cd34").await,
            Err(CronError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_id_is_not_found() {
        let bridge = Arc::new(MemoryCrontab::new(vec!["root".into()]));
        let manager = manager_with(bridge.clone());
        assert!(matches!(
            manager.delete_job("zzzz-9999").await,
            Err(CronError::NotFound(_))
        ));
        assert!(matches!(
            manager.update_job("zzzz-9999", &JobPatch::default()).await,
            Err(CronError::NotFound(_))
        ));
        assert_eq!(bridge.write_count(), 0);
    }

    #[tokio::test]
    async fn test_restore_replaces_or_appends() {
        let bridge = Arc::new(MemoryCrontab::new(vec!["root".into()]));
        let manager = manager_with(bridge.clone());
        let record = CronJob {
            id: "ab12-cd34".into(),
            schedule: "0 4 * * *".into(),
            command: "/usr/bin/backup.sh".into(),
            comment: Some("restored".into()),
            user: "root".into(),
            paused: true,
            logs_enabled: true,
        };
        manager.restore_job(record.clone()).await.unwrap();
        manager.restore_job(record.clone()).await.unwrap();

        let jobs = manager.list_jobs("root").await;
        assert_eq!(jobs, vec![record]);
    }

    #[tokio::test]
    async fn test_backup_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let original = "# id: ab12-cd34\n0 0 * * * date\n";
        let bridge = Arc::new(MemoryCrontab::new(vec!["root".into()]).with_crontab("root", original));
        let manager = manager_with(bridge.clone()).with_backups(BackupStore::open(dir.path()).unwrap());

        let path = manager.backup_job("ab12-cd34").await.unwrap();
        assert!(path.exists());
        assert_eq!(manager.backup_all().await.unwrap(), 1);

        manager.delete_job("ab12-cd34").await.unwrap();
        let restored = manager.restore_from_backup("ab12-cd34").await.unwrap();
        assert_eq!(restored.command, "date");
        assert_eq!(bridge.crontab("root").unwrap(), original);
    }

    #[tokio::test]
    async fn test_backup_without_store_fails() {
        let bridge = Arc::new(
            MemoryCrontab::new(vec!["root".into()]).with_crontab("root", "# id: ab12-cd34\n0 0 * * * date\n"),
        );
        let manager = manager_with(bridge);
        assert!(matches!(
            manager.backup_job("ab12-cd34").await,
            Err(CronError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_install_wrapper_script() {
        let dir = tempfile::tempdir().unwrap();
        let script_path = dir.path().join("scripts").join("cron-log-wrapper.sh");
        let bridge = Arc::new(MemoryCrontab::new(vec!["root".into()]));
        let manager = CronManager::new(bridge, WrapperCodec::new(script_path.to_string_lossy()));

        let installed = manager.install_wrapper_script(&dir.path().join("logs")).await.unwrap();
        assert_eq!(installed, script_path);
        let content = std::fs::read_to_string(&installed).unwrap();
        assert!(content.contains(&dir.path().join("logs").to_string_lossy().to_string()));

        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&installed).unwrap().permissions().mode();
        assert_ne!(mode & 0o111, 0);
    }
}
