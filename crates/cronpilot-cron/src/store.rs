//! Per-job JSON snapshots for backup and restore.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{CronError, CronJob, Result, is_valid_job_id};

/// Directory of `<id>.json` job snapshots.
pub struct BackupStore {
    dir: PathBuf,
}

impl BackupStore {
    /// Open a backup store, creating the directory if needed.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        if !is_valid_job_id(id) {
            return Err(CronError::validation("id", format!("'{id}' is not xxxx-xxxx")));
        }
        Ok(self.dir.join(format!("{id}.json")))
    }

    /// Write (or overwrite) the snapshot of a job.
    pub fn save(&self, job: &CronJob) -> Result<PathBuf> {
        let path = self.path_for(&job.id)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(job)?)?;
        std::fs::rename(&tmp, &path)?;
        debug!(job_id = %job.id, path = %path.display(), "Job snapshot written");
        Ok(path)
    }

    /// Load a snapshot by job id.
    pub fn load(&self, id: &str) -> Result<CronJob> {
        let path = self.path_for(id)?;
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(CronError::NotFound(id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// All readable snapshots. Corrupt files are skipped.
    pub fn list(&self) -> Result<Vec<CronJob>> {
        let mut jobs = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read_to_string(&path)
                .map_err(CronError::from)
                .and_then(|c| serde_json::from_str::<CronJob>(&c).map_err(CronError::from))
            {
                Ok(job) => jobs.push(job),
                Err(e) => warn!(path = %path.display(), "Skipping unreadable job snapshot: {e}"),
            }
        }
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(jobs)
    }

    /// Delete a snapshot. Returns whether it existed.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let path = self.path_for(id)?;
        match std::fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str) -> CronJob {
        CronJob {
            id: id.into(),
            schedule: "0 2 * * *".into(),
            command: "/usr/bin/backup.sh".into(),
            comment: Some("nightly".into()),
            user: "root".into(),
            paused: true,
            logs_enabled: true,
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackupStore::open(dir.path()).unwrap();
        let path = store.save(&sample("ab12-cd34")).unwrap();
        assert!(path.ends_with("ab12-cd34.json"));
        assert_eq!(store.load("ab12-cd34").unwrap(), sample("ab12-cd34"));
    }

    #[test]
    fn test_snapshot_uses_wire_field_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackupStore::open(dir.path()).unwrap();
        let path = store.save(&sample("ab12-cd34")).unwrap();
        let raw = std::fs::read_to_string(path).unwrap();
        assert!(raw.contains("\"logsEnabled\": true"));
    }

    #[test]
    fn test_missing_snapshot_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackupStore::open(dir.path()).unwrap();
        assert!(matches!(store.load("zzzz-0000"), Err(CronError::NotFound(_))));
        assert!(!store.delete("zzzz-0000").unwrap());
    }

    #[test]
    fn test_rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackupStore::open(dir.path()).unwrap();
        assert!(matches!(
            store.load("../../etc/passwd"),
            Err(CronError::Validation { .. })
        ));
    }

    #[test]
    fn test_list_skips_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackupStore::open(dir.path()).unwrap();
        store.save(&sample("bbbb-0002")).unwrap();
        store.save(&sample("aaaa-0001")).unwrap();
        std::fs::write(dir.path().join("cccc-0003.json"), "{not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignore").unwrap();

        let ids: Vec<String> = store.list().unwrap().into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec!["aaaa-0001", "bbbb-0002"]);
        assert!(store.delete("aaaa-0001").unwrap());
        assert_eq!(store.list().unwrap().len(), 1);
    }
}
