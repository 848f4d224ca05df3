//! REST handlers for the job CRUD surface.
//!
//! Every answer is an [`ActionResult`]: `{success, message, data?}`.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use cronpilot_cron::{CronError, CronJob};
use cronpilot_exec::{Signal, parse_signal};
use cronpilot_types::{ActionResult, JobPatch, NewJob};

use crate::GatewayState;

type Shared = State<Arc<GatewayState>>;

/// A [`CronError`] rendered as `{success: false, message}`.
pub struct ApiError(pub StatusCode, pub String);

impl From<CronError> for ApiError {
    fn from(e: CronError) -> Self {
        let status = match &e {
            CronError::NotFound(_) => StatusCode::NOT_FOUND,
            CronError::Validation { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = match &e {
            CronError::ExecFailure { message, stderr } if !stderr.is_empty() => {
                format!("{message}: {stderr}")
            }
            _ => e.to_string(),
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!("Request failed: {message}");
        }
        ApiError(status, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(ActionResult::fail(self.1))).into_response()
    }
}

type ApiResult = Result<Json<ActionResult>, ApiError>;

fn ok(message: impl Into<String>, data: serde_json::Value) -> ApiResult {
    Ok(Json(ActionResult::ok(message).with_data(data)))
}

fn job_data(job: &CronJob) -> serde_json::Value {
    serde_json::to_value(job).unwrap_or_default()
}

/// GET /health
pub async fn health(State(state): Shared) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "subscribers": state.hub.subscriber_count(),
        "mode": match state.manager.target() {
            cronpilot_cron::bridge::ShellTarget::Local => "host",
            cronpilot_cron::bridge::ShellTarget::Host => "bridged",
        },
    }))
}

/// GET /api/users
pub async fn list_users(State(state): Shared) -> ApiResult {
    let users = state.manager.list_users().await;
    ok(format!("{} users", users.len()), json!(users))
}

#[derive(Debug, Default, Deserialize)]
pub struct JobsQuery {
    pub user: Option<String>,
}

/// GET /api/jobs?user=
pub async fn list_jobs(State(state): Shared, Query(query): Query<JobsQuery>) -> ApiResult {
    let jobs = match query.user.as_deref().filter(|u| !u.is_empty()) {
        Some(user) => state.manager.list_jobs(user).await,
        None => state.manager.list_all_jobs().await,
    };
    ok(format!("{} jobs", jobs.len()), json!(jobs))
}

/// GET /api/jobs/{id}
pub async fn get_job(State(state): Shared, Path(id): Path<String>) -> ApiResult {
    let job = state.manager.get_job(&id).await?;
    ok("Job found", job_data(&job))
}

/// POST /api/jobs
pub async fn create_job(State(state): Shared, Json(new): Json<NewJob>) -> ApiResult {
    let job = state.manager.create_job(new).await?;
    ok(format!("Job {} created", job.id), job_data(&job))
}

/// PATCH /api/jobs/{id}
pub async fn update_job(
    State(state): Shared,
    Path(id): Path<String>,
    Json(patch): Json<JobPatch>,
) -> ApiResult {
    let job = state.manager.update_job(&id, &patch).await?;
    ok(format!("Job {id} updated"), job_data(&job))
}

/// DELETE /api/jobs/{id}
pub async fn delete_job(State(state): Shared, Path(id): Path<String>) -> ApiResult {
    let job = state.manager.delete_job(&id).await?;
    ok(format!("Job {id} deleted"), job_data(&job))
}

/// POST /api/jobs/{id}/pause
pub async fn pause_job(State(state): Shared, Path(id): Path<String>) -> ApiResult {
    let job = state.manager.set_paused(&id, true).await?;
    ok(format!("Job {id} paused"), job_data(&job))
}

/// POST /api/jobs/{id}/resume
pub async fn resume_job(State(state): Shared, Path(id): Path<String>) -> ApiResult {
    let job = state.manager.set_paused(&id, false).await?;
    ok(format!("Job {id} resumed"), job_data(&job))
}

#[derive(Debug, Default, Deserialize)]
pub struct RunQuery {
    #[serde(default)]
    pub background: bool,
}

/// POST /api/jobs/{id}/run?background=
///
/// A job that runs but fails is still a 200 with `success: false`.
pub async fn run_job(
    State(state): Shared,
    Path(id): Path<String>,
    Query(query): Query<RunQuery>,
) -> ApiResult {
    let outcome = state.runner.execute(&id, query.background).await?;
    let data = serde_json::to_value(&outcome).unwrap_or_default();
    Ok(Json(ActionResult {
        success: outcome.success,
        message: outcome.message,
        data: Some(data),
    }))
}

/// POST /api/jobs/{id}/backup
pub async fn backup_job(State(state): Shared, Path(id): Path<String>) -> ApiResult {
    let path = state.manager.backup_job(&id).await?;
    ok(
        format!("Job {id} backed up"),
        json!({ "path": path.to_string_lossy() }),
    )
}

/// POST /api/jobs/restore
pub async fn restore_job(State(state): Shared, Json(record): Json<CronJob>) -> ApiResult {
    let job = state.manager.restore_job(record).await?;
    ok(format!("Job {} restored", job.id), job_data(&job))
}

/// GET /api/backups
pub async fn list_backups(State(state): Shared) -> ApiResult {
    let jobs = state.manager.list_backups()?;
    let dir = state
        .manager
        .backup_dir()
        .map(|d| d.to_string_lossy().into_owned());
    ok(format!("{} backups", jobs.len()), json!({ "dir": dir, "jobs": jobs }))
}

/// POST /api/backups
pub async fn backup_all(State(state): Shared) -> ApiResult {
    let count = state.manager.backup_all().await?;
    ok(format!("{count} jobs backed up"), json!({ "count": count }))
}

/// POST /api/backups/{id}/restore
pub async fn restore_backup(State(state): Shared, Path(id): Path<String>) -> ApiResult {
    let job = state.manager.restore_from_backup(&id).await?;
    ok(format!("Job {id} restored from backup"), job_data(&job))
}

/// DELETE /api/backups/{id}
pub async fn delete_backup(State(state): Shared, Path(id): Path<String>) -> ApiResult {
    if state.manager.delete_backup(&id)? {
        ok(format!("Backup {id} deleted"), json!({ "id": id }))
    } else {
        Err(CronError::NotFound(id).into())
    }
}

/// GET /api/runs
pub async fn list_runs(State(state): Shared) -> ApiResult {
    let runs = state.runner.registry().list().await;
    ok(format!("{} background runs", runs.len()), json!(runs))
}

#[derive(Debug, Default, Deserialize)]
pub struct KillQuery {
    pub signal: Option<String>,
}

/// DELETE /api/runs/{run_id}?signal=
pub async fn kill_run(
    State(state): Shared,
    Path(run_id): Path<String>,
    Query(query): Query<KillQuery>,
) -> ApiResult {
    let signal = match query.signal.as_deref() {
        Some(name) => parse_signal(name).ok_or_else(|| {
            ApiError::from(CronError::validation("signal", format!("unknown signal '{name}'")))
        })?,
        None => Signal::SIGTERM,
    };
    match state.runner.registry().kill(&run_id, signal).await {
        Some(true) => ok(format!("Sent {signal} to run {run_id}"), json!({ "runId": run_id })),
        Some(false) => Err(ApiError(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to signal run {run_id}"),
        )),
        None => Err(CronError::NotFound(run_id).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::body::to_bytes;
    use cronpilot_cron::manager::CronManager;
    use cronpilot_cron::memory::MemoryCrontab;
    use cronpilot_cron::store::BackupStore;
    use cronpilot_cron::wrapper::WrapperCodec;
    use cronpilot_exec::JobRunner;

    use crate::hub::BroadcastHub;

    fn state_with(crontab: &str) -> (Arc<GatewayState>, Arc<MemoryCrontab>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let bridge = Arc::new(MemoryCrontab::new(vec!["root".into()]).with_crontab("root", crontab));
        let backups = BackupStore::open(&dir.path().join("backup")).unwrap();
        let manager = Arc::new(
            CronManager::new(
                bridge.clone(),
                WrapperCodec::new("/opt/cronpilot/cron-log-wrapper.sh"),
            )
            .with_backups(backups),
        );
        let hub = BroadcastHub::new(
            std::time::Duration::from_secs(60),
            std::time::Duration::from_millis(3000),
            16,
        );
        let runner = Arc::new(JobRunner::new(
            manager.clone(),
            Arc::new(hub.clone()),
            dir.path(),
        ));
        let state = Arc::new(GatewayState {
            manager,
            runner,
            hub,
            auth_token: None,
        });
        (state, bridge, dir)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_missing_job_is_404() {
        let (state, _bridge, _dir) = state_with("");
        let response = get_job(State(state), Path("zzzz-9999".into()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert!(body["message"].as_str().unwrap().contains("zzzz-9999"));
    }

    #[tokio::test]
    async fn test_invalid_create_is_400() {
        let (state, bridge, _dir) = state_with("");
        let new = NewJob {
            schedule: "not a schedule".into(),
            command: "date".into(),
            comment: None,
            user: None,
            logs_enabled: false,
        };
        let response = create_job(State(state), Json(new)).await.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(bridge.write_count(), 0);
    }

    #[tokio::test]
    async fn test_create_then_list() {
        let (state, _bridge, _dir) = state_with("");
        let new = NewJob {
            schedule: "*/5 * * * *".into(),
            command: "/usr/bin/backup.sh".into(),
            comment: Some("backup".into()),
            user: None,
            logs_enabled: true,
        };
        let Json(created) = create_job(State(state.clone()), Json(new)).await.ok().unwrap();
        assert!(created.success);
        let id = created.data.unwrap()["id"].as_str().unwrap().to_string();

        let Json(listed) = list_jobs(State(state), Query(JobsQuery::default()))
            .await
            .ok()
            .unwrap();
        let jobs = listed.data.unwrap();
        assert_eq!(jobs[0]["id"], id.as_str());
        assert_eq!(jobs[0]["logsEnabled"], true);
        assert_eq!(jobs[0]["command"], "/usr/bin/backup.sh");
    }

    #[tokio::test]
    async fn test_write_failure_is_500() {
        let (state, bridge, _dir) = state_with("# id: ab12-cd34\n0 0 * * * date\n");
        bridge.set_fail_writes(true);
        let response = pause_job(State(state), Path("ab12-cd34".into()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert!(body["message"].as_str().unwrap().contains("writes disabled"));
    }

    #[tokio::test]
    async fn test_run_unknown_job_is_404() {
        let (state, _bridge, _dir) = state_with("");
        let response = run_job(
            State(state),
            Path("zzzz-9999".into()),
            Query(RunQuery::default()),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_backup_endpoints() {
        let (state, bridge, dir) = state_with("# id: ab12-cd34\n0 0 * * * date\n");

        let Json(saved) = backup_all(State(state.clone())).await.ok().unwrap();
        assert_eq!(saved.data.unwrap()["count"], 1);

        let Json(listed) = list_backups(State(state.clone())).await.ok().unwrap();
        let data = listed.data.unwrap();
        assert_eq!(data["jobs"][0]["id"], "ab12-cd34");
        assert_eq!(
            data["dir"].as_str().unwrap(),
            dir.path().join("backup").to_string_lossy()
        );

        delete_job(State(state.clone()), Path("ab12-cd34".into()))
            .await
            .ok()
            .unwrap();
        assert_eq!(bridge.crontab("root").unwrap(), "");
        let Json(restored) = restore_backup(State(state.clone()), Path("ab12-cd34".into()))
            .await
            .ok()
            .unwrap();
        assert!(restored.success);
        assert_eq!(bridge.crontab("root").unwrap(), "# id: ab12-cd34\n0 0 * * * date\n");

        delete_backup(State(state.clone()), Path("ab12-cd34".into()))
            .await
            .ok()
            .unwrap();
        let response = delete_backup(State(state), Path("ab12-cd34".into()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_kill_unknown_run_is_404() {
        let (state, _bridge, _dir) = state_with("");
        let response = kill_run(
            State(state.clone()),
            Path("nope".into()),
            Query(KillQuery::default()),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = kill_run(
            State(state),
            Path("nope".into()),
            Query(KillQuery {
                signal: Some("SIGBOGUS".into()),
            }),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
