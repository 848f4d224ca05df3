//! cronpilot-gateway: HTTP surface and live event pipeline.
//!
//! Provides:
//! - REST job CRUD, run and backup endpoints
//! - Server-Sent Events stream of job lifecycle and log events
//! - Broadcast hub with per-subscriber heartbeats
//! - Run-log watcher feeding the hub
//! - Bearer token authentication
//! - HTTP health check endpoint

pub mod handlers;
pub mod hub;
pub mod sse;
pub mod watcher;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{delete, get, post};
use serde::Deserialize;
use tracing::{info, warn};

use cronpilot_config::CronPilotConfig;
use cronpilot_cron::manager::CronManager;
use cronpilot_exec::JobRunner;
use hub::BroadcastHub;
use watcher::LogWatcher;

/// Shared gateway state.
pub struct GatewayState {
    pub manager: Arc<CronManager>,
    pub runner: Arc<JobRunner>,
    pub hub: BroadcastHub,
    pub auth_token: Option<String>,
}

/// Build the router for a given state.
pub fn router(state: Arc<GatewayState>) -> Router {
    let api = Router::new()
        .route("/users", get(handlers::list_users))
        .route("/jobs", get(handlers::list_jobs).post(handlers::create_job))
        .route("/jobs/restore", post(handlers::restore_job))
        .route(
            "/jobs/{id}",
            get(handlers::get_job)
                .patch(handlers::update_job)
                .delete(handlers::delete_job),
        )
        .route("/jobs/{id}/pause", post(handlers::pause_job))
        .route("/jobs/{id}/resume", post(handlers::resume_job))
        .route("/jobs/{id}/run", post(handlers::run_job))
        .route("/jobs/{id}/backup", post(handlers::backup_job))
        .route(
            "/backups",
            get(handlers::list_backups).post(handlers::backup_all),
        )
        .route("/backups/{id}", delete(handlers::delete_backup))
        .route("/backups/{id}/restore", post(handlers::restore_backup))
        .route("/runs", get(handlers::list_runs))
        .route("/runs/{run_id}", delete(handlers::kill_run))
        .route("/events", get(sse::events_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api", api)
        .with_state(state)
}

/// Start the Gateway server.
///
/// Wires the crontab manager, job runner, event hub and log watcher together,
/// installs the wrapper script, then serves until Ctrl-C.
pub async fn start_gateway(config: CronPilotConfig, port_override: Option<u16>) -> anyhow::Result<()> {
    let port = port_override.unwrap_or(config.gateway.port);
    let host = config.gateway.host.clone();
    let log_dir = config.cron.log_dir();

    if let Err(e) = cronpilot_config::ensure_config_dir() {
        warn!("Failed to create config directory: {e}");
    }

    let manager = Arc::new(CronManager::from_config(&config.cron));
    match manager.install_wrapper_script(&log_dir).await {
        Ok(path) => info!("Wrapper script: {}", path.display()),
        Err(e) => warn!("Failed to install wrapper script, wrapped jobs will not log: {e}"),
    }

    let hub = BroadcastHub::from_config(&config.events);
    hub.start();

    let runner = Arc::new(JobRunner::from_config(
        manager.clone(),
        Arc::new(hub.clone()),
        &config.cron,
        &config.exec,
    ));

    let log_watcher = LogWatcher::new(&log_dir, Arc::new(hub.clone()));
    log_watcher.start();

    let state = Arc::new(GatewayState {
        manager: manager.clone(),
        runner,
        hub: hub.clone(),
        auth_token: config.gateway.auth_token.clone(),
    });
    let app = router(state);

    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    info!("Gateway listening on {addr}");
    info!("  REST:   http://{addr}/api/jobs");
    info!("  Events: http://{addr}/api/events");
    info!("  Health: http://{addr}/health");
    info!("  Mode:   {:?}", manager.target());
    info!("  Logs:   {}", log_dir.display());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    hub.stop();
    log_watcher.stop().await;
    served?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

/// Query parameters for token auth (EventSource cannot set headers).
#[derive(Deserialize, Default)]
struct TokenQuery {
    token: Option<String>,
}

/// Reject `/api` requests without the configured bearer token.
async fn require_auth(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<TokenQuery>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if let Some(expected_token) = &state.auth_token {
        let provided_token = extract_bearer_token(request.headers()).or(query.token.as_deref());
        match provided_token {
            Some(token) if token == expected_token => {}
            _ => {
                warn!(path = %request.uri().path(), "API authentication failed");
                return Err(StatusCode::UNAUTHORIZED);
            }
        }
    }
    Ok(next.run(request).await)
}

/// Extract bearer token from Authorization header.
fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::body::{Body, to_bytes};
    use tower::ServiceExt;

    use cronpilot_cron::memory::MemoryCrontab;
    use cronpilot_cron::wrapper::WrapperCodec;

    fn app(auth_token: Option<&str>) -> (Router, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let bridge = Arc::new(
            MemoryCrontab::new(vec!["root".into()])
                .with_crontab("root", "# nightly | id: ab12-cd34\n0 2 * * * /usr/bin/backup.sh\n"),
        );
        let manager = Arc::new(CronManager::new(
            bridge,
            WrapperCodec::new("/opt/cronpilot/cron-log-wrapper.sh"),
        ));
        let hub = BroadcastHub::new(Duration::from_secs(60), Duration::from_millis(3000), 16);
        hub.start();
        let runner = Arc::new(JobRunner::new(manager.clone(), Arc::new(hub.clone()), dir.path()));
        let state = Arc::new(GatewayState {
            manager,
            runner,
            hub,
            auth_token: auth_token.map(String::from),
        });
        (router(state), dir)
    }

    fn get_req(uri: &str) -> Request {
        axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[test]
    fn test_extract_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer my-secret-token".parse().unwrap());
        assert_eq!(extract_bearer_token(&headers), Some("my-secret-token"));
    }

    #[test]
    fn test_extract_bearer_token_missing() {
        let headers = HeaderMap::new();
        assert_eq!(extract_bearer_token(&headers), None);
    }

    #[test]
    fn test_extract_bearer_token_wrong_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Basic abc123".parse().unwrap());
        assert_eq!(extract_bearer_token(&headers), None);
    }

    #[tokio::test]
    async fn test_health_needs_no_token() {
        let (app, _dir) = app(Some("secret"));
        let response = app.oneshot(get_req("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_requires_token() {
        let (app, _dir) = app(Some("secret"));
        let response = app.clone().oneshot(get_req("/api/jobs")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let request = axum::http::Request::builder()
            .uri("/api/jobs")
            .header("authorization", "Bearer secret")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.oneshot(get_req("/api/jobs?token=secret")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_routes_reach_handlers() {
        let (app, _dir) = app(None);
        let response = app
            .clone()
            .oneshot(get_req("/api/jobs/ab12-cd34"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["data"]["comment"], "nightly");

        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/api/jobs/ab12-cd34/pause")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let request = axum::http::Request::builder()
            .method("PATCH")
            .uri("/api/jobs/ab12-cd34")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"comment":"weekly"}"#))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["data"]["comment"], "weekly");
        assert_eq!(body["data"]["paused"], true);

        let response = app.oneshot(get_req("/api/jobs/zzzz-9999")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
