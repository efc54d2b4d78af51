//! Axum server setup

use crate::error::{ServerError, ServerResult};
use crate::state::AppState;
use crate::tasks::{BackupTask, CronTask, HealthTask};
use crate::ws;
use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tether::{BackupSynchronizer, CliJobRegistry, GatewayStatus, TetherConfig};
use tether_host_interface::SandboxHost;
use tether_sentinel::{Sentinel, SentinelPolicy, TaskKind, TickStats};
use tower_http::trace::TraceLayer;

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub gateway: GatewayStatus,
    pub active_sessions: usize,
    pub uptime_s: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sentinel: Option<std::collections::BTreeMap<TaskKind, TickStats>>,
}

#[derive(Debug, Serialize)]
pub struct RestartResponse {
    pub restarted: bool,
    pub gateway: String,
}

/// Gateway status snapshot; never starts anything
async fn status_handler(State(state): State<AppState>) -> ServerResult<Json<StatusResponse>> {
    let gateway = state.supervisor.status().await?;
    Ok(Json(StatusResponse {
        gateway,
        active_sessions: state.sessions(),
        uptime_s: state.started_at.elapsed().as_secs(),
        sentinel: state.sentinel.as_ref().map(|s| s.snapshot()),
    }))
}

/// Explicit restart; failures surface as 502 with a hint
async fn restart_handler(State(state): State<AppState>) -> ServerResult<Json<RestartResponse>> {
    tracing::info!("Restart requested over the API");
    let handle = state.supervisor.restart().await?;
    Ok(Json(RestartResponse {
        restarted: true,
        gateway: handle.id().to_string(),
    }))
}

/// Edge liveness; does not touch the gateway
async fn healthz_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "tether-server",
        "version": tether::VERSION,
    }))
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        // WebSocket endpoints
        .route("/", get(ws::ws_handler))
        .route("/ws", get(ws::ws_handler))
        // Edge and gateway endpoints
        .route("/healthz", get(healthz_handler))
        .route("/api/status", get(status_handler))
        .route("/api/restart", post(restart_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Sentinel with the server's three periodic duties
pub fn build_sentinel(
    config: &TetherConfig,
    host: Arc<dyn SandboxHost>,
    state: &AppState,
) -> Result<Sentinel, ServerError> {
    let policy = SentinelPolicy {
        backup_interval_s: config.sentinel.backup_interval_s,
        cron_interval_s: config.sentinel.cron_interval_s,
        health_interval_s: config.sentinel.health_interval_s,
        ..Default::default()
    };
    let invalid = |e: tether_sentinel::SentinelError| ServerError::InvalidConfig(e.to_string());

    let mut sentinel = Sentinel::new(policy).map_err(invalid)?;
    if config.backup.enabled {
        let sync = BackupSynchronizer::new(host.clone(), config.backup.clone());
        sentinel = sentinel
            .with_task(Arc::new(BackupTask::new(sync)))
            .map_err(invalid)?;
    }
    if config.cron.enabled {
        let registry = Arc::new(CliJobRegistry::new(
            host,
            config.gateway.binary.clone(),
            &config.cron,
        ));
        sentinel = sentinel
            .with_task(Arc::new(CronTask::new(
                state.supervisor.clone(),
                registry,
                config.cron.jobs.clone(),
            )))
            .map_err(invalid)?;
    }
    sentinel
        .with_task(Arc::new(HealthTask::new(state.supervisor.clone())))
        .map_err(invalid)
}

/// Bring gateway state back from the bucket before anything can start it
///
/// Runs only with backup enabled and credentials present. A failed restore is
/// logged and the server boots anyway. Returns whether state was restored.
pub async fn restore_on_boot(config: &TetherConfig, host: Arc<dyn SandboxHost>) -> bool {
    if !config.backup.enabled {
        return false;
    }
    if config.backup.credentials.is_none() {
        tracing::info!("No storage credentials, skipping restore on boot");
        return false;
    }

    match BackupSynchronizer::new(host, config.backup.clone()).restore().await {
        Ok(restored) => restored,
        Err(e) => {
            tracing::warn!(error = %e, "Restore on boot failed, starting with current state");
            false
        }
    }
}

/// Run the edge server until the listener fails
pub async fn run_server(config: TetherConfig, host: Arc<dyn SandboxHost>) -> anyhow::Result<()> {
    tracing::info!("Starting Tether edge server v{}", tether::VERSION);

    restore_on_boot(&config, host.clone()).await;

    let state = AppState::new(config.clone(), host.clone());
    let sentinel = build_sentinel(&config, host, &state)?;
    let state = state.with_sentinel(sentinel.stats());

    tracing::info!("Starting sentinel ({:?})", sentinel.task_kinds());
    tokio::spawn(sentinel.run());

    let app = build_router(state);

    let addr = config.proxy.bind.clone();
    tracing::info!("Tether listening on http://{}", addr);
    tracing::info!("   WebSocket: ws://{}/ws", addr);
    tracing::info!("   Status: http://{}/api/status", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
