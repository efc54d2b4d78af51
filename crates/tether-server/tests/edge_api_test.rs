//! Edge server HTTP surface and sentinel tasks against a mock sandbox
//!
//! Requests are driven through the router with `tower::ServiceExt::oneshot`;
//! no socket is bound.

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use std::sync::Arc;
use tether::{BackupSynchronizer, MockHost, Supervisor, TetherConfig};
use tether_host_interface::{ProcessStatus, SandboxHost};
use tether_sentinel::{SentinelTask, TaskKind, TickOutcome};
use tether_server::tasks::{BackupTask, CronTask, HealthTask};
use tether_server::{build_router, build_sentinel, restore_on_boot, AppState};
use tower::ServiceExt;

fn state(host: &MockHost) -> AppState {
    let host: Arc<dyn SandboxHost> = Arc::new(host.clone());
    AppState::new(TetherConfig::default(), host)
}

fn with_credentials() -> TetherConfig {
    let mut config = TetherConfig::default();
    config.backup.credentials = Some(tether_host_interface::StorageCredentials {
        access_key_id: "id".to_string(),
        secret_access_key: "secret".to_string(),
        endpoint: None,
    });
    config
}

async fn send(state: AppState, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = build_router(state)
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

// ============================================================
// HTTP routes
// ============================================================

#[tokio::test]
async fn test_healthz_does_not_touch_gateway() {
    let host = MockHost::new();
    let (status, body) = send(state(&host), "GET", "/healthz").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert!(host.started().is_empty());
}

#[tokio::test]
async fn test_status_reports_running_gateway() {
    let host = MockHost::new();
    host.add_process("/usr/local/bin/start-agentd.sh", ProcessStatus::Running);
    host.add_process("agentd cron list", ProcessStatus::Completed);

    let (status, body) = send(state(&host), "GET", "/api/status").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["gateway"]["gateway_processes"], 1);
    assert_eq!(body["gateway"]["zombie_processes"], 1);
    // Nothing persisted yet: first boot counts as drift
    assert_eq!(body["gateway"]["fingerprint_matches"], false);
    assert_eq!(body["active_sessions"], 0);
    assert!(host.started().is_empty());
}

#[tokio::test]
async fn test_restart_starts_fresh_gateway() {
    let host = MockHost::new();
    let old = host.add_process("/usr/local/bin/start-agentd.sh", ProcessStatus::Running);

    let (status, body) = send(state(&host), "POST", "/api/restart").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["restarted"], true);
    assert!(host.killed().contains(&old));
    assert_eq!(host.started().len(), 1);
}

#[tokio::test]
async fn test_restart_failure_is_502_with_hint() {
    let host = MockHost::new();
    host.fail_next_start("sandbox at capacity");

    let (status, body) = send(state(&host), "POST", "/api/restart").await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(body["error"].as_str().unwrap().contains("sandbox at capacity"));
    assert!(body["hint"].as_str().unwrap().contains("start command"));
}

// ============================================================
// Sentinel wiring
// ============================================================

#[tokio::test]
async fn test_sentinel_registers_enabled_tasks() {
    let host = MockHost::new();
    let mut config = TetherConfig::default();
    let app = state(&host);

    let sentinel = build_sentinel(&config, Arc::new(host.clone()), &app).unwrap();
    assert_eq!(
        sentinel.task_kinds(),
        vec![TaskKind::BackupSync, TaskKind::CronReconcile, TaskKind::HealthCheck]
    );

    config.backup.enabled = false;
    config.cron.enabled = false;
    let sentinel = build_sentinel(&config, Arc::new(host), &app).unwrap();
    assert_eq!(sentinel.task_kinds(), vec![TaskKind::HealthCheck]);
}

#[tokio::test]
async fn test_backup_tick_skips_incomplete_source() {
    let host = MockHost::new();
    let mut config = TetherConfig::default();
    config.backup.credentials = Some(tether_host_interface::StorageCredentials {
        access_key_id: "id".to_string(),
        secret_access_key: "secret".to_string(),
        endpoint: None,
    });

    let task = BackupTask::new(BackupSynchronizer::new(Arc::new(host.clone()), config.backup));

    assert_eq!(task.tick().await.unwrap(), TickOutcome::Idle);
    assert!(host.writes().is_empty());
}

#[tokio::test]
async fn test_backup_tick_fails_without_credentials() {
    let host = MockHost::new();
    let config = TetherConfig::default();
    let task = BackupTask::new(BackupSynchronizer::new(Arc::new(host), config.backup));

    let err = task.tick().await.unwrap_err();
    assert!(err.to_string().to_lowercase().contains("credential"));
}

#[tokio::test]
async fn test_idle_ticks_never_start_gateway() {
    let host = MockHost::new();
    let config = TetherConfig::default();
    let supervisor = Arc::new(Supervisor::new(
        Arc::new(host.clone()),
        config.gateway.clone(),
        config.supervisor.clone(),
    ));

    let health = HealthTask::new(supervisor.clone());
    assert_eq!(health.tick().await.unwrap(), TickOutcome::Idle);

    let registry = Arc::new(tether::CliJobRegistry::new(
        Arc::new(host.clone()),
        "agentd",
        &config.cron,
    ));
    let jobs = vec![tether::CronSpec {
        name: "auto-study".to_string(),
        interval: "6h".to_string(),
        message: "study".to_string(),
        model: None,
    }];
    let cron = CronTask::new(supervisor, registry, jobs);
    assert_eq!(cron.tick().await.unwrap(), TickOutcome::Idle);

    assert!(host.started().is_empty());
    assert!(host.executed().is_empty());
}

#[tokio::test]
async fn test_cron_tick_fails_when_registration_fails() {
    let host = MockHost::new();
    host.add_process("agentd gateway", ProcessStatus::Running);
    host.on_exec(|cmd| {
        if cmd.contains("cron add") {
            tether_host_interface::ExecOutput {
                exit_code: Some(1),
                stdout: String::new(),
                stderr: "registry locked".to_string(),
            }
        } else {
            tether_host_interface::ExecOutput::ok("")
        }
    });
    let config = TetherConfig::default();
    let supervisor = Arc::new(Supervisor::new(
        Arc::new(host.clone()),
        config.gateway.clone(),
        config.supervisor.clone(),
    ));
    let registry = Arc::new(tether::CliJobRegistry::new(
        Arc::new(host.clone()),
        "agentd",
        &config.cron,
    ));
    let jobs = vec![tether::CronSpec {
        name: "auto-study".to_string(),
        interval: "6h".to_string(),
        message: "study".to_string(),
        model: None,
    }];

    let err = CronTask::new(supervisor, registry, jobs)
        .tick()
        .await
        .unwrap_err();
    assert!(err.to_string().contains("auto-study"));
}

// ============================================================
// Boot
// ============================================================

#[tokio::test]
async fn test_boot_restores_empty_source_before_gateway() {
    let host = MockHost::new();
    let config = with_credentials();
    host.add_file(config.backup.marker_path(), "2026-10-19T00:00:00.000Z");
    let source_marker = BackupSynchronizer::new(Arc::new(host.clone()), config.backup.clone())
        .source_marker();
    let fs = host.clone();
    host.on_exec(move |_| {
        fs.add_file(source_marker.clone(), "{}");
        tether_host_interface::ExecOutput::ok("")
    });

    assert!(restore_on_boot(&config, Arc::new(host.clone())).await);

    assert_eq!(host.executed().len(), 1);
    assert!(host.executed()[0].contains(&config.backup.mount_path.display().to_string()));
    assert!(host.started().is_empty());
}

#[tokio::test]
async fn test_boot_survives_failed_restore() {
    let host = MockHost::new();
    let config = with_credentials();
    host.add_file(config.backup.marker_path(), "2026-10-19T00:00:00.000Z");
    host.on_exec(|_| tether_host_interface::ExecOutput {
        exit_code: Some(23),
        stdout: String::new(),
        stderr: "partial transfer".to_string(),
    });

    assert!(!restore_on_boot(&config, Arc::new(host.clone())).await);
    assert_eq!(host.executed().len(), 1);
    assert!(host.started().is_empty());
}

#[tokio::test]
async fn test_boot_skips_restore_without_credentials() {
    let host = MockHost::new();
    let config = TetherConfig::default();
    host.add_file(config.backup.marker_path(), "2026-10-19T00:00:00.000Z");

    assert!(!restore_on_boot(&config, Arc::new(host.clone())).await);
    assert!(host.executed().is_empty());
    assert!(host.mounts().is_empty());
}
