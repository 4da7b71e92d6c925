use std::path::{Path, PathBuf};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use tokio::process::Command;

use crate::ssh::ActiveSessions;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub active_sessions: usize,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub storage: CheckResult,
    pub git: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy(detail: impl Into<String>) -> Self {
        Self {
            ok: true,
            detail: Some(detail.into()),
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state expected by the handler
// ---------------------------------------------------------------------------

/// Subset of `AppState` the health check needs.
#[derive(Clone)]
pub struct HealthState {
    pub repos_dir: PathBuf,
    pub sessions: ActiveSessions,
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

/// The repository root must exist and be a directory.
async fn check_storage(repos_dir: &Path) -> CheckResult {
    match tokio::fs::metadata(repos_dir).await {
        Ok(meta) if meta.is_dir() => CheckResult::healthy(repos_dir.display().to_string()),
        Ok(_) => CheckResult::unhealthy(format!("{} is not a directory", repos_dir.display())),
        Err(e) => CheckResult::unhealthy(format!("{}: {e}", repos_dir.display())),
    }
}

/// Every executor shells out to `git`, so it has to be on `PATH`.
async fn check_git() -> CheckResult {
    match Command::new("git").arg("--version").output().await {
        Ok(out) if out.status.success() => {
            CheckResult::healthy(String::from_utf8_lossy(&out.stdout).trim().to_string())
        }
        Ok(out) => CheckResult::unhealthy(format!("git --version exited with {}", out.status)),
        Err(e) => CheckResult::unhealthy(format!("failed to run git: {e}")),
    }
}

fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    if checks.storage.ok && checks.git.ok {
        HealthStatus::Ok
    } else {
        HealthStatus::Unhealthy
    }
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `GET /healthz` handler.  Returns 200 when healthy, 503 otherwise.
pub async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let (storage, git) = tokio::join!(check_storage(&state.repos_dir), check_git());

    let checks = HealthChecks { storage, git };
    let status = aggregate_status(&checks);
    let body = HealthResponse {
        status,
        active_sessions: state.sessions.count(),
        checks,
    };

    let http_status = match status {
        HealthStatus::Ok => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(body))
}
