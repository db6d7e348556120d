use std::path::{Path, PathBuf};

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::AppState;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub repositories: usize,
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
    pub cache_dir: CheckResult,
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
// Individual checks
// ---------------------------------------------------------------------------

/// The cache directory must exist and accept new files.
async fn check_cache_dir(base: PathBuf) -> CheckResult {
    let result = tokio::task::spawn_blocking(move || probe_writable(&base)).await;

    match result {
        Ok(Ok(path)) => CheckResult::healthy(format!("{} is writable", path.display())),
        Ok(Err(e)) => CheckResult::unhealthy(format!("cache dir check failed: {e}")),
        Err(e) => CheckResult::unhealthy(format!("cache dir check task failed: {e}")),
    }
}

fn probe_writable(base: &Path) -> anyhow::Result<PathBuf> {
    anyhow::ensure!(base.is_dir(), "{} is not a directory", base.display());
    // Dropped immediately; the probe file is removed on drop.
    tempfile::Builder::new()
        .prefix(".pkgproxy-health-")
        .tempfile_in(base)?;
    Ok(base.to_path_buf())
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// Body of `GET /healthz`.  Returns 200 when every check passes, 503
/// otherwise.
pub async fn health_handler(state: &AppState) -> Response {
    let cache_dir = check_cache_dir(state.cache.base_path.clone()).await;

    let status = if cache_dir.ok {
        HealthStatus::Ok
    } else {
        HealthStatus::Unhealthy
    };
    let body = HealthResponse {
        status,
        repositories: state.registry.len(),
        checks: HealthChecks { cache_dir },
    };

    let http_status = match status {
        HealthStatus::Ok => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(body)).into_response()
}
