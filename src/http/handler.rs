//! Axum router, auxiliary handlers and the error type for the HTTP surface.
//!
//! Routes:
//! - `GET  /healthz`   - Health check
//! - `GET  /metrics`   - Prometheus metrics
//! - anything else     - 404 unless the request pipeline claims it
//!
//! The request pipeline runs as a middleware in front of every route, so a
//! configured repository handle takes precedence over the routes above.

use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Context as _;
use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{HeaderValue, Method, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;
use tokio_util::io::ReaderStream;
use tracing::error;

use super::pipeline::{self, Phase};
use crate::AppState;
use crate::metrics::Outcome;
use crate::proxy::failover::FailoverError;

/// Non-standard status used for requests the client abandoned mid-proxy.
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with the pipeline middleware and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .fallback(handle_not_found)
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            pipeline::proxy_pipeline,
        ))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /healthz`
async fn handle_health(State(state): State<Arc<AppState>>) -> Response {
    crate::health::health_handler(&state).await
}

/// `GET /metrics`
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, ProxyError> {
    let buf = state.metrics.encode()?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

/// Default stage for requests outside every configured repository.
async fn handle_not_found() -> Response {
    ProxyError::NotFound.into_response()
}

// ---------------------------------------------------------------------------
// Cache hits
// ---------------------------------------------------------------------------

/// Serve a cached package straight from disk.
pub async fn serve_cached_file(path: &Path, method: &Method) -> Result<Response, ProxyError> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("open cached file: {}", path.display()))?;
    let metadata = file
        .metadata()
        .await
        .with_context(|| format!("stat cached file: {}", path.display()))?;

    let body = if *method == Method::HEAD {
        Body::empty()
    } else {
        Body::from_stream(ReaderStream::new(file))
    };

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(content_type_for_path(path)),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(metadata.len()));
    if let Some(value) = metadata
        .modified()
        .ok()
        .and_then(|mtime| HeaderValue::from_str(&http_date(mtime)).ok())
    {
        headers.insert(header::LAST_MODIFIED, value);
    }

    Ok(response)
}

/// Map a package filename to an appropriate Content-Type.
fn content_type_for_path(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("rpm" | "drpm" | "srpm") => "application/x-rpm",
        Some("deb" | "udeb" | "ddeb") => "application/vnd.debian.binary-package",
        Some("gz") => "application/gzip",
        Some("xz") => "application/x-xz",
        Some("bz2") => "application/x-bzip2",
        Some("zst") => "application/zstd",
        Some("xml") => "application/xml",
        _ => "application/octet-stream",
    }
}

/// Format a timestamp as an IMF-fixdate (`Mon, 01 Jan 2024 00:00:00 GMT`).
pub fn http_date(time: SystemTime) -> String {
    chrono::DateTime::<chrono::Utc>::from(time)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Terminal failures of the request pipeline, each mapped to a status and a
/// `{"message": ...}` body.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("{phase} does not allow method {method}")]
    MethodNotAllowed { phase: Phase, method: Method },
    #[error("Not Found")]
    NotFound,
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    BadGateway(String),
    #[error("client closed connection")]
    ClientCanceled,
    #[error("{0:#}")]
    Internal(anyhow::Error),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            ProxyError::NotFound => StatusCode::NOT_FOUND,
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            ProxyError::ClientCanceled => {
                StatusCode::from_u16(CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::BAD_REQUEST)
            }
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn outcome(&self) -> Outcome {
        match self {
            ProxyError::MethodNotAllowed { .. } => Outcome::MethodNotAllowed,
            ProxyError::NotFound => Outcome::NotFound,
            ProxyError::BadRequest(_) => Outcome::BadRequest,
            ProxyError::BadGateway(_) => Outcome::BadGateway,
            ProxyError::ClientCanceled => Outcome::ClientCanceled,
            ProxyError::Internal(_) => Outcome::Internal,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        if let ProxyError::Internal(err) = &self {
            error!(error = %err, "internal server error");
        }
        let status = self.status();
        (status, Json(json!({ "message": self.to_string() }))).into_response()
    }
}

impl From<anyhow::Error> for ProxyError {
    fn from(err: anyhow::Error) -> Self {
        ProxyError::Internal(err)
    }
}

impl From<FailoverError> for ProxyError {
    fn from(err: FailoverError) -> Self {
        match err {
            FailoverError::Canceled => ProxyError::ClientCanceled,
            exhausted @ FailoverError::Exhausted { .. } => {
                ProxyError::BadGateway(exhausted.to_string())
            }
        }
    }
}

/// `{"message": ...}` response with a success status.
pub fn message(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "message": message }))).into_response()
}
