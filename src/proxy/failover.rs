//! Ordered mirror failover.
//!
//! Mirrors are tried strictly in configured order.  Transport errors and
//! non-200 answers are logged and move on to the next mirror; only total
//! exhaustion is reported to the caller.

use std::sync::Arc;
use std::time::Instant;

use axum::http::{HeaderMap, Method, StatusCode};
use reqwest::Url;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::headers::filter_request_headers;
use super::transport::{OriginRequest, OriginResponse, Transport};
use crate::metrics::{MetricsRegistry, MirrorLabels, MirrorResult};
use crate::registry::Repository;

#[derive(Debug, thiserror::Error)]
pub enum FailoverError {
    #[error("no mirror of '{handle}' returned 200 (last error: {})", .last_error.as_deref().unwrap_or("none"))]
    Exhausted {
        handle: String,
        last_error: Option<String>,
    },
    #[error("client closed connection")]
    Canceled,
}

#[derive(Clone)]
pub struct MirrorFailover {
    transport: Arc<dyn Transport>,
    metrics: MetricsRegistry,
}

impl MirrorFailover {
    pub fn new(transport: Arc<dyn Transport>, metrics: MetricsRegistry) -> Self {
        Self { transport, metrics }
    }

    /// Fetch `upstream_path` (already stripped of the handle) from the first
    /// mirror of `repo` that answers `200`.
    #[instrument(skip(self, repo, client_headers, cancel), fields(handle = %repo.handle))]
    pub async fn fetch(
        &self,
        repo: &Repository,
        method: &Method,
        upstream_path: &str,
        query: Option<&str>,
        client_headers: &HeaderMap,
        cancel: &CancellationToken,
    ) -> Result<OriginResponse, FailoverError> {
        let headers = filter_request_headers(client_headers);
        // Exhaustion reports the last transport error, else the last bad status.
        let mut last_transport_error: Option<String> = None;
        let mut last_status: Option<String> = None;

        for mirror in &repo.mirrors {
            let url = mirror_url(mirror, upstream_path, query);
            let request = OriginRequest {
                method: method.clone(),
                url: url.clone(),
                headers: headers.clone(),
            };

            let started = Instant::now();
            let attempt = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(FailoverError::Canceled),
                result = self.transport.round_trip(request) => result,
            };
            self.metrics
                .metrics
                .upstream_duration_seconds
                .observe(started.elapsed().as_secs_f64());

            match attempt {
                Ok(response) if response.status == StatusCode::OK => {
                    debug!(%url, "mirror answered");
                    self.record(mirror, MirrorResult::Ok);
                    return Ok(response);
                }
                Ok(response) => {
                    warn!(%url, status = %response.status, "mirror returned non-success status");
                    self.record(mirror, MirrorResult::BadStatus);
                    last_status = Some(format!("{url} returned status {}", response.status));
                }
                Err(e) => {
                    warn!(%url, error = %e, "mirror request failed");
                    self.record(mirror, MirrorResult::Error);
                    last_transport_error = Some(e.to_string());
                }
            }
        }

        Err(FailoverError::Exhausted {
            handle: repo.handle.clone(),
            last_error: last_transport_error.or(last_status),
        })
    }

    fn record(&self, mirror: &Url, result: MirrorResult) {
        self.metrics
            .metrics
            .mirror_requests_total
            .get_or_create(&MirrorLabels {
                mirror: mirror.host_str().unwrap_or_default().to_string(),
                result,
            })
            .inc();
    }
}

/// Join a mirror base URL with a handle-relative path and the client query.
pub fn mirror_url(mirror: &Url, upstream_path: &str, query: Option<&str>) -> Url {
    let mut url = mirror.clone();
    let path = format!(
        "{}/{}",
        mirror.path().trim_end_matches('/'),
        upstream_path.trim_start_matches('/')
    );
    url.set_path(&path);
    url.set_query(query);
    url
}
