//! The per-request state machine.
//!
//! Requests whose first path segment is not a configured handle pass
//! through to the next stage untouched.  Everything else runs the cache
//! phase (method gate, delete, cache hit) and then the forward phase (mirror
//! failover, header filtering, optional cache fill).

use std::fmt;
use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::handler::{self, ProxyError};
use super::tee::{self, CacheFill};
use crate::AppState;
use crate::cache::CacheError;
use crate::metrics::Outcome;
use crate::proxy::failover::FailoverError;
use crate::proxy::headers::filter_response_headers;
use crate::registry::{Repository, strip_handle};

/// Per-request data carried through both phases.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Client path including the handle, captured before any rewriting.
    pub original_uri: String,
    pub handle: String,
    pub method: Method,
    pub query: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Cache,
    Forward,
}

impl Phase {
    fn allows(self, method: &Method) -> bool {
        match self {
            Phase::Cache => matches!(*method, Method::GET | Method::HEAD | Method::DELETE),
            Phase::Forward => matches!(*method, Method::GET | Method::HEAD),
        }
    }

    fn check(self, method: &Method) -> Result<(), ProxyError> {
        if self.allows(method) {
            Ok(())
        } else {
            Err(ProxyError::MethodNotAllowed {
                phase: self,
                method: method.clone(),
            })
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Cache => f.write_str("cache"),
            Phase::Forward => f.write_str("forward"),
        }
    }
}

// ---------------------------------------------------------------------------
// Middleware entry point
// ---------------------------------------------------------------------------

/// Axum middleware running the pipeline for configured repositories and
/// delegating everything else to `next`.
pub async fn proxy_pipeline(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(repo) = state.registry.resolve_uri(request.uri().path()) else {
        state.metrics.metrics.passthrough_total.inc();
        return next.run(request).await;
    };

    let (parts, _body) = request.into_parts();
    let ctx = RequestContext {
        original_uri: parts.uri.path().to_string(),
        handle: repo.handle.clone(),
        method: parts.method,
        query: parts.uri.query().map(str::to_string),
    };

    match handle_repository_request(&state, repo, &ctx, &parts.headers).await {
        Ok((outcome, response)) => {
            state.metrics.metrics.record(&ctx.handle, outcome);
            response
        }
        Err(err) => {
            // Abandoned fetches record themselves; see `forward`.
            if !matches!(err, ProxyError::ClientCanceled) {
                state.metrics.metrics.record(&ctx.handle, err.outcome());
            }
            debug!(uri = %ctx.original_uri, status = %err.status(), error = %err, "request rejected");
            err.into_response()
        }
    }
}

#[instrument(skip_all, fields(handle = %ctx.handle, method = %ctx.method, uri = %ctx.original_uri))]
async fn handle_repository_request(
    state: &AppState,
    repo: &Repository,
    ctx: &RequestContext,
    headers: &HeaderMap,
) -> Result<(Outcome, Response), ProxyError> {
    check_path(&ctx.original_uri)?;

    // ---------- cache phase ----------
    Phase::Cache.check(&ctx.method)?;

    if ctx.method == Method::DELETE {
        if !state.cache.is_cached(&ctx.original_uri).await {
            return Err(ProxyError::NotFound);
        }
        state
            .cache
            .delete_file(&ctx.original_uri)
            .await
            .map_err(|e| match e {
                CacheError::NotFound(_) => ProxyError::NotFound,
                e => ProxyError::Internal(e.into()),
            })?;
        info!("deleted cache entry");
        return Ok((Outcome::Deleted, handler::message(StatusCode::OK, "Success")));
    }

    let candidate = state.cache.is_cache_candidate(&ctx.original_uri);
    if candidate && state.cache.is_cached(&ctx.original_uri).await {
        debug!("cache hit");
        let path = state.cache.file_path(&ctx.original_uri);
        let response = handler::serve_cached_file(&path, &ctx.method).await?;
        return Ok((Outcome::ServedFromCache, response));
    }

    let fill = candidate.then(|| CacheFill {
        cache: state.cache.clone(),
        uri: ctx.original_uri.clone(),
        metrics: state.metrics.clone(),
    });

    // ---------- forward phase ----------
    Phase::Forward.check(&ctx.method)?;
    let response = forward(state, repo, ctx, headers, fill).await?;
    Ok((Outcome::Forwarded, response))
}

/// Fetch from the mirrors and stream the answer back to the client.
///
/// The fetch runs in its own task.  Dropping this future (the client went
/// away) cancels it through the token.
async fn forward(
    state: &AppState,
    repo: &Repository,
    ctx: &RequestContext,
    headers: &HeaderMap,
    fill: Option<CacheFill>,
) -> Result<Response, ProxyError> {
    let upstream_path = strip_handle(&ctx.original_uri, &repo.handle).to_string();
    debug!(%upstream_path, cache_fill = fill.is_some(), "forwarding to mirrors");

    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let fetch = tokio::spawn({
        let failover = state.failover.clone();
        let metrics = state.metrics.clone();
        let repo = repo.clone();
        let method = ctx.method.clone();
        let query = ctx.query.clone();
        let headers = headers.clone();
        let uri = ctx.original_uri.clone();
        async move {
            let result = failover
                .fetch(
                    &repo,
                    &method,
                    &upstream_path,
                    query.as_deref(),
                    &headers,
                    &cancel,
                )
                .await;
            if let Err(FailoverError::Canceled) = &result {
                info!(handle = %repo.handle, %uri, "client closed connection");
                metrics.metrics.record(&repo.handle, Outcome::ClientCanceled);
            }
            result
        }
    });

    let origin = fetch
        .await
        .map_err(|e| ProxyError::Internal(anyhow::anyhow!("mirror fetch task failed: {e}")))??;

    info!(mirror = %origin.url, status = %origin.status, "mirror response");

    let mut response_headers = filter_response_headers(&origin.headers);
    if let Some(len) = origin.content_length {
        response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    }
    let status = origin.status;
    let body = tee::forward_body(origin, fill, &ctx.method);

    let mut response = body.into_response();
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    Ok(response)
}

/// Reject paths that could escape the cache directory or the mirror's base
/// path.
fn check_path(uri: &str) -> Result<(), ProxyError> {
    if uri.contains('\\') || uri.contains('\0') || uri.split('/').any(is_dot_segment) {
        return Err(ProxyError::BadRequest(format!("invalid path: {uri:?}")));
    }
    Ok(())
}

/// `.` or `..`, including percent-encoded spellings that URL joining
/// normalizes the same way.
fn is_dot_segment(segment: &str) -> bool {
    let decoded = segment.to_ascii_lowercase().replace("%2e", ".");
    decoded == "." || decoded == ".."
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::{Duration, SystemTime};

    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::config::parse_config;
    use crate::http::handler::create_router;
    use crate::metrics::OutcomeLabels;
    use crate::proxy::transport::mock::MockTransport;
    use crate::registry::Registry;

    const CONFIG: &str = r#"
repositories:
  fedora:
    suffixes: [".rpm", ".drpm"]
    mirrors:
      - "http://a.example.org/fedora"
      - "http://b.example.org/fedora"
"#;

    const LAST_MODIFIED: &str = "Mon, 01 Jan 2024 00:00:00 GMT";

    fn state(base: &Path, origin: Arc<MockTransport>) -> Arc<AppState> {
        let config = parse_config(CONFIG).unwrap();
        let registry = Arc::new(Registry::from_config(&config).unwrap());
        Arc::new(AppState::new(registry, base.to_path_buf(), origin))
    }

    fn fedora_origin() -> MockTransport {
        MockTransport::new()
            .respond("http://a.example.org/fedora/x.rpm", 503, &[], b"unavailable")
            .respond(
                "http://b.example.org/fedora/x.rpm",
                200,
                &[
                    ("last-modified", LAST_MODIFIED),
                    ("content-type", "application/x-rpm"),
                    ("content-length", "3"),
                ],
                b"PKG",
            )
    }

    async fn send(state: &Arc<AppState>, method: Method, uri: &str) -> (StatusCode, HeaderMap, Vec<u8>) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("x-secret", "hunter2")
            .header("user-agent", "dnf/4.18")
            .body(Body::empty())
            .unwrap();
        let response = create_router(Arc::clone(state)).oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, headers, body.to_vec())
    }

    fn json_message(body: &[u8]) -> String {
        let value: serde_json::Value = serde_json::from_slice(body).unwrap();
        value["message"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn miss_fills_cache_and_second_get_stays_local() {
        let dir = tempfile::tempdir().unwrap();
        let origin = Arc::new(fedora_origin());
        let state = state(dir.path(), Arc::clone(&origin));

        let (status, headers, body) = send(&state, Method::GET, "/fedora/x.rpm").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"PKG");
        assert_eq!(headers["content-length"], "3");
        assert_eq!(
            origin.requested_urls(),
            vec![
                "http://a.example.org/fedora/x.rpm".to_string(),
                "http://b.example.org/fedora/x.rpm".to_string(),
            ]
        );

        let path = dir.path().join("fedora/x.rpm");
        assert_eq!(std::fs::read(&path).unwrap(), b"PKG");
        assert_eq!(
            std::fs::metadata(&path).unwrap().modified().unwrap(),
            SystemTime::UNIX_EPOCH + Duration::from_secs(1_704_067_200)
        );

        let (status, headers, body) = send(&state, Method::GET, "/fedora/x.rpm").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"PKG");
        assert_eq!(headers["last-modified"], LAST_MODIFIED);
        assert_eq!(headers["content-type"], "application/x-rpm");
        assert_eq!(origin.requests().len(), 2);
    }

    #[tokio::test]
    async fn head_on_cache_hit_has_headers_only() {
        let dir = tempfile::tempdir().unwrap();
        let origin = Arc::new(MockTransport::new());
        let state = state(dir.path(), Arc::clone(&origin));
        state
            .cache
            .save_to_disk("/fedora/x.rpm", b"PKG", SystemTime::now())
            .unwrap();

        let (status, headers, body) = send(&state, Method::HEAD, "/fedora/x.rpm").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["content-length"], "3");
        assert!(body.is_empty());
        assert!(origin.requests().is_empty());
    }

    #[tokio::test]
    async fn other_methods_are_rejected_regardless_of_cache_state() {
        let dir = tempfile::tempdir().unwrap();
        let origin = Arc::new(fedora_origin());
        let state = state(dir.path(), Arc::clone(&origin));

        let (status, _, body) = send(&state, Method::POST, "/fedora/x.rpm").await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(json_message(&body), "cache does not allow method POST");

        state
            .cache
            .save_to_disk("/fedora/x.rpm", b"PKG", SystemTime::now())
            .unwrap();
        let (status, _, _) = send(&state, Method::PUT, "/fedora/x.rpm").await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        assert!(origin.requests().is_empty());
    }

    #[tokio::test]
    async fn delete_removes_entry_and_next_get_refetches() {
        let dir = tempfile::tempdir().unwrap();
        let origin = Arc::new(fedora_origin());
        let state = state(dir.path(), Arc::clone(&origin));
        state
            .cache
            .save_to_disk("/fedora/x.rpm", b"OLD", SystemTime::now())
            .unwrap();

        let (status, _, body) = send(&state, Method::DELETE, "/fedora/x.rpm").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_message(&body), "Success");
        assert!(!dir.path().join("fedora/x.rpm").exists());

        let (status, _, body) = send(&state, Method::GET, "/fedora/x.rpm").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"PKG");
        assert_eq!(origin.requests().len(), 2);
    }

    #[tokio::test]
    async fn delete_of_absent_entry_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path(), Arc::new(MockTransport::new()));

        let (status, _, body) = send(&state, Method::DELETE, "/fedora/missing.rpm").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json_message(&body), "Not Found");
    }

    #[tokio::test]
    async fn unknown_handle_passes_through() {
        let dir = tempfile::tempdir().unwrap();
        let origin = Arc::new(MockTransport::new());
        let state = state(dir.path(), Arc::clone(&origin));

        let (status, _, _) = send(&state, Method::GET, "/centos/x.rpm").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _, _) = send(&state, Method::POST, "/centos/x.rpm").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(origin.requests().is_empty());
        assert_eq!(state.metrics.metrics.passthrough_total.get(), 2);
    }

    #[tokio::test]
    async fn headers_are_filtered_in_both_directions() {
        let dir = tempfile::tempdir().unwrap();
        let origin = Arc::new(MockTransport::new().respond(
            "http://a.example.org/fedora/repodata/repomd.xml?arch=x86_64",
            200,
            &[
                ("set-cookie", "session=abc"),
                ("x-served-by", "cache-1"),
                ("content-type", "application/xml"),
                ("etag", "\"v1\""),
            ],
            b"<repomd/>",
        ));
        let state = state(dir.path(), Arc::clone(&origin));

        let (status, headers, body) =
            send(&state, Method::GET, "/fedora/repodata/repomd.xml?arch=x86_64").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"<repomd/>");
        assert!(!headers.contains_key("set-cookie"));
        assert!(!headers.contains_key("x-served-by"));
        assert_eq!(headers["content-type"], "application/xml");
        assert_eq!(headers["etag"], "\"v1\"");

        let sent = &origin.requests()[0];
        assert_eq!(
            sent.url.as_str(),
            "http://a.example.org/fedora/repodata/repomd.xml?arch=x86_64"
        );
        assert!(!sent.headers.contains_key("x-secret"));
        assert_eq!(sent.headers["user-agent"], "dnf/4.18");

        // Metadata is never a cache candidate.
        assert!(!dir.path().join("fedora/repodata/repomd.xml").exists());
    }

    #[tokio::test]
    async fn all_mirrors_failing_is_bad_gateway() {
        let dir = tempfile::tempdir().unwrap();
        let origin = Arc::new(
            MockTransport::new()
                .respond("http://a.example.org/fedora/x.rpm", 500, &[], b"")
                .fail("http://b.example.org/fedora/x.rpm"),
        );
        let state = state(dir.path(), Arc::clone(&origin));

        let (status, _, body) = send(&state, Method::GET, "/fedora/x.rpm").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(json_message(&body).contains("connection refused"));
        assert!(!dir.path().join("fedora/x.rpm").exists());
        assert_eq!(origin.requests().len(), 2);
    }

    #[tokio::test]
    async fn redirect_response_replaces_original() {
        let dir = tempfile::tempdir().unwrap();
        let origin = Arc::new(
            MockTransport::new()
                .respond(
                    "http://a.example.org/fedora/x.rpm",
                    301,
                    &[("location", "http://geo.example.org/pub/x.rpm"), ("server", "a")],
                    b"",
                )
                .respond(
                    "http://geo.example.org/pub/x.rpm",
                    200,
                    &[("server", "geo"), ("last-modified", LAST_MODIFIED)],
                    b"PKG",
                ),
        );
        let state = state(dir.path(), Arc::clone(&origin));

        let (status, headers, body) = send(&state, Method::GET, "/fedora/x.rpm").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"PKG");
        assert_eq!(headers["server"], "geo");
        assert!(!headers.contains_key("location"));

        let requests = origin.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].method, Method::GET);
        assert!(dir.path().join("fedora/x.rpm").exists());
    }

    #[tokio::test]
    async fn traversal_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let origin = Arc::new(MockTransport::new());
        let state = state(dir.path(), Arc::clone(&origin));

        let (status, _, _) = send(&state, Method::GET, "/fedora/../../etc/passwd.rpm").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _, _) = send(&state, Method::DELETE, "/fedora/a/../../x.rpm").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _, body) =
            send(&state, Method::GET, "/fedora/%2e%2e/%2E%2e/%2e%2e/secret.rpm").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json_message(&body).starts_with("invalid path"));
        assert!(origin.requests().is_empty());
        assert!(!dir.path().join("fedora").exists());
    }

    fn outcome_count(state: &AppState, outcome: Outcome) -> u64 {
        state
            .metrics
            .metrics
            .requests_total
            .get_or_create(&OutcomeLabels {
                handle: "fedora".into(),
                outcome,
            })
            .get()
    }

    #[tokio::test]
    async fn dropped_request_cancels_mirror_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let origin = Arc::new(
            MockTransport::new()
                .stall("http://a.example.org/fedora/x.rpm")
                .respond("http://b.example.org/fedora/x.rpm", 200, &[], b"PKG"),
        );
        let state = state(dir.path(), Arc::clone(&origin));

        let request = Request::builder()
            .uri("/fedora/x.rpm")
            .body(Body::empty())
            .unwrap();
        let pending = create_router(Arc::clone(&state)).oneshot(request);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), pending)
                .await
                .is_err()
        );

        for _ in 0..100 {
            if outcome_count(&state, Outcome::ClientCanceled) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(outcome_count(&state, Outcome::ClientCanceled), 1);
        assert_eq!(outcome_count(&state, Outcome::BadGateway), 0);
        assert_eq!(outcome_count(&state, Outcome::Forwarded), 0);
        assert_eq!(
            origin.requested_urls(),
            vec!["http://a.example.org/fedora/x.rpm".to_string()]
        );
        assert!(!dir.path().join("fedora/x.rpm").exists());
    }

    #[tokio::test]
    async fn outcomes_are_counted() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path(), Arc::new(fedora_origin()));

        send(&state, Method::GET, "/fedora/x.rpm").await;
        send(&state, Method::GET, "/fedora/x.rpm").await;
        send(&state, Method::POST, "/fedora/x.rpm").await;

        let (status, _, body) = send(&state, Method::GET, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains(
            "pkgproxy_requests_total{handle=\"fedora\",outcome=\"Forwarded\"} 1"
        ));
        assert!(text.contains(
            "pkgproxy_requests_total{handle=\"fedora\",outcome=\"ServedFromCache\"} 1"
        ));
        assert!(text.contains(
            "pkgproxy_requests_total{handle=\"fedora\",outcome=\"MethodNotAllowed\"} 1"
        ));
    }

    #[test]
    fn phase_method_gates() {
        assert!(Phase::Cache.allows(&Method::DELETE));
        assert!(!Phase::Forward.allows(&Method::DELETE));
        assert!(!Phase::Cache.allows(&Method::OPTIONS));
        assert_eq!(
            Phase::Forward.check(&Method::PATCH).unwrap_err().to_string(),
            "forward does not allow method PATCH"
        );
    }

    #[test]
    fn path_checks() {
        assert!(check_path("/fedora/releases/39/x.rpm").is_ok());
        assert!(check_path("/fedora/..hidden.rpm").is_ok());
        assert!(check_path("/fedora/../x.rpm").is_err());
        assert!(check_path("/fedora/./x.rpm").is_err());
        assert!(check_path("/fedora/a\\b.rpm").is_err());
        for segment in ["%2e", "%2E", ".%2e", "%2e.", "%2e%2e", "%2E%2E"] {
            assert!(check_path(&format!("/fedora/{segment}/x.rpm")).is_err(), "{segment}");
        }
        assert!(check_path("/fedora/%2e%2e.rpm").is_ok());
        assert!(check_path("/fedora/a%2eb.rpm").is_ok());
    }
}
