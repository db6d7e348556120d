//! The "send one request to an origin, get one response" capability.
//!
//! Everything that talks to a mirror goes through the [`Transport`] trait so
//! that redirect following composes around it as a decorator and tests can
//! substitute a scripted origin.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use axum::http::{HeaderMap, Method, StatusCode, Version, header};
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use reqwest::Url;

/// Streaming response body as handed from origin to client.
pub type BodyStream = BoxStream<'static, Result<Bytes, std::io::Error>>;

#[derive(Debug, Clone)]
pub struct OriginRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
}

pub struct OriginResponse {
    pub version: Version,
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Declared body length, from the origin's `Content-Length`.
    pub content_length: Option<u64>,
    /// URL that produced this response (after any redirect hop).
    pub url: Url,
    pub body: BodyStream,
}

impl fmt::Debug for OriginResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OriginResponse")
            .field("version", &self.version)
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("content_length", &self.content_length)
            .field("url", &self.url.as_str())
            .finish_non_exhaustive()
    }
}

impl OriginResponse {
    /// Origin `Last-Modified` as a timestamp, when present and parseable.
    pub fn last_modified(&self) -> Option<SystemTime> {
        let value = self.headers.get(header::LAST_MODIFIED)?.to_str().ok()?;
        chrono::DateTime::parse_from_rfc2822(value)
            .ok()
            .map(SystemTime::from)
    }
}

pub(crate) fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: Url,
        #[source]
        source: reqwest::Error,
    },
    #[error("redirect from {url} has no usable Location header")]
    MissingLocation { url: Url },
    #[error("{url} unreachable: {message}")]
    Unreachable { url: Url, message: String },
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Transport: Send + Sync {
    async fn round_trip(&self, request: OriginRequest) -> Result<OriginResponse, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn round_trip(&self, request: OriginRequest) -> Result<OriginResponse, TransportError> {
        (**self).round_trip(request).await
    }
}

// ---------------------------------------------------------------------------
// reqwest-backed transport
// ---------------------------------------------------------------------------

/// Transport over a shared [`reqwest::Client`].  Automatic redirects are
/// disabled; redirect handling belongs to [`super::redirect::FollowRedirect`].
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Option<Duration>) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(10));
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build reqwest client: {e}"))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn round_trip(&self, request: OriginRequest) -> Result<OriginResponse, TransportError> {
        let url = request.url.clone();
        let response = self
            .client
            .request(request.method, request.url)
            .headers(request.headers)
            .send()
            .await
            .map_err(|source| TransportError::Request {
                url: url.clone(),
                source,
            })?;

        let headers = response.headers().clone();
        Ok(OriginResponse {
            version: response.version(),
            status: response.status(),
            content_length: content_length(&headers),
            headers,
            url: response.url().clone(),
            body: response.bytes_stream().map_err(std::io::Error::other).boxed(),
        })
    }
}

// ---------------------------------------------------------------------------
// Scripted origin for tests
// ---------------------------------------------------------------------------
