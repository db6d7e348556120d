//! Single-hop redirect resolution.
//!
//! Mirrors commonly answer with a redirect to a geographically closer host.
//! [`FollowRedirect`] wraps another [`Transport`] and, when the response is a
//! redirect, reissues the request as a `GET` to the `Location` target and
//! substitutes that response for the original one.  Only one hop is
//! followed.  `HEAD` requests are followed with `GET` as well.

use async_trait::async_trait;
use axum::http::{HeaderMap, Method, StatusCode, header};
use tracing::debug;

use super::headers::{filter_request_headers, merge_headers};
use super::transport::{OriginRequest, OriginResponse, Transport, TransportError};

const REDIRECT_STATUSES: [StatusCode; 5] = [
    StatusCode::MOVED_PERMANENTLY,
    StatusCode::FOUND,
    StatusCode::SEE_OTHER,
    StatusCode::TEMPORARY_REDIRECT,
    StatusCode::PERMANENT_REDIRECT,
];

pub fn is_redirect(status: StatusCode) -> bool {
    REDIRECT_STATUSES.contains(&status)
}

#[derive(Debug, Clone)]
pub struct FollowRedirect<T> {
    inner: T,
}

impl<T: Transport> FollowRedirect<T> {
    pub fn new(inner: T) -> Self {
        Self { inner }
    }

    /// Replace `response` with the response from its `Location` target.
    async fn follow(
        &self,
        response: &mut OriginResponse,
        request_headers: &HeaderMap,
    ) -> Result<(), TransportError> {
        let location = response
            .headers
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| response.url.join(v).ok())
            .ok_or_else(|| TransportError::MissingLocation {
                url: response.url.clone(),
            })?;

        debug!(from = %response.url, to = %location, status = %response.status, "following redirect");

        let redirected = self
            .inner
            .round_trip(OriginRequest {
                method: Method::GET,
                url: location,
                headers: filter_request_headers(request_headers),
            })
            .await?;

        replace_response(response, redirected);
        Ok(())
    }
}

#[async_trait]
impl<T: Transport> Transport for FollowRedirect<T> {
    async fn round_trip(&self, request: OriginRequest) -> Result<OriginResponse, TransportError> {
        let request_headers = request.headers.clone();
        let mut response = self.inner.round_trip(request).await?;
        if is_redirect(response.status) {
            self.follow(&mut response, &request_headers).await?;
        }
        Ok(response)
    }
}

/// Overwrite `dst` with `src`, merging headers in place.
fn replace_response(dst: &mut OriginResponse, src: OriginResponse) {
    dst.version = src.version;
    dst.status = src.status;
    dst.content_length = src.content_length;
    dst.url = src.url;
    dst.body = src.body;
    merge_headers(&mut dst.headers, &src.headers);
}
