//! Fixed header allow-lists between client and origin.
//!
//! Nothing outside these lists crosses the proxy in either direction, so no
//! forwarding or internal host headers leak to origin or client.

use axum::http::header::{HeaderMap, HeaderName};

/// Headers forwarded from the client to a mirror.
pub const REQUEST_ALLOW_LIST: &[&str] = &[
    "accept",
    "accept-encoding",
    "accept-language",
    "authorization",
    "cache-control",
    "cookie",
    "range",
    "referer",
    "user-agent",
];

/// Headers returned from a mirror to the client.
pub const RESPONSE_ALLOW_LIST: &[&str] = &[
    "accept-ranges",
    "age",
    "allow",
    "content-encoding",
    "content-language",
    "content-type",
    "cache-control",
    "date",
    "etag",
    "expires",
    "last-modified",
    "location",
    "server",
    "vary",
];

pub fn filter_request_headers(headers: &HeaderMap) -> HeaderMap {
    filter(headers, REQUEST_ALLOW_LIST)
}

pub fn filter_response_headers(headers: &HeaderMap) -> HeaderMap {
    filter(headers, RESPONSE_ALLOW_LIST)
}

fn filter(headers: &HeaderMap, allowed: &[&'static str]) -> HeaderMap {
    let mut filtered = HeaderMap::new();
    for name in allowed {
        for value in headers.get_all(*name) {
            filtered.append(HeaderName::from_static(*name), value.clone());
        }
    }
    filtered
}

/// Make `dst` carry exactly the headers of `src`, mutating it in place:
/// names in both take the `src` values, names only in `dst` are removed and
/// names only in `src` are added.
pub fn merge_headers(dst: &mut HeaderMap, src: &HeaderMap) {
    let stale: Vec<HeaderName> = dst
        .keys()
        .filter(|name| !src.contains_key(*name))
        .cloned()
        .collect();
    for name in stale {
        dst.remove(&name);
    }

    for name in src.keys() {
        let mut values = src.get_all(name).iter();
        if let Some(first) = values.next() {
            dst.insert(name.clone(), first.clone());
            for value in values {
                dst.append(name.clone(), value.clone());
            }
        }
    }
}
