//! Origin body forwarding with optional capture for a cache fill.
//!
//! Without a fill the origin stream becomes the client body as-is.  With a
//! fill, a task copies every chunk to the client and into a buffer; once the
//! origin body ends the buffer is written to the cache and only then is the
//! client body closed.

use std::time::SystemTime;

use axum::body::Body;
use axum::http::Method;
use bytes::BytesMut;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::cache::CacheStore;
use crate::metrics::MetricsRegistry;
use crate::proxy::transport::OriginResponse;

/// A pending cache write for one request.
pub struct CacheFill {
    pub cache: CacheStore,
    pub uri: String,
    pub metrics: MetricsRegistry,
}

impl CacheFill {
    /// Write `payload` to disk.  Failures are logged and counted, never
    /// returned: the client already has its response.
    async fn persist(self, payload: bytes::Bytes, modified: SystemTime) {
        let CacheFill {
            cache,
            uri,
            metrics,
        } = self;

        let key = uri.clone();
        let result =
            tokio::task::spawn_blocking(move || cache.save_to_disk(&key, &payload, modified))
                .await;

        match result {
            Ok(Ok(size)) => {
                metrics.metrics.cache_fill_bytes.inc_by(size);
            }
            Ok(Err(e)) => {
                warn!(%uri, error = %e, "cache write failed");
                metrics.metrics.cache_write_failures.inc();
            }
            Err(e) => {
                warn!(%uri, error = %e, "cache write task failed");
                metrics.metrics.cache_write_failures.inc();
            }
        }
    }
}

/// Turn an origin response body into the client body, capturing it for
/// `fill` when one is pending.  `HEAD` clients get an empty body.
pub fn forward_body(origin: OriginResponse, fill: Option<CacheFill>, method: &Method) -> Body {
    let head = *method == Method::HEAD;

    let Some(fill) = fill else {
        return if head {
            Body::empty()
        } else {
            Body::from_stream(origin.body)
        };
    };

    let modified = origin.last_modified().unwrap_or_else(SystemTime::now);
    let mut stream = origin.body;
    let (tx, rx) = mpsc::channel::<Result<bytes::Bytes, std::io::Error>>(32);

    tokio::spawn(async move {
        let mut buffer = BytesMut::new();

        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(chunk) => {
                    buffer.extend_from_slice(&chunk);
                    if !head && tx.send(Ok(chunk)).await.is_err() {
                        info!(uri = %fill.uri, "client closed connection, skipping cache fill");
                        return;
                    }
                }
                Err(e) => {
                    warn!(uri = %fill.uri, error = %e, "origin body failed, skipping cache fill");
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        }

        if buffer.is_empty() {
            debug!(uri = %fill.uri, "empty origin body, skipping cache fill");
            return;
        }

        fill.persist(buffer.freeze(), modified).await;
        drop(tx);
    });

    if head {
        Body::empty()
    } else {
        Body::from_stream(ReceiverStream::new(rx))
    }
}
