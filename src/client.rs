// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Pipeline-facing HTTP client built on the caching transport.

use crate::cache::Cache;
use crate::error::{Error, Result};
use crate::headers::CACHE_TIMESTAMP_HEADER;
use crate::store::parse_timestamp;
use crate::transport::{CachingTransport, HyperTransport, Transport};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hyper::{Method, Request, Response, StatusCode};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// HTTP client whose requests may be answered from the cache.
#[derive(Clone)]
pub struct CachedClient {
    transport: Arc<dyn Transport>,
    cache: Option<Cache>,
}

/// Result of [`CachedClient::download`].
#[derive(Clone, Debug)]
pub struct Download {
    pub body: Bytes,
    pub status: StatusCode,
    /// When the body was fetched from the origin, which for cache hits is
    /// the stored time rather than now.
    pub fetched_at: DateTime<Utc>,
}

/// Builds the client used by scrapers.
///
/// Without a database path the client goes straight to the network. With
/// one, the path must be absolute and every exchange goes through the cache
/// stored there.
pub async fn new_http_client(db_path: Option<&Path>) -> Result<CachedClient> {
    let Some(path) = db_path else {
        info!("no cache database configured, using fallback client without caching");
        return Ok(CachedClient::uncached(HyperTransport::new()?));
    };

    if !path.is_absolute() {
        return Err(Error::InvalidPath(path.display().to_string()));
    }

    let network = HyperTransport::new()?;
    let cache = Cache::open(path).await?;
    info!(db = %path.display(), "http cache enabled");
    Ok(CachedClient::cached(cache, network))
}

impl CachedClient {
    /// Client that talks to `inner` directly.
    pub fn uncached<T: Transport + 'static>(inner: T) -> Self {
        Self {
            transport: Arc::new(inner),
            cache: None,
        }
    }

    /// Client that consults `cache` before `inner`.
    pub fn cached<T: Transport + 'static>(cache: Cache, inner: T) -> Self {
        Self {
            transport: Arc::new(CachingTransport::new(cache.clone(), inner)),
            cache: Some(cache),
        }
    }

    /// The cache behind this client, for manual splicing.
    pub fn cache(&self) -> Option<&Cache> {
        self.cache.as_ref()
    }

    pub async fn send(&self, req: Request<Bytes>) -> Result<Response<Bytes>> {
        self.transport.round_trip(req).await
    }

    pub async fn get(&self, url: &str) -> Result<Response<Bytes>> {
        let req = Request::builder()
            .method(Method::GET)
            .uri(url)
            .body(Bytes::new())?;
        self.send(req).await
    }

    /// GETs `url`, failing on anything but `200 OK`.
    pub async fn download(&self, url: &str, timeout: Duration) -> Result<Download> {
        let resp = tokio::time::timeout(timeout, self.get(url))
            .await
            .map_err(|_| Error::Timeout(url.to_string()))??;

        let status = resp.status();
        if status != StatusCode::OK {
            return Err(Error::UnexpectedStatus(status.as_u16()));
        }

        let fetched_at = resp
            .headers()
            .get(CACHE_TIMESTAMP_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_timestamp(v).ok())
            .unwrap_or_else(Utc::now);

        Ok(Download {
            body: resp.into_body(),
            status,
            fetched_at,
        })
    }
}

/// [`CachedClient::download`] with exponential backoff between attempts.
///
/// `max_retries` is the total number of attempts (at least one is made). The
/// delay starts at `base_delay` and doubles after every failure; there is no
/// sleep after the final attempt.
pub async fn download_with_retry(
    client: &CachedClient,
    url: &str,
    timeout: Duration,
    max_retries: u32,
    base_delay: Duration,
) -> Result<Download> {
    let attempts = max_retries.max(1);
    let mut delay = base_delay;
    let mut attempt = 1;

    loop {
        let err = match client.download(url, timeout).await {
            Ok(download) => return Ok(download),
            Err(e) => e,
        };

        warn!(%url, attempt, max_tries = attempts, error = %err, ?delay, "download attempt failed");
        if attempt >= attempts {
            return Err(Error::RetriesExhausted {
                attempts,
                source: Box::new(err),
            });
        }

        tokio::time::sleep(delay).await;
        delay *= 2;
        attempt += 1;
    }
}
