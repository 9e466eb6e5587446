// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! HTTP-shaped facade over the [`Store`].
//!
//! Responses handed out by the facade always carry `X-Cache-Timestamp`
//! (RFC3339) with the stored time of the entry, both on hits and on the
//! response returned from [`Cache::set`].

use crate::error::{Error, Result};
use crate::headers::{to_header_map, to_headers, CACHE_TIMESTAMP_HEADER};
use crate::store::{format_timestamp, CacheEntry, CacheKey, Store};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderMap, HeaderValue};
use hyper::{Response, StatusCode};
use std::path::Path;

#[derive(Clone, Debug)]
pub struct Cache {
    store: Store,
}

impl Cache {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Opens the store at `path` and wraps it.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(Store::open(path).await?))
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Rebuilds the stored response for `(method, url)`, or `None` on a miss.
    pub async fn get(&self, url: &str, method: &str) -> Result<Option<Response<Bytes>>> {
        let key = CacheKey::new(method, url);
        match self.store.get(&key).await? {
            Some(entry) => Ok(Some(to_response(&entry)?)),
            None => Ok(None),
        }
    }

    /// Drains `response`, stores it under `(method, url)` stamped with the
    /// current time and hands back a replayable copy.
    ///
    /// Any `X-Cache-Timestamp` on `response` is discarded. Store conflicts are
    /// returned unchanged.
    pub async fn set<B>(&self, response: Response<B>, url: &str, method: &str) -> Result<Response<Bytes>>
    where
        B: hyper::body::Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        self.set_at(response, url, method, Utc::now()).await
    }

    /// [`Cache::set`] with a caller-supplied storage time.
    pub async fn set_at<B>(
        &self,
        response: Response<B>,
        url: &str,
        method: &str,
        stored_at: DateTime<Utc>,
    ) -> Result<Response<Bytes>>
    where
        B: hyper::body::Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let (mut parts, body) = response.into_parts();
        let body = body.collect().await.map_err(Error::body)?.to_bytes();
        parts.headers.remove(CACHE_TIMESTAMP_HEADER);

        let entry = CacheEntry::with_timestamp(
            CacheKey::new(method, url),
            parts.status.as_u16(),
            to_headers(&parts.headers),
            body.to_vec(),
            stored_at,
        );
        self.store.set(&entry).await?;

        parts
            .headers
            .insert(CACHE_TIMESTAMP_HEADER, timestamp_header(&entry.timestamp)?);
        Ok(Response::from_parts(parts, body))
    }

    pub async fn delete(&self, url: &str, method: &str) -> Result<()> {
        self.store.delete(&CacheKey::new(method, url)).await
    }

    /// Replaces whatever is cached for `(method, url)` with a response that
    /// was obtained out of band, stamped with `captured_at`.
    pub async fn inject(
        &self,
        url: &str,
        method: &str,
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
        captured_at: DateTime<Utc>,
    ) -> Result<Response<Bytes>> {
        let mut response = Response::new(Full::new(body));
        *response.status_mut() = status;
        *response.headers_mut() = headers;

        self.delete(url, method).await?;
        self.set_at(response, url, method, captured_at).await
    }
}

fn timestamp_header(ts: &DateTime<Utc>) -> Result<HeaderValue> {
    HeaderValue::from_str(&format_timestamp(ts))
        .map_err(|e| Error::InvalidRequest(format!("timestamp header: {}", e)))
}

fn to_response(entry: &CacheEntry) -> Result<Response<Bytes>> {
    let status = StatusCode::from_u16(entry.status_code).map_err(|e| Error::CorruptEntry {
        key: entry.key.clone(),
        reason: e.to_string(),
    })?;

    let mut response = Response::new(Bytes::from(entry.body.clone()));
    *response.status_mut() = status;
    *response.headers_mut() = to_header_map(&entry.headers);
    response
        .headers_mut()
        .insert(CACHE_TIMESTAMP_HEADER, timestamp_header(&entry.timestamp)?);

    if let Some(reason) = custom_reason(status, &entry.status) {
        if let Ok(phrase) = hyper::ext::ReasonPhrase::try_from(reason.to_string()) {
            response.extensions_mut().insert(phrase);
        }
    }
    Ok(response)
}

// The stored status text, minus the leading code, when it is not the
// canonical reason for that code.
fn custom_reason(status: StatusCode, text: &str) -> Option<&str> {
    let reason = text
        .strip_prefix(status.as_str())
        .map(str::trim_start)
        .filter(|r| !r.is_empty())?;
    match status.canonical_reason() {
        Some(canonical) if canonical == reason => None,
        _ => Some(reason),
    }
}
