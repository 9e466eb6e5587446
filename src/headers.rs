// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Conversions between `hyper::HeaderMap` and the persisted header shape,
//! plus hop-by-hop filtering for the proxy.

use crate::store::Headers;
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::HashSet;
use tracing::debug;

/// Synthetic header carrying the RFC3339 storage (or provenance) time of a
/// response returned by the cache.
pub const CACHE_TIMESTAMP_HEADER: &str = "x-cache-timestamp";

// RFC 7230 Section 6.1: Hop-by-hop headers must not be forwarded by proxies.
pub(crate) static HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Flattens a header map into name -> values, keeping per-name value order.
///
/// Values that are not valid UTF-8 are stored lossily.
pub fn to_headers(map: &HeaderMap) -> Headers {
    let mut out = Headers::new();
    for name in map.keys() {
        let values = map
            .get_all(name)
            .iter()
            .map(|v| match v.to_str() {
                Ok(s) => s.to_string(),
                Err(_) => {
                    debug!(header = %name, "non-utf8 header value stored lossily");
                    String::from_utf8_lossy(v.as_bytes()).into_owned()
                }
            })
            .collect();
        out.insert(name.as_str().to_string(), values);
    }
    out
}

/// Rebuilds a header map. Names or values that are no longer valid HTTP are
/// skipped.
pub fn to_header_map(headers: &Headers) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, values) in headers {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            debug!(header = %name, "skipping invalid stored header name");
            continue;
        };
        for value in values {
            match HeaderValue::from_str(value) {
                Ok(v) => {
                    map.append(name.clone(), v);
                }
                Err(_) => debug!(header = %name, "skipping invalid stored header value"),
            }
        }
    }
    map
}

// Parse a Connection header value into a lowercased set of tokens
pub(crate) fn parse_connection_tokens(val: Option<&HeaderValue>) -> HashSet<String> {
    let mut set = HashSet::new();
    if let Some(conn_str) = val.and_then(|v| v.to_str().ok()) {
        for token in conn_str.split(',') {
            let trimmed = token.trim().to_ascii_lowercase();
            if !trimmed.is_empty() {
                set.insert(trimmed);
            }
        }
    }
    set
}

pub(crate) fn is_hop_by_hop_header(name: &str, connection_tokens: &HashSet<String>) -> bool {
    connection_tokens.contains(name) || HOP_BY_HOP_HEADERS.contains(&name)
}

/// Copy of `headers` without hop-by-hop entries.
pub(crate) fn end_to_end(headers: &HeaderMap) -> HeaderMap {
    let tokens = parse_connection_tokens(headers.get(hyper::header::CONNECTION));
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        if !is_hop_by_hop_header(name.as_str(), &tokens) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}
