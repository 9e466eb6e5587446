// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Error taxonomy shared by the store, the cache facade and the transports.
//!
//! A cache miss is not an error: lookups return `Ok(None)`.

use crate::store::CacheKey;
use tokio_rusqlite::rusqlite;

pub type Result<T, E = Error> = std::result::Result<T, E>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An entry already exists for the key and its headers differ.
    #[error("cache entry for {0} exists with different headers")]
    HeadersConflict(CacheKey),

    /// An entry already exists for the key and its body differs.
    #[error("cache entry for {0} exists with different body")]
    BodyConflict(CacheKey),

    #[error("cache database error: {0}")]
    Database(tokio_rusqlite::Error),

    #[error("cache migration failed: {0}")]
    Migration(String),

    #[error("failed to encode or decode headers: {0}")]
    Headers(#[from] serde_json::Error),

    #[error("failed to parse timestamp {value:?}: {source}")]
    Timestamp {
        value: String,
        source: chrono::ParseError,
    },

    #[error("failed to read response body: {0}")]
    Body(#[source] BoxError),

    #[error("transport error: {0}")]
    Transport(#[source] BoxError),

    #[error("request to {0} timed out")]
    Timeout(String),

    #[error("need absolute path for cache file, got: {0}")]
    InvalidPath(String),

    #[error("unexpected status code: got {0}")]
    UnexpectedStatus(u16),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("stored entry for {key} is unusable: {reason}")]
    CorruptEntry { key: CacheKey, reason: String },

    #[error("tls error: {0}")]
    Tls(String),

    #[error("failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// True for the two conflict variants.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::HeadersConflict(_) | Error::BodyConflict(_))
    }

    pub(crate) fn transport<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        Error::Transport(err.into())
    }

    pub(crate) fn body<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        Error::Body(err.into())
    }
}

impl From<tokio_rusqlite::Error<Error>> for Error {
    fn from(err: tokio_rusqlite::Error<Error>) -> Self {
        match err {
            tokio_rusqlite::Error::Error(e) => e,
            tokio_rusqlite::Error::ConnectionClosed => {
                Error::Database(tokio_rusqlite::Error::ConnectionClosed)
            }
            tokio_rusqlite::Error::Close(c) => Error::Database(tokio_rusqlite::Error::Close(c)),
            _ => Error::Database(tokio_rusqlite::Error::ConnectionClosed),
        }
    }
}

impl From<tokio_rusqlite::Error<rusqlite::Error>> for Error {
    fn from(err: tokio_rusqlite::Error<rusqlite::Error>) -> Self {
        Error::Database(err)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(tokio_rusqlite::Error::Error(err))
    }
}

impl From<hyper::http::Error> for Error {
    fn from(err: hyper::http::Error) -> Self {
        Error::InvalidRequest(err.to_string())
    }
}
