// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Persistent HTTP response cache for scraping pipelines.
//!
//! This library provides the SQLite-backed store and its facade, a client
//! transport that answers repeated requests from the cache, and a
//! TLS-intercepting forward proxy that caches what it relays.

pub mod ca;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod headers;
pub mod proxy;
pub mod server;
pub mod store;
pub mod transport;

#[cfg(test)]
mod test_helpers;

pub use error::{Error, Result};

// Keep library small; main.rs remains the binary entrypoint.
