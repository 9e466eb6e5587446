// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Configuration loading.

use anyhow::Context;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Listen address, e.g. 127.0.0.1:8080
    pub listen: String,

    /// Absolute path of the SQLite cache file
    pub db_path: Option<PathBuf>,
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            db_path: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub ca_cert_path: PathBuf,
    pub ca_key_path: PathBuf,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            ca_cert_path: PathBuf::from("scrape-cache-ca.crt"),
            ca_key_path: PathBuf::from("scrape-cache-ca.key"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Whole-exchange timeout towards origins; 0 disables it
    pub timeout_seconds: u64,

    /// Accept any origin certificate on the outbound leg
    pub accept_invalid_certs: bool,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 60,
            accept_invalid_certs: true,
        }
    }
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_seconds > 0).then(|| Duration::from_secs(self.timeout_seconds))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// How long in-flight requests may run after shutdown starts
    pub shutdown_grace_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_seconds: 10,
        }
    }
}

impl ServerConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub tls: TlsConfig,
    pub upstream: UpstreamConfig,
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from a TOML file. Every section and key is
    /// optional:
    ///
    /// ```toml
    /// [general]
    /// listen = "127.0.0.1:8080"
    /// db_path = "/var/lib/scrape/http-cache.sqlite"
    ///
    /// [upstream]
    /// timeout_seconds = 30
    /// ```
    pub async fn load_from_path<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        let path_ref = path.as_ref();
        let s = tokio::fs::read_to_string(path_ref)
            .await
            .with_context(|| format!("failed to read config {}", path_ref.display()))?;
        let cfg: Self = toml::from_str(&s)
            .with_context(|| format!("failed to parse config {}", path_ref.display()))?;
        Ok(cfg)
    }
}
