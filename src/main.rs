// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

use anyhow::Context;
use clap::{Parser, Subcommand};
use hyper::{HeaderMap, StatusCode};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use scrape_cache::cache::Cache;
use scrape_cache::client::new_http_client;
use scrape_cache::config::Config;
use scrape_cache::headers::CACHE_TIMESTAMP_HEADER;
use scrape_cache::proxy::CachingProxy;
use scrape_cache::server::run_server;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "scrape-cache", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the caching MITM proxy until SIGINT/SIGTERM
    Serve {
        /// Listen address, e.g. 127.0.0.1:8080
        #[arg(long)]
        listen: Option<String>,

        /// Cache database path
        #[arg(long, env = "SCRAPE_CACHE_DB")]
        db: Option<PathBuf>,

        /// Optional TOML config path
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Fetch a URL through the cache and print what came back
    Fetch {
        #[arg(long, env = "SCRAPE_CACHE_DB")]
        db: PathBuf,
        url: String,
    },

    /// List cached entries, newest first
    List {
        #[arg(long, env = "SCRAPE_CACHE_DB")]
        db: PathBuf,
    },

    /// Remove one cached entry
    Delete {
        #[arg(long, env = "SCRAPE_CACHE_DB")]
        db: PathBuf,
        #[arg(long, default_value = "GET")]
        method: String,
        url: String,
    },

    /// Store a local file as the 200 response for a URL
    Inject {
        #[arg(long, env = "SCRAPE_CACHE_DB")]
        db: PathBuf,
        #[arg(long, default_value = "GET")]
        method: String,
        url: String,
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Serve { listen, db, config } => serve(listen, db, config).await,
        Command::Fetch { db, url } => fetch(&db, &url).await,
        Command::List { db } => list(&db).await,
        Command::Delete { db, method, url } => {
            open_cache(&db).await?.delete(&url, &method).await?;
            info!(%method, %url, "deleted");
            Ok(())
        }
        Command::Inject {
            db,
            method,
            url,
            file,
        } => inject(&db, &method, &url, &file).await,
    }
}

async fn load_config(
    listen: Option<String>,
    db: Option<PathBuf>,
    config: Option<PathBuf>,
) -> anyhow::Result<Config> {
    let mut cfg = match config {
        Some(p) => Config::load_from_path(&p).await?,
        None => Config::default(),
    };
    if let Some(listen) = listen {
        cfg.general.listen = listen;
    }
    if let Some(db) = db {
        cfg.general.db_path = Some(absolute(&db)?);
    }
    Ok(cfg)
}

async fn serve(
    listen: Option<String>,
    db: Option<PathBuf>,
    config: Option<PathBuf>,
) -> anyhow::Result<()> {
    let cfg = load_config(listen, db, config).await?;
    let addr: SocketAddr = cfg
        .general
        .listen
        .parse()
        .with_context(|| format!("invalid listen address {}", cfg.general.listen))?;

    let proxy = Arc::new(CachingProxy::from_config(&cfg).await?);
    let handle = run_server(addr, proxy, cfg.server.shutdown_grace()).await?;
    handle.wait().await
}

async fn fetch(db: &Path, url: &str) -> anyhow::Result<()> {
    let db = absolute(db)?;
    let client = new_http_client(Some(&db)).await?;
    let resp = client.get(url).await?;
    let fetched = resp
        .headers()
        .get(CACHE_TIMESTAMP_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-");
    println!("{}\t{}\t{} bytes", resp.status(), fetched, resp.body().len());
    Ok(())
}

async fn list(db: &Path) -> anyhow::Result<()> {
    let cache = open_cache(db).await?;
    for entry in cache.store().list_all().await? {
        println!(
            "{}\t{}\t{}\t{}\t{}",
            scrape_cache::store::format_timestamp(&entry.timestamp),
            entry.key.method,
            entry.status_code,
            entry.body.len(),
            entry.key.url
        );
    }
    Ok(())
}

async fn inject(db: &Path, method: &str, url: &str, file: &Path) -> anyhow::Result<()> {
    let body = tokio::fs::read(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;
    let modified = tokio::fs::metadata(file).await?.modified()?;

    let cache = open_cache(db).await?;
    cache
        .inject(
            url,
            method,
            StatusCode::OK,
            HeaderMap::new(),
            body.into(),
            modified.into(),
        )
        .await?;
    info!(%method, %url, file = %file.display(), "injected");
    Ok(())
}

async fn open_cache(db: &Path) -> anyhow::Result<Cache> {
    let db = absolute(db)?;
    Cache::open(&db)
        .await
        .with_context(|| format!("failed to open cache {}", db.display()))
}

fn absolute(path: &Path) -> anyhow::Result<PathBuf> {
    std::path::absolute(path).with_context(|| format!("invalid path {}", path.display()))
}
