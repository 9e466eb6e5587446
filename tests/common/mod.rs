// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hyper::{Request, Response};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use scrape_cache::ca::CertificateAuthority;
use scrape_cache::cache::Cache;
use scrape_cache::proxy::{CachingProxy, LogOnFailure};
use scrape_cache::server::{run_server, ServerHandle};
use scrape_cache::transport::Transport;

/// Absolute path for a throwaway cache database.
pub fn temp_db_path() -> PathBuf {
    std::env::temp_dir().join(format!("scrape-cache_integ_{}.sqlite", uuid::Uuid::new_v4()))
}

pub async fn remove_db(path: &std::path::Path) {
    let _ = tokio::fs::remove_file(path).await;
    for suffix in ["-wal", "-shm"] {
        let mut p = path.as_os_str().to_owned();
        p.push(suffix);
        let _ = tokio::fs::remove_file(PathBuf::from(p)).await;
    }
}

/// Upstream that answers every request with the same body and counts calls.
#[derive(Clone)]
pub struct CountingUpstream {
    body: &'static str,
    calls: Arc<AtomicUsize>,
    seen: Arc<std::sync::Mutex<Vec<String>>>,
}

impl CountingUpstream {
    pub fn new(body: &'static str) -> Self {
        Self {
            body,
            calls: Arc::new(AtomicUsize::new(0)),
            seen: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Transport for CountingUpstream {
    async fn round_trip(&self, req: Request<Bytes>) -> scrape_cache::Result<Response<Bytes>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(req.uri().to_string());
        }
        Ok(Response::builder()
            .header("content-type", "text/html")
            .body(Bytes::from_static(self.body.as_bytes()))?)
    }
}

pub async fn make_proxy<T: Transport + 'static>(
    cache: Cache,
    upstream: T,
) -> anyhow::Result<Arc<CachingProxy>> {
    Ok(Arc::new(
        CachingProxy::new(cache, CertificateAuthority::generate()?, upstream)
            .with_failure_policy(LogOnFailure),
    ))
}

pub async fn start_proxy(proxy: Arc<CachingProxy>) -> anyhow::Result<ServerHandle> {
    run_server("127.0.0.1:0".parse()?, proxy, Duration::from_secs(2)).await
}

async fn read_to_end_with_timeout<S>(stream: &mut S) -> anyhow::Result<Vec<u8>>
where
    S: AsyncReadExt + Unpin,
{
    let mut resp = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let read = timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .map_err(|_| anyhow::anyhow!("timeout reading response"))?;
        match read {
            Ok(0) => break,
            Ok(n) => resp.extend_from_slice(&buf[..n]),
            // Peer closed without close_notify after a complete response.
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof && !resp.is_empty() => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(resp)
}

/// Sends a raw HTTP/1.1 request to the proxy and reads until it closes.
pub async fn raw_http(proxy_addr: SocketAddr, request: &str) -> anyhow::Result<String> {
    let mut stream = tokio::net::TcpStream::connect(proxy_addr).await?;
    stream.write_all(request.as_bytes()).await?;
    let resp = read_to_end_with_timeout(&mut stream).await?;
    Ok(String::from_utf8_lossy(&resp).into_owned())
}

/// Opens a CONNECT tunnel, completes TLS trusting `ca_pem`, sends
/// `inner_request` and reads until the proxy closes the tunnel.
pub async fn perform_connect_and_tls(
    proxy_addr: SocketAddr,
    connect_host: &str,
    ca_pem: &str,
    inner_request: &str,
) -> anyhow::Result<String> {
    use rustls::client::ClientConfig;
    use rustls::pki_types::ServerName;
    use rustls::RootCertStore;

    let mut stream = tokio::net::TcpStream::connect(proxy_addr).await?;

    let connect = format!(
        "CONNECT {host}:443 HTTP/1.1\r\nHost: {host}:443\r\n\r\n",
        host = connect_host
    );
    stream.write_all(connect.as_bytes()).await?;

    // Read the CONNECT response head byte by byte so nothing of the TLS
    // stream is consumed.
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = timeout(Duration::from_secs(3), stream.read(&mut byte))
            .await
            .map_err(|_| anyhow::anyhow!("timeout reading CONNECT response"))??;
        if n == 0 {
            return Err(anyhow::anyhow!("proxy closed during CONNECT"));
        }
        head.push(byte[0]);
    }
    let head = String::from_utf8_lossy(&head);
    if !head.starts_with("HTTP/1.1 200") {
        return Err(anyhow::anyhow!("CONNECT not successful: {}", head));
    }

    let mut root_store = RootCertStore::empty();
    let certs: Vec<_> =
        rustls_pemfile::certs(&mut ca_pem.as_bytes()).collect::<Result<Vec<_>, _>>()?;
    root_store.add_parsable_certificates(certs);
    let client_cfg = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::aws_lc_rs::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_root_certificates(root_store)
    .with_no_client_auth();

    let connector = TlsConnector::from(Arc::new(client_cfg));
    let server_name = ServerName::try_from(connect_host.to_string())
        .map_err(|_| anyhow::anyhow!("invalid server name"))?;

    let mut tls = connector.connect(server_name, stream).await?;
    tls.write_all(inner_request.as_bytes()).await?;

    let resp = read_to_end_with_timeout(&mut tls).await?;
    Ok(String::from_utf8_lossy(&resp).into_owned())
}
