// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! TLS-intercepting forward proxy that answers repeat requests from the cache.
//!
//! Every CONNECT is intercepted: the tunnel is terminated with a leaf
//! certificate for the target host and the decrypted requests go through the
//! same cache logic as plain-HTTP proxy requests. Only `200 OK` responses are
//! stored.

use crate::ca::CertificateAuthority;
use crate::cache::Cache;
use crate::config::Config;
use crate::error::Error;
use crate::headers::{end_to_end, CACHE_TIMESTAMP_HEADER};
use crate::server::Lifecycle;
use crate::transport::{HyperTransport, Transport};
use anyhow::Context;
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Incoming;
use hyper::http::uri::Scheme;
use hyper::upgrade::Upgraded;
use hyper::{service::service_fn, Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoConnBuilder;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Path on the proxy itself serving the root CA certificate.
pub const CA_CERT_PATH: &str = "/_scrape_cache/ca.crt";

pub(crate) type ProxyBody = BoxBody<Bytes, Infallible>;

type ServiceFuture = Pin<Box<dyn Future<Output = Result<Response<ProxyBody>, Infallible>> + Send>>;

/// Decides what happens when the cache cannot be read or written while
/// serving a request.
pub trait CacheFailurePolicy: Send + Sync {
    fn on_cache_failure(&self, err: &Error);
}

/// Terminates the process with status 1.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExitOnFailure;

impl CacheFailurePolicy for ExitOnFailure {
    fn on_cache_failure(&self, err: &Error) {
        error!(error = %err, "cache failure, exiting");
        std::process::exit(1);
    }
}

/// Logs the failure and lets the proxy answer the request with 500.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogOnFailure;

impl CacheFailurePolicy for LogOnFailure {
    fn on_cache_failure(&self, err: &Error) {
        error!(error = %err, "cache failure");
    }
}

#[derive(Debug)]
struct AlwaysResolves(Arc<CertifiedKey>);

impl ResolvesServerCert for AlwaysResolves {
    fn resolve(&self, _client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

type Handler = Arc<dyn Fn(Request<Incoming>) -> ServiceFuture + Send + Sync>;

pub struct CachingProxy {
    cache: Cache,
    ca: Arc<CertificateAuthority>,
    upstream: Arc<dyn Transport>,
    on_failure: Arc<dyn CacheFailurePolicy>,
}

impl CachingProxy {
    /// Proxy with the [`ExitOnFailure`] policy.
    pub fn new<T: Transport + 'static>(
        cache: Cache,
        ca: Arc<CertificateAuthority>,
        upstream: T,
    ) -> Self {
        Self {
            cache,
            ca,
            upstream: Arc::new(upstream),
            on_failure: Arc::new(ExitOnFailure),
        }
    }

    pub fn with_failure_policy<P: CacheFailurePolicy + 'static>(mut self, policy: P) -> Self {
        self.on_failure = Arc::new(policy);
        self
    }

    /// Opens the cache, loads (or creates) the CA and builds the upstream
    /// transport described by `cfg`.
    pub async fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        let db_path = cfg
            .general
            .db_path
            .as_deref()
            .context("no cache database configured")?;
        if !db_path.is_absolute() {
            return Err(Error::InvalidPath(db_path.display().to_string()).into());
        }
        let cache = Cache::open(db_path)
            .await
            .with_context(|| format!("failed to open cache at {}", db_path.display()))?;

        let ca = CertificateAuthority::load_or_generate(&cfg.tls.ca_cert_path, &cfg.tls.ca_key_path)
            .await?;

        let upstream = if cfg.upstream.accept_invalid_certs {
            HyperTransport::accept_invalid_certs()?
        } else {
            HyperTransport::new()?
        };
        let upstream = upstream.with_timeout(cfg.upstream.timeout());

        Ok(Self::new(cache, ca, upstream))
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn ca(&self) -> &Arc<CertificateAuthority> {
        &self.ca
    }
}

/// Serves a client connected to the listener.
pub(crate) async fn serve_client<I>(io: I, proxy: Arc<CachingProxy>, lifecycle: Lifecycle)
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let service_lifecycle = lifecycle.clone();
    let handler: Handler = Arc::new(move |req: Request<Incoming>| {
        let proxy = proxy.clone();
        let lifecycle = service_lifecycle.clone();
        let fut: ServiceFuture = Box::pin(async move { handle_request(req, proxy, lifecycle).await });
        fut
    });

    if let Err(e) = serve_connection(io, handler, &lifecycle).await {
        error!(%e, "connection error");
    }
}

// Drives one HTTP connection to completion, switching to a graceful close
// once the lifecycle starts draining.
async fn serve_connection<I>(
    io: I,
    handler: Handler,
    lifecycle: &Lifecycle,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let service = service_fn(move |req: Request<Incoming>| handler(req));
    let builder = AutoConnBuilder::new(TokioExecutor::new());
    let conn = builder.serve_connection_with_upgrades(io, service);
    let mut conn = std::pin::pin!(conn);
    let mut draining = false;

    loop {
        tokio::select! {
            res = conn.as_mut() => return res,
            _ = lifecycle.draining(), if !draining => {
                draining = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    }
}

pub(crate) async fn handle_request<B>(
    req: Request<B>,
    proxy: Arc<CachingProxy>,
    lifecycle: Lifecycle,
) -> Result<Response<ProxyBody>, Infallible>
where
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    if req.method() == Method::CONNECT {
        let uri = req.uri().clone();
        let tunnel_lifecycle = lifecycle.clone();
        lifecycle.spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    if let Err(e) = handle_connect(upgraded, uri, proxy, tunnel_lifecycle).await {
                        error!("connect error: {:#}", e);
                    }
                }
                Err(e) => error!("upgrade error for {}: {}", uri, e),
            }
        });
        return Ok(Response::new(empty()));
    }

    if req.uri().scheme().is_none()
        && req.method() == Method::GET
        && req.uri().path() == CA_CERT_PATH
    {
        let pem = proxy.ca.ca_cert_pem().to_string();
        let mut resp = Response::new(full(Bytes::from(pem)));
        let headers = resp.headers_mut();
        headers.insert(
            hyper::header::CONTENT_TYPE,
            hyper::header::HeaderValue::from_static("application/x-x509-ca-cert"),
        );
        headers.insert(
            hyper::header::CONTENT_DISPOSITION,
            hyper::header::HeaderValue::from_static(
                "attachment; filename=\"scrape-cache-ca.crt\"",
            ),
        );
        return Ok(resp);
    }

    handle_http_logic(req, proxy, Scheme::HTTP, None).await
}

// Requests decrypted inside an intercepted tunnel to `authority`.
async fn handle_inner_request<B>(
    req: Request<B>,
    proxy: Arc<CachingProxy>,
    authority: Arc<str>,
) -> Result<Response<ProxyBody>, Infallible>
where
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    if req.method() == Method::CONNECT {
        return Ok(text_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "Nested CONNECT not supported",
        ));
    }
    handle_http_logic(req, proxy, Scheme::HTTPS, Some(&*authority)).await
}

async fn handle_http_logic<B>(
    req: Request<B>,
    proxy: Arc<CachingProxy>,
    scheme: Scheme,
    fallback_host: Option<&str>,
) -> Result<Response<ProxyBody>, Infallible>
where
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let uri = match absolute_uri(&req, &scheme, fallback_host) {
        Ok(uri) => uri,
        Err(e) => {
            warn!(uri = %req.uri(), %e, "cannot resolve request target");
            return Ok(text_response(StatusCode::BAD_REQUEST, "invalid request target"));
        }
    };
    let url = uri.to_string();
    let method = req.method().clone();

    match proxy.cache.get(&url, method.as_str()).await {
        Ok(Some(hit)) => {
            debug!(%url, %method, "cache hit");
            return Ok(client_response(hit));
        }
        Ok(None) => debug!(%url, %method, "cache miss"),
        Err(e) => {
            proxy.on_failure.on_cache_failure(&e);
            return Ok(text_response(StatusCode::INTERNAL_SERVER_ERROR, "cache error"));
        }
    }

    let (parts, body) = req.into_parts();
    let body_bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            let boxed: Box<dyn std::error::Error + Send + Sync> = e.into();
            error!("failed to collect request body: {}", boxed);
            return Ok(text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "request body collect error",
            ));
        }
    };

    let mut upstream_req = Request::new(body_bytes);
    *upstream_req.method_mut() = method.clone();
    *upstream_req.uri_mut() = uri;
    *upstream_req.headers_mut() = end_to_end(&parts.headers);

    let resp = match proxy.upstream.round_trip(upstream_req).await {
        Ok(r) => r,
        Err(Error::Body(e)) => {
            error!(%url, "upstream body collect error: {}", e);
            return Ok(text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("upstream body collect error: {}", e),
            ));
        }
        Err(e) => {
            warn!(%url, %e, "upstream error");
            return Ok(text_response(
                StatusCode::BAD_GATEWAY,
                format!("upstream error: {}", e),
            ));
        }
    };

    if resp.status() != StatusCode::OK {
        debug!(%url, status = resp.status().as_u16(), "not caching non-200 response");
        return Ok(client_response(resp));
    }

    let (parts, body) = resp.into_parts();
    let mut fresh = Response::new(body.clone());
    *fresh.status_mut() = parts.status;
    *fresh.version_mut() = parts.version;
    *fresh.headers_mut() = parts.headers.clone();
    fresh.headers_mut().remove(CACHE_TIMESTAMP_HEADER);

    debug!(%url, %method, "caching");
    let stored = Response::from_parts(parts, Full::new(body));
    match proxy.cache.set(stored, &url, method.as_str()).await {
        Ok(stored) => Ok(client_response(stored)),
        Err(e) if e.is_conflict() => {
            warn!(%url, %method, error = %e, "fresh response conflicts with cached entry, not stored");
            Ok(client_response(fresh))
        }
        Err(e) => {
            proxy.on_failure.on_cache_failure(&e);
            Ok(text_response(StatusCode::INTERNAL_SERVER_ERROR, "cache error"))
        }
    }
}

// Absolute-form targets are used as given; origin-form targets are resolved
// against Host, or the CONNECT authority inside a tunnel.
fn absolute_uri<B>(
    req: &Request<B>,
    scheme: &Scheme,
    fallback_host: Option<&str>,
) -> Result<Uri, hyper::http::Error> {
    if req.uri().scheme().is_some() {
        return Ok(req.uri().clone());
    }

    let host = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .or(fallback_host)
        .unwrap_or("localhost");
    let host = if *scheme == Scheme::HTTPS {
        host.strip_suffix(":443").unwrap_or(host)
    } else {
        host
    };
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let uri = format!("{}://{}{}", scheme, host, path).parse::<Uri>()?;
    Ok(uri)
}

async fn handle_connect(
    client_conn: Upgraded,
    uri: Uri,
    proxy: Arc<CachingProxy>,
    lifecycle: Lifecycle,
) -> anyhow::Result<()> {
    let authority = uri
        .authority()
        .with_context(|| format!("CONNECT target without authority: {}", uri))?;
    let host = authority.host().to_string();
    let cert = proxy.ca.cert_for_host(&host)?;

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let mut server_config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(AlwaysResolves(cert)));

    // Configure ALPN to support HTTP/2 and HTTP/1.1
    server_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));
    let stream = acceptor
        .accept(TokioIo::new(client_conn))
        .await
        .map_err(|e| Error::Tls(format!("handshake with client for {}: {}", host, e)))?;
    info!(%host, "intercepting CONNECT tunnel");

    // Strip the default port so keys match what a direct client would use.
    let authority: Arc<str> = match authority.port_u16() {
        Some(443) | None => host.as_str().into(),
        Some(_) => authority.as_str().into(),
    };
    let handler: Handler = Arc::new(move |req: Request<Incoming>| {
        let proxy = proxy.clone();
        let authority = authority.clone();
        let fut: ServiceFuture =
            Box::pin(async move { handle_inner_request(req, proxy, authority).await });
        fut
    });

    if let Err(e) = serve_connection(TokioIo::new(stream), handler, &lifecycle).await {
        error!(%host, "TLS connection error: {}", e);
    }
    Ok(())
}

// Drop hop-by-hop headers before a response leaves the proxy.
fn client_response(resp: Response<Bytes>) -> Response<ProxyBody> {
    let (mut parts, body) = resp.into_parts();
    parts.headers = end_to_end(&parts.headers);
    Response::from_parts(parts, full(body))
}

fn text_response(status: StatusCode, msg: impl Into<Bytes>) -> Response<ProxyBody> {
    let mut resp = Response::new(full(msg.into()));
    *resp.status_mut() = status;
    resp
}

fn full(body: Bytes) -> ProxyBody {
    Full::new(body).boxed()
}

fn empty() -> ProxyBody {
    full(Bytes::new())
}
