// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Outbound HTTP transports.
//!
//! [`Transport`] is the single-exchange contract every client in the crate is
//! written against. [`HyperTransport`] performs real network I/O and
//! [`CachingTransport`] wraps any other transport with the cache.

use crate::cache::Cache;
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Request, Response};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as LegacyClient;
use hyper_util::rt::TokioExecutor;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Performs one HTTP exchange. Bodies are fully buffered on both sides.
///
/// Failures reaching the origin are [`Error::Transport`] or
/// [`Error::Timeout`]; a response whose body breaks off is [`Error::Body`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn round_trip(&self, req: Request<Bytes>) -> Result<Response<Bytes>>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn round_trip(&self, req: Request<Bytes>) -> Result<Response<Bytes>> {
        (**self).round_trip(req).await
    }
}

type HttpsClient = LegacyClient<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Network transport on top of the hyper legacy client, HTTP and HTTPS.
#[derive(Clone, Debug)]
pub struct HyperTransport {
    client: HttpsClient,
    timeout: Option<Duration>,
}

impl HyperTransport {
    /// Verifies origin certificates against the platform roots.
    pub fn new() -> Result<Self> {
        let https = HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(Error::transport)?
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();
        Ok(Self::from_connector(https))
    }

    /// Accepts any origin certificate. Used by the intercepting proxy.
    pub fn accept_invalid_certs() -> Result<Self> {
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let config = rustls::ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(Error::transport)?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(provider)))
            .with_no_client_auth();

        let https = HttpsConnectorBuilder::new()
            .with_tls_config(config)
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();
        Ok(Self::from_connector(https))
    }

    fn from_connector(https: HttpsConnector<HttpConnector>) -> Self {
        let client = LegacyClient::builder(TokioExecutor::new()).build(https);
        Self {
            client,
            timeout: None,
        }
    }

    /// Bounds the whole exchange, body included. `None` waits indefinitely.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    async fn exchange(&self, req: Request<Bytes>) -> Result<Response<Bytes>> {
        let resp = self
            .client
            .request(req.map(Full::new))
            .await
            .map_err(Error::transport)?;
        let (parts, body) = resp.into_parts();
        let body = body.collect().await.map_err(Error::body)?.to_bytes();
        Ok(Response::from_parts(parts, body))
    }
}

#[async_trait]
impl Transport for HyperTransport {
    async fn round_trip(&self, req: Request<Bytes>) -> Result<Response<Bytes>> {
        match self.timeout {
            Some(limit) => {
                let uri = req.uri().to_string();
                tokio::time::timeout(limit, self.exchange(req))
                    .await
                    .map_err(|_| Error::Timeout(uri))?
            }
            None => self.exchange(req).await,
        }
    }
}

#[derive(Debug)]
struct AcceptAnyServerCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Serves repeat requests from the cache and records every fresh response.
///
/// The key is `(method, uri)` with the URI exactly as given in the request.
/// There is no retry here; errors from the inner transport and from the
/// store reach the caller unchanged. When the network fetch succeeds but the
/// store reports a conflict, the fetched response is dropped and the
/// conflict is returned.
#[derive(Clone, Debug)]
pub struct CachingTransport<T> {
    cache: Cache,
    inner: T,
}

impl<T: Transport> CachingTransport<T> {
    pub fn new(cache: Cache, inner: T) -> Self {
        Self { cache, inner }
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

#[async_trait]
impl<T: Transport> Transport for CachingTransport<T> {
    async fn round_trip(&self, req: Request<Bytes>) -> Result<Response<Bytes>> {
        let url = req.uri().to_string();
        let method = req.method().as_str().to_string();

        if let Some(hit) = self.cache.get(&url, &method).await? {
            debug!(%url, %method, "cache hit");
            return Ok(hit);
        }

        debug!(%url, %method, "cache miss");
        let resp = self.inner.round_trip(req).await?;

        debug!(%url, %method, status = resp.status().as_u16(), "caching");
        self.cache
            .set(resp.map(Full::new), &url, &method)
            .await
            .inspect_err(|e| {
                if e.is_conflict() {
                    warn!(%url, %method, error = %e, "fetched response conflicts with cached entry");
                }
            })
    }
}
