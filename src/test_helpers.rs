// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Shared test utilities to reduce duplication across test modules.

use crate::transport::Transport;
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::{Request, Response};
use std::pin::Pin;
use std::task::{Context, Poll};

/// Build a bodiless request with the given headers.
pub fn make_request(
    method: &str,
    uri: &str,
    headers: &[(&str, &str)],
) -> anyhow::Result<Request<Full<Bytes>>> {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    Ok(builder.body(Full::new(Bytes::new()))?)
}

/// A body whose first frame is an error, to exercise body collection failures.
pub struct FailingBody;

impl hyper::body::Body for FailingBody {
    type Data = Bytes;
    type Error = std::io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<hyper::body::Frame<Self::Data>, Self::Error>>> {
        Poll::Ready(Some(Err(std::io::Error::other("simulated body error"))))
    }
}

/// Transport answering every request with a closure instead of the network.
pub struct ScriptedTransport<F> {
    script: F,
}

impl<F> ScriptedTransport<F>
where
    F: Fn(Request<Bytes>) -> crate::Result<Response<Bytes>> + Send + Sync + 'static,
{
    pub fn new(script: F) -> Self {
        Self { script }
    }
}

#[async_trait]
impl<F> Transport for ScriptedTransport<F>
where
    F: Fn(Request<Bytes>) -> crate::Result<Response<Bytes>> + Send + Sync + 'static,
{
    async fn round_trip(&self, req: Request<Bytes>) -> crate::Result<Response<Bytes>> {
        (self.script)(req)
    }
}
