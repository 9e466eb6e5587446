// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Listener hosting the caching proxy, with signal-driven graceful shutdown.
//!
//! Shutdown starts when the handle is cancelled or the process receives
//! SIGINT/SIGTERM; both paths cancel the same token. The listener stops
//! accepting, open connections are asked to finish their in-flight request,
//! and whatever is still running when the grace period ends is dropped.

use crate::proxy::{self, CachingProxy};
use anyhow::Context;
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tokio_util::task::TaskTracker;
use tracing::{error, info, trace, warn};

/// Grace period used when none is configured.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Shutdown state shared by the accept loop and every connection task.
#[derive(Clone, Debug)]
pub(crate) struct Lifecycle {
    graceful: CancellationToken,
    force: CancellationToken,
    tracker: TaskTracker,
}

impl Lifecycle {
    pub(crate) fn new(graceful: CancellationToken) -> Self {
        Self {
            graceful,
            force: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Resolves once shutdown has started.
    pub(crate) fn draining(&self) -> WaitForCancellationFuture<'_> {
        self.graceful.cancelled()
    }

    /// Runs `fut` as a tracked task that is dropped on forced shutdown.
    pub(crate) fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let force = self.force.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = fut => {}
                _ = force.cancelled() => {}
            }
        });
    }

    async fn drain(&self, grace: Duration) {
        self.tracker.close();
        info!(in_flight = self.tracker.len(), ?grace, "shutting down");
        match tokio::time::timeout(grace, self.tracker.wait()).await {
            Ok(()) => info!("shutdown complete"),
            Err(_) => {
                warn!(
                    remaining = self.tracker.len(),
                    "shutdown grace period elapsed, closing remaining connections"
                );
                self.force.cancel();
                self.tracker.wait().await;
            }
        }
    }
}

/// Handle to a running proxy server.
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl ServerHandle {
    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Starts shutdown. Calling it again, or after a signal, has no effect.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Waits until the server has stopped, without triggering shutdown.
    pub async fn wait(self) -> anyhow::Result<()> {
        self.join.await.context("server task failed")
    }

    /// Triggers shutdown and waits for it to finish.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.cancel();
        self.wait().await
    }
}

/// Binds `listen` and serves `proxy` on a background task.
///
/// Bind errors are returned here; everything after that is logged.
pub async fn run_server(
    listen: SocketAddr,
    proxy: Arc<CachingProxy>,
    grace: Duration,
) -> anyhow::Result<ServerHandle> {
    let signals = shutdown_signal().context("failed to install signal handlers")?;
    run_server_until(listen, proxy, grace, signals).await
}

// Like `run_server`, with `trigger` standing in for the process signals.
pub(crate) async fn run_server_until<F>(
    listen: SocketAddr,
    proxy: Arc<CachingProxy>,
    grace: Duration,
    trigger: F,
) -> anyhow::Result<ServerHandle>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {}", listen))?;
    let local_addr = listener.local_addr()?;

    let token = CancellationToken::new();
    cancel_on(token.clone(), trigger);

    info!(listen = %local_addr, "caching proxy listening");
    let join = tokio::spawn(accept_loop(listener, proxy, token.clone(), grace));

    Ok(ServerHandle {
        local_addr,
        token,
        join,
    })
}

async fn accept_loop(
    listener: TcpListener,
    proxy: Arc<CachingProxy>,
    token: CancellationToken,
    grace: Duration,
) {
    let lifecycle = Lifecycle::new(token.clone());

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote_addr)) => {
                    trace!(%remote_addr, "accepted connection");
                    let proxy = proxy.clone();
                    let conn_lifecycle = lifecycle.clone();
                    lifecycle.spawn(async move {
                        proxy::serve_client(TokioIo::new(stream), proxy, conn_lifecycle).await;
                    });
                }
                Err(e) => {
                    error!(%e, "accept error");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    drop(listener);
    lifecycle.drain(grace).await;
}

// Cancels `token` when `trigger` resolves; gives up once the token is
// cancelled some other way.
fn cancel_on<F>(token: CancellationToken, trigger: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        tokio::select! {
            _ = trigger => token.cancel(),
            _ = token.cancelled() => {}
        }
    });
}

/// Resolves on the first SIGINT or SIGTERM (Ctrl+C elsewhere).
///
/// Handlers are installed before this returns, so a signal arriving before
/// the future is first polled is not lost.
pub fn shutdown_signal() -> std::io::Result<impl Future<Output = ()> + Send + 'static> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        Ok(async move {
            tokio::select! {
                _ = sigterm.recv() => info!("received SIGTERM"),
                _ = sigint.recv() => info!("received SIGINT"),
            }
        })
    }

    #[cfg(not(unix))]
    {
        Ok(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("received Ctrl+C"),
                Err(e) => {
                    error!(%e, "failed to listen for Ctrl+C");
                    std::future::pending::<()>().await;
                }
            }
        })
    }
}
