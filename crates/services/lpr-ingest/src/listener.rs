//! Push listener
//!
//! Binds every configured address and serves each accepted connection on its
//! own task. `https` bindings terminate TLS before handing the stream to
//! hyper.
//!
//! Lifecycle: `Stopped → Starting → Running → Stopping → Stopped`. A listener
//! can be restarted after `stop()`, but not after `dispose()`.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::{Extension, Router};
use hyper::server::conn::http1;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::service::TowerToHyperService;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;

use crate::api::{build_router, AppState, ConnectionMeta};
use crate::config::ServerConfig;
use crate::handler::PlateEventHandler;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::tls::load_acceptor;

/// Upper bound on a TLS handshake
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Listener lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Listener lifecycle errors
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("Listener is already running")]
    AlreadyRunning,

    #[error("Listener has been disposed")]
    Disposed,

    #[error("Failed to bind {addr}: {reason}")]
    Bind { addr: String, reason: String },

    #[error("TLS error: {0}")]
    Tls(String),
}

/// Observable status, readable without waiting on lifecycle operations
struct Status {
    state: ListenerState,
    local_addrs: Vec<SocketAddr>,
}

/// Resources owned by a running listener
struct Running {
    shutdown_tx: watch::Sender<bool>,
    accept_loops: Vec<JoinHandle<()>>,
}

#[derive(Default)]
struct Lifecycle {
    disposed: bool,
    running: Option<Running>,
}

/// HTTP(S) listener for camera push notifications
pub struct PlateListener {
    app: AppState,
    lifecycle: Mutex<Lifecycle>,
    status: RwLock<Status>,
}

impl PlateListener {
    /// Create a stopped listener
    pub fn new<H: PlateEventHandler>(config: ServerConfig, handler: H) -> Self {
        Self::with_handler(config, Arc::new(handler))
    }

    /// Create a stopped listener sharing an existing handler
    pub fn with_handler(config: ServerConfig, handler: Arc<dyn PlateEventHandler>) -> Self {
        Self {
            app: AppState::new(Arc::new(config), handler, Arc::new(Metrics::new())),
            lifecycle: Mutex::new(Lifecycle::default()),
            status: RwLock::new(Status {
                state: ListenerState::Stopped,
                local_addrs: Vec::new(),
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.app.config
    }

    pub fn state(&self) -> ListenerState {
        self.status
            .read()
            .map(|s| s.state)
            .unwrap_or_else(|e| e.into_inner().state)
    }

    /// Addresses actually bound, empty unless running
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.status
            .read()
            .map(|s| s.local_addrs.clone())
            .unwrap_or_else(|e| e.into_inner().local_addrs.clone())
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.app.metrics.snapshot()
    }

    fn set_status(&self, state: ListenerState, local_addrs: Option<Vec<SocketAddr>>) {
        let mut status = self.status.write().unwrap_or_else(|e| e.into_inner());
        status.state = state;
        if let Some(addrs) = local_addrs {
            status.local_addrs = addrs;
        }
    }

    /// Bind every configured address and start accepting
    ///
    /// # Errors
    /// * `ListenerError::AlreadyRunning` - `start()` was already called
    /// * `ListenerError::Disposed` - The listener was disposed
    /// * `ListenerError::Tls` - TLS material could not be loaded
    /// * `ListenerError::Bind` - An address could not be bound
    pub async fn start(&self) -> Result<(), ListenerError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.disposed {
            return Err(ListenerError::Disposed);
        }
        if lifecycle.running.is_some() {
            return Err(ListenerError::AlreadyRunning);
        }

        self.set_status(ListenerState::Starting, None);
        match self.bind_all().await {
            Ok((running, local_addrs)) => {
                tracing::info!(addrs = ?local_addrs, "Plate listener running");
                lifecycle.running = Some(running);
                self.set_status(ListenerState::Running, Some(local_addrs));
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Plate listener failed to start");
                self.set_status(ListenerState::Stopped, Some(Vec::new()));
                Err(e)
            }
        }
    }

    async fn bind_all(&self) -> Result<(Running, Vec<SocketAddr>), ListenerError> {
        let config = &self.app.config;

        let acceptor = match config.tls() {
            Some(files) if config.bindings().iter().any(|b| b.secure) => {
                Some(load_acceptor(files)?)
            }
            _ => None,
        };

        // Bind everything before spawning so a failure leaves nothing running
        let mut bound = Vec::with_capacity(config.bindings().len());
        for binding in config.bindings() {
            let listener = TcpListener::bind(binding.addr.as_str())
                .await
                .map_err(|e| ListenerError::Bind {
                    addr: binding.addr.clone(),
                    reason: e.to_string(),
                })?;
            let local_addr = listener.local_addr().map_err(|e| ListenerError::Bind {
                addr: binding.addr.clone(),
                reason: e.to_string(),
            })?;
            bound.push((listener, local_addr, binding));
        }

        let (shutdown_tx, _) = watch::channel(false);
        let limiter = config
            .max_concurrent_connections()
            .map(|n| Arc::new(Semaphore::new(n)));

        let mut local_addrs = Vec::with_capacity(bound.len());
        let mut accept_loops = Vec::with_capacity(bound.len());
        for (listener, local_addr, binding) in bound {
            let ctx = AcceptContext {
                router: build_router(self.app.clone(), binding.prefixes.clone()),
                tls: if binding.secure { acceptor.clone() } else { None },
                metrics: self.app.metrics.clone(),
                limiter: limiter.clone(),
                backoff: config.accept_error_backoff(),
            };
            tracing::info!(
                addr = %local_addr,
                secure = binding.secure,
                prefixes = binding.prefixes.len(),
                "Accepting push notifications"
            );
            accept_loops.push(tokio::spawn(accept_loop(
                listener,
                ctx,
                shutdown_tx.subscribe(),
            )));
            local_addrs.push(local_addr);
        }

        Ok((
            Running {
                shutdown_tx,
                accept_loops,
            },
            local_addrs,
        ))
    }

    /// Stop accepting and wait for in-flight requests
    ///
    /// Waits at most the configured shutdown timeout; work still running
    /// after that is abandoned. Stopping a stopped listener does nothing.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(running) = lifecycle.running.take() else {
            return;
        };

        self.set_status(ListenerState::Stopping, None);
        tracing::info!("Plate listener stopping");
        let _ = running.shutdown_tx.send(true);

        let mut accept_loops = running.accept_loops;
        let timeout = self.app.config.shutdown_timeout();
        let drained = tokio::time::timeout(
            timeout,
            futures::future::join_all(accept_loops.iter_mut()),
        )
        .await;

        match drained {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "Accept loop ended abnormally");
                    }
                }
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    active_connections = self.app.metrics.active_connection_count(),
                    "Shutdown timeout elapsed, abandoning in-flight requests"
                );
                for handle in &accept_loops {
                    handle.abort();
                }
            }
        }

        self.set_status(ListenerState::Stopped, Some(Vec::new()));
        tracing::info!("Plate listener stopped");
    }

    /// Stop and release the listener; it cannot be started again
    pub async fn dispose(&self) {
        self.stop().await;
        self.lifecycle.lock().await.disposed = true;
    }
}

impl Drop for PlateListener {
    fn drop(&mut self) {
        if let Ok(lifecycle) = self.lifecycle.try_lock() {
            if let Some(running) = &lifecycle.running {
                let _ = running.shutdown_tx.send(true);
            }
        }
    }
}

/// Everything an accept loop needs besides its socket
struct AcceptContext {
    router: Router,
    tls: Option<TlsAcceptor>,
    metrics: Arc<Metrics>,
    limiter: Option<Arc<Semaphore>>,
    backoff: Duration,
}

async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    // A dropped sender also means shutdown
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn accept_loop(
    listener: TcpListener,
    ctx: AcceptContext,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();

    loop {
        let permit = match &ctx.limiter {
            Some(limiter) => tokio::select! {
                permit = limiter.clone().acquire_owned() => permit.ok(),
                _ = shutdown_requested(&mut shutdown) => break,
            },
            None => None,
        };

        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown_requested(&mut shutdown) => break,
        };

        match accepted {
            Ok((stream, remote_addr)) => {
                ctx.metrics.connection_opened();
                tracing::debug!(remote_addr = %remote_addr, "Connection accepted");

                let meta = ConnectionMeta {
                    remote_addr,
                    secure: ctx.tls.is_some(),
                };
                let router = ctx.router.clone().layer(Extension(meta));
                let tls = ctx.tls.clone();
                let metrics = ctx.metrics.clone();
                let shutdown = shutdown.clone();

                connections.spawn(async move {
                    match tls {
                        Some(acceptor) => {
                            serve_tls(acceptor, stream, router, shutdown, remote_addr).await
                        }
                        None => serve_connection(stream, router, shutdown).await,
                    }
                    metrics.connection_closed();
                    drop(permit);
                });
            }
            Err(e) => {
                ctx.metrics.accept_failed();
                tracing::warn!(error = %e, "Failed to accept connection");
                tokio::select! {
                    _ = tokio::time::sleep(ctx.backoff) => {}
                    _ = shutdown_requested(&mut shutdown) => break,
                }
            }
        }

        while let Some(finished) = connections.try_join_next() {
            if let Err(e) = finished {
                tracing::error!(error = %e, "Connection task failed");
            }
        }
    }

    drop(listener);
    while let Some(finished) = connections.join_next().await {
        if let Err(e) = finished {
            tracing::error!(error = %e, "Connection task failed");
        }
    }
}

async fn serve_tls(
    acceptor: TlsAcceptor,
    stream: tokio::net::TcpStream,
    router: Router,
    mut shutdown: watch::Receiver<bool>,
    remote_addr: SocketAddr,
) {
    let handshake = tokio::select! {
        result = tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)) => result,
        _ = shutdown_requested(&mut shutdown) => return,
    };

    match handshake {
        Ok(Ok(tls_stream)) => serve_connection(tls_stream, router, shutdown).await,
        Ok(Err(e)) => {
            tracing::debug!(remote_addr = %remote_addr, error = %e, "TLS handshake failed")
        }
        Err(_) => tracing::debug!(remote_addr = %remote_addr, "TLS handshake timed out"),
    }
}

async fn serve_connection<IO>(io: IO, router: Router, mut shutdown: watch::Receiver<bool>)
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = TowerToHyperService::new(router);
    let mut builder = http1::Builder::new();
    builder.timer(TokioTimer::new());
    let conn = builder.serve_connection(TokioIo::new(io), service);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(e) = result {
                tracing::debug!(error = %e, "Connection closed with error");
            }
        }
        _ = shutdown_requested(&mut shutdown) => {
            // Finish the in-flight request, then close
            conn.as_mut().graceful_shutdown();
            if let Err(e) = conn.await {
                tracing::debug!(error = %e, "Connection closed with error during shutdown");
            }
        }
    }
}
