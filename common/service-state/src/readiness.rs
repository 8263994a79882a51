//! Readiness publishing: the [`ReadinessSignaler`] capability consumed by the state
//! managers, and [`ProbeSignaler`], a K8s-style implementation exposing
//! `/health`, `/ready` and `/live` probes and running shutdown handlers.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::{lock, metrics, signals};

/// Deferred cleanup run once shutdown begins.
pub type ShutdownHandler = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Box an async closure as a [`ShutdownHandler`].
pub fn shutdown_handler<F, Fut>(handler: F) -> ShutdownHandler
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Box::new(move || handler().boxed())
}

/// External readiness/liveness publisher. Implementations must be cheap to call
/// from inside the state store's critical section.
pub trait ReadinessSignaler: Send + Sync + 'static {
    fn signal_ready(&self);

    fn signal_not_ready(&self);

    /// Queue `handler` to run when shutdown begins.
    fn register_shutdown_handler(&self, handler: ShutdownHandler);

    /// Shutdown waits (bounded) until every beacon created here is dropped.
    fn create_beacon(&self) -> Beacon;

    fn is_server_ready(&self) -> bool;

    fn is_shutting_down(&self) -> bool;

    /// Initiate shutdown. Non-blocking and idempotent.
    fn shutdown(&self);
}

#[derive(Default)]
struct BeaconSet {
    live: AtomicUsize,
    notify: Notify,
}

impl BeaconSet {
    fn create(self: &Arc<Self>) -> Beacon {
        self.live.fetch_add(1, Ordering::SeqCst);
        Beacon {
            set: Some(self.clone()),
        }
    }

    async fn wait_empty(&self) {
        loop {
            let notified = self.notify.notified();
            if self.live.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// RAII guard that holds shutdown back while some work is still in flight.
pub struct Beacon {
    set: Option<Arc<BeaconSet>>,
}

impl Beacon {
    /// Beacon not attached to any signaler; dropping it has no effect.
    pub fn detached() -> Self {
        Self { set: None }
    }

    /// Release the beacon explicitly.
    pub fn die(self) {
        drop(self)
    }
}

impl Drop for Beacon {
    fn drop(&mut self) {
        if let Some(set) = self.set.take() {
            if set.live.fetch_sub(1, Ordering::SeqCst) == 1 {
                set.notify.notify_waiters();
            }
        }
    }
}

/// Probe outcome; implements [`IntoResponse`] for axum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    Ready,
    NotReady,
    ShuttingDown,
    NotShuttingDown,
}

impl ProbeStatus {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProbeStatus::Ready | ProbeStatus::NotShuttingDown => StatusCode::OK,
            ProbeStatus::NotReady | ProbeStatus::ShuttingDown => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeStatus::Ready => "SERVER_IS_READY",
            ProbeStatus::NotReady => "SERVER_IS_NOT_READY",
            ProbeStatus::ShuttingDown => "SERVER_IS_SHUTTING_DOWN",
            ProbeStatus::NotShuttingDown => "SERVER_IS_NOT_SHUTTING_DOWN",
        }
    }
}

impl IntoResponse for ProbeStatus {
    fn into_response(self) -> Response {
        (self.status_code(), self.as_str()).into_response()
    }
}

struct ProbeInner {
    ready: AtomicBool,
    shutdown_token: CancellationToken,
    completed: CancellationToken,
    handlers: Mutex<Vec<ShutdownHandler>>,
    beacons: Arc<BeaconSet>,
    beacon_timeout: Duration,
    handler_timeout: Duration,
}

/// Builder for [`ProbeSignaler`].
pub struct ProbeSignalerBuilder {
    trap_signals: bool,
    beacon_timeout: Duration,
    handler_timeout: Duration,
}

impl ProbeSignalerBuilder {
    /// Install SIGINT/SIGTERM handlers that initiate shutdown (default: true).
    pub fn with_trap_signals(mut self, trap: bool) -> Self {
        self.trap_signals = trap;
        self
    }

    pub fn with_beacon_timeout(mut self, timeout: Duration) -> Self {
        self.beacon_timeout = timeout;
        self
    }

    pub fn with_shutdown_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Build the signaler and spawn its shutdown driver. Must be called from within
    /// a tokio runtime.
    pub fn build(self) -> ProbeSignaler {
        let inner = Arc::new(ProbeInner {
            ready: AtomicBool::new(false),
            shutdown_token: CancellationToken::new(),
            completed: CancellationToken::new(),
            handlers: Mutex::new(Vec::new()),
            beacons: Arc::default(),
            beacon_timeout: self.beacon_timeout,
            handler_timeout: self.handler_timeout,
        });

        if self.trap_signals {
            let token = inner.shutdown_token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = signals::wait_for_shutdown_signal() => {
                        if !token.is_cancelled() {
                            metrics::emit_shutdown_initiated("signal");
                            info!(trigger_reason = "signal", "ProbeSignaler: shutdown initiated");
                        }
                        token.cancel();
                    }
                    _ = token.cancelled() => {}
                }
            });
        }

        tokio::spawn(drive_shutdown(inner.clone()));

        ProbeSignaler { inner }
    }
}

/// Readiness signaler backed by in-memory flags, with HTTP probe handlers.
#[derive(Clone)]
pub struct ProbeSignaler {
    inner: Arc<ProbeInner>,
}

impl ProbeSignaler {
    pub fn builder() -> ProbeSignalerBuilder {
        ProbeSignalerBuilder {
            trap_signals: true,
            beacon_timeout: Duration::from_secs(60),
            handler_timeout: Duration::from_secs(60),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::builder()
            .with_trap_signals(config.trap_signals)
            .with_beacon_timeout(config.beacon_timeout.0)
            .with_shutdown_handler_timeout(config.shutdown_handler_timeout.0)
            .build()
    }

    /// `/health` and `/ready` outcome.
    pub fn health(&self) -> ProbeStatus {
        if self.is_shutting_down() {
            ProbeStatus::ShuttingDown
        } else if self.inner.ready.load(Ordering::SeqCst) {
            ProbeStatus::Ready
        } else {
            ProbeStatus::NotReady
        }
    }

    /// `/live` outcome.
    pub fn live(&self) -> ProbeStatus {
        if self.is_shutting_down() {
            ProbeStatus::ShuttingDown
        } else {
            ProbeStatus::NotShuttingDown
        }
    }

    /// Router serving `/health`, `/ready` and `/live`.
    pub fn router(&self) -> Router {
        let health = self.clone();
        let ready = self.clone();
        let live = self.clone();
        Router::new()
            .route(
                "/health",
                get(move || std::future::ready(health.health())),
            )
            .route("/ready", get(move || std::future::ready(ready.health())))
            .route("/live", get(move || std::future::ready(live.live())))
    }

    /// Resolves once every shutdown handler has run (or timed out).
    pub async fn wait_for_shutdown(&self) {
        self.inner.completed.cancelled().await
    }

    pub fn shutdown_completed(&self) -> bool {
        self.inner.completed.is_cancelled()
    }
}

impl ReadinessSignaler for ProbeSignaler {
    fn signal_ready(&self) {
        if self.is_shutting_down() {
            warn!("ProbeSignaler: server is shutting down, ignoring ready signal");
            return;
        }
        if !self.inner.ready.swap(true, Ordering::SeqCst) {
            info!("ProbeSignaler: server is ready");
        }
    }

    fn signal_not_ready(&self) {
        if self.inner.ready.swap(false, Ordering::SeqCst) {
            info!("ProbeSignaler: server is not ready");
        }
    }

    fn register_shutdown_handler(&self, handler: ShutdownHandler) {
        let mut handlers = lock(&self.inner.handlers);
        if self.inner.shutdown_token.is_cancelled() {
            warn!("ProbeSignaler: shutdown already started, dropping late shutdown handler");
            return;
        }
        handlers.push(handler);
        debug!(handlers = handlers.len(), "ProbeSignaler: shutdown handler registered");
    }

    fn create_beacon(&self) -> Beacon {
        self.inner.beacons.create()
    }

    fn is_server_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst) && !self.is_shutting_down()
    }

    fn is_shutting_down(&self) -> bool {
        self.inner.shutdown_token.is_cancelled()
    }

    fn shutdown(&self) {
        if self.inner.shutdown_token.is_cancelled() {
            debug!("ProbeSignaler: shutdown already in progress");
            return;
        }
        metrics::emit_shutdown_initiated("requested");
        info!(trigger_reason = "requested", "ProbeSignaler: shutdown initiated");
        self.inner.shutdown_token.cancel();
    }
}

async fn drive_shutdown(inner: Arc<ProbeInner>) {
    inner.shutdown_token.cancelled().await;
    inner.ready.store(false, Ordering::SeqCst);

    let live = inner.beacons.live.load(Ordering::SeqCst);
    if live > 0 {
        info!(beacons = live, "ProbeSignaler: waiting for beacons to die");
    }
    if tokio::time::timeout(inner.beacon_timeout, inner.beacons.wait_empty())
        .await
        .is_err()
    {
        warn!(
            beacons = inner.beacons.live.load(Ordering::SeqCst),
            timeout_secs = inner.beacon_timeout.as_secs_f64(),
            "ProbeSignaler: beacon timeout reached, proceeding with shutdown"
        );
    }

    let handlers = std::mem::take(&mut *lock(&inner.handlers));
    let total = handlers.len();
    for (index, handler) in handlers.into_iter().enumerate() {
        if tokio::time::timeout(inner.handler_timeout, handler())
            .await
            .is_err()
        {
            warn!(
                handler = index,
                timeout_secs = inner.handler_timeout.as_secs_f64(),
                "ProbeSignaler: shutdown handler timed out"
            );
        }
    }

    info!(handlers = total, "ProbeSignaler: shutdown complete");
    inner.completed.cancel();
}
