//! Health checker worker: runs checks on its own OS thread and runtime, reporting
//! results to the coordinator over the signaling channel.
//!
//! Lifecycle: `Starting -> AwaitingPort -> Ready -> Terminating -> Closed`. The
//! worker waits (bounded) for exactly one [`InitMessage`], then serves until the
//! channel closes, at which point every checker is cancelled before [`run`]
//! returns. A fault reported by the coordinator ends the worker with an error.
//!
//! [`run`]: HealthCheckWorker::run

use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::channel::{EndpointReceiver, EndpointSender, ParentPort};
use crate::checker::{CheckerRegistry, ExecutionPolicy, HealthCheck, SignalSink};
use crate::error::{CheckerError, WorkerError};
use crate::message::Message;
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    AwaitingPort,
    Ready,
    Terminating,
    Closed,
}

/// Posts `{service: ready}` updates on the worker's endpoint.
struct ChannelSink(EndpointSender);

impl SignalSink for ChannelSink {
    fn signal(&self, service: &str, ready: bool) {
        if let Err(e) = self.0.send(Message::update(service, ready)) {
            debug!(service = %service, error = %e, "dropping state update");
        }
    }
}

pub struct HealthCheckWorker {
    parent: Option<ParentPort>,
    state: watch::Sender<WorkerState>,
    sender: Option<EndpointSender>,
    receiver: Option<EndpointReceiver>,
    checkers: Option<CheckerRegistry>,
}

impl HealthCheckWorker {
    pub fn new(parent: ParentPort) -> Self {
        let (state, _) = watch::channel(WorkerState::Starting);
        Self {
            parent: Some(parent),
            state,
            sender: None,
            receiver: None,
            checkers: None,
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Observe state transitions, including after [`run`](Self::run) consumed the worker.
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: WorkerState) {
        let previous = self.state.send_replace(next);
        debug!(?previous, ?next, "worker state changed");
    }

    /// Wait up to `timeout` for the coordinator to hand over the signaling channel.
    /// Must be called from within the worker's runtime.
    pub async fn init(&mut self, timeout: Duration) -> Result<(), WorkerError> {
        if self.state() == WorkerState::Ready {
            return Ok(());
        }
        let parent = self.parent.take().ok_or(WorkerError::HandshakeAborted)?;

        info!("Initializing the health checker worker...");
        self.set_state(WorkerState::AwaitingPort);
        let init = match tokio::time::timeout(timeout, parent.recv()).await {
            Ok(Some(init)) => init,
            Ok(None) => {
                self.set_state(WorkerState::Closed);
                error!("coordinator dropped the bootstrap port before the handshake");
                return Err(WorkerError::HandshakeAborted);
            }
            Err(_) => {
                self.set_state(WorkerState::Closed);
                error!(
                    timeout_ms = timeout.as_millis() as u64,
                    "coordinator did not send the signaling channel"
                );
                return Err(WorkerError::HandshakeTimeout(timeout));
            }
        };
        info!("Received the signaling channel");

        let (sender, receiver) = init.signaling_channel.split();
        self.checkers = Some(CheckerRegistry::new(
            Arc::new(ChannelSink(sender.clone())),
            ExecutionPolicy::Inline,
            Handle::current(),
        ));
        self.sender = Some(sender);
        self.receiver = Some(receiver);
        self.set_state(WorkerState::Ready);
        info!("... the health checker worker has successfully initialized!");
        Ok(())
    }

    /// Register a periodic check reporting as `name`. Requires a completed handshake.
    pub fn add_health_checker<C>(
        &mut self,
        name: &str,
        check: C,
        interval: Duration,
    ) -> Result<(), WorkerError>
    where
        C: HealthCheck,
    {
        if self.state() != WorkerState::Ready {
            return Err(WorkerError::NotReady);
        }
        let checkers = self.checkers.as_mut().ok_or(WorkerError::NotReady)?;
        checkers.add(name, check, interval);
        Ok(())
    }

    pub fn clear_health_checker(&mut self, name: &str) -> Result<(), CheckerError> {
        match self.checkers.as_mut() {
            Some(checkers) => checkers.remove(name),
            None => Err(CheckerError::NotFound(name.to_string())),
        }
    }

    pub fn clear_all_health_checkers(&mut self) {
        match self.checkers.as_mut() {
            Some(checkers) => checkers.remove_all(),
            None => info!("No health checkers to remove"),
        }
    }

    pub fn checker_count(&self) -> usize {
        self.checkers.as_ref().map_or(0, CheckerRegistry::len)
    }

    /// The worker's endpoint, for checks that post raw messages.
    pub fn signaling_channel(&self) -> Option<EndpointSender> {
        self.sender.clone()
    }

    /// Serve until the channel closes (graceful drain, `Ok`), the coordinator
    /// reports a fault (`Err(WorkerError::Fault)`) or a health check panics
    /// (`Err(WorkerError::CheckPanicked)`).
    pub async fn run(mut self) -> Result<(), WorkerError> {
        let mut receiver = self.receiver.take().ok_or(WorkerError::NotReady)?;
        let mut failures = self
            .checkers
            .as_mut()
            .and_then(CheckerRegistry::take_failures);

        loop {
            tokio::select! {
                message = receiver.recv() => match message {
                    None => {
                        warn!("The worker is terminating...");
                        self.set_state(WorkerState::Terminating);
                        self.clear_all_health_checkers();
                        self.set_state(WorkerState::Closed);
                        warn!("... worker has gracefully stopped.");
                        return Ok(());
                    }
                    Some(Message::Fault { error }) => {
                        metrics::emit_worker_fault();
                        error!(error = %error, "coordinator rejected a state update");
                        self.abort();
                        return Err(WorkerError::Fault(error));
                    }
                    Some(Message::Update(state)) => {
                        debug!(?state, "ignoring state update received by the worker");
                    }
                },
                Some(checker) = next_failure(&mut failures) => {
                    error!(checker = %checker, "health check panicked, stopping the worker");
                    self.abort();
                    return Err(WorkerError::CheckPanicked(checker));
                }
            }
        }
    }

    /// Close the channel and cancel every checker after a fatal error.
    fn abort(&mut self) {
        if let Some(sender) = &self.sender {
            sender.close();
        }
        self.set_state(WorkerState::Terminating);
        self.clear_all_health_checkers();
        self.set_state(WorkerState::Closed);
    }
}

async fn next_failure(failures: &mut Option<mpsc::UnboundedReceiver<String>>) -> Option<String> {
    match failures {
        Some(failures) => failures.recv().await,
        None => std::future::pending().await,
    }
}

/// Health checker implementation run inside the worker context. `register` is
/// called once the handshake completed and should add the checkers.
pub trait WorkerImpl: Send + 'static {
    fn name(&self) -> &str;

    fn register(&self, worker: &mut HealthCheckWorker) -> Result<(), WorkerError>;
}

/// [`WorkerImpl`] made of a name and a registration closure.
pub struct NamedWorker<F> {
    name: String,
    register: F,
}

pub fn worker_impl<F>(name: impl Into<String>, register: F) -> NamedWorker<F>
where
    F: Fn(&mut HealthCheckWorker) -> Result<(), WorkerError> + Send + 'static,
{
    NamedWorker {
        name: name.into(),
        register,
    }
}

impl<F> WorkerImpl for NamedWorker<F>
where
    F: Fn(&mut HealthCheckWorker) -> Result<(), WorkerError> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn register(&self, worker: &mut HealthCheckWorker) -> Result<(), WorkerError> {
        (self.register)(worker)
    }
}

/// Receivers for the worker thread's online signal and final result.
pub(crate) struct WorkerThread {
    pub(crate) online: oneshot::Receiver<()>,
    pub(crate) exit: oneshot::Receiver<Result<(), WorkerError>>,
}

/// Start `imp` on a dedicated OS thread with its own current-thread runtime.
pub(crate) fn spawn_worker<W>(
    imp: W,
    thread_name: &str,
    handshake_timeout: Duration,
    parent: ParentPort,
) -> io::Result<WorkerThread>
where
    W: WorkerImpl,
{
    let (online_tx, online) = oneshot::channel();
    let (exit_tx, exit) = oneshot::channel();

    thread::Builder::new()
        .name(thread_name.to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    drop(exit_tx.send(Err(WorkerError::Runtime(e))));
                    return;
                }
            };

            let span = info_span!("health_checker_worker", worker = %imp.name());
            let result = runtime.block_on(
                async move {
                    let mut worker = HealthCheckWorker::new(parent);
                    drop(online_tx.send(()));
                    worker.init(handshake_timeout).await?;
                    imp.register(&mut worker)?;
                    worker.run().await
                }
                .instrument(span),
            );
            drop(exit_tx.send(result));
        })?;

    Ok(WorkerThread { online, exit })
}
