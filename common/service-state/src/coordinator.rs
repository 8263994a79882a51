//! Cross-context service state manager.
//!
//! The coordinator owns the [`StateStore`] and the readiness signaler, and runs
//! the health checks on a [`HealthCheckWorker`] living on its own OS thread. Once
//! the worker is online it receives one end of a [`SignalingChannel`]; every
//! update arriving on the other end is applied here. Rejected updates, fault
//! messages from the worker included, are sent back as faults; multi-service
//! updates shut the whole service down.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::{parent_port, EndpointSender, InitMessage, ParentSender, SignalingChannel};
use crate::config::Config;
use crate::error::{CoordinatorError, StateError, WorkerError};
use crate::message::Message;
use crate::readiness::{shutdown_handler, Beacon, ReadinessSignaler, ShutdownHandler};
use crate::state::{SharedState, StateStore};
use crate::worker::{spawn_worker, WorkerImpl, WorkerThread};
use crate::{lock, metrics};

type WorkerExit = oneshot::Receiver<Result<(), WorkerError>>;

pub struct Coordinator {
    state: SharedState,
    signaler: Arc<dyn ReadinessSignaler>,
    exit: Mutex<Option<WorkerExit>>,
}

impl Coordinator {
    /// Declare `services`, start `worker` on its own thread and wire the signaling
    /// channel once it is online. Must be called from within a tokio runtime.
    pub fn start<I, S, W>(
        services: I,
        worker: W,
        signaler: Arc<dyn ReadinessSignaler>,
        config: &Config,
    ) -> Result<Self, CoordinatorError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        W: WorkerImpl,
    {
        info!("Initializing the Coordinator...");
        let state = SharedState::new(StateStore::new(services, signaler.clone()));
        debug!(services = ?state.snapshot(), ?config, "Coordinator configuration");

        info!(worker = %worker.name(), "Initializing the health checker worker thread");
        let (parent, port) = parent_port();
        let WorkerThread { online, exit } = spawn_worker(
            worker,
            &config.worker_name,
            config.handshake_timeout.0,
            port,
        )
        .map_err(CoordinatorError::Spawn)?;

        let worker_done = CancellationToken::new();
        tokio::spawn(serve_worker(
            online,
            parent,
            state.clone(),
            signaler.clone(),
            worker_done.clone(),
        ));

        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(supervise_worker(exit, exit_tx, signaler.clone(), worker_done));

        info!("... Coordinator initialized.");
        Ok(Self {
            state,
            signaler,
            exit: Mutex::new(Some(exit_rx)),
        })
    }

    /// Mark `service` ready without going through a health checker.
    pub fn signal_ready(&self, service: &str) -> Result<(), StateError> {
        self.state.set(service, true).map(|_| ())
    }

    pub fn signal_not_ready(&self, service: &str) -> Result<(), StateError> {
        self.state.set(service, false).map(|_| ())
    }

    /// Aggregate readiness of the declared services.
    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    pub fn snapshot(&self) -> BTreeMap<String, bool> {
        self.state.snapshot()
    }

    pub fn signaler(&self) -> &Arc<dyn ReadinessSignaler> {
        &self.signaler
    }

    pub fn register_shutdown_handler(&self, handler: ShutdownHandler) {
        self.signaler.register_shutdown_handler(handler)
    }

    pub fn create_beacon(&self) -> Beacon {
        self.signaler.create_beacon()
    }

    pub fn is_server_ready(&self) -> bool {
        self.signaler.is_server_ready()
    }

    pub fn shutdown(&self) {
        self.signaler.shutdown()
    }

    /// Final result of the worker context. Resolves after a graceful drain, a
    /// fatal fault or a failed handshake; can be awaited once.
    pub async fn worker_exit(&self) -> Result<(), CoordinatorError> {
        let exit = lock(&self.exit).take().ok_or(CoordinatorError::WorkerGone)?;
        match exit.await {
            Ok(result) => result.map_err(CoordinatorError::from),
            Err(_) => Err(CoordinatorError::WorkerFailed(WorkerError::Panicked)),
        }
    }
}

/// Hand the worker its endpoint once it is online, then apply its updates until
/// the channel closes.
async fn serve_worker(
    online: oneshot::Receiver<()>,
    parent: ParentSender,
    state: SharedState,
    signaler: Arc<dyn ReadinessSignaler>,
    worker_done: CancellationToken,
) {
    if online.await.is_err() {
        warn!("health checker worker exited before coming online");
        return;
    }

    let (port1, port2) = SignalingChannel::new();
    if parent
        .post(InitMessage {
            signaling_channel: port1,
        })
        .is_err()
    {
        warn!("health checker worker went away before the handshake");
        return;
    }
    debug!("sent the signaling channel to the worker");

    let (sender, mut receiver) = port2.split();

    let closer = sender.clone();
    signaler.register_shutdown_handler(shutdown_handler(move || async move {
        warn!("Closing the signaling channel");
        closer.close();
        worker_done.cancelled().await;
    }));
    if signaler.is_shutting_down() {
        sender.close();
    }

    while let Some(message) = receiver.recv().await {
        handle_signal_message(&state, &sender, signaler.as_ref(), message);
    }
    debug!("signaling channel closed");
}

/// Forward the worker's final result; a failed worker takes the service down.
async fn supervise_worker(
    exit: oneshot::Receiver<Result<(), WorkerError>>,
    forward: oneshot::Sender<Result<(), WorkerError>>,
    signaler: Arc<dyn ReadinessSignaler>,
    worker_done: CancellationToken,
) {
    let result = exit.await.unwrap_or(Err(WorkerError::Panicked));
    match &result {
        Ok(()) => info!("health checker worker stopped"),
        Err(e) => {
            error!(error = %e, "health checker worker failed, shutting down");
            signaler.shutdown();
        }
    }
    worker_done.cancel();
    drop(forward.send(result));
}

pub(crate) fn handle_signal_message(
    state: &SharedState,
    sender: &EndpointSender,
    signaler: &dyn ReadinessSignaler,
    message: Message,
) {
    match message {
        Message::Update(update) => {
            if update.len() > 1 {
                metrics::emit_protocol_violation();
                error!(
                    keys = update.len(),
                    "Incorrect usage: the status message must contain only one service status"
                );
                signaler.shutdown();
                return;
            }
            if let Err(e) = state.apply(&update) {
                report_fault(sender, e);
            }
        }
        Message::Fault { error } => {
            // `{error: <string>}` read as an update carries a non-boolean value
            warn!(error = %error, "received a fault message from the worker");
            report_fault(sender, StateError::InvalidType { received: "string" });
        }
    }
}

fn report_fault(sender: &EndpointSender, e: StateError) {
    warn!(error = %e, "rejected state update, reporting fault to the worker");
    if sender.send(Message::fault(e)).is_err() {
        warn!("signaling channel closed, could not report fault");
    }
}
