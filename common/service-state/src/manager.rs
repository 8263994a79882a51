//! In-process service state manager: state store, health checkers and readiness
//! signaler all live on the caller's runtime.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{debug, error, info};

use crate::checker::{CheckerRegistry, ExecutionPolicy, HealthCheck};
use crate::error::{CheckerError, StateError};
use crate::lock;
use crate::readiness::{shutdown_handler, Beacon, ReadinessSignaler, ShutdownHandler};
use crate::state::{SharedState, StateStore};

/// Manages the declared services' states, running health checkers on the
/// current runtime. Overlapping ticks of one checker are dropped while its
/// previous run is still in flight; a run lasts until the future returned by
/// the check completes. A panicking check initiates shutdown.
pub struct Manager {
    state: SharedState,
    checkers: Arc<Mutex<CheckerRegistry>>,
    signaler: Arc<dyn ReadinessSignaler>,
}

impl Manager {
    /// Declare `services` (all initially not ready). Clearing every health checker
    /// is registered as a shutdown handler. Must be called from within a tokio runtime.
    pub fn new<I, S>(services: I, signaler: Arc<dyn ReadinessSignaler>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        info!("Initializing the Manager...");
        let state = SharedState::new(StateStore::new(services, signaler.clone()));
        let checkers = Arc::new(Mutex::new(CheckerRegistry::new(
            Arc::new(state.clone()),
            ExecutionPolicy::Guarded,
            Handle::current(),
        )));

        if let Some(mut failures) = lock(&checkers).take_failures() {
            let signaler = signaler.clone();
            tokio::spawn(async move {
                while let Some(checker) = failures.recv().await {
                    error!(checker = %checker, "health check panicked, shutting down");
                    signaler.shutdown();
                }
            });
        }

        let registry = Arc::downgrade(&checkers);
        signaler.register_shutdown_handler(shutdown_handler(move || async move {
            if let Some(registry) = registry.upgrade() {
                lock(&registry).remove_all();
            }
        }));

        debug!(services = ?state.snapshot(), "Manager configuration");
        info!("... Manager initialized.");
        Self {
            state,
            checkers,
            signaler,
        }
    }

    /// Mark `service` ready, e.g. from a client's own connection events.
    pub fn signal_ready(&self, service: &str) -> Result<(), StateError> {
        self.state.set(service, true).map(|_| ())
    }

    pub fn signal_not_ready(&self, service: &str) -> Result<(), StateError> {
        self.state.set(service, false).map(|_| ())
    }

    /// Run `check` every `interval`, reporting as `service`. Rejected reports are
    /// logged and the checker keeps running.
    pub fn add_health_checker<C>(&self, service: &str, check: C, interval: Duration)
    where
        C: HealthCheck,
    {
        lock(&self.checkers).add(service, check, interval)
    }

    pub fn clear_health_checker(&self, service: &str) -> Result<(), CheckerError> {
        lock(&self.checkers).remove(service)
    }

    pub fn clear_all_health_checkers(&self) {
        lock(&self.checkers).remove_all()
    }

    pub fn health_checkers(&self) -> Vec<String> {
        lock(&self.checkers).names()
    }

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
}
