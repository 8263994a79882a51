//! Aggregated per-service readiness and the single-key update protocol.
//!
//! The declared service set is fixed at construction; every service starts as
//! not ready. Each accepted update recomputes the aggregate (logical AND over all
//! services) and publishes it to the [`ReadinessSignaler`] before returning, so
//! callers holding the store behind a lock never observe a half-applied update.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use tracing::{debug, error};

use crate::checker::SignalSink;
use crate::error::StateError;
use crate::lock;
use crate::message::kind_of;
use crate::metrics;
use crate::readiness::ReadinessSignaler;

/// Aggregate readiness: true iff every declared service is ready.
pub fn all_true(services: &BTreeMap<String, bool>) -> bool {
    services.values().all(|ready| *ready)
}

pub struct StateStore {
    services: BTreeMap<String, bool>,
    signaler: Arc<dyn ReadinessSignaler>,
}

impl StateStore {
    pub fn new<I, S>(services: I, signaler: Arc<dyn ReadinessSignaler>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            services: services.into_iter().map(|s| (s.into(), false)).collect(),
            signaler,
        }
    }

    /// Apply one `(service, value)` pair and publish the resulting aggregate.
    /// Returns the aggregate readiness after the update.
    pub fn update(&mut self, service: &str, value: &Value) -> Result<bool, StateError> {
        // undeclared names would make the label set unbounded
        let label = if self.services.contains_key(service) {
            service
        } else {
            metrics::UNKNOWN_SERVICE_LABEL
        };
        let Value::Bool(ready) = value else {
            metrics::emit_state_update(label, "invalid_type");
            return Err(StateError::InvalidType {
                received: kind_of(Some(value)),
            });
        };
        let Some(slot) = self.services.get_mut(service) else {
            metrics::emit_state_update(label, "unknown_service");
            return Err(StateError::UnknownService(service.to_string()));
        };
        *slot = *ready;

        let aggregate = all_true(&self.services);
        if aggregate {
            self.signaler.signal_ready();
        } else {
            self.signaler.signal_not_ready();
        }
        metrics::emit_state_update(label, "ok");
        metrics::emit_ready(aggregate);
        debug!(service = %service, ready = *ready, aggregate, "state updated");
        Ok(aggregate)
    }

    pub fn set(&mut self, service: &str, ready: bool) -> Result<bool, StateError> {
        self.update(service, &Value::Bool(ready))
    }

    /// Apply a wire update. Anything but exactly one key is rejected without
    /// touching the store; an empty message has no value to apply.
    pub fn apply(&mut self, message: &Map<String, Value>) -> Result<bool, StateError> {
        if message.len() > 1 {
            return Err(StateError::ProtocolViolation {
                keys: message.len(),
            });
        }
        match message.iter().next() {
            Some((service, value)) => self.update(service, value),
            None => Err(StateError::InvalidType {
                received: kind_of(None),
            }),
        }
    }

    pub fn is_ready(&self) -> bool {
        all_true(&self.services)
    }

    pub fn get(&self, service: &str) -> Option<bool> {
        self.services.get(service).copied()
    }

    pub fn snapshot(&self) -> BTreeMap<String, bool> {
        self.services.clone()
    }

    pub fn signaler(&self) -> &Arc<dyn ReadinessSignaler> {
        &self.signaler
    }
}

/// A [`StateStore`] shared by every caller of one manager. All access goes
/// through the lock, which doubles as the critical section for publishing.
#[derive(Clone)]
pub(crate) struct SharedState(Arc<Mutex<StateStore>>);

impl SharedState {
    pub(crate) fn new(store: StateStore) -> Self {
        Self(Arc::new(Mutex::new(store)))
    }

    pub(crate) fn set(&self, service: &str, ready: bool) -> Result<bool, StateError> {
        lock(&self.0).set(service, ready)
    }

    pub(crate) fn apply(&self, message: &Map<String, Value>) -> Result<bool, StateError> {
        lock(&self.0).apply(message)
    }

    pub(crate) fn is_ready(&self) -> bool {
        lock(&self.0).is_ready()
    }

    pub(crate) fn snapshot(&self) -> BTreeMap<String, bool> {
        lock(&self.0).snapshot()
    }
}

impl SignalSink for SharedState {
    fn signal(&self, service: &str, ready: bool) {
        if let Err(e) = self.set(service, ready) {
            error!(service = %service, error = %e, "rejected state update from health checker");
        }
    }
}
