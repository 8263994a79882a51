//! Service state management for microservices: aggregate per-service readiness,
//! periodic health checkers that never overlap with themselves, and readiness
//! publishing with coordinated shutdown. [`Manager`] runs everything on the
//! caller's runtime; [`Coordinator`] moves the health checkers to a worker on a
//! dedicated OS thread, talking to it only through a [`SignalingChannel`].

use std::sync::{Mutex, MutexGuard, PoisonError};

mod channel;
mod checker;
pub mod config;
mod coordinator;
mod error;
mod manager;
mod message;
mod metrics;
mod readiness;
mod signals;
mod state;
mod worker;

pub use channel::{
    parent_port, Endpoint, EndpointReceiver, EndpointSender, InitMessage, ParentPort,
    ParentSender, SignalingChannel,
};
pub use checker::{CheckerRegistry, ExecutionPolicy, HealthCheck, ServiceSignal, SignalSink};
pub use config::Config;
pub use coordinator::Coordinator;
pub use error::{ChannelError, CheckerError, CoordinatorError, StateError, WorkerError};
pub use manager::Manager;
pub use message::Message;
pub use readiness::{
    shutdown_handler, Beacon, ProbeSignaler, ProbeSignalerBuilder, ProbeStatus,
    ReadinessSignaler, ShutdownHandler,
};
pub use state::{all_true, StateStore};
pub use worker::{worker_impl, HealthCheckWorker, NamedWorker, WorkerImpl, WorkerState};

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
