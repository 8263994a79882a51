//! Error types for state updates, checker management and the worker/coordinator pair.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by the state update protocol.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StateError {
    /// The update value was not a boolean.
    #[error("Invalid state type: expected \"boolean\", received \"{received}\"")]
    InvalidType { received: &'static str },

    /// The update targets a service outside the declared set.
    #[error("Service is not registered: \"{0}\"")]
    UnknownService(String),

    /// A single update message carried more (or less) than one service.
    #[error("Incorrect usage: the status message must contain only one service status, got {keys} keys")]
    ProtocolViolation { keys: usize },
}

/// Errors raised by [`CheckerRegistry`](crate::CheckerRegistry).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CheckerError {
    #[error("Health checker \"{0}\" not found")]
    NotFound(String),
}

/// Errors raised when posting on a [`SignalingChannel`](crate::SignalingChannel) endpoint.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("signaling channel is closed")]
    Closed,
}

/// Errors that end the worker execution context.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The coordinator did not send the signaling channel within the deadline.
    #[error("coordinator did not send the signaling channel within {0:?}")]
    HandshakeTimeout(Duration),

    /// The bootstrap port was dropped before any handshake message arrived.
    #[error("coordinator went away before sending the signaling channel")]
    HandshakeAborted,

    /// An operation that needs the signaling channel was attempted before the handshake.
    #[error("health checker worker is not initialized")]
    NotReady,

    /// The coordinator reported a failed state update; unrecoverable for the worker.
    #[error("coordinator rejected a state update: {0}")]
    Fault(String),

    /// A health check body panicked; its checker is dead.
    #[error("health check \"{0}\" panicked")]
    CheckPanicked(String),

    #[error(transparent)]
    Checker(#[from] CheckerError),

    /// The worker's dedicated runtime could not be built.
    #[error("failed to build the worker runtime: {0}")]
    Runtime(#[source] std::io::Error),

    /// The worker thread panicked or exited without reporting.
    #[error("health checker worker thread panicked")]
    Panicked,
}

/// Errors returned by the cross-context [`Coordinator`](crate::Coordinator).
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// The worker OS thread could not be spawned.
    #[error("failed to spawn the health checker worker: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("health checker worker failed: {0}")]
    WorkerFailed(#[from] WorkerError),

    /// The worker result was already collected.
    #[error("health checker worker result was already taken")]
    WorkerGone,
}
