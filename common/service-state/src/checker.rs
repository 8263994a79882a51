//! Named periodic health checks.
//!
//! Each registered checker owns a ticking task. A tick never queues behind a
//! running check: with [`ExecutionPolicy::Guarded`] the check runs on its own task
//! behind a busy guard and overlapping ticks are dropped, with
//! [`ExecutionPolicy::Inline`] the check runs inside the ticking task and ticks
//! missed meanwhile are skipped by the interval.
//!
//! A run ends when the future returned by the check body completes; work the
//! body detaches from that future is not covered by the guard. A panicking body
//! stops its checker and is reported on the registry's failure channel.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::CheckerError;
use crate::metrics;

const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Destination of the readiness reported by checkers.
pub trait SignalSink: Send + Sync + 'static {
    fn signal(&self, service: &str, ready: bool);
}

/// Signal callbacks bound to one service at registration time.
#[derive(Clone)]
pub struct ServiceSignal {
    service: Arc<str>,
    sink: Arc<dyn SignalSink>,
}

impl ServiceSignal {
    pub fn new(service: impl Into<Arc<str>>, sink: Arc<dyn SignalSink>) -> Self {
        Self {
            service: service.into(),
            sink,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn ready(&self) {
        self.sink.signal(&self.service, true)
    }

    pub fn not_ready(&self) {
        self.sink.signal(&self.service, false)
    }

    pub fn set(&self, ready: bool) {
        self.sink.signal(&self.service, ready)
    }
}

/// User-supplied health check body. Implemented for any
/// `Fn(ServiceSignal) -> impl Future<Output = ()>`.
pub trait HealthCheck: Send + Sync + 'static {
    fn check(&self, signal: ServiceSignal) -> BoxFuture<'static, ()>;
}

impl<F, Fut> HealthCheck for F
where
    F: Fn(ServiceSignal) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn check(&self, signal: ServiceSignal) -> BoxFuture<'static, ()> {
        self(signal).boxed()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionPolicy {
    /// Checks run on their own task; ticks are dropped until the check's future
    /// completes.
    Guarded,
    /// Checks run on the ticking task itself.
    Inline,
}

/// Idle/Running flag for one checker.
#[derive(Clone, Default)]
pub(crate) struct BusyGuard(Arc<AtomicBool>);

impl BusyGuard {
    pub(crate) fn try_acquire(&self) -> Option<BusyPermit> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BusyPermit(self.0.clone()))
    }

    #[cfg(test)]
    pub(crate) fn is_busy(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Returns the guard to Idle when dropped.
pub(crate) struct BusyPermit(Arc<AtomicBool>);

impl Drop for BusyPermit {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub(crate) struct Checker {
    name: Arc<str>,
    check: Arc<dyn HealthCheck>,
    signal: ServiceSignal,
    guard: BusyGuard,
    token: CancellationToken,
    failures: mpsc::UnboundedSender<String>,
}

impl Checker {
    fn new(
        name: &str,
        check: Arc<dyn HealthCheck>,
        sink: Arc<dyn SignalSink>,
        token: CancellationToken,
        failures: mpsc::UnboundedSender<String>,
    ) -> Self {
        let name: Arc<str> = Arc::from(name);
        Self {
            signal: ServiceSignal::new(name.clone(), sink),
            name,
            check,
            guard: BusyGuard::default(),
            token,
            failures,
        }
    }

    fn run(&self) -> impl Future<Output = ()> + Send + 'static {
        let check = self.check.clone();
        let signal = self.signal.clone();
        run_check(
            async move { check.check(signal).await }.boxed(),
            self.name.clone(),
            self.token.clone(),
            self.failures.clone(),
        )
    }

    /// Start one guarded run. Returns false when the previous run is still in flight.
    pub(crate) fn fire(&self) -> bool {
        let Some(permit) = self.guard.try_acquire() else {
            debug!(checker = %self.name, "previous check still running, skipping tick");
            metrics::emit_tick_skipped(&self.name);
            return false;
        };
        let run = self.run();
        tokio::spawn(async move {
            run.await;
            drop(permit);
        });
        true
    }

    async fn tick_loop(self, interval: Duration, policy: ExecutionPolicy) {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;

                _ = self.token.cancelled() => break,
                _ = ticker.tick() => match policy {
                    ExecutionPolicy::Guarded => {
                        self.fire();
                    }
                    ExecutionPolicy::Inline => self.run().await,
                },
            }
        }
        debug!(checker = %self.name, "health checker stopped");
    }
}

/// Drive one check body until it completes or the checker is cancelled. A panic
/// cancels the checker and reports its name on `failures`.
async fn run_check(
    run: BoxFuture<'static, ()>,
    name: Arc<str>,
    token: CancellationToken,
    failures: mpsc::UnboundedSender<String>,
) {
    tokio::select! {
        outcome = AssertUnwindSafe(run).catch_unwind() => {
            if let Err(panic) = outcome {
                error!(
                    checker = %name,
                    reason = %panic_reason(&*panic),
                    "health check panicked"
                );
                metrics::emit_check_panicked(&name);
                token.cancel();
                drop(failures.send(name.to_string()));
            }
        }
        _ = token.cancelled() => {}
    }
}

fn panic_reason(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

struct CheckerEntry {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Set of named periodic checks. Owned by a single execution context.
pub struct CheckerRegistry {
    entries: HashMap<String, CheckerEntry>,
    sink: Arc<dyn SignalSink>,
    policy: ExecutionPolicy,
    runtime: Handle,
    failures: mpsc::UnboundedSender<String>,
    failed: Option<mpsc::UnboundedReceiver<String>>,
}

impl CheckerRegistry {
    /// Tick loops are spawned on `runtime`.
    pub fn new(sink: Arc<dyn SignalSink>, policy: ExecutionPolicy, runtime: Handle) -> Self {
        let (failures, failed) = mpsc::unbounded_channel();
        Self {
            entries: HashMap::new(),
            sink,
            policy,
            runtime,
            failures,
            failed: Some(failed),
        }
    }

    /// Names of checkers whose body panicked, in order. Can be taken once.
    pub fn take_failures(&mut self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.failed.take()
    }

    /// Run `check` every `interval`, first one interval from now. A checker already
    /// registered under `name` is cancelled and replaced.
    pub fn add<C>(&mut self, name: &str, check: C, interval: Duration)
    where
        C: HealthCheck,
    {
        let interval = if interval < MIN_INTERVAL {
            warn!(checker = %name, ?interval, "health checker interval too small, using 1ms");
            MIN_INTERVAL
        } else {
            interval
        };

        let token = CancellationToken::new();
        let checker = Checker::new(
            name,
            Arc::new(check),
            self.sink.clone(),
            token.clone(),
            self.failures.clone(),
        );
        let task = self
            .runtime
            .spawn(checker.tick_loop(interval, self.policy));

        if let Some(previous) = self
            .entries
            .insert(name.to_string(), CheckerEntry { token, task })
        {
            previous.token.cancel();
            warn!(checker = %name, "replaced existing health checker");
        }
        info!(
            checker = %name,
            interval_ms = interval.as_millis() as u64,
            "added health checker"
        );
    }

    /// Cancel the checker registered under `name`.
    pub fn remove(&mut self, name: &str) -> Result<(), CheckerError> {
        let entry = self
            .entries
            .remove(name)
            .ok_or_else(|| CheckerError::NotFound(name.to_string()))?;
        entry.token.cancel();
        info!(checker = %name, "Cleared \"{name}\" health checker");
        Ok(())
    }

    /// Cancel every registered checker. Never fails.
    pub fn remove_all(&mut self) {
        if self.entries.is_empty() {
            info!("No health checkers to remove");
            return;
        }
        info!("Removing {} health checkers...", self.entries.len());
        for (name, entry) in self.entries.drain() {
            entry.token.cancel();
            debug!(checker = %name, "cleared health checker");
        }
        info!("... successfully removed all health checkers");
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    /// True once the tick loop of `name` has exited.
    #[cfg(test)]
    fn is_finished(&self, name: &str) -> Option<bool> {
        self.entries.get(name).map(|e| e.task.is_finished())
    }
}

impl Drop for CheckerRegistry {
    fn drop(&mut self) {
        for entry in self.entries.values() {
            entry.token.cancel();
            entry.task.abort();
        }
    }
}
