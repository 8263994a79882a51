//! Demo service: readiness is the conjunction of the probe server being up and
//! an upstream TCP dependency accepting connections, checked from the worker.
use std::sync::Arc;
use std::time::Duration;

use envconfig::Envconfig;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use service_state::config::EnvMsDuration;
use service_state::{
    worker_impl, Config, Coordinator, HealthCheckWorker, ProbeSignaler, ServiceSignal,
};

#[derive(Envconfig, Clone, Debug)]
struct DemoConfig {
    #[envconfig(nested = true)]
    service_state: Config,

    #[envconfig(from = "UPSTREAM_ADDR", default = "127.0.0.1:5432")]
    upstream_addr: String,

    #[envconfig(from = "UPSTREAM_CHECK_INTERVAL_MS", default = "5000")]
    check_interval: EnvMsDuration,
}

async fn check_upstream(addr: String, signal: ServiceSignal) {
    let connect = tokio::net::TcpStream::connect(addr.as_str());
    match tokio::time::timeout(Duration::from_secs(1), connect).await {
        Ok(Ok(_)) => signal.ready(),
        Ok(Err(e)) => {
            info!(upstream = %addr, error = %e, "upstream is not accepting connections");
            signal.not_ready()
        }
        Err(_) => {
            info!(upstream = %addr, "upstream connection timed out");
            signal.not_ready()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = DemoConfig::init_from_env()?;
    let signaler = ProbeSignaler::from_config(&config.service_state);

    let upstream = config.upstream_addr.clone();
    let interval = config.check_interval.0;
    let worker = worker_impl("upstream-checker", move |worker: &mut HealthCheckWorker| {
        let upstream = upstream.clone();
        worker.add_health_checker(
            "upstream",
            move |signal: ServiceSignal| check_upstream(upstream.clone(), signal),
            interval,
        )
    });

    let coordinator = Coordinator::start(
        ["server", "upstream"],
        worker,
        Arc::new(signaler.clone()),
        &config.service_state,
    )?;

    let bind = config.service_state.bind();
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    let router = signaler.router();
    let server_signaler = signaler.clone();
    tokio::spawn(async move {
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(async move { server_signaler.wait_for_shutdown().await })
            .await;
        if let Err(e) = served {
            error!(error = %e, "probe server failed");
        }
    });
    info!(%bind, "probe server listening");
    coordinator.signal_ready("server")?;

    signaler.wait_for_shutdown().await;
    match coordinator.worker_exit().await {
        Ok(()) => info!("health checker worker stopped cleanly"),
        Err(e) => error!(error = %e, "health checker worker failed"),
    }

    Ok(())
}
