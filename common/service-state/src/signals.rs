use tokio::signal::unix::SignalKind;

/// Resolves on SIGINT or SIGTERM. If the SIGTERM handler cannot be installed,
/// only SIGINT is watched.
pub(crate) async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = match tokio::signal::unix::signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::warn!(error = %e, "failed to install SIGTERM handler");
            if let Err(e) = ctrl_c.await {
                tracing::warn!(error = %e, "failed to listen for SIGINT");
                std::future::pending::<()>().await;
            }
            tracing::info!("received SIGINT");
            return;
        }
    };

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT"),
        _ = sigterm.recv() => tracing::info!("received SIGTERM"),
    }
}
