use tokio_util::sync::CancellationToken;

/// Install a shutdown handler for SIGTERM (unix) and ctrl-c.
///
/// Returns a `CancellationToken` cancelled when either signal arrives. The
/// dispatch, watch, and scheduler loops all monitor this token and drain
/// gracefully.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Received interrupt, initiating graceful shutdown");
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Received interrupt, initiating graceful shutdown");
        }

        token_clone.cancel();
    });

    token
}
