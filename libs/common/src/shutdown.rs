//! Graceful shutdown utilities
//!
//! Provides unified shutdown signal handling for the services.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Wait for shutdown signal (Ctrl+C or SIGTERM on Unix)
///
/// - On Unix: Ctrl+C (SIGINT) or SIGTERM
/// - On Windows: Ctrl+C only
///
/// # Example
///
/// ```ignore
/// tokio::select! {
///     _ = common::shutdown::wait_for_shutdown() => {
///         info!("Shutdown signal received");
///     }
///     // ... other tasks
/// }
/// ```
pub async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let term_signal = match signal(SignalKind::terminate()) {
            Ok(sig) => Some(sig),
            Err(e) => {
                warn!(
                    "Failed to install SIGTERM handler: {}. Service will only respond to Ctrl+C",
                    e
                );
                None
            },
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = async {
                if let Some(mut sig) = term_signal {
                    sig.recv().await;
                } else {
                    std::future::pending::<()>().await
                }
            } => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Spawn a listener that cancels the returned token on the first shutdown signal
///
/// Supervisors and workers hold child tokens of this one, so a single
/// signal unwinds every device loop.
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        wait_for_shutdown().await;
        info!("Shutdown signal received");
        trigger.cancel();
    });
    token
}
