//! Process shutdown signals
//!
//! Kubernetes stops a pod with SIGTERM, a terminal with SIGINT. Both start
//! the same graceful shutdown.

use tracing::info;

/// Registered SIGINT and SIGTERM listeners
pub struct ShutdownSignals {
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
}

impl ShutdownSignals {
    /// Register the listeners. Signals delivered after this returns are
    /// caught rather than killing the process.
    pub fn install() -> std::io::Result<Self> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            Ok(Self {
                terminate: signal(SignalKind::terminate())?,
                interrupt: signal(SignalKind::interrupt())?,
            })
        }
        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }

    /// Wait for the first shutdown signal and return its name
    pub async fn recv(&mut self) -> &'static str {
        #[cfg(unix)]
        let name = tokio::select! {
            _ = self.terminate.recv() => "SIGTERM",
            _ = self.interrupt.recv() => "SIGINT",
        };
        #[cfg(not(unix))]
        let name = match tokio::signal::ctrl_c().await {
            Ok(()) => "ctrl-c",
            Err(_) => std::future::pending().await,
        };

        info!(signal = name, "shutdown signal received");
        name
    }
}
