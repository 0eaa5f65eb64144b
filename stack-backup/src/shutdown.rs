//! Termination signals (SIGINT and SIGTERM).
//!
//! Workflows are raced against [`wait_for_signal`]; the losing workflow future
//! is dropped, which runs its staging cleanup before the process exits.

use std::io;
use tokio::signal;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
}

impl Signal {
    /// Conventional shell exit status for a process ended by this signal.
    pub fn exit_code(&self) -> i32 {
        match self {
            Signal::Interrupt => 130,
            Signal::Terminate => 143,
        }
    }
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM.
pub async fn wait_for_signal() -> io::Result<Signal> {
    #[cfg(unix)]
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    #[cfg(unix)]
    let terminate = async move {
        terminate.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let received = tokio::select! {
        result = signal::ctrl_c() => {
            result?;
            Signal::Interrupt
        }
        _ = terminate => Signal::Terminate,
    };

    warn!("Received {:?}, abandoning the running operation", received);
    Ok(received)
}
