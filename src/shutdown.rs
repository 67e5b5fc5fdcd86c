//! Termination-signal handling for embedding binaries.
//!
//! The library never installs signal handlers on its own; a binary that wants
//! the standard lifecycle awaits [`wait_for_termination`] and then calls
//! [`Core::shutdown`](crate::core::Core::shutdown), or uses
//! [`run_until_termination`] which does both.

use log::debug;
use tokio::signal::unix::{SignalKind, signal};

use crate::core::Core;

/// Resolve when the process receives `SIGINT` or `SIGTERM`.
pub async fn wait_for_termination() -> std::io::Result<()> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = interrupt.recv() => debug!("received SIGINT"),
        _ = terminate.recv() => debug!("received SIGTERM"),
    }
    Ok(())
}

/// Block until a termination signal arrives, then tear the core down.
/// Returns once teardown completes so the caller can exit 0.
pub async fn run_until_termination(core: &Core) -> std::io::Result<()> {
    wait_for_termination().await?;
    core.shutdown().await;
    Ok(())
}
