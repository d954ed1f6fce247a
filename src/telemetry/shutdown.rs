//! Signal-driven shutdown

use crate::engine::StopHandle;
use crate::Result;
use std::future::Future;
use std::time::Duration;
use tracing::info;

/// Time given to the engine to leave its read loop after a signal
pub const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Waits for SIGINT or SIGTERM, then stops the engine and waits out the
/// grace period. The caller exits the process afterwards.
pub async fn shutdown_on_signal(stop: StopHandle) -> Result<()> {
    stop_after(wait_for_signal(), stop, SHUTDOWN_GRACE).await
}

async fn stop_after<F>(signal: F, stop: StopHandle, grace: Duration) -> Result<()>
where
    F: Future<Output = Result<&'static str>>,
{
    let name = signal.await?;
    info!(signal = name, "received stop signal");
    stop.stop();
    tokio::time::sleep(grace).await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = interrupt.recv() => Ok("SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl-c")
}
