//! Process signal handling.

use beaconwatch_core::ShutdownTrigger;
use tracing::{error, info};

/// Fire `trigger` on SIGINT or SIGTERM (Ctrl+C on other platforms).
///
/// The handler runs on its own task. If the handlers cannot be installed the
/// error is logged and the process can only be stopped by force.
pub fn setup_signal_handlers(trigger: ShutdownTrigger) {
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(signal) => {
                info!("Received {signal}, initiating shutdown...");
                trigger.trigger();
            }
            Err(e) => error!(error = %e, "Failed to install signal handlers"),
        }
    });
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => Ok("SIGINT"),
        _ = sigterm.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("Ctrl+C")
}
