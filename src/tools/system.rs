//! Process lifecycle: signal handling and shutdown coordination.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};

static RUNNING: AtomicBool = AtomicBool::new(true);

/// Spawns a task which flips the process into shutdown mode on SIGINT, SIGTERM or SIGHUP.
///
/// Must be called from within a tokio runtime.
pub fn install_termination_listener() {
    tokio::spawn(async move {
        let mut sig_term = signal(SignalKind::terminate()).ok();
        let mut sig_int = signal(SignalKind::interrupt()).ok();
        let mut sig_hup = signal(SignalKind::hangup()).ok();

        tokio::select! {
            Some(_) = async { sig_int.as_mut()?.recv().await } => {
                tracing::info!("Received SIGINT. Shutting down...");
            },
            Some(_) = async { sig_term.as_mut()?.recv().await } => {
                tracing::info!("Received SIGTERM. Shutting down...");
            },
            Some(_) = async { sig_hup.as_mut()?.recv().await } => {
                tracing::info!("Received SIGHUP. Shutting down...");
            },
        }

        request_shutdown();
    });
}

/// Marks the process as shutting down.
pub fn request_shutdown() {
    RUNNING.store(false, Ordering::Relaxed);
}

pub fn is_running() -> bool {
    RUNNING.load(Ordering::Relaxed)
}

/// Completes once a shutdown has been requested.
pub async fn await_shutdown() {
    while is_running() {
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}
