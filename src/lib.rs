pub mod config;
pub mod controller;
pub mod enforcer;
pub mod engine;
pub mod error;
pub mod escape;
pub mod event;
pub mod hook;
pub mod journal;
pub mod keyboard;
pub mod permission;
pub mod platform;
pub mod pointer;
pub mod schedule;
pub mod sim;
pub mod state;

pub use config::EngineConfig;
pub use controller::{LockReport, LockStatus, UnlockReason};
pub use engine::{Backend, InputLockEngine};
pub use error::{LockError, RunError};
pub use escape::{EscapeSignal, ObservationPoint};
pub use hook::Coverage;
pub use state::{Device, LockState};

use std::time::Duration;
use tokio::sync::mpsc;

/// What the `inputlock` binary was asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Session {
    /// Lock one device until the duration elapses, Ctrl-C, or (pointer only)
    /// the escape key.
    Lock {
        device: Device,
        duration: Option<Duration>,
    },
    /// Report the accessibility permission, optionally prompting for it.
    Permission { request: bool },
}

/// Runs one session on the native backend.
///
/// Must be driven inside a [`tokio::task::LocalSet`] on the main thread.
pub async fn run(session: Session, config: EngineConfig) -> Result<(), RunError> {
    let backend = platform::native_backend()?;
    let engine = InputLockEngine::new(backend, config);

    match session {
        Session::Permission { request } => {
            if request {
                engine.request_permission();
                engine.poll_permission();
            }
            let snapshot = engine.permission();
            match serde_json::to_string(&snapshot) {
                Ok(json) => println!("{json}"),
                Err(e) => log::error!("Failed to serialize permission snapshot: {e}"),
            }
        }
        Session::Lock { device, duration } => hold_lock(&engine, device, duration).await?,
    }

    engine.teardown();
    Ok(())
}

async fn hold_lock(
    engine: &InputLockEngine,
    device: Device,
    duration: Option<Duration>,
) -> Result<(), RunError> {
    let (tx, mut escapes) = mpsc::unbounded_channel::<EscapeSignal>();
    if let Err(e) = engine.attach_process_filter(move |signal| {
        let _ = tx.send(signal);
    }) {
        log::warn!("Escape filter unavailable: {e}");
    }

    let mut status = engine.subscribe();
    let report = engine.lock(device)?;
    for layer in report.layers.iter().filter(|layer| !layer.is_active()) {
        log::warn!("{:?} layer is not blocking: {:?}", layer.layer, layer.status);
    }
    if !engine.permission().trusted {
        log::warn!("Accessibility permission missing; run `inputlock permission --request`");
    }
    let _ = status.borrow_and_update();

    let deadline = async {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => {
                log::info!("Lock duration elapsed");
                engine.unlock();
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted; unlocking");
                engine.unlock();
                break;
            }
            Some(signal) = escapes.recv() => {
                engine.observe(ObservationPoint::ProcessFilter, signal);
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                if !current.state.is_locked() {
                    log::info!("Lock released: {:?}", current.last_unlock);
                    break;
                }
                if current.permission.is_some_and(|p| !p.trusted) {
                    log::warn!("Accessibility permission revoked while locked");
                }
            }
        }
    }
    Ok(())
}
