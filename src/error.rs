//! Error types for the input lock engine.
//!
//! Nothing here is fatal to the process: an [`InstallError`] degrades one
//! blocking layer, a [`LockError`] refuses one transition.

use crate::hook::{HookLifecycle, LayerId, Placement};
use crate::state::Device;
use thiserror::Error;

/// Why the OS refused to install a hook.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallFailure {
    #[error("accessibility or input monitoring permission denied")]
    PermissionDenied,

    #[error("device is held exclusively by another client")]
    DeviceBusy,

    #[error("not supported on this platform")]
    Unsupported,

    #[error("OS error {0:#x}")]
    Os(i32),
}

/// A hook layer failed to install. Logged, then the next fallback is tried.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("failed to install {layer} hook at {placement}: {reason}")]
pub struct InstallError {
    pub layer: LayerId,
    pub placement: Placement,
    pub reason: InstallFailure,
}

impl InstallError {
    pub fn new(layer: LayerId, placement: Placement, reason: InstallFailure) -> Self {
        Self {
            layer,
            placement,
            reason,
        }
    }
}

/// Hook handle lifecycle errors.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookError {
    #[error(transparent)]
    Install(#[from] InstallError),

    #[error("{layer} hook cannot move from {from:?} to {to:?}")]
    IllegalTransition {
        layer: LayerId,
        from: HookLifecycle,
        to: HookLifecycle,
    },
}

/// Refused lock transitions.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    #[error("{active} is already locked; refusing to lock {requested}")]
    AlreadyLocked { active: Device, requested: Device },

    #[error("input lock engine has been torn down")]
    TornDown,
}

/// Failures of the `inputlock` binary session.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("failed to start platform backend: {0}")]
    Backend(#[from] std::io::Error),

    #[error(transparent)]
    Lock(#[from] LockError),
}
