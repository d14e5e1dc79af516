//! Lock state and the atomic flags hook callbacks read it through.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Device class a lock applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    Keyboard,
    Pointer,
}

impl Device {
    pub const fn other(self) -> Device {
        match self {
            Device::Keyboard => Device::Pointer,
            Device::Pointer => Device::Keyboard,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Device::Keyboard => "keyboard",
            Device::Pointer => "pointer",
        })
    }
}

/// Exactly one of these holds at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    #[default]
    Unlocked,
    KeyboardLocked,
    PointerLocked,
}

impl LockState {
    pub const fn locked(device: Device) -> Self {
        match device {
            Device::Keyboard => LockState::KeyboardLocked,
            Device::Pointer => LockState::PointerLocked,
        }
    }

    pub const fn device(self) -> Option<Device> {
        match self {
            LockState::Unlocked => None,
            LockState::KeyboardLocked => Some(Device::Keyboard),
            LockState::PointerLocked => Some(Device::Pointer),
        }
    }

    pub const fn is_locked(self) -> bool {
        !matches!(self, LockState::Unlocked)
    }
}

#[derive(Debug, Default)]
struct FlagCells {
    keyboard: AtomicBool,
    pointer: AtomicBool,
}

impl FlagCells {
    fn cell(&self, device: Device) -> &AtomicBool {
        match device {
            Device::Keyboard => &self.keyboard,
            Device::Pointer => &self.pointer,
        }
    }
}

/// One atomic flag per device, owned and written by the lock controller.
///
/// Hook callbacks run on OS-managed threads, so they never see the
/// controller itself; they get a [`LockFlagsReader`] at construction.
#[derive(Debug, Default)]
pub struct LockFlags {
    cells: Arc<FlagCells>,
}

impl LockFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reader(&self) -> LockFlagsReader {
        LockFlagsReader {
            cells: Arc::clone(&self.cells),
        }
    }

    /// Raises the flag for `device` and lowers the other one.
    pub(crate) fn raise(&self, device: Device) {
        self.cells.cell(device.other()).store(false, Ordering::SeqCst);
        self.cells.cell(device).store(true, Ordering::SeqCst);
    }

    pub(crate) fn clear(&self) {
        self.cells.keyboard.store(false, Ordering::SeqCst);
        self.cells.pointer.store(false, Ordering::SeqCst);
    }
}

/// Read-only view of [`LockFlags`], safe to move into hook callbacks.
#[derive(Debug, Clone)]
pub struct LockFlagsReader {
    cells: Arc<FlagCells>,
}

impl LockFlagsReader {
    pub fn is_locked(&self, device: Device) -> bool {
        self.cells.cell(device).load(Ordering::SeqCst)
    }

    pub fn keyboard_locked(&self) -> bool {
        self.is_locked(Device::Keyboard)
    }

    pub fn pointer_locked(&self) -> bool {
        self.is_locked(Device::Pointer)
    }
}
