//! The input lock engine: the lock controller wired to the escape trigger,
//! the permission monitor and the unlock journal.
//!
//! Everything here lives on one cooperative loop. Only the hook callbacks
//! run elsewhere, and they only ever read the atomic lock flags.

use crate::config::EngineConfig;
use crate::controller::{LockController, LockReport, LockStatus, UnlockReason};
use crate::enforcer::{PointerControl, WindowHost};
use crate::error::LockError;
use crate::escape::{escape_verdict, Disposition, EscapeSignal, EscapeTrigger, ObservationPoint};
use crate::event::{EventMask, Verdict};
use crate::hook::{HookCallback, HookDescriptor, HookRegistry, LayerId, Placement, TapMode};
use crate::journal::Journal;
use crate::permission::{
    PermissionChange, PermissionMonitor, PermissionProbe, PermissionSnapshot,
};
use crate::schedule::Scheduler;
use crate::state::{Device, LockState};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use tokio::sync::watch;

/// Process-wide escape filter. Sits where HID events enter the session, so
/// it sees keys before any window does.
pub const PROCESS_FILTER: HookDescriptor = HookDescriptor::new(
    LayerId::EscapeObserver,
    EventMask::KEY_DOWN,
    Placement::SessionTap,
    TapMode::Capture,
);

/// The OS-facing capabilities the engine consumes.
#[derive(Clone)]
pub struct Backend {
    pub registry: Rc<dyn HookRegistry>,
    pub window: Rc<dyn WindowHost>,
    pub pointer: Rc<dyn PointerControl>,
    pub permission: Rc<dyn PermissionProbe>,
    pub scheduler: Rc<dyn Scheduler>,
}

pub struct InputLockEngine {
    controller: Rc<LockController>,
    escape: EscapeTrigger,
    permission: RefCell<PermissionMonitor>,
}

impl InputLockEngine {
    /// Builds the engine and starts polling permission. Escape unlocks are
    /// journaled to the default location when the config asks for it.
    ///
    /// With [`crate::schedule::TokioScheduler`] this must run inside a
    /// [`tokio::task::LocalSet`].
    pub fn new(backend: Backend, config: EngineConfig) -> Self {
        let journal = config
            .record_escape_unlocks
            .then(Journal::default_location);
        Self::with_journal(backend, config, journal)
    }

    pub fn with_journal(backend: Backend, config: EngineConfig, journal: Option<Journal>) -> Self {
        let controller = Rc::new(LockController::new(&backend, &config));

        let on_match = {
            let controller = Rc::clone(&controller);
            Box::new(move |point: ObservationPoint| {
                let released = controller.unlock_with(UnlockReason::EscapeKey(point));
                if released.is_none() {
                    return;
                }
                if let Some(journal) = &journal {
                    if let Err(e) = journal.record_escape_unlock(point) {
                        log::error!("Failed to append to {}: {e}", journal.path().display());
                    }
                }
            })
        };
        let escape = EscapeTrigger::new(controller.flags_reader(), config.escape_keys(), on_match);

        let on_change = {
            let controller = Rc::downgrade(&controller);
            Box::new(move |snapshot: PermissionSnapshot, _: PermissionChange| {
                if let Some(controller) = controller.upgrade() {
                    controller.record_permission(snapshot);
                }
            })
        };
        let mut permission = PermissionMonitor::new(Rc::clone(&backend.permission), on_change);
        controller.record_permission(permission.snapshot());
        permission.start(backend.scheduler.as_ref(), config.permission_poll());

        Self {
            controller,
            escape,
            permission: RefCell::new(permission),
        }
    }

    pub fn lock(&self, device: Device) -> Result<LockReport, LockError> {
        self.controller.lock(device)
    }

    /// Unconditional and synchronous. Returns the device that was released.
    pub fn unlock(&self) -> Option<Device> {
        self.controller.unlock()
    }

    pub fn current_state(&self) -> LockState {
        self.controller.current_state()
    }

    pub fn status(&self) -> LockStatus {
        self.controller.status()
    }

    /// Push-style notification of every transition, including escape unlocks.
    pub fn subscribe(&self) -> watch::Receiver<LockStatus> {
        self.controller.subscribe()
    }

    pub fn controller(&self) -> &LockController {
        &self.controller
    }

    pub fn escape_trigger(&self) -> &EscapeTrigger {
        &self.escape
    }

    /// Feeds a key seen at `point` into the escape chain.
    pub fn observe(&self, point: ObservationPoint, signal: EscapeSignal) -> Disposition {
        self.escape.dispatch(point, signal)
    }

    /// Installs the process-wide escape hook. It swallows a matching key
    /// while the pointer is locked and hands it to `forward`, which must
    /// get it back to [`Self::observe`] on the loop.
    pub fn attach_process_filter(
        &self,
        forward: impl Fn(EscapeSignal) + Send + Sync + 'static,
    ) -> Result<(), LockError> {
        let flags = self.controller.flags_reader();
        let keys = self.escape.keys();
        let callback: HookCallback = Arc::new(move |event| {
            let verdict = escape_verdict(&flags, &keys, event);
            if verdict == Verdict::Swallow {
                forward(EscapeSignal::Key(*event));
            }
            verdict
        });
        self.controller.attach_observer(PROCESS_FILTER, callback)
    }

    pub fn permission(&self) -> PermissionSnapshot {
        self.permission.borrow().snapshot()
    }

    pub fn poll_permission(&self) {
        self.permission.borrow().poll();
    }

    pub fn request_permission(&self) {
        self.permission.borrow().request();
    }

    /// Releases everything in order: hooks disabled, hooks invalidated,
    /// timers stopped, observation points removed. Idempotent.
    pub fn teardown(&self) {
        if self.controller.is_torn_down() {
            return;
        }
        self.controller.teardown();
        self.permission.borrow_mut().stop();
        self.escape.clear();
    }
}

impl Drop for InputLockEngine {
    fn drop(&mut self) {
        self.teardown();
    }
}
