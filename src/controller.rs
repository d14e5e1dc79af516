//! Lock state controller: the single writer of [`LockState`].
//!
//! Every transition runs to completion before it returns, so the public
//! query API never sees a half-activated lock. All methods take `&self` so
//! the escape trigger can unlock from inside its callback.

use crate::config::EngineConfig;
use crate::enforcer::PositionEnforcer;
use crate::engine::Backend;
use crate::error::{HookError, LockError};
use crate::escape::ObservationPoint;
use crate::hook::{
    Coverage, HookCallback, HookDescriptor, HookHandle, HookLifecycle, HookRegistry, LayerId,
    LayerOutcome,
};
use crate::keyboard::KeyboardInterceptor;
use crate::permission::PermissionSnapshot;
use crate::pointer::PointerInterceptor;
use crate::state::{Device, LockFlags, LockFlagsReader, LockState};
use serde::Serialize;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use tokio::sync::watch;

/// Why the last unlock happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnlockReason {
    Requested,
    EscapeKey(ObservationPoint),
    Teardown,
}

/// Result of a successful [`LockController::lock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockReport {
    pub device: Device,
    pub coverage: Coverage,
    pub layers: Vec<LayerOutcome>,
    /// The device was already locked; nothing was installed.
    pub already_active: bool,
}

impl LockReport {
    /// Accepted with at least one blocking layer missing.
    pub fn degraded(&self) -> bool {
        self.coverage.is_degraded()
    }
}

/// Snapshot published to subscribers after every completed transition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LockStatus {
    pub state: LockState,
    pub degraded: bool,
    pub coverage: Option<Coverage>,
    pub last_unlock: Option<UnlockReason>,
    pub permission: Option<PermissionSnapshot>,
}

pub struct LockController {
    flags: LockFlags,
    state: Cell<LockState>,
    registry: Rc<dyn HookRegistry>,
    keyboard: RefCell<KeyboardInterceptor>,
    pointer: RefCell<PointerInterceptor>,
    enforcer: RefCell<PositionEnforcer>,
    observers: RefCell<Vec<HookHandle>>,
    active: RefCell<Option<LockReport>>,
    torn_down: Cell<bool>,
    status: watch::Sender<LockStatus>,
}

impl LockController {
    pub fn new(backend: &Backend, config: &EngineConfig) -> Self {
        let flags = LockFlags::new();
        let keyboard = KeyboardInterceptor::new(
            Rc::clone(&backend.registry),
            flags.reader(),
            config.force_quit,
        );
        let pointer = PointerInterceptor::new(Rc::clone(&backend.registry), flags.reader());
        let enforcer = PositionEnforcer::new(
            Rc::clone(&backend.window),
            Rc::clone(&backend.pointer),
            Rc::clone(&backend.scheduler),
            config.enforcer_interval(),
            config.warp_tolerance,
        );
        let (status, _) = watch::channel(LockStatus::default());
        Self {
            flags,
            state: Cell::new(LockState::Unlocked),
            registry: Rc::clone(&backend.registry),
            keyboard: RefCell::new(keyboard),
            pointer: RefCell::new(pointer),
            enforcer: RefCell::new(enforcer),
            observers: RefCell::new(Vec::new()),
            active: RefCell::new(None),
            torn_down: Cell::new(false),
            status,
        }
    }

    pub fn current_state(&self) -> LockState {
        self.state.get()
    }

    pub fn status(&self) -> LockStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LockStatus> {
        self.status.subscribe()
    }

    /// Read-only flag capability for callbacks outside the interceptors.
    pub fn flags_reader(&self) -> LockFlagsReader {
        self.flags.reader()
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.get()
    }

    /// Locks `device`. Idempotent for the device already locked; refused
    /// while the other device is locked.
    pub fn lock(&self, device: Device) -> Result<LockReport, LockError> {
        if self.torn_down.get() {
            return Err(LockError::TornDown);
        }
        match self.state.get().device() {
            Some(active) if active == device => {
                let mut report = self.active.borrow().clone().unwrap_or(LockReport {
                    device,
                    coverage: Coverage::Complete,
                    layers: Vec::new(),
                    already_active: true,
                });
                report.already_active = true;
                return Ok(report);
            }
            Some(active) => {
                log::warn!("Refusing to lock {device} while {active} is locked");
                return Err(LockError::AlreadyLocked {
                    active,
                    requested: device,
                });
            }
            None => {}
        }

        self.flags.raise(device);
        let (layers, coverage) = match device {
            Device::Keyboard => {
                let layers = self.keyboard.borrow_mut().activate();
                let coverage = Coverage::from_outcomes(&layers);
                (layers, coverage)
            }
            Device::Pointer => {
                let activation = self.pointer.borrow_mut().activate();
                self.set_observers_enabled(true);
                self.enforcer.borrow_mut().start();
                (activation.layers, activation.coverage)
            }
        };
        let report = LockReport {
            device,
            coverage,
            layers,
            already_active: false,
        };

        self.state.set(LockState::locked(device));
        *self.active.borrow_mut() = Some(report.clone());
        self.status.send_modify(|status| {
            status.state = LockState::locked(device);
            status.coverage = Some(coverage);
            status.degraded = coverage.is_degraded();
        });
        if report.degraded() {
            log::warn!("{device} locked in degraded mode ({coverage:?})");
        } else {
            log::info!("{device} locked");
        }
        Ok(report)
    }

    /// Unlocks whatever is locked. A no-op while unlocked.
    pub fn unlock(&self) -> Option<Device> {
        self.unlock_with(UnlockReason::Requested)
    }

    /// Returns the device that was released, if any.
    pub fn unlock_with(&self, reason: UnlockReason) -> Option<Device> {
        let device = self.state.get().device()?;

        // Lower the flags first so every hook passes events from here on.
        self.flags.clear();
        match device {
            Device::Keyboard => self.keyboard.borrow_mut().deactivate(),
            Device::Pointer => {
                self.pointer.borrow_mut().deactivate();
                self.set_observers_enabled(false);
                self.enforcer.borrow_mut().stop();
            }
        }

        self.state.set(LockState::Unlocked);
        self.active.borrow_mut().take();
        self.status.send_modify(|status| {
            status.state = LockState::Unlocked;
            status.coverage = None;
            status.degraded = false;
            status.last_unlock = Some(reason);
        });
        log::info!("{device} unlocked ({reason:?})");
        Some(device)
    }

    /// Installs an auxiliary observation hook, owned by the controller so
    /// teardown releases it with the blocking layers. It is enabled only
    /// while the pointer is locked.
    pub fn attach_observer(
        &self,
        descriptor: HookDescriptor,
        callback: HookCallback,
    ) -> Result<(), LockError> {
        if self.torn_down.get() {
            return Err(LockError::TornDown);
        }
        let mut handle = HookHandle::new(descriptor, Rc::clone(&self.registry));
        match handle.install(callback) {
            Ok(()) => {
                if self.state.get() == LockState::PointerLocked {
                    enable_observer(&mut handle);
                }
                self.observers.borrow_mut().push(handle);
            }
            Err(HookError::Install(err)) => log::warn!("{err}; observer not attached"),
            Err(err) => log::error!("Observer hook unusable: {err}"),
        }
        Ok(())
    }

    fn set_observers_enabled(&self, enabled: bool) {
        for handle in self.observers.borrow_mut().iter_mut() {
            if enabled {
                enable_observer(handle);
            } else {
                handle.disable();
            }
        }
    }

    pub fn record_permission(&self, snapshot: PermissionSnapshot) {
        self.status.send_if_modified(|status| {
            let changed = status.permission != Some(snapshot);
            status.permission = Some(snapshot);
            changed
        });
    }

    /// Releases every hook and timer. Idempotent; later locks fail.
    ///
    /// Order: disable all hooks, invalidate all hooks, stop the timer.
    pub fn teardown(&self) {
        if self.torn_down.replace(true) {
            return;
        }
        let was_locked = self.state.get().is_locked();
        self.flags.clear();

        {
            let mut keyboard = self.keyboard.borrow_mut();
            let mut pointer = self.pointer.borrow_mut();
            let mut observers = self.observers.borrow_mut();

            keyboard.deactivate();
            pointer.deactivate();
            observers.iter_mut().for_each(HookHandle::disable);

            keyboard.release();
            pointer.release();
            observers.iter_mut().for_each(HookHandle::invalidate);
            observers.clear();
        }
        self.enforcer.borrow_mut().stop();

        self.state.set(LockState::Unlocked);
        self.active.borrow_mut().take();
        if was_locked {
            self.status.send_modify(|status| {
                status.state = LockState::Unlocked;
                status.coverage = None;
                status.degraded = false;
                status.last_unlock = Some(UnlockReason::Teardown);
            });
        }
        log::info!("Input lock controller torn down");
    }

    /// Every live hook handle and its lifecycle.
    pub fn hook_census(&self) -> Vec<(LayerId, HookLifecycle)> {
        let mut census = self.keyboard.borrow().lifecycles();
        census.extend(self.pointer.borrow().lifecycles());
        census.extend(
            self.observers
                .borrow()
                .iter()
                .map(|h| (h.layer(), h.lifecycle())),
        );
        census
    }

    pub fn enabled_hook_count(&self) -> usize {
        self.hook_census()
            .iter()
            .filter(|(_, lifecycle)| lifecycle.is_enabled())
            .count()
    }

    pub fn enforcer_running(&self) -> bool {
        self.enforcer.borrow().is_running()
    }
}

fn enable_observer(handle: &mut HookHandle) {
    if let Err(err) = handle.enable() {
        log::warn!("Escape observer not listening: {err}");
    }
}

impl Drop for LockController {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InstallFailure;
    use crate::sim::SimBackend;

    fn controller() -> (SimBackend, LockController) {
        let sim = SimBackend::new();
        let controller = LockController::new(&sim.backend(), &EngineConfig::default());
        (sim, controller)
    }

    #[test]
    fn keyboard_lock_refuses_pointer() {
        let (sim, controller) = controller();
        let report = controller.lock(Device::Keyboard).unwrap();
        assert_eq!(report.coverage, Coverage::Complete);
        assert_eq!(controller.current_state(), LockState::KeyboardLocked);

        assert_eq!(
            controller.lock(Device::Pointer),
            Err(LockError::AlreadyLocked {
                active: Device::Keyboard,
                requested: Device::Pointer,
            })
        );
        assert_eq!(controller.current_state(), LockState::KeyboardLocked);

        assert_eq!(controller.unlock(), Some(Device::Keyboard));
        assert_eq!(controller.current_state(), LockState::Unlocked);
        assert_eq!(sim.registry.enabled_count(), 0);
    }

    #[test]
    fn relock_is_idempotent() {
        let (sim, controller) = controller();
        controller.lock(Device::Pointer).unwrap();
        let handles = controller.hook_census().len();
        let again = controller.lock(Device::Pointer).unwrap();
        assert!(again.already_active);
        assert_eq!(again.layers.len(), 4);
        assert_eq!(controller.hook_census().len(), handles);
        assert_eq!(sim.registry.registered_count(), 4);
        assert_eq!(sim.scheduler.active_count(), 1);
    }

    #[test]
    fn unlock_while_unlocked_is_a_noop() {
        let (_sim, controller) = controller();
        let mut rx = controller.subscribe();
        assert_eq!(controller.unlock(), None);
        assert_eq!(controller.current_state(), LockState::Unlocked);
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn unlock_leaves_nothing_enabled() {
        let (sim, controller) = controller();
        controller.lock(Device::Pointer).unwrap();
        assert!(controller.enforcer_running());
        controller.unlock();
        assert_eq!(controller.enabled_hook_count(), 0);
        assert!(!controller.enforcer_running());
        assert_eq!(sim.scheduler.active_count(), 0);
    }

    #[test]
    fn every_pointer_layer_failing_is_degraded_not_refused() {
        let (sim, controller) = controller();
        sim.registry.fail_all(InstallFailure::PermissionDenied);
        let report = controller.lock(Device::Pointer).unwrap();
        assert!(report.degraded());
        assert_eq!(report.coverage, Coverage::Unprotected);
        assert_eq!(controller.current_state(), LockState::PointerLocked);
        let status = controller.status();
        assert!(status.degraded);
        assert_eq!(status.coverage, Some(Coverage::Unprotected));
    }

    #[test]
    fn status_carries_unlock_reason() {
        let (_sim, controller) = controller();
        let mut rx = controller.subscribe();
        controller.lock(Device::Pointer).unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().state, LockState::PointerLocked);

        let point = ObservationPoint::WindowFilter;
        controller.unlock_with(UnlockReason::EscapeKey(point));
        let status = rx.borrow_and_update().clone();
        assert_eq!(status.state, LockState::Unlocked);
        assert_eq!(status.last_unlock, Some(UnlockReason::EscapeKey(point)));
    }

    #[test]
    fn teardown_releases_everything_and_refuses_new_locks() {
        let (sim, controller) = controller();
        controller.lock(Device::Pointer).unwrap();
        controller.teardown();
        controller.teardown();

        assert_eq!(sim.registry.live_count(), 0);
        assert_eq!(sim.scheduler.active_count(), 0);
        assert!(controller.hook_census().is_empty());
        assert_eq!(controller.current_state(), LockState::Unlocked);
        assert_eq!(controller.status().last_unlock, Some(UnlockReason::Teardown));
        assert_eq!(controller.lock(Device::Keyboard), Err(LockError::TornDown));
    }

    #[test]
    fn observer_listens_only_while_pointer_locked() {
        use crate::engine::PROCESS_FILTER;
        use crate::event::Verdict;
        use std::sync::Arc;

        let (sim, controller) = controller();
        controller
            .attach_observer(PROCESS_FILTER, Arc::new(|_| Verdict::Pass))
            .unwrap();
        assert_eq!(sim.registry.live_count(), 1);
        assert_eq!(controller.enabled_hook_count(), 0);

        controller.lock(Device::Keyboard).unwrap();
        assert!(controller
            .hook_census()
            .contains(&(LayerId::EscapeObserver, HookLifecycle::InstalledDisabled)));
        controller.unlock();

        controller.lock(Device::Pointer).unwrap();
        assert!(controller
            .hook_census()
            .contains(&(LayerId::EscapeObserver, HookLifecycle::InstalledEnabled)));

        controller.unlock();
        assert_eq!(controller.enabled_hook_count(), 0);
        assert_eq!(sim.registry.enabled_count(), 0);
        // Two keyboard hooks, four pointer layers and the observer stay installed.
        assert_eq!(sim.registry.live_count(), 7);
    }

    #[test]
    fn observer_attached_mid_lock_starts_listening() {
        use crate::engine::PROCESS_FILTER;
        use crate::event::Verdict;
        use std::sync::Arc;

        let (_sim, controller) = controller();
        controller.lock(Device::Pointer).unwrap();
        controller
            .attach_observer(PROCESS_FILTER, Arc::new(|_| Verdict::Pass))
            .unwrap();
        assert_eq!(controller.enabled_hook_count(), 5);
        controller.unlock();
        assert_eq!(controller.enabled_hook_count(), 0);
    }
}
