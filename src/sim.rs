//! Deterministic in-memory backends.
//!
//! Every OS-facing capability the engine consumes has a simulated twin
//! here, so the whole engine can be driven from tests or headless runs:
//! hooks are recorded instead of installed, events are delivered by hand,
//! timers fire when told to, and the window and pointer are plain cells.

use crate::engine::Backend;
use crate::enforcer::{PointerControl, WindowHost};
use crate::error::{InstallError, InstallFailure};
use crate::event::{InputEvent, Point, Rect, Verdict};
use crate::hook::{HookCallback, HookDescriptor, HookRegistry, HookToken, LayerId, Placement};
use crate::permission::PermissionProbe;
use crate::schedule::{Scheduler, TimerHandle};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

struct SimHook {
    descriptor: HookDescriptor,
    callback: HookCallback,
    enabled: bool,
}

#[derive(Debug, Clone, Copy)]
enum FailRule {
    Layer(LayerId, InstallFailure),
    Placement(Placement, InstallFailure),
    All(InstallFailure),
}

impl FailRule {
    fn applies(&self, descriptor: &HookDescriptor) -> Option<InstallFailure> {
        match *self {
            FailRule::Layer(layer, reason) if layer == descriptor.layer => Some(reason),
            FailRule::Placement(placement, reason) if placement == descriptor.placement => {
                Some(reason)
            }
            FailRule::All(reason) => Some(reason),
            _ => None,
        }
    }
}

#[derive(Default)]
struct RegistryState {
    next_token: u64,
    hooks: BTreeMap<HookToken, SimHook>,
    rules: Vec<FailRule>,
    enable_rules: Vec<(LayerId, InstallFailure)>,
    registrations: usize,
}

/// Where an event delivered through [`SimRegistry::deliver`] ended up.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Delivery {
    /// Layers whose callbacks saw the event, in delivery order.
    pub reached: Vec<LayerId>,
    /// First layer that swallowed the event.
    pub blocked_by: Option<LayerId>,
}

impl Delivery {
    pub fn is_blocked(&self) -> bool {
        self.blocked_by.is_some()
    }
}

/// Hook registry that records hooks and lets tests push events through them.
#[derive(Default)]
pub struct SimRegistry {
    state: RefCell<RegistryState>,
}

impl SimRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every future install of `layer` fail.
    pub fn fail_layer(&self, layer: LayerId, reason: InstallFailure) {
        self.state.borrow_mut().rules.push(FailRule::Layer(layer, reason));
    }

    pub fn fail_placement(&self, placement: Placement, reason: InstallFailure) {
        self.state
            .borrow_mut()
            .rules
            .push(FailRule::Placement(placement, reason));
    }

    pub fn fail_all(&self, reason: InstallFailure) {
        self.state.borrow_mut().rules.push(FailRule::All(reason));
    }

    /// Lets `layer` install but makes every later enable of it fail, as a
    /// device seizure does when another client holds the device.
    pub fn fail_enable(&self, layer: LayerId, reason: InstallFailure) {
        self.state.borrow_mut().enable_rules.push((layer, reason));
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.borrow_mut();
        state.rules.clear();
        state.enable_rules.clear();
    }

    /// Delivers `event` through enabled hooks in placement order, stopping
    /// at the first one that swallows it.
    pub fn deliver(&self, event: &InputEvent) -> Delivery {
        let mut targets: Vec<(Placement, LayerId, HookCallback)> = self
            .state
            .borrow()
            .hooks
            .values()
            .filter(|hook| hook.enabled && hook.descriptor.mask.contains(event.kind))
            .map(|hook| {
                (
                    hook.descriptor.placement,
                    hook.descriptor.layer,
                    Arc::clone(&hook.callback),
                )
            })
            .collect();
        targets.sort_by_key(|(placement, layer, _)| (*placement, *layer));

        let mut delivery = Delivery::default();
        for (_, layer, callback) in targets {
            delivery.reached.push(layer);
            if callback(event) == Verdict::Swallow {
                delivery.blocked_by = Some(layer);
                break;
            }
        }
        delivery
    }

    /// Total successful registrations over the registry's lifetime.
    pub fn registered_count(&self) -> usize {
        self.state.borrow().registrations
    }

    /// Hooks installed and not yet invalidated.
    pub fn live_count(&self) -> usize {
        self.state.borrow().hooks.len()
    }

    pub fn enabled_count(&self) -> usize {
        self.state.borrow().hooks.values().filter(|h| h.enabled).count()
    }

    pub fn live_layers(&self) -> Vec<(LayerId, Placement)> {
        self.state
            .borrow()
            .hooks
            .values()
            .map(|h| (h.descriptor.layer, h.descriptor.placement))
            .collect()
    }
}

impl HookRegistry for SimRegistry {
    fn register_hook(
        &self,
        descriptor: &HookDescriptor,
        callback: HookCallback,
    ) -> Result<HookToken, InstallError> {
        let mut state = self.state.borrow_mut();
        if let Some(reason) = state.rules.iter().find_map(|rule| rule.applies(descriptor)) {
            return Err(InstallError::new(
                descriptor.layer,
                descriptor.placement,
                reason,
            ));
        }
        state.next_token += 1;
        let token = HookToken::new(state.next_token);
        state.registrations += 1;
        state.hooks.insert(
            token,
            SimHook {
                descriptor: *descriptor,
                callback,
                enabled: false,
            },
        );
        Ok(token)
    }

    fn set_enabled(&self, token: HookToken, enabled: bool) -> Result<(), InstallError> {
        let mut state = self.state.borrow_mut();
        let RegistryState {
            hooks,
            enable_rules,
            ..
        } = &mut *state;
        let Some(hook) = hooks.get_mut(&token) else {
            return Ok(());
        };
        if enabled {
            let layer = hook.descriptor.layer;
            if let Some((_, reason)) = enable_rules.iter().find(|(l, _)| *l == layer) {
                return Err(InstallError::new(layer, hook.descriptor.placement, *reason));
            }
        }
        hook.enabled = enabled;
        Ok(())
    }

    fn invalidate(&self, token: HookToken) {
        self.state.borrow_mut().hooks.remove(&token);
    }
}

/// Window host backed by plain cells.
pub struct SimWindow {
    focused: Cell<bool>,
    origin: Cell<Point>,
    anchor: Cell<Rect>,
    raises: Cell<usize>,
}

impl SimWindow {
    pub fn new(origin: Point, anchor: Rect) -> Self {
        Self {
            focused: Cell::new(true),
            origin: Cell::new(origin),
            anchor: Cell::new(anchor),
            raises: Cell::new(0),
        }
    }

    pub fn set_focused(&self, focused: bool) {
        self.focused.set(focused);
    }

    pub fn move_to(&self, origin: Point) {
        self.origin.set(origin);
    }

    pub fn set_anchor_rect(&self, anchor: Rect) {
        self.anchor.set(anchor);
    }

    /// How many times the window was forced to the foreground.
    pub fn raises(&self) -> usize {
        self.raises.get()
    }
}

impl Default for SimWindow {
    fn default() -> Self {
        Self::new(Point::new(100.0, 100.0), Rect::new(20.0, 40.0, 120.0, 32.0))
    }
}

impl WindowHost for SimWindow {
    fn is_focused(&self) -> bool {
        self.focused.get()
    }

    fn bring_to_front(&self) {
        self.raises.set(self.raises.get() + 1);
        self.focused.set(true);
    }

    fn window_origin(&self) -> Point {
        self.origin.get()
    }

    fn anchor_rect(&self) -> Rect {
        self.anchor.get()
    }
}

/// Pointer whose position only changes when told to.
pub struct SimPointer {
    position: Cell<Point>,
    warps: Cell<usize>,
}

impl SimPointer {
    pub fn new(position: Point) -> Self {
        Self {
            position: Cell::new(position),
            warps: Cell::new(0),
        }
    }

    /// Moves the pointer as a user would.
    pub fn nudge(&self, dx: f64, dy: f64) {
        self.position.set(self.position.get().offset(dx, dy));
    }

    pub fn current(&self) -> Point {
        self.position.get()
    }

    pub fn warps(&self) -> usize {
        self.warps.get()
    }
}

impl Default for SimPointer {
    fn default() -> Self {
        Self::new(Point::default())
    }
}

impl PointerControl for SimPointer {
    fn position(&self) -> Option<Point> {
        Some(self.position.get())
    }

    fn warp(&self, to: Point) -> bool {
        self.position.set(to);
        self.warps.set(self.warps.get() + 1);
        true
    }
}

pub struct SimPermission {
    trusted: Cell<bool>,
    requests: Cell<usize>,
}

impl SimPermission {
    pub fn new(trusted: bool) -> Self {
        Self {
            trusted: Cell::new(trusted),
            requests: Cell::new(0),
        }
    }

    pub fn set_trusted(&self, trusted: bool) {
        self.trusted.set(trusted);
    }

    pub fn requests(&self) -> usize {
        self.requests.get()
    }
}

impl PermissionProbe for SimPermission {
    fn is_trusted(&self) -> bool {
        self.trusted.get()
    }

    fn request_permission(&self) {
        self.requests.set(self.requests.get() + 1);
    }
}

struct ManualTimer {
    period: Duration,
    task: Option<Box<dyn FnMut()>>,
}

#[derive(Default)]
struct ManualTimers {
    next_id: u64,
    timers: BTreeMap<u64, ManualTimer>,
}

/// Scheduler whose timers only fire on [`ManualScheduler::tick`].
#[derive(Default)]
pub struct ManualScheduler {
    timers: Rc<RefCell<ManualTimers>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires every live timer once, in creation order.
    pub fn tick(&self) {
        let ids: Vec<u64> = self.timers.borrow().timers.keys().copied().collect();
        for id in ids {
            let task = self
                .timers
                .borrow_mut()
                .timers
                .get_mut(&id)
                .and_then(|timer| timer.task.take());
            let Some(mut task) = task else { continue };
            task();
            // The task may have cancelled its own timer while running.
            if let Some(timer) = self.timers.borrow_mut().timers.get_mut(&id) {
                timer.task = Some(task);
            }
        }
    }

    pub fn run_ticks(&self, count: usize) {
        for _ in 0..count {
            self.tick();
        }
    }

    pub fn active_count(&self) -> usize {
        self.timers.borrow().timers.len()
    }

    pub fn periods(&self) -> Vec<Duration> {
        self.timers.borrow().timers.values().map(|t| t.period).collect()
    }
}

impl Scheduler for ManualScheduler {
    fn every(&self, period: Duration, task: Box<dyn FnMut()>) -> TimerHandle {
        let id = {
            let mut timers = self.timers.borrow_mut();
            timers.next_id += 1;
            let id = timers.next_id;
            timers.timers.insert(
                id,
                ManualTimer {
                    period,
                    task: Some(task),
                },
            );
            id
        };
        let timers = Rc::downgrade(&self.timers);
        TimerHandle::new(move || {
            if let Some(timers) = timers.upgrade() {
                timers.borrow_mut().timers.remove(&id);
            }
        })
    }
}

/// All simulated backends, kept reachable so tests can steer them.
pub struct SimBackend {
    pub registry: Rc<SimRegistry>,
    pub window: Rc<SimWindow>,
    pub pointer: Rc<SimPointer>,
    pub permission: Rc<SimPermission>,
    pub scheduler: Rc<ManualScheduler>,
}

impl SimBackend {
    pub fn new() -> Self {
        Self {
            registry: Rc::new(SimRegistry::new()),
            window: Rc::new(SimWindow::default()),
            pointer: Rc::new(SimPointer::default()),
            permission: Rc::new(SimPermission::new(true)),
            scheduler: Rc::new(ManualScheduler::new()),
        }
    }

    pub fn backend(&self) -> Backend {
        Backend {
            registry: self.registry.clone(),
            window: self.window.clone(),
            pointer: self.pointer.clone(),
            permission: self.permission.clone(),
            scheduler: self.scheduler.clone(),
        }
    }
}

impl Default for SimBackend {
    fn default() -> Self {
        Self::new()
    }
}
