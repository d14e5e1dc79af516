//! Keyboard interceptor: two redundant capture hooks running one filter.
//!
//! A single tap level has been seen to miss synthetic and driver-injected
//! key events, so the same filter runs at both the HID and the session
//! level. Swallowed events never reach the second hook, so double blocking
//! costs nothing.

use crate::error::HookError;
use crate::event::{EventMask, InputEvent, KeyChord, Verdict};
use crate::hook::{
    HookCallback, HookDescriptor, HookHandle, HookLifecycle, HookRegistry, LayerId, LayerOutcome,
    LayerStatus, Placement, TapMode,
};
use crate::state::LockFlagsReader;
use std::rc::Rc;
use std::sync::Arc;

pub const HARDWARE_HOOK: HookDescriptor = HookDescriptor::new(
    LayerId::KeyboardHardware,
    EventMask::KEYBOARD,
    Placement::HidTap,
    TapMode::Capture,
);

pub const SESSION_HOOK: HookDescriptor = HookDescriptor::new(
    LayerId::KeyboardSession,
    EventMask::KEYBOARD,
    Placement::SessionTap,
    TapMode::Capture,
);

/// The filter every keyboard hook runs, in order:
/// 1. not keyboard-locked: pass;
/// 2. the force-quit chord: pass, so the process stays killable;
/// 3. anything else: swallow.
pub fn keyboard_verdict(
    flags: &LockFlagsReader,
    force_quit: &KeyChord,
    event: &InputEvent,
) -> Verdict {
    if !flags.keyboard_locked() {
        return Verdict::Pass;
    }
    if force_quit.matches(event) {
        return Verdict::Pass;
    }
    Verdict::Swallow
}

pub struct KeyboardInterceptor {
    registry: Rc<dyn HookRegistry>,
    flags: LockFlagsReader,
    force_quit: KeyChord,
    hooks: Vec<HookHandle>,
}

impl KeyboardInterceptor {
    pub fn new(
        registry: Rc<dyn HookRegistry>,
        flags: LockFlagsReader,
        force_quit: KeyChord,
    ) -> Self {
        Self {
            registry,
            flags,
            force_quit,
            hooks: Vec::new(),
        }
    }

    fn callback(&self) -> HookCallback {
        let flags = self.flags.clone();
        let force_quit = self.force_quit;
        Arc::new(move |event| keyboard_verdict(&flags, &force_quit, event))
    }

    /// Installs both hooks on first use, then enables whatever is installed.
    ///
    /// A hook that failed to install on an earlier activation is retried.
    pub fn activate(&mut self) -> Vec<LayerOutcome> {
        if self.hooks.is_empty() {
            self.hooks = [HARDWARE_HOOK, SESSION_HOOK]
                .into_iter()
                .map(|descriptor| HookHandle::new(descriptor, Rc::clone(&self.registry)))
                .collect();
        }

        let callback = self.callback();
        let mut outcomes = Vec::with_capacity(self.hooks.len());
        for hook in &mut self.hooks {
            let placement = hook.descriptor().placement;
            let result = hook
                .install(Arc::clone(&callback))
                .and_then(|()| hook.enable());
            let status = match result {
                Ok(()) => LayerStatus::Active(placement),
                Err(HookError::Install(err)) => {
                    log::warn!("{err}");
                    LayerStatus::Failed(err)
                }
                Err(err @ HookError::IllegalTransition { .. }) => {
                    log::error!("Keyboard hook unusable: {err}");
                    continue;
                }
            };
            outcomes.push(LayerOutcome {
                layer: hook.layer(),
                status,
            });
        }
        outcomes
    }

    /// Disables both hooks but keeps them installed for cheap re-enabling.
    pub fn deactivate(&mut self) {
        for hook in &mut self.hooks {
            hook.disable();
        }
    }

    /// Invalidates and releases both hooks. Call [`Self::deactivate`] first.
    pub fn release(&mut self) {
        for hook in &mut self.hooks {
            hook.invalidate();
        }
        self.hooks.clear();
    }

    pub fn handle_count(&self) -> usize {
        self.hooks.len()
    }

    pub fn lifecycles(&self) -> Vec<(LayerId, HookLifecycle)> {
        self.hooks.iter().map(|h| (h.layer(), h.lifecycle())).collect()
    }
}
