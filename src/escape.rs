//! Escape trigger: an ordered chain of observation points that always gets
//! the cancel or confirm key to the unlock callback while the pointer is
//! locked, whichever UI element currently has focus.
//!
//! The chain is data, not an override hierarchy. A signal enters at the
//! point that observed it and walks the remaining enabled points in order
//! until one consumes it. Every point applies the same rule.

use crate::event::{EventKind, InputEvent, KeyChord, Verdict};
use crate::state::LockFlagsReader;
use serde::Serialize;
use std::cell::{Cell, RefCell};
use std::fmt;

/// Responder-level handlers that must all intercept the key identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponderHook {
    KeyDown,
    KeyEquivalent,
    /// The standard "cancel" command the toolkit sends for Escape.
    CancelOperation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case", tag = "point", content = "hook")]
pub enum ObservationPoint {
    /// Sees every keyboard event before default dispatch.
    ProcessFilter,
    /// Same key set, scoped to the host window.
    WindowFilter,
    Responder(ResponderHook),
}

impl ObservationPoint {
    /// Priority order.
    pub const CHAIN: [ObservationPoint; 5] = [
        ObservationPoint::ProcessFilter,
        ObservationPoint::WindowFilter,
        ObservationPoint::Responder(ResponderHook::KeyDown),
        ObservationPoint::Responder(ResponderHook::KeyEquivalent),
        ObservationPoint::Responder(ResponderHook::CancelOperation),
    ];

    pub const fn name(self) -> &'static str {
        match self {
            ObservationPoint::ProcessFilter => "process-filter",
            ObservationPoint::WindowFilter => "window-filter",
            ObservationPoint::Responder(ResponderHook::KeyDown) => "responder-key-down",
            ObservationPoint::Responder(ResponderHook::KeyEquivalent) => {
                "responder-key-equivalent"
            }
            ObservationPoint::Responder(ResponderHook::CancelOperation) => {
                "responder-cancel-operation"
            }
        }
    }
}

impl fmt::Display for ObservationPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What an observation point saw.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EscapeSignal {
    Key(InputEvent),
    /// Toolkit cancel command; always means the cancel key.
    CancelCommand { press_id: u64 },
}

impl EscapeSignal {
    /// Zero means the press has no identity and is never deduplicated.
    pub fn press_id(&self) -> u64 {
        match self {
            EscapeSignal::Key(event) => event.press_id,
            EscapeSignal::CancelCommand { press_id } => *press_id,
        }
    }
}

/// The two keys that unlock a pointer lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscapeKeys {
    pub cancel: u16,
    pub confirm: u16,
}

impl Default for EscapeKeys {
    fn default() -> Self {
        Self {
            cancel: KeyChord::ESCAPE,
            confirm: KeyChord::RETURN,
        }
    }
}

impl EscapeKeys {
    pub fn matches_event(&self, event: &InputEvent) -> bool {
        event.kind == EventKind::KeyDown
            && matches!(event.keycode, Some(code) if code == self.cancel || code == self.confirm)
    }

    pub fn matches(&self, signal: &EscapeSignal) -> bool {
        match signal {
            EscapeSignal::Key(event) => self.matches_event(event),
            EscapeSignal::CancelCommand { .. } => true,
        }
    }
}

/// The rule for a process-wide hook callback: swallow a matching key while
/// the pointer is locked. O(1); the unlock itself happens on the loop.
pub fn escape_verdict(flags: &LockFlagsReader, keys: &EscapeKeys, event: &InputEvent) -> Verdict {
    if flags.pointer_locked() && keys.matches_event(event) {
        Verdict::Swallow
    } else {
        Verdict::Pass
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Propagation stops; no default handling (such as closing the window).
    Consumed,
    PassThrough,
}

#[derive(Debug, Clone, Copy)]
struct ChainEntry {
    point: ObservationPoint,
    enabled: bool,
}

pub struct EscapeTrigger {
    flags: LockFlagsReader,
    keys: EscapeKeys,
    entries: RefCell<Vec<ChainEntry>>,
    last_press: Cell<Option<u64>>,
    on_match: Box<dyn Fn(ObservationPoint)>,
}

impl EscapeTrigger {
    /// `on_match` runs on the loop, once per physical press, and must unlock.
    pub fn new(
        flags: LockFlagsReader,
        keys: EscapeKeys,
        on_match: Box<dyn Fn(ObservationPoint)>,
    ) -> Self {
        let entries = ObservationPoint::CHAIN
            .iter()
            .map(|&point| ChainEntry {
                point,
                enabled: true,
            })
            .collect();
        Self {
            flags,
            keys,
            entries: RefCell::new(entries),
            last_press: Cell::new(None),
            on_match,
        }
    }

    pub fn keys(&self) -> EscapeKeys {
        self.keys
    }

    /// Enabled points, in priority order.
    pub fn points(&self) -> Vec<ObservationPoint> {
        self.entries
            .borrow()
            .iter()
            .filter(|e| e.enabled)
            .map(|e| e.point)
            .collect()
    }

    pub fn set_enabled(&self, point: ObservationPoint, enabled: bool) {
        for entry in self.entries.borrow_mut().iter_mut() {
            if entry.point == point {
                entry.enabled = enabled;
            }
        }
    }

    pub fn remove(&self, point: ObservationPoint) {
        self.entries.borrow_mut().retain(|e| e.point != point);
    }

    /// Removes every observation point. Idempotent.
    pub fn clear(&self) {
        let mut entries = self.entries.borrow_mut();
        if !entries.is_empty() {
            entries.clear();
            log::debug!("Escape observation chain cleared");
        }
    }

    /// Runs `signal` through the chain starting at `origin`.
    ///
    /// A press already handled at another point is consumed again but does
    /// not unlock a second time.
    pub fn dispatch(&self, origin: ObservationPoint, signal: EscapeSignal) -> Disposition {
        // First enabled point at or after `origin`.
        let first = {
            let entries = self.entries.borrow();
            match entries.iter().position(|e| e.point == origin) {
                Some(start) => entries[start..].iter().find(|e| e.enabled).map(|e| e.point),
                None => return Disposition::PassThrough,
            }
        };
        if !self.keys.matches(&signal) {
            return Disposition::PassThrough;
        }

        let press = signal.press_id();
        if press != 0 && self.last_press.get() == Some(press) {
            log::debug!("Escape press {press} already handled; consumed at {origin}");
            return Disposition::Consumed;
        }

        let Some(point) = first else {
            return Disposition::PassThrough;
        };
        if !self.flags.pointer_locked() {
            return Disposition::PassThrough;
        }
        if press != 0 {
            self.last_press.set(Some(press));
        }
        log::info!("Escape key observed at {point}; unlocking");
        (self.on_match)(point);
        Disposition::Consumed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Modifiers;
    use crate::state::{Device, LockFlags};
    use std::rc::Rc;

    fn escape(press_id: u64) -> EscapeSignal {
        EscapeSignal::Key(
            InputEvent::key(EventKind::KeyDown, KeyChord::ESCAPE, Modifiers::NONE)
                .with_press_id(press_id),
        )
    }

    fn trigger(flags: &LockFlags) -> (EscapeTrigger, Rc<RefCell<Vec<ObservationPoint>>>) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let trigger = EscapeTrigger::new(
            flags.reader(),
            EscapeKeys::default(),
            Box::new(move |point| sink.borrow_mut().push(point)),
        );
        (trigger, seen)
    }

    #[test]
    fn consumes_at_origin_while_pointer_locked() {
        let flags = LockFlags::new();
        flags.raise(Device::Pointer);
        let (trigger, seen) = trigger(&flags);

        for (id, point) in ObservationPoint::CHAIN.into_iter().enumerate() {
            let disposition = trigger.dispatch(point, escape(id as u64 + 1));
            assert_eq!(disposition, Disposition::Consumed);
        }
        assert_eq!(*seen.borrow(), ObservationPoint::CHAIN.to_vec());
    }

    #[test]
    fn same_press_at_two_points_unlocks_once() {
        let flags = LockFlags::new();
        flags.raise(Device::Pointer);
        let (trigger, seen) = trigger(&flags);

        assert_eq!(
            trigger.dispatch(ObservationPoint::ProcessFilter, escape(7)),
            Disposition::Consumed
        );
        assert_eq!(
            trigger.dispatch(ObservationPoint::WindowFilter, escape(7)),
            Disposition::Consumed
        );
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn never_fires_while_only_keyboard_locked() {
        let flags = LockFlags::new();
        flags.raise(Device::Keyboard);
        let (trigger, seen) = trigger(&flags);

        assert_eq!(
            trigger.dispatch(ObservationPoint::ProcessFilter, escape(1)),
            Disposition::PassThrough
        );
        assert_eq!(
            trigger.dispatch(
                ObservationPoint::Responder(ResponderHook::CancelOperation),
                EscapeSignal::CancelCommand { press_id: 2 }
            ),
            Disposition::PassThrough
        );
        assert!(seen.borrow().is_empty());
    }

    #[test]
    fn other_keys_flow_through() {
        let flags = LockFlags::new();
        flags.raise(Device::Pointer);
        let (trigger, seen) = trigger(&flags);

        let letter = InputEvent::key(EventKind::KeyDown, 0, Modifiers::NONE).with_press_id(3);
        assert_eq!(
            trigger.dispatch(ObservationPoint::WindowFilter, EscapeSignal::Key(letter)),
            Disposition::PassThrough
        );
        let release = InputEvent::key(EventKind::KeyUp, KeyChord::RETURN, Modifiers::NONE);
        assert_eq!(
            trigger.dispatch(ObservationPoint::WindowFilter, EscapeSignal::Key(release)),
            Disposition::PassThrough
        );
        assert!(seen.borrow().is_empty());
    }

    #[test]
    fn disabled_origin_hands_over_to_next_point() {
        let flags = LockFlags::new();
        flags.raise(Device::Pointer);
        let (trigger, seen) = trigger(&flags);

        trigger.set_enabled(ObservationPoint::ProcessFilter, false);
        assert_eq!(
            trigger.dispatch(ObservationPoint::ProcessFilter, escape(4)),
            Disposition::Consumed
        );
        assert_eq!(*seen.borrow(), vec![ObservationPoint::WindowFilter]);
    }

    #[test]
    fn chain_with_nothing_enabled_past_origin_passes() {
        let flags = LockFlags::new();
        flags.raise(Device::Pointer);
        let (trigger, seen) = trigger(&flags);

        let tail = ObservationPoint::CHAIN[2..].to_vec();
        for point in &tail {
            trigger.set_enabled(*point, false);
        }
        assert_eq!(trigger.dispatch(tail[0], escape(6)), Disposition::PassThrough);
        assert!(seen.borrow().is_empty());

        trigger.set_enabled(tail[2], true);
        assert_eq!(trigger.dispatch(tail[0], escape(7)), Disposition::Consumed);
        assert_eq!(*seen.borrow(), vec![tail[2]]);
    }

    #[test]
    fn cleared_chain_observes_nothing() {
        let flags = LockFlags::new();
        flags.raise(Device::Pointer);
        let (trigger, seen) = trigger(&flags);

        trigger.remove(ObservationPoint::WindowFilter);
        assert_eq!(trigger.points().len(), 4);
        trigger.clear();
        trigger.clear();
        assert!(trigger.points().is_empty());
        assert_eq!(
            trigger.dispatch(ObservationPoint::ProcessFilter, escape(5)),
            Disposition::PassThrough
        );
        assert!(seen.borrow().is_empty());
    }

    #[test]
    fn hook_rule_swallows_only_matching_keys() {
        let flags = LockFlags::new();
        let reader = flags.reader();
        let keys = EscapeKeys::default();
        let enter = InputEvent::key(EventKind::KeyDown, KeyChord::RETURN, Modifiers::NONE);
        assert_eq!(escape_verdict(&reader, &keys, &enter), Verdict::Pass);

        flags.raise(Device::Pointer);
        assert_eq!(escape_verdict(&reader, &keys, &enter), Verdict::Swallow);
        let letter = InputEvent::key(EventKind::KeyDown, 1, Modifiers::NONE);
        assert_eq!(escape_verdict(&reader, &keys, &letter), Verdict::Pass);
    }
}
