//! Accessibility trust, polled.
//!
//! The OS never pushes trust changes, so the monitor samples the probe on a
//! fixed cadence. Revocation is informational only: hooks installed before
//! it usually keep working for the life of the process.

use crate::schedule::{Scheduler, TimerHandle};
use serde::Serialize;
use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

/// Permission collaborator.
pub trait PermissionProbe {
    fn is_trusted(&self) -> bool;
    /// Fire-and-forget; opens the OS settings surface.
    fn request_permission(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PermissionSnapshot {
    pub trusted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionChange {
    Unchanged,
    Granted,
    Revoked,
}

impl PermissionChange {
    fn between(before: PermissionSnapshot, after: PermissionSnapshot) -> Self {
        match (before.trusted, after.trusted) {
            (false, true) => PermissionChange::Granted,
            (true, false) => PermissionChange::Revoked,
            _ => PermissionChange::Unchanged,
        }
    }
}

struct MonitorCore {
    probe: Rc<dyn PermissionProbe>,
    last: Cell<PermissionSnapshot>,
    on_change: Box<dyn Fn(PermissionSnapshot, PermissionChange)>,
}

impl MonitorCore {
    fn poll(&self) -> PermissionChange {
        let now = PermissionSnapshot {
            trusted: self.probe.is_trusted(),
        };
        let change = PermissionChange::between(self.last.replace(now), now);
        match change {
            PermissionChange::Unchanged => return change,
            PermissionChange::Granted => log::info!("Accessibility permission granted"),
            PermissionChange::Revoked => {
                log::warn!("PermissionRevoked: accessibility trust withdrawn; lock stays in place")
            }
        }
        (self.on_change)(now, change);
        change
    }
}

pub struct PermissionMonitor {
    core: Rc<MonitorCore>,
    timer: Option<TimerHandle>,
}

impl PermissionMonitor {
    /// Takes the first snapshot immediately. `on_change` runs on edges only.
    pub fn new(
        probe: Rc<dyn PermissionProbe>,
        on_change: Box<dyn Fn(PermissionSnapshot, PermissionChange)>,
    ) -> Self {
        let first = PermissionSnapshot {
            trusted: probe.is_trusted(),
        };
        if !first.trusted {
            log::warn!("Process is not trusted for accessibility; hooks may fail to install");
        }
        Self {
            core: Rc::new(MonitorCore {
                probe,
                last: Cell::new(first),
                on_change,
            }),
            timer: None,
        }
    }

    pub fn snapshot(&self) -> PermissionSnapshot {
        self.core.last.get()
    }

    pub fn poll(&self) -> PermissionChange {
        self.core.poll()
    }

    pub fn request(&self) {
        log::info!("Requesting accessibility permission");
        self.core.probe.request_permission();
    }

    pub fn start(&mut self, scheduler: &dyn Scheduler, period: Duration) {
        if self.timer.is_some() {
            return;
        }
        let core = Rc::clone(&self.core);
        self.timer = Some(scheduler.every(
            period,
            Box::new(move || {
                core.poll();
            }),
        ));
    }

    pub fn stop(&mut self) {
        self.timer = None;
    }

    pub fn is_running(&self) -> bool {
        self.timer.is_some()
    }
}
