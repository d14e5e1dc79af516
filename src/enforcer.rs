//! Position enforcer: keeps the pointer pinned over the unlock control.
//!
//! While a pointer lock is active a short periodic task refocuses the host
//! window and warps the pointer back onto the anchor. The movement events a
//! warp generates are swallowed by the pointer interceptor; the reentrancy
//! flag only stops a tick from doing the same work twice.

use crate::event::{Point, Rect};
use crate::schedule::{Scheduler, TimerHandle};
use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

/// Windowing collaborator.
pub trait WindowHost {
    fn is_focused(&self) -> bool;
    fn bring_to_front(&self);
    /// Window origin in screen coordinates.
    fn window_origin(&self) -> Point;
    /// Unlock control geometry, in window-local coordinates.
    fn anchor_rect(&self) -> Rect;
}

/// Pointer position and warping.
pub trait PointerControl {
    /// `None` when the position cannot be read.
    fn position(&self) -> Option<Point>;
    /// Returns `false` if the OS refused the warp.
    fn warp(&self, to: Point) -> bool;
}

/// Screen-space anchor plus the geometry it was computed from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnchorPoint {
    origin: Point,
    rect: Rect,
    point: Point,
}

impl AnchorPoint {
    pub fn compute(origin: Point, rect: Rect) -> Self {
        let center = rect.center();
        Self {
            origin,
            rect,
            point: origin.offset(center.x, center.y),
        }
    }

    pub fn point(&self) -> Point {
        self.point
    }

    fn is_current(&self, origin: Point, rect: Rect) -> bool {
        self.origin == origin && self.rect == rect
    }
}

/// What one tick did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickOutcome {
    pub anchor: Point,
    pub refocused: bool,
    pub warped: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnforcerStats {
    pub ticks: u64,
    pub warps: u64,
    pub failed_warps: u64,
    pub refocuses: u64,
    pub anchor_updates: u64,
}

/// Clears the in-flight flag however the tick exits.
struct Repositioning<'a>(&'a Cell<bool>);

impl<'a> Repositioning<'a> {
    fn enter(flag: &'a Cell<bool>) -> Option<Self> {
        if flag.replace(true) {
            None
        } else {
            Some(Self(flag))
        }
    }
}

impl Drop for Repositioning<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

struct EnforcerCore {
    window: Rc<dyn WindowHost>,
    pointer: Rc<dyn PointerControl>,
    tolerance: f64,
    anchor: Cell<Option<AnchorPoint>>,
    repositioning: Cell<bool>,
    stats: Cell<EnforcerStats>,
}

impl EnforcerCore {
    fn resolve_anchor(&self, stats: &mut EnforcerStats) -> Point {
        let origin = self.window.window_origin();
        let rect = self.window.anchor_rect();
        match self.anchor.get() {
            Some(anchor) if anchor.is_current(origin, rect) => anchor.point(),
            _ => {
                let anchor = AnchorPoint::compute(origin, rect);
                log::debug!("Anchor moved to ({:.1}, {:.1})", anchor.point.x, anchor.point.y);
                self.anchor.set(Some(anchor));
                stats.anchor_updates += 1;
                anchor.point()
            }
        }
    }

    fn tick(&self) -> Option<TickOutcome> {
        let _guard = Repositioning::enter(&self.repositioning)?;
        let mut stats = self.stats.get();
        stats.ticks += 1;

        let refocused = !self.window.is_focused();
        if refocused {
            self.window.bring_to_front();
            stats.refocuses += 1;
        }

        let anchor = self.resolve_anchor(&mut stats);
        let off_anchor = self
            .pointer
            .position()
            .map_or(true, |at| at.distance_to(anchor) > self.tolerance);
        let mut warped = false;
        if off_anchor {
            if self.pointer.warp(anchor) {
                warped = true;
                stats.warps += 1;
            } else {
                stats.failed_warps += 1;
                log::trace!("Pointer warp refused");
            }
        }

        self.stats.set(stats);
        Some(TickOutcome {
            anchor,
            refocused,
            warped,
        })
    }
}

pub struct PositionEnforcer {
    core: Rc<EnforcerCore>,
    scheduler: Rc<dyn Scheduler>,
    period: Duration,
    timer: Option<TimerHandle>,
}

impl PositionEnforcer {
    /// `tolerance` is the distance from the anchor, in points, within which
    /// the pointer counts as pinned. Only a strictly larger distance warps.
    pub fn new(
        window: Rc<dyn WindowHost>,
        pointer: Rc<dyn PointerControl>,
        scheduler: Rc<dyn Scheduler>,
        period: Duration,
        tolerance: f64,
    ) -> Self {
        Self {
            core: Rc::new(EnforcerCore {
                window,
                pointer,
                tolerance,
                anchor: Cell::new(None),
                repositioning: Cell::new(false),
                stats: Cell::new(EnforcerStats::default()),
            }),
            scheduler,
            period,
            timer: None,
        }
    }

    /// Computes a fresh anchor, pins the pointer once, then starts the
    /// periodic task. A no-op if already running.
    pub fn start(&mut self) {
        if self.timer.is_some() {
            return;
        }
        self.core.anchor.set(None);
        self.core.tick();

        let core = Rc::clone(&self.core);
        self.timer = Some(self.scheduler.every(
            self.period,
            Box::new(move || {
                core.tick();
            }),
        ));
        log::info!("Position enforcer started ({:?} period)", self.period);
    }

    /// Stops the periodic task. Idempotent.
    pub fn stop(&mut self) {
        if let Some(mut timer) = self.timer.take() {
            timer.cancel();
            log::info!("Position enforcer stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.timer.is_some()
    }

    /// Runs one tick by hand. `None` if a tick is already in flight.
    pub fn tick(&self) -> Option<TickOutcome> {
        self.core.tick()
    }

    pub fn anchor(&self) -> Option<Point> {
        self.core.anchor.get().map(|a| a.point())
    }

    pub fn stats(&self) -> EnforcerStats {
        self.core.stats.get()
    }
}

impl Drop for PositionEnforcer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{ManualScheduler, SimPointer, SimWindow};
    use std::cell::RefCell;

    fn enforcer(
        window: &Rc<SimWindow>,
        pointer: &Rc<SimPointer>,
        scheduler: &Rc<ManualScheduler>,
    ) -> PositionEnforcer {
        PositionEnforcer::new(
            window.clone(),
            pointer.clone(),
            scheduler.clone(),
            Duration::from_millis(4),
            0.5,
        )
    }

    #[test]
    fn anchor_is_window_origin_plus_control_center() {
        let anchor = AnchorPoint::compute(
            Point::new(100.0, 100.0),
            Rect::new(20.0, 40.0, 120.0, 32.0),
        );
        assert_eq!(anchor.point(), Point::new(180.0, 156.0));
    }

    #[test]
    fn pins_drifting_pointer_every_tick() {
        let window = Rc::new(SimWindow::default());
        let pointer = Rc::new(SimPointer::new(Point::new(0.0, 0.0)));
        let scheduler = Rc::new(ManualScheduler::new());
        let mut enforcer = enforcer(&window, &pointer, &scheduler);

        enforcer.start();
        let anchor = Point::new(180.0, 156.0);
        assert_eq!(pointer.current(), anchor);
        assert_eq!(scheduler.periods(), vec![Duration::from_millis(4)]);

        for _ in 0..50 {
            pointer.nudge(1.0, 0.0);
            scheduler.tick();
            assert_eq!(pointer.current(), anchor);
        }
        let stats = enforcer.stats();
        assert_eq!(stats.ticks, 51);
        assert_eq!(stats.warps, 51);
        assert_eq!(stats.anchor_updates, 1);
    }

    #[test]
    fn follows_window_moves_and_refocuses() {
        let window = Rc::new(SimWindow::default());
        let pointer = Rc::new(SimPointer::default());
        let scheduler = Rc::new(ManualScheduler::new());
        let mut enforcer = enforcer(&window, &pointer, &scheduler);
        enforcer.start();

        window.move_to(Point::new(300.0, 50.0));
        window.set_focused(false);
        pointer.nudge(1.0, 1.0);
        scheduler.tick();

        assert_eq!(pointer.current(), Point::new(380.0, 106.0));
        assert_eq!(enforcer.anchor(), Some(Point::new(380.0, 106.0)));
        assert_eq!(window.raises(), 1);
        assert!(window.is_focused());
    }

    #[test]
    fn tolerance_boundary_is_inclusive() {
        let window = Rc::new(SimWindow::default());
        let pointer = Rc::new(SimPointer::new(Point::new(180.5, 156.0)));
        let scheduler = Rc::new(ManualScheduler::new());
        let enforcer = enforcer(&window, &pointer, &scheduler);

        assert!(!enforcer.tick().unwrap().warped);
        assert_eq!(pointer.current(), Point::new(180.5, 156.0));

        pointer.nudge(0.01, 0.0);
        assert!(enforcer.tick().unwrap().warped);
        assert_eq!(pointer.current(), Point::new(180.0, 156.0));
        assert_eq!(pointer.warps(), 1);
    }

    #[test]
    fn follows_the_control_when_only_it_moves() {
        let window = Rc::new(SimWindow::default());
        let pointer = Rc::new(SimPointer::default());
        let scheduler = Rc::new(ManualScheduler::new());
        let mut enforcer = enforcer(&window, &pointer, &scheduler);
        enforcer.start();
        assert_eq!(enforcer.anchor(), Some(Point::new(180.0, 156.0)));

        window.set_anchor_rect(Rect::new(60.0, 40.0, 120.0, 32.0));
        scheduler.tick();

        assert_eq!(pointer.current(), Point::new(220.0, 156.0));
        assert_eq!(enforcer.stats().anchor_updates, 2);
        assert_eq!(window.raises(), 0);
    }

    #[test]
    fn stop_cancels_the_timer() {
        let window = Rc::new(SimWindow::default());
        let pointer = Rc::new(SimPointer::default());
        let scheduler = Rc::new(ManualScheduler::new());
        let mut enforcer = enforcer(&window, &pointer, &scheduler);

        enforcer.start();
        enforcer.start();
        assert_eq!(scheduler.active_count(), 1);
        enforcer.stop();
        enforcer.stop();
        assert!(!enforcer.is_running());
        assert_eq!(scheduler.active_count(), 0);

        pointer.nudge(10.0, 10.0);
        scheduler.tick();
        assert_eq!(enforcer.stats().ticks, 1);
    }

    /// Warping re-enters the tick, as a synchronous movement callback would.
    struct ReentrantPointer {
        inner: SimPointer,
        core: RefCell<Option<Rc<EnforcerCore>>>,
        nested: RefCell<Vec<Option<TickOutcome>>>,
    }

    impl PointerControl for ReentrantPointer {
        fn position(&self) -> Option<Point> {
            self.inner.position()
        }

        fn warp(&self, to: Point) -> bool {
            if let Some(core) = self.core.borrow().as_ref() {
                self.nested.borrow_mut().push(core.tick());
            }
            self.inner.warp(to)
        }
    }

    #[test]
    fn tick_does_not_reenter_itself() {
        let window = Rc::new(SimWindow::default());
        let pointer = Rc::new(ReentrantPointer {
            inner: SimPointer::default(),
            core: RefCell::new(None),
            nested: RefCell::new(Vec::new()),
        });
        let scheduler = Rc::new(ManualScheduler::new());
        let enforcer = PositionEnforcer::new(
            window,
            pointer.clone(),
            scheduler,
            Duration::from_millis(4),
            0.5,
        );
        *pointer.core.borrow_mut() = Some(Rc::clone(&enforcer.core));

        assert!(enforcer.tick().unwrap().warped);
        assert_eq!(*pointer.nested.borrow(), vec![None]);
        assert!(!enforcer.core.repositioning.get());
        assert_eq!(enforcer.stats().ticks, 1);

        pointer.core.borrow_mut().take();
    }
}
