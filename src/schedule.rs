//! Repeating timers on the cooperative loop.

use std::time::Duration;
use tokio::time::MissedTickBehavior;

/// Runs a task repeatedly until the returned handle is cancelled or dropped.
pub trait Scheduler {
    fn every(&self, period: Duration, task: Box<dyn FnMut()>) -> TimerHandle;
}

/// Cancels its timer when dropped.
pub struct TimerHandle {
    cancel: Option<Box<dyn FnOnce()>>,
}

impl TimerHandle {
    pub fn new(cancel: impl FnOnce() + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Stops the timer. Idempotent.
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    pub fn is_active(&self) -> bool {
        self.cancel.is_some()
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Scheduler backed by tokio local tasks.
///
/// # Panics
///
/// [`Scheduler::every`] panics unless called from within a
/// [`tokio::task::LocalSet`]; the tasks are not `Send`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn every(&self, period: Duration, mut task: Box<dyn FnMut()>) -> TimerHandle {
        let join = tokio::task::spawn_local(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                task();
            }
        });
        TimerHandle::new(move || join.abort())
    }
}
