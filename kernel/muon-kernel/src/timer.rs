//! Software timers.
//!
//! A [`Timer`] owns one timestamp-queue node. One-shot timers run their
//! function once at the deadline; periodic timers advance the deadline by
//! their period and re-link themselves from inside the dispatch, while the
//! queue's critical section is still held.
//!
//! The function runs at interrupt level (inside the clock's dispatch) and
//! must behave accordingly: no blocking, no long work.

use core::cell::{Cell, UnsafeCell};

use crate::time::{ClockList, SystemClock, TimestampAction, TimestampNode};

/// The function a timer runs at expiry, with its argument.
pub type TimerFn = fn(usize);

/// Whether a timer re-arms itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Fires once, then lies dormant until started again.
    Once,
    /// Re-links itself every period until stopped.
    Periodic,
}

/// A software timer driven by the system clock's timestamp queue.
pub struct Timer {
    name: &'static str,
    kind: TimerKind,
    func: TimerFn,
    arg: usize,
    /// Ticks between firings for periodic timers; set by `start`.
    period: Cell<u64>,
    /// The timer's entry in the timestamp queue. Mutated only under the
    /// clock's critical section.
    node: UnsafeCell<TimestampNode>,
}

// SAFETY: `period` and `node` are only mutated while the owning clock's
// timestamp queue is locked.
unsafe impl Sync for Timer {}

impl Timer {
    /// Creates a stopped timer. Usable in `static` items.
    pub const fn new(name: &'static str, kind: TimerKind, func: TimerFn, arg: usize) -> Self {
        Self {
            name,
            kind,
            func,
            arg,
            period: Cell::new(0),
            node: UnsafeCell::new(TimestampNode::new(0)),
        }
    }

    /// The timer's name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// One-shot or periodic.
    pub fn kind(&self) -> TimerKind {
        self.kind
    }

    /// Arms the timer to fire `ticks` from now on `clock`.
    ///
    /// For periodic timers, `ticks` is also the period. Starting a timer
    /// that is already armed re-arms it at the new deadline.
    ///
    /// The timer must always be driven by the same clock: start, stop,
    /// and expiry all go through that clock's queue.
    pub fn start(&'static self, clock: &SystemClock, ticks: u64) {
        let deadline = clock.now().wrapping_add(ticks);
        clock.with_timestamps(|queue| {
            // SAFETY: The node is owned by this 'static timer and the
            // queue's critical section is held.
            unsafe {
                let node = self.node.get();
                (*node).links.unlink();
                (*node).set_timestamp(deadline);
                (*node).set_action(TimestampAction::Timer { timer: self });
                self.period.set(ticks);
                queue.link(node);
            }
        });
    }

    /// Disarms the timer. A no-op if it is not pending.
    pub fn stop(&self, clock: &SystemClock) {
        clock.with_timestamps(|_queue| {
            // SAFETY: The queue's critical section is held; unlink is
            // idempotent.
            unsafe { (*self.node.get()).links.unlink() };
        });
    }

    /// Runs the timer's function at expiry, re-linking periodic timers.
    ///
    /// Called from the timestamp dispatch with the queue still locked;
    /// `queue` is that locked list, so the re-link needs no fresh
    /// acquisition.
    pub(crate) fn interrupt_service_routine(&self, queue: &mut ClockList) {
        #[cfg(feature = "trace-lists")]
        muon_core::ktrace!("timer: fire {}", self.name);

        (self.func)(self.arg);

        if self.kind == TimerKind::Periodic {
            // SAFETY: The node was just unlinked by the dispatch; the
            // queue's critical section is still held.
            unsafe {
                let node = self.node.get();
                let next = (*node).timestamp().wrapping_add(self.period.get());
                (*node).set_timestamp(next);
                queue.link(node);
            }
        }
    }
}
