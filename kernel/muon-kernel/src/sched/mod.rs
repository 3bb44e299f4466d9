//! Scheduler entry points and the scheduler critical section.
//!
//! The scheduler itself is small: the global ready queue plus
//! [`pick_next`], which the port's context-switch path calls to fetch the
//! thread to run. Everything that makes threads runnable goes through the
//! queues in [`queues`].
//!
//! Preemption can be suppressed without masking interrupts via
//! [`SchedCriticalSection`]; the port's switch code consults
//! [`preemption_locked`] before acting on a reschedule request.

pub mod queues;

use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use muon_core::sync::IrqSpinLock;

use crate::thread::Thread;
use queues::ReadyList;

/// The global ready queue. Interrupt handlers resume threads into it, so
/// it lives behind the interrupt critical section.
static READY_QUEUE: IrqSpinLock<ReadyList> = IrqSpinLock::new(ReadyList::new());

/// The global ready queue.
pub fn ready_queue() -> &'static IrqSpinLock<ReadyList> {
    &READY_QUEUE
}

/// Unlinks and returns the most urgent runnable thread, or `None` when the
/// ready queue is empty (the port then runs its idle loop).
///
/// The returned thread has been marked running.
pub fn pick_next() -> Option<*const Thread> {
    let mut queue = READY_QUEUE.lock();
    if queue.is_empty() {
        return None;
    }
    // SAFETY: The queue's lock is held and linked nodes belong to live
    // threads per the link contract.
    Some(unsafe { queue.unlink_head() })
}

/// Nesting count of scheduler critical sections. Non-zero = preemption
/// suppressed.
static PREEMPTION_LOCKS: AtomicU32 = AtomicU32::new(0);

/// RAII scheduler critical section: suppresses preemption, leaves
/// interrupts enabled.
///
/// Used around state that only thread context touches, like the default
/// memory resource's bookkeeping. Sections nest; preemption resumes when
/// the outermost guard drops.
pub struct SchedCriticalSection {
    _private: (),
}

impl SchedCriticalSection {
    /// Suppresses preemption until the guard is dropped.
    pub fn enter() -> Self {
        PREEMPTION_LOCKS.fetch_add(1, Ordering::Acquire);
        Self { _private: () }
    }
}

impl Drop for SchedCriticalSection {
    fn drop(&mut self) {
        let prior = PREEMPTION_LOCKS.fetch_sub(1, Ordering::Release);
        debug_assert!(prior != 0, "unbalanced scheduler critical section");
    }
}

/// The preemption-lock count is a per-CPU affair.
impl !Send for SchedCriticalSection {}

/// `true` while at least one [`SchedCriticalSection`] is live.
pub fn preemption_locked() -> bool {
    PREEMPTION_LOCKS.load(Ordering::Acquire) != 0
}

/// The port's context-switch entry point.
pub type ContextSwitchFn = fn();

static CONTEXT_SWITCH_FN: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());

/// Registers the port's context-switch primitive.
///
/// # Safety
///
/// `f` must be callable from any context the kernel requests a reschedule
/// in, and must itself pick the next thread via [`pick_next`].
pub unsafe fn set_context_switch_hook(f: ContextSwitchFn) {
    CONTEXT_SWITCH_FN.store(f as *mut (), Ordering::Release);
}

/// Requests a context switch, if the port registered one and preemption is
/// not suppressed.
///
/// The substrate itself never suspends; blocking operations link their
/// nodes and then call this.
pub fn reschedule() {
    if preemption_locked() {
        return;
    }
    let raw = CONTEXT_SWITCH_FN.load(Ordering::Acquire);
    if raw.is_null() {
        return;
    }
    // SAFETY: Only valid `ContextSwitchFn` pointers are stored in the slot.
    let f: ContextSwitchFn = unsafe { core::mem::transmute(raw) };
    f();
}
