//! The system clock and its timestamp queue.
//!
//! A single ascending-timestamp list drives every timed wait and software
//! timer: the head is always the earliest deadline, so the tick handler
//! only ever inspects one node. [`SystemClock::tick`] advances the
//! monotonic counter and dispatches everything that has expired.
//!
//! Dispatch re-enters a fresh critical section per expired node, so a
//! burst of simultaneous deadlines does not keep interrupts masked for the
//! whole burst.

use core::sync::atomic::{AtomicU64, Ordering};

use muon_core::list::{DoubleList, Links};
use muon_core::sync::{IrqSpinLock, SpinLock};

use crate::sched::queues::WaitNode;
use crate::thread::{Thread, ThreadState};
use crate::timer::Timer;

/// A monotonic hardware counter the port can register as the time base.
pub trait ClockSource: Send + Sync {
    /// Current time in clock ticks since an arbitrary epoch.
    fn now_ticks(&self) -> u64;
}

/// What an expired timestamp node does.
///
/// The kernel's set of deadline consumers is closed, so the action is a
/// tagged variant rather than a dispatch table.
#[derive(Clone, Copy)]
pub enum TimestampAction {
    /// Not armed yet.
    None,
    /// A timed wait expired: release the paired wait-queue entry and make
    /// the thread runnable.
    Timeout {
        /// The waiting thread.
        thread: *const Thread,
        /// Its entry in the wait queue, unlinked in the same critical
        /// section so a later wakeup finds nothing.
        wait_node: *mut WaitNode,
    },
    /// A software timer fired: run its interrupt-level routine.
    Timer {
        /// The owning timer; periodic timers re-link their node.
        timer: *const Timer,
    },
}

/// An entry in the timestamp queue: a list node, an absolute deadline, and
/// the action to run at expiry.
///
/// Owned by the thread or timer it belongs to; the queue borrows it while
/// linked. `links` stays the first field so node and `Links` addresses
/// coincide.
#[repr(C)]
pub struct TimestampNode {
    pub(crate) links: Links,
    timestamp: u64,
    action: TimestampAction,
}

impl TimestampNode {
    /// Creates an unarmed node with the given deadline.
    pub const fn new(timestamp: u64) -> Self {
        Self {
            links: Links::new(),
            timestamp,
            action: TimestampAction::None,
        }
    }

    /// The absolute deadline.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Sets the absolute deadline. Only meaningful while unlinked.
    pub fn set_timestamp(&mut self, timestamp: u64) {
        debug_assert!(self.links.is_unlinked());
        self.timestamp = timestamp;
    }

    /// Arms the node with an action. Only meaningful while unlinked.
    pub fn set_action(&mut self, action: TimestampAction) {
        debug_assert!(self.links.is_unlinked());
        self.action = action;
    }

    /// `true` while the node sits in a timestamp queue.
    pub fn is_linked(&self) -> bool {
        !self.links.is_unlinked()
    }

    /// Unlinks the node and runs its action.
    ///
    /// Runs inside the queue's critical section; `list` is the
    /// already-locked queue so a periodic timer can re-link without
    /// re-entering the lock.
    ///
    /// # Safety
    ///
    /// `node` must be the queue's linked head; the thread or timer behind
    /// the action must be live.
    unsafe fn run(node: *mut TimestampNode, list: &mut ClockList) {
        unsafe {
            (*node).links.unlink();
            match (*node).action {
                TimestampAction::None => {}
                TimestampAction::Timeout { thread, wait_node } => {
                    if !wait_node.is_null() {
                        (*wait_node).links.unlink();
                        (*wait_node).timeout = core::ptr::null_mut();
                    }
                    #[cfg(feature = "trace-lists")]
                    muon_core::ktrace!("clock: timeout {}", (*thread).name());
                    if (*thread).state() != ThreadState::Destroyed {
                        (*thread).resume();
                    }
                }
                TimestampAction::Timer { timer } => {
                    (*timer).interrupt_service_routine(list);
                }
            }
        }
    }
}

/// The ascending-timestamp list. Ties keep insertion order, so
/// equal-deadline actions dispatch in the order they were armed.
pub struct ClockList {
    list: DoubleList,
}

impl ClockList {
    /// Creates an empty list.
    pub const fn new() -> Self {
        Self {
            list: DoubleList::new(),
        }
    }

    /// `true` when no deadline is pending.
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Links a node in ascending timestamp order.
    ///
    /// Insertion scans from the tail, so a node never passes an equal
    /// timestamp: ties dispatch in insertion order.
    ///
    /// # Safety
    ///
    /// `node` must be valid, unlinked, armed, and stay at its address
    /// while linked. The caller holds the queue's critical section.
    pub(crate) unsafe fn link(&mut self, node: *mut TimestampNode) {
        self.list.normalize();
        unsafe {
            let ts = (*node).timestamp;
            let mut after = self.list.tail() as *mut TimestampNode;
            let head = self.list.head() as *mut TimestampNode;

            if self.list.is_empty() || ts >= (*after).timestamp {
                // Latest deadline (or a tie with the latest): tail.
            } else if ts < (*head).timestamp {
                // New earliest deadline.
                after = self.list.head_slot() as *mut TimestampNode;
            } else {
                // Walk back past strictly-later deadlines.
                while ts < (*after).timestamp {
                    after = (*after).links.prev() as *mut TimestampNode;
                }
            }
            self.list.insert_after(node as *mut Links, after as *mut Links);

            #[cfg(feature = "trace-lists")]
            muon_core::ktrace!("clock: link @{}", ts);
        }
    }

    /// The earliest-deadline node. Meaningful only when `!is_empty()`.
    fn head_node(&self) -> *mut TimestampNode {
        self.list.head() as *mut TimestampNode
    }
}

/// The system clock: a monotonic tick counter (or a registered hardware
/// [`ClockSource`]) plus the timestamp queue it drives.
pub struct SystemClock {
    ticks: AtomicU64,
    timestamps: IrqSpinLock<ClockList>,
    source: SpinLock<Option<&'static dyn ClockSource>>,
}

impl SystemClock {
    /// Creates a clock at tick zero with nothing pending.
    pub const fn new() -> Self {
        Self {
            ticks: AtomicU64::new(0),
            timestamps: IrqSpinLock::new(ClockList::new()),
            source: SpinLock::new(None),
        }
    }

    /// The current time, from the registered source if there is one,
    /// otherwise from the tick counter.
    pub fn now(&self) -> u64 {
        if let Some(source) = *self.source.lock() {
            source.now_ticks()
        } else {
            self.ticks.load(Ordering::Relaxed)
        }
    }

    /// Registers a hardware time base. Expected at boot, before timed
    /// waits are armed.
    pub fn set_source(&self, source: &'static dyn ClockSource) {
        *self.source.lock() = Some(source);
    }

    /// Advances the tick counter and dispatches expired deadlines. Called
    /// from the tick interrupt handler.
    pub fn tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        self.check_timestamps(self.now());
    }

    /// Links an armed node into the timestamp queue.
    ///
    /// # Safety
    ///
    /// Same contract as [`ClockList::link`].
    pub unsafe fn link(&self, node: *mut TimestampNode) {
        let mut queue = self.timestamps.lock();
        unsafe { queue.link(node) };
    }

    /// Unlinks a node, cancelling its pending action. A node that already
    /// fired (or was never linked) is left alone.
    ///
    /// # Safety
    ///
    /// `node` must be valid; if linked, it must be linked in *this*
    /// clock's queue.
    pub unsafe fn cancel(&self, node: *mut TimestampNode) {
        let _queue = self.timestamps.lock();
        unsafe { (*node).links.unlink() };
    }

    /// Dispatches every node whose deadline is at or before `now`.
    ///
    /// Each expired node is handled in its own critical section, earliest
    /// first; ties in insertion order. Safe to call before anything was
    /// ever linked (the zero-form empty queue is accepted).
    pub fn check_timestamps(&self, now: u64) {
        loop {
            let mut queue = self.timestamps.lock();
            if queue.is_empty() {
                break;
            }
            let head = queue.head_node();
            // SAFETY: The head of a non-empty queue is live and linked.
            if now < unsafe { (*head).timestamp } {
                break;
            }
            // SAFETY: `head` is the linked head; link contracts keep the
            // thread/timer behind the action alive.
            unsafe { TimestampNode::run(head, &mut queue) };
            // The guard drops here: interrupts get a window between
            // expirations.
        }
    }

    /// Runs `f` with the timestamp queue locked.
    pub(crate) fn with_timestamps<R>(&self, f: impl FnOnce(&mut ClockList) -> R) -> R {
        let mut queue = self.timestamps.lock();
        f(&mut queue)
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

/// The kernel's clock instance, driven by the port's tick interrupt.
pub static SYSCLOCK: SystemClock = SystemClock::new();
