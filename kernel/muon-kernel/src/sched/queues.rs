//! Priority-ordered thread queues.
//!
//! [`ReadyList`] holds runnable threads, [`WaitList`] holds threads blocked
//! on a synchronization object. Both keep descending priority order (head =
//! most urgent) and insert by scanning **from the tail backwards**, which
//! makes equal-priority threads a natural FIFO: the new node lands after
//! the last existing node of its priority.
//!
//! Typical wait queues hold one thread, occasionally two; the ordered
//! insert costs a short walk there but makes taking the top waiter a
//! single head access, which is what the wakeup paths care about.
//!
//! [`WaitQueue`] wraps a `WaitList` in the interrupt critical section and
//! carries the two-phase resume discipline: unlink under the lock, call
//! `resume()` after dropping it, so a resume that takes other locks never
//! runs with interrupts masked.

use muon_core::list::{DoubleList, Links};
use muon_core::sync::IrqSpinLock;

use crate::thread::{Thread, ThreadState};
use crate::time::TimestampNode;

/// Scheduling-queue node. Embedded in its thread (the scheduling node) or
/// created on the waiting side's stack frame for the duration of a blocking
/// call.
///
/// `links` stays the first field so the node address and the `Links`
/// address coincide.
#[repr(C)]
pub struct WaitNode {
    pub(crate) links: Links,
    pub(crate) thread: *const Thread,
    /// Paired timeout entry in the timestamp queue, null for untimed
    /// waits. Whichever of {waker, clock} fires first unlinks both.
    pub(crate) timeout: *mut TimestampNode,
}

impl WaitNode {
    /// A node not yet bound to a thread. Usable in `static` initialisers.
    pub const fn unbound() -> Self {
        Self {
            links: Links::new(),
            thread: core::ptr::null(),
            timeout: core::ptr::null_mut(),
        }
    }

    /// A node bound to `thread`.
    pub fn new(thread: &Thread) -> Self {
        Self {
            links: Links::new(),
            thread,
            timeout: core::ptr::null_mut(),
        }
    }

    /// The thread this node queues (null while unbound).
    pub fn thread(&self) -> *const Thread {
        self.thread
    }

    /// `true` while the node is a member of some queue.
    pub fn is_linked(&self) -> bool {
        !self.links.is_unlinked()
    }
}

/// Finds the insertion anchor for a node of priority `prio` in a
/// descending-priority list of `WaitNode`s.
///
/// # Safety
///
/// Every linked node must belong to a live thread; the caller holds the
/// list's critical section. `list` must be normalised.
unsafe fn priority_anchor(list: &mut DoubleList, prio: u8, key: fn(&Thread) -> u8) -> *mut Links {
    unsafe {
        let mut after = list.tail() as *mut WaitNode;
        let head = list.head() as *mut WaitNode;

        if list.is_empty() || prio <= key(&*(*after).thread) {
            // Tail insertion: lowest priority, or FIFO behind its equals.
        } else if prio > key(&*(*head).thread) {
            // New most-urgent thread: insert right after the sentinel.
            after = list.head_slot() as *mut WaitNode;
        } else {
            // Walk back to the last node of priority >= prio. Guaranteed to
            // terminate before the sentinel: the head's priority is >= prio.
            while prio > key(&*(*after).thread) {
                after = (*after).links.prev() as *mut WaitNode;
            }
        }
        after as *mut Links
    }
}

/// The ready queue: runnable threads in descending priority order.
pub struct ReadyList {
    list: DoubleList,
}

impl ReadyList {
    /// Creates an empty ready queue.
    pub const fn new() -> Self {
        Self {
            list: DoubleList::new(),
        }
    }

    /// `true` when no thread is runnable.
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Links a thread's scheduling node and marks the thread ready.
    ///
    /// Ordered by the thread's assigned priority; equal priorities keep
    /// arrival order.
    ///
    /// # Safety
    ///
    /// `node` must be valid, unlinked, bound to a live thread, and stay at
    /// its address while linked. The caller holds the queue's lock.
    pub unsafe fn link(&mut self, node: *mut WaitNode) {
        self.list.normalize();
        unsafe {
            let thread = (*node).thread;
            debug_assert!(!thread.is_null());

            let anchor = priority_anchor(&mut self.list, (*thread).priority(), Thread::priority);
            self.list.insert_after(node as *mut Links, anchor);
            (*thread).set_state(ThreadState::Ready);

            #[cfg(feature = "trace-lists")]
            muon_core::ktrace!("ready: link {}", (*thread).name());
        }
    }

    /// Unlinks the most urgent thread, marks it running, and returns it.
    ///
    /// Precondition: `!is_empty()`. The caller holds the queue's lock.
    ///
    /// # Safety
    ///
    /// Linked nodes must belong to live threads.
    pub unsafe fn unlink_head(&mut self) -> *const Thread {
        debug_assert!(!self.is_empty());
        unsafe {
            let node = self.list.head() as *mut WaitNode;
            let thread = (*node).thread;
            (*node).links.unlink();
            (*thread).set_state(ThreadState::Running);

            #[cfg(feature = "trace-lists")]
            muon_core::ktrace!("ready: unlink head {}", (*thread).name());

            thread
        }
    }
}

/// Threads blocked on one synchronization object, in descending priority
/// order.
///
/// Unlike the ready queue, insertion reads [`Thread::sched_prio`] (so
/// priority boosts take effect) and touches no state: the caller marked
/// the thread waiting before it linked.
pub struct WaitList {
    list: DoubleList,
}

impl WaitList {
    /// Creates an empty wait list.
    pub const fn new() -> Self {
        Self {
            list: DoubleList::new(),
        }
    }

    /// `true` when nothing is blocked here.
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Links a wait node in priority order.
    ///
    /// # Safety
    ///
    /// Same contract as [`ReadyList::link`].
    pub unsafe fn link(&mut self, node: *mut WaitNode) {
        self.list.normalize();
        unsafe {
            let thread = (*node).thread;
            debug_assert!(!thread.is_null());

            let anchor =
                priority_anchor(&mut self.list, (*thread).sched_prio(), Thread::sched_prio);
            self.list.insert_after(node as *mut Links, anchor);

            #[cfg(feature = "trace-lists")]
            muon_core::ktrace!("wait: link {}", (*thread).name());
        }
    }

    /// Unlinks the top-priority waiter and its paired timeout entry, and
    /// returns the waiting thread.
    ///
    /// Precondition: `!is_empty()`. Runs entirely under the caller's
    /// critical section so the wakeup and the timeout can never both fire.
    ///
    /// # Safety
    ///
    /// Linked nodes must belong to live threads and live timeout entries.
    pub unsafe fn take_head(&mut self) -> *const Thread {
        debug_assert!(!self.is_empty());
        unsafe {
            let node = self.list.head() as *mut WaitNode;
            let thread = (*node).thread;
            (*node).links.unlink();

            let timeout = (*node).timeout;
            if !timeout.is_null() {
                (*timeout).links.unlink();
                (*node).timeout = core::ptr::null_mut();
            }

            #[cfg(feature = "trace-lists")]
            muon_core::ktrace!("wait: take head {}", (*thread).name());

            thread
        }
    }
}

/// A wait queue attached to a synchronization object: the wait list plus
/// the interrupt critical section protecting it.
pub struct WaitQueue {
    inner: IrqSpinLock<WaitList>,
}

impl WaitQueue {
    /// Creates an empty wait queue. Usable in `static` items.
    pub const fn new() -> Self {
        Self {
            inner: IrqSpinLock::new(WaitList::new()),
        }
    }

    /// `true` when nothing is blocked on the queue.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Links a wait node for an untimed wait.
    ///
    /// The caller has already marked the thread waiting.
    ///
    /// # Safety
    ///
    /// `node` must be valid, unlinked, bound to a live thread, and stay at
    /// its address until it is unlinked again.
    pub unsafe fn link(&self, node: *mut WaitNode) {
        let mut list = self.inner.lock();
        unsafe { list.link(node) };
    }

    /// Links a wait node paired with a timeout entry in `clock`'s
    /// timestamp queue.
    ///
    /// Whichever side fires first — [`Self::resume_one`] or the clock's
    /// timestamp dispatch — unlinks both nodes inside its own critical
    /// section, so the loser finds nothing to do.
    ///
    /// # Safety
    ///
    /// Same contract as [`Self::link`]; additionally `timeout` must be
    /// valid, unlinked, and stay at its address until unlinked.
    pub unsafe fn link_timed(
        &self,
        node: *mut WaitNode,
        clock: &crate::time::SystemClock,
        deadline: u64,
        timeout: *mut TimestampNode,
    ) {
        unsafe {
            (*timeout).set_timestamp(deadline);
            (*timeout).set_action(crate::time::TimestampAction::Timeout {
                thread: (*node).thread,
                wait_node: node,
            });
            (*node).timeout = timeout;

            {
                let mut list = self.inner.lock();
                list.link(node);
            }
            clock.link(timeout);
        }
    }

    /// Wakes the top-priority waiter, if any. Returns `true` if one was
    /// taken.
    ///
    /// Two phases: the unlink happens under the queue's critical section;
    /// the `resume()` call happens after it is released, because resuming
    /// takes the ready queue's lock and may grow more expensive. A thread
    /// already marked destroyed is unlinked but not resumed.
    pub fn resume_one(&self) -> bool {
        let thread = {
            let mut list = self.inner.lock();
            if list.is_empty() {
                return false;
            }
            // SAFETY: Queue membership implies the node and its thread are
            // live; the lock is held.
            unsafe { list.take_head() }
        };

        // SAFETY: The thread pointer was valid while linked; the contract
        // on link() keeps it valid until its nodes are unlinked, which has
        // just happened under the lock.
        unsafe {
            if (*thread).state() != ThreadState::Destroyed {
                (*thread).resume();
            }
        }
        true
    }

    /// Wakes every waiter.
    ///
    /// Each wakeup is its own critical section, so interrupt latency stays
    /// bounded while a long queue drains.
    pub fn resume_all(&self) {
        while self.resume_one() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::ptr;

    /// Collects (name, priority) pairs head→tail from a wait/ready list.
    fn snapshot(list: &DoubleList) -> Vec<(&'static str, u8)> {
        let mut out = Vec::new();
        if list.is_empty() {
            return out;
        }
        let mut cur = list.head();
        let end = list.tail();
        loop {
            unsafe {
                let node = cur as *mut WaitNode;
                let t = &*(*node).thread;
                out.push((t.name(), t.priority()));
                if ptr::eq(cur, end) {
                    break;
                }
                cur = (*node).links.next();
            }
        }
        out
    }

    #[test]
    fn ready_queue_priority_ordering() {
        // Priorities [3, 7, 5, 7, 1] named A..E must order as
        // B(7) D(7) C(5) A(3) E(1): descending, FIFO among equals.
        let a = Thread::new("A", 3);
        let b = Thread::new("B", 7);
        let c = Thread::new("C", 5);
        let d = Thread::new("D", 7);
        let e = Thread::new("E", 1);
        let threads = [&a, &b, &c, &d, &e];

        let mut queue = ReadyList::new();
        for t in threads {
            unsafe {
                let node = t.ready_node_ptr();
                (*node).thread = t as *const Thread;
                queue.link(node);
            }
            assert_eq!(t.state(), ThreadState::Ready);
        }

        assert_eq!(
            snapshot(&queue.list),
            vec![("B", 7), ("D", 7), ("C", 5), ("A", 3), ("E", 1)]
        );

        // Tail-to-head walk yields non-decreasing priorities.
        let order = snapshot(&queue.list);
        for pair in order.windows(2) {
            assert!(pair[0].1 >= pair[1].1);
        }

        // Popping yields B D C A E; each popped thread is Running, the
        // rest still Ready.
        for expected in ["B", "D", "C", "A", "E"] {
            let t = unsafe { queue.unlink_head() };
            unsafe {
                assert_eq!((*t).name(), expected);
                assert_eq!((*t).state(), ThreadState::Running);
            }
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn ready_queue_equal_priorities_are_fifo() {
        let t1 = Thread::new("first", 4);
        let t2 = Thread::new("second", 4);
        let t3 = Thread::new("third", 4);

        let mut queue = ReadyList::new();
        for t in [&t1, &t2, &t3] {
            unsafe {
                let node = t.ready_node_ptr();
                (*node).thread = t as *const Thread;
                queue.link(node);
            }
        }

        for expected in ["first", "second", "third"] {
            let t = unsafe { queue.unlink_head() };
            assert_eq!(unsafe { (*t).name() }, expected);
        }
    }

    #[test]
    fn ready_queue_accepts_zero_form() {
        let t = Thread::new("only", 1);
        let mut queue = ReadyList::new();
        assert!(queue.is_empty());

        unsafe {
            let node = t.ready_node_ptr();
            (*node).thread = &t;
            queue.link(node);
        }
        assert!(!queue.is_empty());
        assert!(ptr::eq(unsafe { queue.unlink_head() }, &t));
        assert!(queue.is_empty());
    }

    #[test]
    fn wait_list_orders_by_sched_prio() {
        let low = Thread::new("low", 1);
        let high = Thread::new("high", 9);
        let mid = Thread::new("mid", 5);

        let mut list = WaitList::new();
        let mut nodes = [
            WaitNode::new(&low),
            WaitNode::new(&high),
            WaitNode::new(&mid),
        ];
        for node in nodes.iter_mut() {
            unsafe { list.link(node as *mut WaitNode) };
        }

        assert_eq!(
            snapshot(&list.list),
            vec![("high", 9), ("mid", 5), ("low", 1)]
        );

        for node in nodes.iter_mut() {
            unsafe { node.links.unlink() };
        }
    }

    #[test]
    fn wait_list_link_does_not_touch_state() {
        let t = Thread::new("blocked", 3);
        t.set_waiting();

        let mut list = WaitList::new();
        let mut node = WaitNode::new(&t);
        unsafe { list.link(&mut node as *mut WaitNode) };
        assert_eq!(t.state(), ThreadState::Waiting);

        unsafe { node.links.unlink() };
    }

    #[test]
    fn resume_one_wakes_highest_priority_waiter() {
        let _g = crate::test_support::lock_global_state();

        let low = Thread::new("low", 1);
        let high = Thread::new("high", 8);
        low.set_waiting();
        high.set_waiting();

        let queue = WaitQueue::new();
        let mut nl = WaitNode::new(&low);
        let mut nh = WaitNode::new(&high);
        // SAFETY: Threads and nodes outlive the queue; nodes are unlinked
        // by resume_one before the test returns.
        unsafe {
            queue.link(&mut nl as *mut WaitNode);
            queue.link(&mut nh as *mut WaitNode);
        }

        assert!(queue.resume_one());
        assert_eq!(high.state(), ThreadState::Ready);
        assert_eq!(low.state(), ThreadState::Waiting);

        assert!(queue.resume_one());
        assert_eq!(low.state(), ThreadState::Ready);
        assert!(!queue.resume_one());

        crate::test_support::drain_ready_queue();
    }

    #[test]
    fn resume_all_empties_the_queue() {
        let _g = crate::test_support::lock_global_state();

        let threads: Vec<Thread> = (0..4)
            .map(|i| {
                let t = Thread::new("w", i);
                t.set_waiting();
                t
            })
            .collect();
        let mut nodes: Vec<WaitNode> = threads.iter().map(WaitNode::new).collect();

        let queue = WaitQueue::new();
        for node in nodes.iter_mut() {
            // SAFETY: Nodes outlive the queue and are unlinked by
            // resume_all.
            unsafe { queue.link(node as *mut WaitNode) };
        }

        queue.resume_all();
        assert!(queue.is_empty());
        for t in &threads {
            assert_eq!(t.state(), ThreadState::Ready);
        }

        crate::test_support::drain_ready_queue();
    }

    #[test]
    fn destroyed_thread_is_unlinked_but_not_resumed() {
        let _g = crate::test_support::lock_global_state();

        let t = Thread::new("gone", 5);
        t.set_waiting();

        let queue = WaitQueue::new();
        let mut node = WaitNode::new(&t);
        unsafe { queue.link(&mut node as *mut WaitNode) };

        t.set_destroyed();
        assert!(queue.resume_one());
        assert_eq!(t.state(), ThreadState::Destroyed);
        assert!(queue.is_empty());

        // Nothing was linked into the ready queue.
        assert!(crate::sched::pick_next().is_none());
    }
}
