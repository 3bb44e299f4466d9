//! Threads as the scheduler sees them.
//!
//! [`Thread`] carries only what the queues observe: a priority, a
//! scheduling state, and two embedded list nodes — the scheduling node
//! (in exactly one of the ready queue, a wait queue, or the terminated
//! list at any time) and the hierarchy node (in the parent's children
//! list, or the top-level list for roots).
//!
//! `Thread::new` is `const`, so threads can be statically constructed and
//! enqueued before any initialisation code has run; the lists they land in
//! accept their zero-initialised empty form.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU8, Ordering};

use muon_core::list::{DoubleList, Links};
use muon_core::sync::IrqSpinLock;

use crate::sched;
use crate::sched::queues::WaitNode;

/// Scheduling state of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    /// Linked in the ready queue, runnable.
    Ready = 0,
    /// Currently executing.
    Running = 1,
    /// Blocked on a wait queue or a timed wait.
    Waiting = 2,
    /// Finished executing; awaiting reclamation.
    Terminated = 3,
    /// Storage is being torn down; must never be resumed.
    Destroyed = 4,
}

impl ThreadState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Ready,
            1 => Self::Running,
            2 => Self::Waiting,
            3 => Self::Terminated,
            _ => Self::Destroyed,
        }
    }
}

/// A kernel thread, reduced to what the scheduling substrate needs.
///
/// Stack management, entry points, and the context itself belong to the
/// architecture port and the thread lifecycle layer above.
pub struct Thread {
    name: &'static str,
    prio: AtomicU8,
    state: AtomicU8,
    /// Scheduling node, linked by the ready queue, a wait queue, or the
    /// terminated list. Mutated only under the owning queue's lock.
    ready_node: UnsafeCell<WaitNode>,
    /// Hierarchy node, linked by the parent's children list or the
    /// top-level list.
    child_node: UnsafeCell<ThreadNode>,
}

// SAFETY: The atomics are inherently shareable; the embedded nodes are only
// mutated by list operations executed under the owning queue's critical
// section.
unsafe impl Sync for Thread {}

impl Thread {
    /// Creates a thread with the given name and priority.
    ///
    /// Higher priority value = more urgent. Usable in `static` items.
    pub const fn new(name: &'static str, priority: u8) -> Self {
        Self {
            name,
            prio: AtomicU8::new(priority),
            state: AtomicU8::new(ThreadState::Ready as u8),
            ready_node: UnsafeCell::new(WaitNode::unbound()),
            child_node: UnsafeCell::new(ThreadNode::unbound()),
        }
    }

    /// The thread's name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The assigned (base) priority.
    pub fn priority(&self) -> u8 {
        self.prio.load(Ordering::Relaxed)
    }

    /// Reassigns the base priority. Does not reorder queues the thread is
    /// already linked in.
    pub fn set_priority(&self, priority: u8) {
        self.prio.store(priority, Ordering::Relaxed);
    }

    /// The effective scheduling priority.
    ///
    /// Wait queues order by this accessor rather than the raw field so a
    /// future priority-boost scheme only has to change this one place.
    pub fn sched_prio(&self) -> u8 {
        self.priority()
    }

    /// The current scheduling state.
    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Sets the scheduling state.
    pub(crate) fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Marks the thread as waiting. Called by blocking operations before
    /// they link a wait node.
    pub fn set_waiting(&self) {
        self.set_state(ThreadState::Waiting);
    }

    /// Marks the thread's storage as going away. A destroyed thread is
    /// never resumed, even if a stale wakeup still finds one of its nodes.
    pub fn set_destroyed(&self) {
        self.set_state(ThreadState::Destroyed);
    }

    /// The scheduling node. Mutate only under the owning queue's lock.
    pub fn ready_node_ptr(&self) -> *mut WaitNode {
        self.ready_node.get()
    }

    /// The hierarchy node. Mutate only under the owning list's lock.
    pub fn child_node_ptr(&self) -> *mut ThreadNode {
        self.child_node.get()
    }

    /// Makes a waiting thread runnable.
    ///
    /// Links the scheduling node into the global ready queue, which sets
    /// the state to [`ThreadState::Ready`]. At-most-once: if the node is
    /// already linked somewhere the call is a no-op, so a wakeup and a
    /// timeout racing on the same thread cannot double-queue it.
    pub fn resume(&self) {
        let mut queue = sched::ready_queue().lock();
        // SAFETY: The node is owned by this live thread and the ready
        // queue's lock is held.
        unsafe {
            let node = self.ready_node.get();
            if !(*node).links.is_unlinked() {
                return;
            }
            (*node).thread = self as *const Thread;
            queue.link(node);
        }
    }
}

/// Hierarchy list node: `links` first so node and object addresses
/// coincide.
#[repr(C)]
pub struct ThreadNode {
    pub(crate) links: Links,
    pub(crate) thread: *const Thread,
}

impl ThreadNode {
    /// A node not yet bound to a thread.
    pub const fn unbound() -> Self {
        Self {
            links: Links::new(),
            thread: core::ptr::null(),
        }
    }

    /// The thread this node belongs to (null until first linked).
    pub fn thread(&self) -> *const Thread {
        self.thread
    }
}

/// FIFO list of root threads (threads with no parent).
///
/// Statically constructed; normalises its zero-initialised empty form on
/// first use.
pub struct TopThreadsList {
    list: DoubleList,
}

impl TopThreadsList {
    /// Creates an empty list.
    pub const fn new() -> Self {
        Self {
            list: DoubleList::new(),
        }
    }

    /// `true` when no roots are registered.
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Appends `thread` at the tail.
    ///
    /// # Safety
    ///
    /// `thread` must be live, stay at its address while linked, and its
    /// hierarchy node must be unlinked. The caller holds the list's lock.
    pub unsafe fn link(&mut self, thread: *const Thread) {
        unsafe {
            let node = (*thread).child_node_ptr();
            (*node).thread = thread;
            self.list.push_back(node as *mut Links);
        }
    }
}

/// FIFO list of a thread's children.
///
/// Each thread owns one; it exists for as long as its owner does.
pub struct ThreadChildrenList {
    list: DoubleList,
}

impl ThreadChildrenList {
    /// Creates an empty children list.
    pub const fn new() -> Self {
        Self {
            list: DoubleList::new(),
        }
    }

    /// `true` when the thread has no children.
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Appends `thread` at the tail.
    ///
    /// # Safety
    ///
    /// Same contract as [`TopThreadsList::link`].
    pub unsafe fn link(&mut self, thread: *const Thread) {
        unsafe {
            let node = (*thread).child_node_ptr();
            (*node).thread = thread;
            self.list.push_back(node as *mut Links);
        }
    }
}

/// FIFO list of terminated threads awaiting reclamation.
///
/// Links the scheduling node: a terminated thread is in neither the ready
/// queue nor any wait queue, so the node is free.
pub struct TerminatedThreadsList {
    list: DoubleList,
}

impl TerminatedThreadsList {
    /// Creates an empty list.
    pub const fn new() -> Self {
        Self {
            list: DoubleList::new(),
        }
    }

    /// `true` when nothing awaits reclamation.
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Appends the thread's scheduling node at the tail.
    ///
    /// # Safety
    ///
    /// `node` must be valid, unlinked, and bound to a live thread. The
    /// caller holds the list's lock.
    pub unsafe fn link(&mut self, node: *mut WaitNode) {
        unsafe {
            #[cfg(feature = "trace-lists")]
            muon_core::ktrace!("terminated: link {}", (*(*node).thread).name());
            self.list.push_back(node as *mut Links);
        }
    }

    /// Unlinks and returns the oldest terminated thread, if any.
    pub fn pop_front(&mut self) -> Option<*const Thread> {
        if self.list.is_empty() {
            return None;
        }
        // SAFETY: A non-empty list's head is a live, linked WaitNode.
        unsafe {
            let node = self.list.head() as *mut WaitNode;
            let thread = (*node).thread;
            (*node).links.unlink();
            Some(thread)
        }
    }
}

/// Global list of root threads.
static TOP_THREADS: IrqSpinLock<TopThreadsList> = IrqSpinLock::new(TopThreadsList::new());

/// Global list of terminated threads awaiting reclamation.
static TERMINATED_THREADS: IrqSpinLock<TerminatedThreadsList> =
    IrqSpinLock::new(TerminatedThreadsList::new());

/// The global list of root threads.
pub fn top_threads() -> &'static IrqSpinLock<TopThreadsList> {
    &TOP_THREADS
}

/// The global reclamation list.
pub fn terminated_threads() -> &'static IrqSpinLock<TerminatedThreadsList> {
    &TERMINATED_THREADS
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::ptr;

    #[test]
    fn new_thread_defaults() {
        let t = Thread::new("worker", 7);
        assert_eq!(t.name(), "worker");
        assert_eq!(t.priority(), 7);
        assert_eq!(t.sched_prio(), 7);
        assert_eq!(t.state(), ThreadState::Ready);
    }

    #[test]
    fn static_thread_construction() {
        static T: Thread = Thread::new("static", 3);
        assert_eq!(T.priority(), 3);
    }

    #[test]
    fn priority_is_mutable() {
        let t = Thread::new("t", 1);
        t.set_priority(9);
        assert_eq!(t.priority(), 9);
        assert_eq!(t.sched_prio(), 9);
    }

    #[test]
    fn state_transitions() {
        let t = Thread::new("t", 1);
        t.set_waiting();
        assert_eq!(t.state(), ThreadState::Waiting);
        t.set_destroyed();
        assert_eq!(t.state(), ThreadState::Destroyed);
    }

    #[test]
    fn state_round_trips_through_raw() {
        for state in [
            ThreadState::Ready,
            ThreadState::Running,
            ThreadState::Waiting,
            ThreadState::Terminated,
            ThreadState::Destroyed,
        ] {
            assert_eq!(ThreadState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn top_threads_list_is_fifo() {
        let a = Thread::new("a", 5);
        let b = Thread::new("b", 9);
        let c = Thread::new("c", 1);
        let mut list = TopThreadsList::new();
        assert!(list.is_empty());

        // SAFETY: The threads outlive the list and are unlinked below.
        unsafe {
            list.link(&a);
            list.link(&b);
            list.link(&c);
        }
        assert!(!list.is_empty());

        // Priority plays no role here: pure insertion order.
        let mut names = Vec::new();
        let mut cur = list.list.head();
        for _ in 0..3 {
            unsafe {
                let node = cur as *mut ThreadNode;
                names.push((*(*node).thread).name());
                cur = (*node).links.next();
            }
        }
        assert_eq!(names, vec!["a", "b", "c"]);

        unsafe {
            (*a.child_node_ptr()).links.unlink();
            (*b.child_node_ptr()).links.unlink();
            (*c.child_node_ptr()).links.unlink();
        }
    }

    #[test]
    fn children_list_links_and_empties() {
        let child = Thread::new("child", 2);
        let mut list = ThreadChildrenList::new();

        // SAFETY: `child` outlives the list and is unlinked below.
        unsafe { list.link(&child) };
        assert!(!list.is_empty());

        unsafe { (*child.child_node_ptr()).links.unlink() };
        assert!(list.is_empty());
    }

    #[test]
    fn terminated_list_pops_in_order() {
        let a = Thread::new("a", 4);
        let b = Thread::new("b", 8);
        let mut list = TerminatedThreadsList::new();
        assert!(list.pop_front().is_none());

        // SAFETY: Nodes are bound to live threads and unlinked via pop.
        unsafe {
            let na = a.ready_node_ptr();
            (*na).thread = &a;
            list.link(na);
            let nb = b.ready_node_ptr();
            (*nb).thread = &b;
            list.link(nb);
        }

        assert!(ptr::eq(list.pop_front().unwrap(), &a));
        assert!(ptr::eq(list.pop_front().unwrap(), &b));
        assert!(list.pop_front().is_none());
        assert!(list.is_empty());
    }

    #[test]
    fn global_hierarchy_lists_start_usable() {
        let _g = crate::test_support::lock_global_state();

        static ROOT: Thread = Thread::new("root", 1);
        // SAFETY: ROOT is 'static and unlinked again below.
        unsafe { top_threads().lock().link(&ROOT) };
        assert!(!top_threads().lock().is_empty());

        unsafe { (*ROOT.child_node_ptr()).links.unlink() };
        assert!(top_threads().lock().is_empty());
        assert!(terminated_threads().lock().is_empty());
    }

    #[test]
    fn resume_links_into_ready_queue() {
        let _g = crate::test_support::lock_global_state();

        let t = Thread::new("resume-me", 5);
        t.set_waiting();
        t.resume();
        assert_eq!(t.state(), ThreadState::Ready);

        // A second resume must not double-link the node.
        t.resume();

        let picked = crate::sched::pick_next().expect("thread was linked");
        assert!(ptr::eq(picked, &t));
        assert_eq!(t.state(), ThreadState::Running);
        assert!(crate::sched::pick_next().is_none());
    }
}
