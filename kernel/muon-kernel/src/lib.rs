//! Muon kernel scheduling substrate.
//!
//! The pieces that decide which thread runs next and when timed waits
//! expire: intrusive priority queues over [`muon_core::list`], the
//! system-wide timestamp queue, software timers, and the pluggable
//! memory-resource layer.
//!
//! The kernel is uniprocessor. Mutual exclusion is interrupt masking (for
//! state an interrupt handler may touch) or preemption locking (for state
//! shared only between threads); both are scoped RAII acquisitions.

#![cfg_attr(not(test), no_std)]
#![feature(allocator_api, negative_impls)]
#![warn(missing_docs)]

extern crate alloc;

pub mod mm;
pub mod sched;
pub mod thread;
pub mod time;
pub mod timer;

pub use muon_core::log::LogLevel;
pub use muon_core::{kdebug, kerr, kfatal, kinfo, klog, ktrace, kwarn};
pub use muon_core::{kprint, kprintln};

/// Serialises tests that touch process-wide state (the global ready queue,
/// the default memory resource).
#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{Mutex, MutexGuard};

    static GLOBAL_STATE: Mutex<()> = Mutex::new(());

    pub fn lock_global_state() -> MutexGuard<'static, ()> {
        GLOBAL_STATE
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Pops the global ready queue until it is empty so a test's threads
    /// are unlinked before they are dropped.
    pub fn drain_ready_queue() {
        while crate::sched::pick_next().is_some() {}
    }
}
