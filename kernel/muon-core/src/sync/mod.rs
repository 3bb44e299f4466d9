//! Synchronization primitives for the kernel.
//!
//! Everything here is const-constructable so it can live in `static` items
//! and be used before any allocator or scheduler exists. [`interrupts`]
//! provides the scoped interrupt mask, [`SpinLock`] the plain spin lock,
//! and [`IrqSpinLock`] the combination used for any state an interrupt
//! handler may touch.

pub mod interrupts;

mod irq_spinlock;
mod spinlock;

pub use interrupts::CriticalSection;
pub use irq_spinlock::{IrqSpinLock, IrqSpinLockGuard};
pub use spinlock::{SpinLock, SpinLockGuard};
