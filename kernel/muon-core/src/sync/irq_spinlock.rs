//! Interrupt-safe spin lock.
//!
//! Masks interrupts for the duration of the critical section, then takes a
//! spin lock. Any state shared between thread context and an interrupt
//! handler must be behind one of these: a plain [`SpinLock`] would deadlock
//! the moment a handler interrupted its own lock holder.
//!
//! [`SpinLock`]: super::SpinLock

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use super::interrupts;

/// A spin lock that holds an interrupt critical section while locked.
///
/// On the uniprocessor target the masked interrupt flag is the exclusion;
/// the atomic exists so the same code is sound on hosted test builds.
pub struct IrqSpinLock<T> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

// SAFETY: Access to `value` is serialised by the atomic flag, with the
// interrupt mask covering same-CPU reentrancy.
unsafe impl<T: Send> Send for IrqSpinLock<T> {}
unsafe impl<T: Send> Sync for IrqSpinLock<T> {}

impl<T> IrqSpinLock<T> {
    /// Creates a new unlocked lock around `value`.
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, masking interrupts first.
    pub fn lock(&self) -> IrqSpinLockGuard<'_, T> {
        let token = interrupts::save_and_disable();
        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return IrqSpinLockGuard { lock: self, token };
            }
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    /// Attempts to acquire the lock without spinning.
    ///
    /// The interrupt state is restored immediately on failure.
    pub fn try_lock(&self) -> Option<IrqSpinLockGuard<'_, T>> {
        let token = interrupts::save_and_disable();
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(IrqSpinLockGuard { lock: self, token })
        } else {
            interrupts::restore(token);
            None
        }
    }
}

/// RAII guard; releases the lock and restores the interrupt state on drop.
pub struct IrqSpinLockGuard<'a, T> {
    lock: &'a IrqSpinLock<T>,
    token: u64,
}

impl<T> Deref for IrqSpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: The guard's existence proves the lock is held.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for IrqSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The guard's existence proves the lock is held.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for IrqSpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        interrupts::restore(self.token);
    }
}

/// The saved interrupt state is per-CPU; the guard must stay where it was
/// created.
impl<T> !Send for IrqSpinLockGuard<'_, T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_and_mutate() {
        let lock = IrqSpinLock::new(0u64);
        *lock.lock() = 5;
        assert_eq!(*lock.lock(), 5);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = IrqSpinLock::new(());
        let _guard = lock.lock();
        assert!(lock.try_lock().is_none());
    }

    #[test]
    fn released_after_drop() {
        let lock = IrqSpinLock::new(());
        drop(lock.lock());
        assert!(lock.try_lock().is_some());
    }
}
