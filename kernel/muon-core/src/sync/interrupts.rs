//! Scoped control of the global interrupt mask.
//!
//! The kernel is uniprocessor: masking interrupts is the strongest form of
//! mutual exclusion it has. [`save_and_disable`] / [`restore`] are the raw
//! primitives; [`CriticalSection`] is the RAII form that nests correctly
//! and releases on every exit path.
//!
//! Off-target (host unit tests) the mask operations are no-ops; the
//! spin locks layered on top still provide exclusion there.

/// Saves the current interrupt state and disables interrupts.
///
/// Returns an opaque token for [`restore`]. Calls nest: each `restore`
/// reinstates exactly the state its matching `save_and_disable` captured.
#[inline]
pub fn save_and_disable() -> u64 {
    arch_save_and_disable()
}

/// Restores an interrupt state previously captured by [`save_and_disable`].
#[inline]
pub fn restore(token: u64) {
    arch_restore(token)
}

/// RAII interrupt critical section.
///
/// Interrupts are masked from construction until drop. Because the saved
/// state is restored (not unconditionally re-enabled), sections nest.
pub struct CriticalSection {
    token: u64,
}

impl CriticalSection {
    /// Masks interrupts and captures the previous state.
    pub fn enter() -> Self {
        Self {
            token: save_and_disable(),
        }
    }
}

impl Drop for CriticalSection {
    fn drop(&mut self) {
        restore(self.token);
    }
}

/// The captured interrupt state is meaningful only on the CPU that saved it.
impl !Send for CriticalSection {}

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
#[inline]
fn arch_save_and_disable() -> u64 {
    let flags: u64;
    // SAFETY: Reading RFLAGS and clearing IF is safe in kernel mode.
    unsafe {
        core::arch::asm!(
            "pushfq",
            "pop {}",
            "cli",
            out(reg) flags,
            options(nomem),
        );
    }
    flags
}

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
#[inline]
fn arch_restore(token: u64) {
    // Only the IF bit is reinstated.
    if token & (1 << 9) != 0 {
        // SAFETY: Re-enabling interrupts restores a previously observed state.
        unsafe {
            core::arch::asm!("sti", options(nomem, nostack, preserves_flags));
        }
    }
}

#[cfg(all(target_os = "none", target_arch = "aarch64"))]
#[inline]
fn arch_save_and_disable() -> u64 {
    let daif: u64;
    // SAFETY: Reading DAIF and masking interrupts is safe in kernel mode.
    unsafe {
        core::arch::asm!(
            "mrs {}, DAIF",
            "msr DAIFSet, #0xf",
            out(reg) daif,
            options(nomem),
        );
    }
    daif
}

#[cfg(all(target_os = "none", target_arch = "aarch64"))]
#[inline]
fn arch_restore(token: u64) {
    // SAFETY: Writing back a previously read DAIF restores the saved mask.
    unsafe {
        core::arch::asm!(
            "msr DAIF, {}",
            in(reg) token,
            options(nomem, nostack, preserves_flags),
        );
    }
}

#[cfg(not(target_os = "none"))]
#[inline]
fn arch_save_and_disable() -> u64 {
    0
}

#[cfg(not(target_os = "none"))]
#[inline]
fn arch_restore(_token: u64) {}
