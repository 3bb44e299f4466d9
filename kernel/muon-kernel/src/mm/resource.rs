//! The memory-resource abstraction.
//!
//! A [`MemoryResource`] is a byte allocator with alignment, statistics,
//! and an out-of-memory hook. Concrete policies (malloc-backed, first-fit
//! heap, pools) implement the `do_*` methods; the provided wrappers carry
//! the shared behaviour — the OOM retry and the statistics — so every
//! resource reports the same counters the same way.
//!
//! A process-wide *default resource* backs allocations whose caller does
//! not name a resource. It may be installed at boot; until then, readers
//! fall back to the built-in malloc-backed resource.

use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use muon_core::sync::SpinLock;

use super::MAX_ALIGN;
use super::malloc::MallocResource;

/// Out-of-memory handler: invoked on allocation failure. If it returns
/// (ideally after freeing something), the allocation is retried once.
pub type OutOfMemoryHandler = fn();

/// The statistics and hook slot every resource embeds.
///
/// All counters are atomics so the accessors need no lock; they are
/// updated by the provided [`MemoryResource`] wrappers and, for the
/// free-side bookkeeping, by the concrete resource. Byte counters track
/// *requested* bytes, not internal block sizes.
pub struct ResourceState {
    name: &'static str,
    oom_handler: AtomicPtr<()>,
    total_bytes: AtomicUsize,
    allocated_bytes: AtomicUsize,
    free_bytes: AtomicUsize,
    allocated_chunks: AtomicUsize,
    free_chunks: AtomicUsize,
    max_allocated_bytes: AtomicUsize,
}

impl ResourceState {
    /// Creates zeroed statistics under a name.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            oom_handler: AtomicPtr::new(ptr::null_mut()),
            total_bytes: AtomicUsize::new(0),
            allocated_bytes: AtomicUsize::new(0),
            free_bytes: AtomicUsize::new(0),
            allocated_chunks: AtomicUsize::new(0),
            free_chunks: AtomicUsize::new(0),
            max_allocated_bytes: AtomicUsize::new(0),
        }
    }

    /// The resource's human-readable name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Total managed bytes (0 when unbounded or unknown).
    pub fn total_bytes(&self) -> usize {
        self.total_bytes.load(Ordering::Relaxed)
    }

    /// Bytes currently allocated.
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes.load(Ordering::Relaxed)
    }

    /// Bytes currently free.
    pub fn free_bytes(&self) -> usize {
        self.free_bytes.load(Ordering::Relaxed)
    }

    /// Number of live allocations.
    pub fn allocated_chunks(&self) -> usize {
        self.allocated_chunks.load(Ordering::Relaxed)
    }

    /// Number of free chunks.
    pub fn free_chunks(&self) -> usize {
        self.free_chunks.load(Ordering::Relaxed)
    }

    /// High-water mark of `allocated_bytes`. Never decreases, and survives
    /// [`MemoryResource::reset`].
    pub fn max_allocated_bytes(&self) -> usize {
        self.max_allocated_bytes.load(Ordering::Relaxed)
    }

    /// Installs (or clears) the out-of-memory handler; returns the
    /// previous one.
    pub fn set_out_of_memory_handler(
        &self,
        handler: Option<OutOfMemoryHandler>,
    ) -> Option<OutOfMemoryHandler> {
        let raw = match handler {
            Some(h) => h as *mut (),
            None => ptr::null_mut(),
        };
        let prior = self.oom_handler.swap(raw, Ordering::AcqRel);
        if prior.is_null() {
            None
        } else {
            // SAFETY: Only valid handler pointers are ever stored.
            Some(unsafe { core::mem::transmute::<*mut (), OutOfMemoryHandler>(prior) })
        }
    }

    /// The installed out-of-memory handler, if any.
    pub fn out_of_memory_handler(&self) -> Option<OutOfMemoryHandler> {
        let raw = self.oom_handler.load(Ordering::Acquire);
        if raw.is_null() {
            None
        } else {
            // SAFETY: Only valid handler pointers are ever stored.
            Some(unsafe { core::mem::transmute::<*mut (), OutOfMemoryHandler>(raw) })
        }
    }

    /// Records a managed region of `total` bytes, initially one free
    /// chunk. Called by region-backed resources at init.
    pub fn set_region(&self, total: usize) {
        self.total_bytes.store(total, Ordering::Relaxed);
        self.free_bytes.store(total, Ordering::Relaxed);
        self.free_chunks
            .store(if total > 0 { 1 } else { 0 }, Ordering::Relaxed);
    }

    /// Updates free-chunk bookkeeping (owned by the concrete resource).
    pub fn set_free_chunks(&self, chunks: usize) {
        self.free_chunks.store(chunks, Ordering::Relaxed);
    }

    fn record_allocation(&self, bytes: usize) {
        let now = self.allocated_bytes.fetch_add(bytes, Ordering::Relaxed) + bytes;
        self.allocated_chunks.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .free_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(bytes))
            });
        self.max_allocated_bytes.fetch_max(now, Ordering::Relaxed);
    }

    fn record_deallocation(&self, bytes: usize) {
        let _ = self
            .allocated_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(bytes))
            });
        let _ = self
            .allocated_chunks
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
        if self.total_bytes() > 0 {
            self.free_bytes.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    fn reset_statistics(&self) {
        self.allocated_bytes.store(0, Ordering::Relaxed);
        self.allocated_chunks.store(0, Ordering::Relaxed);
        let total = self.total_bytes();
        self.free_bytes.store(total, Ordering::Relaxed);
        self.free_chunks
            .store(if total > 0 { 1 } else { 0 }, Ordering::Relaxed);
        // max_allocated_bytes deliberately survives: it is a lifetime
        // high-water mark.
    }
}

/// A byte allocator with alignment, statistics, and an OOM hook.
///
/// Implementations supply the `do_*` policy methods and an embedded
/// [`ResourceState`]; callers use the provided wrappers, which add the
/// retry and statistics behaviour. The state's address also serves as the
/// resource's identity for equality.
pub trait MemoryResource: Sync {
    /// The embedded statistics block.
    fn state(&self) -> &ResourceState;

    /// Policy: allocate `bytes` aligned to `align` (a power of two), or
    /// return null.
    fn do_allocate(&self, bytes: usize, align: usize) -> *mut u8;

    /// Policy: free a block returned by [`Self::do_allocate`].
    ///
    /// `bytes` may be 0 when the caller does not know the size; the
    /// implementation returns the originally requested size so the shared
    /// statistics stay balanced (0 if it cannot tell either).
    fn do_deallocate(&self, addr: *mut u8, bytes: usize, align: usize) -> usize;

    /// Policy: equality. Two resources are equal iff memory allocated
    /// from one may be freed through the other. Default: identity.
    fn do_is_equal(&self, other: &dyn MemoryResource) -> bool {
        ptr::eq(self.state(), other.state())
    }

    /// Policy: largest request that could possibly succeed; 0 if unknown.
    fn do_max_size(&self) -> usize {
        0
    }

    /// Policy: return to the initial empty state. All outstanding
    /// pointers become invalid.
    fn do_reset(&self) {}

    /// Policy: merge adjacent free blocks; `true` iff at least one larger
    /// block resulted.
    fn do_coalesce(&self) -> bool {
        false
    }

    /// Allocates `bytes` aligned to `alignment`.
    ///
    /// A non-power-of-two alignment is a programmer error (debug assert);
    /// release builds fall back to [`MAX_ALIGN`]. On failure the OOM
    /// handler, if installed, runs once and the allocation is retried; a
    /// second failure (or no handler) yields null.
    fn allocate(&self, bytes: usize, alignment: usize) -> *mut u8 {
        debug_assert!(
            alignment.is_power_of_two(),
            "alignment must be a power of two"
        );
        let align = if alignment.is_power_of_two() {
            alignment
        } else {
            MAX_ALIGN
        };

        let mut addr = self.do_allocate(bytes, align);
        if addr.is_null() {
            if let Some(handler) = self.state().out_of_memory_handler() {
                handler();
                addr = self.do_allocate(bytes, align);
            }
        }
        if !addr.is_null() {
            self.state().record_allocation(bytes);
        }
        addr
    }

    /// Frees a block from this resource. Never fails, never blocks.
    ///
    /// `bytes` may be 0 when unknown; resources that need exact sizes
    /// record them internally.
    fn deallocate(&self, addr: *mut u8, bytes: usize, alignment: usize) {
        if addr.is_null() {
            return;
        }
        let align = if alignment.is_power_of_two() {
            alignment
        } else {
            MAX_ALIGN
        };
        let freed = self.do_deallocate(addr, bytes, align);
        self.state()
            .record_deallocation(if freed != 0 { freed } else { bytes });
    }

    /// Equality: identity short-circuit, then [`Self::do_is_equal`].
    fn is_equal(&self, other: &dyn MemoryResource) -> bool {
        ptr::eq(self.state(), other.state()) || self.do_is_equal(other)
    }

    /// Reinitialises the resource to empty. Statistics return to their
    /// initial values except the high-water mark.
    fn reset(&self) {
        self.do_reset();
        self.state().reset_statistics();
    }

    /// Merges adjacent free blocks; `true` iff anything was merged.
    fn coalesce(&self) -> bool {
        self.do_coalesce()
    }

    /// Largest single request that could possibly succeed; 0 if unknown.
    fn max_size(&self) -> usize {
        self.do_max_size()
    }

    /// Installs the out-of-memory handler; returns the previous one.
    fn set_out_of_memory_handler(
        &self,
        handler: Option<OutOfMemoryHandler>,
    ) -> Option<OutOfMemoryHandler> {
        self.state().set_out_of_memory_handler(handler)
    }

    /// Dumps the statistics to the kernel log.
    fn trace_print_statistics(&self) {
        let s = self.state();
        muon_core::kdebug!(
            "memory '{}': total {} B, allocated {} B in {} chunk(s), free {} B in {} chunk(s), max {} B",
            s.name(),
            s.total_bytes(),
            s.allocated_bytes(),
            s.allocated_chunks(),
            s.free_bytes(),
            s.free_chunks(),
            s.max_allocated_bytes(),
        );
    }
}

/// The built-in malloc-backed resource, also the default-resource
/// fallback.
static SYSTEM_MALLOC: MallocResource = MallocResource::new();

/// The process-wide default-resource slot. Written at boot; readers
/// tolerate the unset state.
static DEFAULT_RESOURCE: SpinLock<Option<&'static dyn MemoryResource>> = SpinLock::new(None);

/// The built-in resource backed by the global allocator.
pub fn malloc_resource() -> &'static dyn MemoryResource {
    &SYSTEM_MALLOC
}

/// Installs the default resource; returns the previous one.
///
/// Expected at boot, before concurrent allocation begins; the slot itself
/// is not synchronised against in-flight allocations through the old
/// resource.
pub fn set_default_resource(
    resource: &'static dyn MemoryResource,
) -> &'static dyn MemoryResource {
    let mut slot = DEFAULT_RESOURCE.lock();
    slot.replace(resource).unwrap_or(&SYSTEM_MALLOC)
}

/// The current default resource, falling back to the built-in
/// malloc-backed one until something is installed.
pub fn default_resource() -> &'static dyn MemoryResource {
    let slot = *DEFAULT_RESOURCE.lock();
    slot.unwrap_or(&SYSTEM_MALLOC)
}
