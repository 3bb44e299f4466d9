//! First-fit free-list heap resource.
//!
//! Manages a caller-supplied region with an address-sorted free list:
//! first-fit allocation with block splitting, immediate coalescing on
//! free, and an explicit [`MemoryResource::coalesce`] pass for allocators
//! layered above that want compaction on demand.
//!
//! Each allocated block carries a header below the payload recording the
//! block bounds and the requested size, so `deallocate` needs no size from
//! the caller and the statistics stay exact.

use core::ptr;

use muon_core::sync::SpinLock;

use super::align_up;
use super::resource::{MemoryResource, ResourceState};

/// Minimum block size: must fit a `FreeBlock` header.
const MIN_BLOCK_SIZE: usize = 32;

/// All blocks start at multiples of this.
const BLOCK_ALIGN: usize = 16;

/// Free block header, living at the start of each free block.
#[repr(C)]
struct FreeBlock {
    /// Total size of this block, header included.
    size: usize,
    /// Next free block in address order, or null.
    next: *mut FreeBlock,
}

/// Allocated block header, living directly below the payload.
#[repr(C)]
#[derive(Clone, Copy)]
struct AllocHeader {
    /// Start of the block this payload was carved from.
    block_start: usize,
    /// Total size of that block.
    block_size: usize,
    /// The caller's requested size.
    requested: usize,
}

const HEADER_SIZE: usize = size_of::<AllocHeader>();

struct FirstFitInner {
    /// Head of the address-sorted free list.
    head: *mut FreeBlock,
    region_start: usize,
    region_end: usize,
}

// SAFETY: The raw free-list pointers are only touched under the SpinLock.
unsafe impl Send for FirstFitInner {}

/// A [`MemoryResource`] managing a fixed region first-fit.
pub struct FirstFitResource {
    state: ResourceState,
    inner: SpinLock<FirstFitInner>,
}

impl FirstFitResource {
    /// Creates an uninitialised resource; [`Self::init`] must run before
    /// the first allocation. Usable in `static` items.
    pub const fn new(name: &'static str) -> Self {
        Self {
            state: ResourceState::new(name),
            inner: SpinLock::new(FirstFitInner {
                head: ptr::null_mut(),
                region_start: 0,
                region_end: 0,
            }),
        }
    }

    /// Hands the resource its region.
    ///
    /// # Safety
    ///
    /// `start` must point to `size` writable bytes, aligned to 16, owned
    /// by this resource for its whole lifetime. Must be called exactly
    /// once.
    pub unsafe fn init(&self, start: *mut u8, size: usize) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.head.is_null(), "heap already initialised");
        debug_assert!(size >= MIN_BLOCK_SIZE, "heap too small");
        debug_assert!(start as usize % BLOCK_ALIGN == 0);

        inner.region_start = start as usize;
        inner.region_end = start as usize + size;

        // One free block spanning the whole region.
        let block = start as *mut FreeBlock;
        // SAFETY: The region is writable and big enough per the contract.
        unsafe {
            (*block).size = size;
            (*block).next = ptr::null_mut();
        }
        inner.head = block;
        self.state.set_region(size);
    }

    /// Inserts a block into the free list in address order, merging with
    /// adjacent free neighbours.
    ///
    /// # Safety
    ///
    /// `[addr, addr + size)` must lie inside the region and overlap no
    /// live allocation or free block. The inner lock must be held.
    unsafe fn insert_free_block(inner: &mut FirstFitInner, addr: usize, size: usize) {
        debug_assert!(size >= MIN_BLOCK_SIZE);
        debug_assert!(addr % BLOCK_ALIGN == 0);
        debug_assert!(addr >= inner.region_start && addr + size <= inner.region_end);

        // Find the address-sorted position.
        let mut prev: *mut FreeBlock = ptr::null_mut();
        let mut cur = inner.head;
        // SAFETY: Free-list nodes are valid blocks inside the region.
        unsafe {
            while !cur.is_null() && (cur as usize) < addr {
                prev = cur;
                cur = (*cur).next;
            }

            // Merge backwards into the predecessor when contiguous.
            if !prev.is_null() && prev as usize + (*prev).size == addr {
                (*prev).size += size;
                // The grown block may now touch its successor too.
                if !cur.is_null() && prev as usize + (*prev).size == cur as usize {
                    (*prev).size += (*cur).size;
                    (*prev).next = (*cur).next;
                }
                return;
            }

            // Stand-alone block; merge forwards when contiguous.
            let block = addr as *mut FreeBlock;
            if !cur.is_null() && addr + size == cur as usize {
                (*block).size = size + (*cur).size;
                (*block).next = (*cur).next;
            } else {
                (*block).size = size;
                (*block).next = cur;
            }

            if prev.is_null() {
                inner.head = block;
            } else {
                (*prev).next = block;
            }
        }
    }

    /// Recounts the free list into the shared statistics.
    fn sync_free_chunks(&self, inner: &FirstFitInner) {
        let mut chunks = 0;
        let mut cur = inner.head;
        while !cur.is_null() {
            chunks += 1;
            // SAFETY: Free-list nodes are valid while the lock is held.
            cur = unsafe { (*cur).next };
        }
        self.state.set_free_chunks(chunks);
    }
}

impl MemoryResource for FirstFitResource {
    fn state(&self) -> &ResourceState {
        &self.state
    }

    fn do_allocate(&self, bytes: usize, align: usize) -> *mut u8 {
        let align = align.max(BLOCK_ALIGN);
        let mut inner = self.inner.lock();

        let mut prev: *mut FreeBlock = ptr::null_mut();
        let mut cur = inner.head;

        // SAFETY: Free-list nodes are valid blocks; all arithmetic stays
        // inside the region the list describes.
        unsafe {
            while !cur.is_null() {
                let block_addr = cur as usize;
                let block_size = (*cur).size;

                let payload = align_up(block_addr + HEADER_SIZE, align);
                let Some(payload_end) = payload.checked_add(bytes) else {
                    return ptr::null_mut();
                };

                if payload_end <= block_addr + block_size {
                    // First fit. Unlink the block.
                    let next = (*cur).next;
                    if prev.is_null() {
                        inner.head = next;
                    } else {
                        (*prev).next = next;
                    }

                    // Split off the remainder when it can stand alone.
                    let used_end = align_up(payload_end, BLOCK_ALIGN);
                    let mut taken = block_size;
                    if block_addr + block_size >= used_end + MIN_BLOCK_SIZE {
                        let remainder = block_addr + block_size - used_end;
                        Self::insert_free_block(&mut inner, used_end, remainder);
                        taken = used_end - block_addr;
                    }

                    (payload as *mut AllocHeader).sub(1).write(AllocHeader {
                        block_start: block_addr,
                        block_size: taken,
                        requested: bytes,
                    });

                    self.sync_free_chunks(&inner);
                    return payload as *mut u8;
                }

                prev = cur;
                cur = (*cur).next;
            }
        }

        ptr::null_mut()
    }

    fn do_deallocate(&self, addr: *mut u8, bytes: usize, _align: usize) -> usize {
        // SAFETY: `addr` came from do_allocate, so a header sits below it
        // describing a block inside the region.
        unsafe {
            let header = (addr as *const AllocHeader).sub(1).read();
            debug_assert!(bytes == 0 || bytes == header.requested);

            let mut inner = self.inner.lock();
            Self::insert_free_block(&mut inner, header.block_start, header.block_size);
            self.sync_free_chunks(&inner);
            header.requested
        }
    }

    fn do_max_size(&self) -> usize {
        self.state
            .total_bytes()
            .saturating_sub(align_up(HEADER_SIZE, BLOCK_ALIGN))
    }

    fn do_reset(&self) {
        let mut inner = self.inner.lock();
        if inner.region_start == 0 {
            return;
        }
        let size = inner.region_end - inner.region_start;
        let block = inner.region_start as *mut FreeBlock;
        // SAFETY: The region is owned by this resource; every outstanding
        // pointer is invalidated by contract.
        unsafe {
            (*block).size = size;
            (*block).next = ptr::null_mut();
        }
        inner.head = block;
    }

    fn do_coalesce(&self) -> bool {
        let inner = self.inner.lock();
        let mut merged = false;
        let mut cur = inner.head;
        // SAFETY: Free-list nodes are valid while the lock is held.
        unsafe {
            while !cur.is_null() {
                let next = (*cur).next;
                if !next.is_null() && cur as usize + (*cur).size == next as usize {
                    (*cur).size += (*next).size;
                    (*cur).next = (*next).next;
                    merged = true;
                    // Stay on this block: it may now touch the one after.
                } else {
                    cur = next;
                }
            }
        }
        if merged {
            self.sync_free_chunks(&inner);
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::MAX_ALIGN;
    use core::alloc::Layout;
    use proptest::prelude::*;

    /// Runs `f` against a fresh heap of `size` bytes.
    fn with_test_heap<F: FnOnce(&FirstFitResource)>(size: usize, f: F) {
        let layout = Layout::from_size_align(size, BLOCK_ALIGN).unwrap();
        let buf = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!buf.is_null());

        let heap = FirstFitResource::new("test-heap");
        unsafe { heap.init(buf, size) };
        f(&heap);

        unsafe { std::alloc::dealloc(buf, layout) };
    }

    #[test]
    fn statistics_walk() {
        // The canonical counter sequence over a 1 KiB heap.
        with_test_heap(1024, |heap| {
            assert_eq!(heap.state().total_bytes(), 1024);
            assert_eq!(heap.state().free_bytes(), 1024);
            assert_eq!(heap.state().free_chunks(), 1);

            let first = heap.allocate(100, MAX_ALIGN);
            assert!(!first.is_null());
            assert_eq!(heap.state().allocated_bytes(), 100);
            assert_eq!(heap.state().allocated_chunks(), 1);
            assert_eq!(heap.state().max_allocated_bytes(), 100);

            let second = heap.allocate(200, MAX_ALIGN);
            assert!(!second.is_null());
            assert_eq!(heap.state().allocated_bytes(), 300);
            assert_eq!(heap.state().max_allocated_bytes(), 300);

            heap.deallocate(first, 100, MAX_ALIGN);
            assert_eq!(heap.state().allocated_bytes(), 200);
            assert_eq!(heap.state().allocated_chunks(), 1);
            assert_eq!(heap.state().max_allocated_bytes(), 300);

            let third = heap.allocate(50, MAX_ALIGN);
            assert!(!third.is_null());
            assert_eq!(heap.state().allocated_bytes(), 250);
            assert_eq!(heap.state().max_allocated_bytes(), 300);

            heap.deallocate(second, 200, MAX_ALIGN);
            heap.deallocate(third, 50, MAX_ALIGN);
            assert_eq!(heap.state().allocated_bytes(), 0);
        });
    }

    #[test]
    fn respects_alignment() {
        with_test_heap(4096, |heap| {
            let p = heap.allocate(64, 256);
            assert!(!p.is_null());
            assert_eq!(p as usize % 256, 0);
            heap.deallocate(p, 64, 256);
        });
    }

    #[test]
    fn exhaustion_returns_null() {
        with_test_heap(256, |heap| {
            let p = heap.allocate(512, MAX_ALIGN);
            assert!(p.is_null());
            assert_eq!(heap.state().allocated_bytes(), 0);
        });
    }

    #[test]
    fn memory_is_writable() {
        with_test_heap(1024, |heap| {
            let p = heap.allocate(100, MAX_ALIGN);
            assert!(!p.is_null());
            unsafe {
                p.write_bytes(0x5A, 100);
                assert_eq!(*p.add(99), 0x5A);
            }
            heap.deallocate(p, 100, MAX_ALIGN);
        });
    }

    #[test]
    fn free_blocks_coalesce_for_reuse() {
        with_test_heap(1024, |heap| {
            let a = heap.allocate(64, MAX_ALIGN);
            let b = heap.allocate(64, MAX_ALIGN);
            let c = heap.allocate(64, MAX_ALIGN);
            assert!(!a.is_null() && !b.is_null() && !c.is_null());

            // Free B then A: the two must merge so a request larger than
            // either fits.
            heap.deallocate(b, 64, MAX_ALIGN);
            heap.deallocate(a, 64, MAX_ALIGN);

            let big = heap.allocate(150, MAX_ALIGN);
            assert!(!big.is_null(), "coalesced region should fit 150 bytes");

            heap.deallocate(big, 150, MAX_ALIGN);
            heap.deallocate(c, 64, MAX_ALIGN);
        });
    }

    #[test]
    fn full_region_recovers_after_frees() {
        with_test_heap(1024, |heap| {
            let a = heap.allocate(100, MAX_ALIGN);
            let b = heap.allocate(100, MAX_ALIGN);
            heap.deallocate(a, 100, MAX_ALIGN);
            heap.deallocate(b, 100, MAX_ALIGN);

            // Everything merged back: one spanning free chunk.
            assert_eq!(heap.state().free_chunks(), 1);
            let big = heap.allocate(900, MAX_ALIGN);
            assert!(!big.is_null());
            heap.deallocate(big, 900, MAX_ALIGN);
        });
    }

    #[test]
    fn deallocate_with_unknown_size() {
        with_test_heap(1024, |heap| {
            let p = heap.allocate(80, MAX_ALIGN);
            assert_eq!(heap.state().allocated_bytes(), 80);
            // The header recovers the real size.
            heap.deallocate(p, 0, MAX_ALIGN);
            assert_eq!(heap.state().allocated_bytes(), 0);
        });
    }

    #[test]
    fn reset_restores_the_spanning_block() {
        with_test_heap(1024, |heap| {
            let _a = heap.allocate(100, MAX_ALIGN);
            let _b = heap.allocate(100, MAX_ALIGN);
            let peak = heap.state().max_allocated_bytes();

            heap.reset();
            assert_eq!(heap.state().allocated_bytes(), 0);
            assert_eq!(heap.state().free_bytes(), 1024);
            assert_eq!(heap.state().free_chunks(), 1);
            // The high-water mark survives reset.
            assert_eq!(heap.state().max_allocated_bytes(), peak);

            // The whole region is usable again.
            let big = heap.allocate(900, MAX_ALIGN);
            assert!(!big.is_null());
            heap.deallocate(big, 900, MAX_ALIGN);
        });
    }

    #[test]
    fn coalesce_reports_whether_it_merged() {
        with_test_heap(1024, |heap| {
            // Adjacent frees merge eagerly, so an explicit pass finds
            // nothing to do.
            let a = heap.allocate(64, MAX_ALIGN);
            heap.deallocate(a, 64, MAX_ALIGN);
            assert!(!heap.coalesce());
        });
    }

    #[test]
    fn max_size_reflects_the_region() {
        with_test_heap(1024, |heap| {
            let max = heap.max_size();
            assert!(max > 0 && max < 1024);
            // A request of exactly max_size on the empty heap succeeds.
            let p = heap.allocate(max, BLOCK_ALIGN);
            assert!(!p.is_null());
            heap.deallocate(p, max, BLOCK_ALIGN);
        });
    }

    proptest! {
        /// Any sequence of successful alloc/free pairs balances the byte
        /// counter and never lowers the high-water mark.
        #[test]
        fn statistics_balance(sizes in prop::collection::vec(1usize..200, 1..16)) {
            // Plain asserts: proptest reports the panic with the inputs.
            with_test_heap(16 * 1024, |heap| {
                let mut live = Vec::new();
                let mut peak = 0;

                for &size in &sizes {
                    let p = heap.allocate(size, MAX_ALIGN);
                    assert!(!p.is_null());
                    live.push((p, size));
                    let mark = heap.state().max_allocated_bytes();
                    assert!(mark >= peak);
                    peak = mark;
                }

                for (p, size) in live.drain(..) {
                    heap.deallocate(p, size, MAX_ALIGN);
                }
                assert_eq!(heap.state().allocated_bytes(), 0);
                assert_eq!(heap.state().allocated_chunks(), 0);
                assert_eq!(heap.state().max_allocated_bytes(), peak);
            });
        }
    }
}
