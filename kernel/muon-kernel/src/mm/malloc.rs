//! Memory resource backed by the global allocator.
//!
//! The bare-metal image routes this at whatever `#[global_allocator]` the
//! kernel heap installs; on the host it is the system malloc. Rust's
//! deallocation interface needs the original layout back, so each block
//! carries a small header recording the requested size and alignment —
//! which also lets `deallocate(addr, 0, _)` (size unknown) work and keeps
//! the statistics exact.

use alloc::alloc::{alloc, dealloc};
use core::alloc::Layout;
use core::ptr;

use super::resource::{MemoryResource, ResourceState};

/// Per-block bookkeeping, stored in the padding in front of the payload.
#[repr(C)]
#[derive(Clone, Copy)]
struct BlockHeader {
    /// Requested payload size in bytes.
    bytes: usize,
    /// Offset from the raw allocation to the payload (= the layout
    /// alignment actually used).
    offset: usize,
}

const HEADER_SIZE: usize = size_of::<BlockHeader>();

/// Payload offset and layout alignment for a request: large enough for the
/// header, aligned enough for the payload.
fn payload_offset(align: usize) -> usize {
    align.max(HEADER_SIZE)
}

/// A [`MemoryResource`] delegating to the global allocator.
///
/// Unbounded from the resource's point of view: `total_bytes` and
/// `max_size` stay 0 (unknown).
pub struct MallocResource {
    state: ResourceState,
}

impl MallocResource {
    /// Creates the resource. Usable in `static` items.
    pub const fn new() -> Self {
        Self {
            state: ResourceState::new("malloc"),
        }
    }
}

impl Default for MallocResource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryResource for MallocResource {
    fn state(&self) -> &ResourceState {
        &self.state
    }

    fn do_allocate(&self, bytes: usize, align: usize) -> *mut u8 {
        let offset = payload_offset(align);
        let Ok(layout) = Layout::from_size_align(offset.saturating_add(bytes), offset) else {
            return ptr::null_mut();
        };

        // SAFETY: The layout has non-zero size (offset >= HEADER_SIZE).
        let raw = unsafe { alloc(layout) };
        if raw.is_null() {
            return ptr::null_mut();
        }

        // SAFETY: `raw + offset` is in bounds of the allocation, and the
        // header lands in the reserved padding directly below the payload.
        unsafe {
            let payload = raw.add(offset);
            (payload.sub(HEADER_SIZE) as *mut BlockHeader).write(BlockHeader { bytes, offset });
            payload
        }
    }

    fn do_deallocate(&self, addr: *mut u8, bytes: usize, _align: usize) -> usize {
        // SAFETY: `addr` came from do_allocate, so the header sits right
        // below it and describes the original layout.
        unsafe {
            let header = (addr.sub(HEADER_SIZE) as *const BlockHeader).read();
            debug_assert!(bytes == 0 || bytes == header.bytes);

            let raw = addr.sub(header.offset);
            // SAFETY: This layout was validated when the block was made.
            let layout =
                Layout::from_size_align_unchecked(header.offset + header.bytes, header.offset);
            dealloc(raw, layout);
            header.bytes
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::MAX_ALIGN;

    #[test]
    fn allocate_and_free() {
        let res = MallocResource::new();
        let p = res.allocate(128, MAX_ALIGN);
        assert!(!p.is_null());
        // The memory is usable.
        unsafe {
            p.write_bytes(0xAB, 128);
            assert_eq!(*p, 0xAB);
        }
        res.deallocate(p, 128, MAX_ALIGN);
        assert_eq!(res.state().allocated_bytes(), 0);
    }

    #[test]
    fn honours_large_alignment() {
        let res = MallocResource::new();
        let p = res.allocate(64, 256);
        assert!(!p.is_null());
        assert_eq!(p as usize % 256, 0);
        res.deallocate(p, 64, 256);
    }

    #[test]
    fn deallocate_with_unknown_size() {
        let res = MallocResource::new();
        let p = res.allocate(100, MAX_ALIGN);
        assert!(!p.is_null());
        assert_eq!(res.state().allocated_bytes(), 100);

        // Size 0 = "don't know": the header supplies the real figure.
        res.deallocate(p, 0, MAX_ALIGN);
        assert_eq!(res.state().allocated_bytes(), 0);
        assert_eq!(res.state().allocated_chunks(), 0);
    }

    #[test]
    fn zero_byte_allocation() {
        let res = MallocResource::new();
        let p = res.allocate(0, MAX_ALIGN);
        assert!(!p.is_null());
        res.deallocate(p, 0, MAX_ALIGN);
    }

    #[test]
    fn max_size_is_unknown() {
        let res = MallocResource::new();
        assert_eq!(res.max_size(), 0);
        assert_eq!(res.state().total_bytes(), 0);
    }

    #[test]
    fn high_water_mark_tracks_peak() {
        let res = MallocResource::new();
        let a = res.allocate(300, MAX_ALIGN);
        let b = res.allocate(200, MAX_ALIGN);
        assert_eq!(res.state().max_allocated_bytes(), 500);
        res.deallocate(a, 300, MAX_ALIGN);
        res.deallocate(b, 200, MAX_ALIGN);

        let c = res.allocate(50, MAX_ALIGN);
        assert_eq!(res.state().max_allocated_bytes(), 500);
        res.deallocate(c, 50, MAX_ALIGN);
    }
}
