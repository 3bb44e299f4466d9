//! Kernel memory resources.
//!
//! A pluggable byte-allocator layer for kernel objects that are not
//! statically constructed: the [`MemoryResource`] capability set with
//! statistics and an out-of-memory hook, concrete resources backed by the
//! global allocator ([`MallocResource`]) or a caller-supplied region
//! ([`FirstFitResource`]), and [`core::alloc::Allocator`] adapters for
//! container-shaped consumers.
//!
//! Queues never allocate; this layer exists for everything above them.

pub mod allocator;
pub mod first_fit;
pub mod malloc;
pub mod resource;

pub use allocator::{DefaultResourceAllocator, SyncResourceAllocator, allocate_unique};
pub use first_fit::FirstFitResource;
pub use malloc::MallocResource;
pub use resource::{
    MemoryResource, OutOfMemoryHandler, ResourceState, default_resource, malloc_resource,
    set_default_resource,
};

/// The largest alignment any resource must honour, and the fallback when a
/// caller passes an unsupported one.
pub const MAX_ALIGN: usize = 16;

/// Rounds `size` up to a multiple of `align`.
///
/// `align` must be a power of two.
#[inline]
pub const fn align_up(size: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (size + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn align_up_identity_when_aligned() {
        assert_eq!(align_up(0x1000, 16), 0x1000);
        assert_eq!(align_up(0, 8), 0);
    }

    #[test]
    fn align_up_rounds_upward() {
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(17, 16), 32);
        assert_eq!(align_up(100, 64), 128);
    }

    proptest! {
        /// The three laws: result >= size, result is a multiple of align,
        /// and less than one whole align of padding was added.
        #[test]
        fn align_up_laws(size in 0usize..1 << 40, shift in 0u32..16) {
            let align = 1usize << shift;
            let aligned = align_up(size, align);
            prop_assert!(aligned >= size);
            prop_assert_eq!(aligned % align, 0);
            prop_assert!(aligned - size < align);
        }
    }
}
