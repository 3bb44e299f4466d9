//! `core::alloc::Allocator` adapters over memory resources.
//!
//! Container-shaped consumers (boxes, vectors, the odd kernel object that
//! wants in-place construction) talk the allocator API; these adapters
//! bridge it to [`MemoryResource`].
//!
//! Requests larger than a resource's known `max_size` are rejected as
//! invalid arguments — without consulting the out-of-memory handler, which
//! could not possibly help.

use alloc::boxed::Box;
use core::alloc::{AllocError, Allocator, Layout};
use core::marker::PhantomData;
use core::ptr::NonNull;

use crate::sched::SchedCriticalSection;

use super::resource::{MemoryResource, default_resource};

fn allocate_from(resource: &dyn MemoryResource, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
    let max = resource.max_size();
    if max != 0 && layout.size() > max {
        // Invalid argument, not exhaustion.
        return Err(AllocError);
    }
    let addr = resource.allocate(layout.size(), layout.align());
    match NonNull::new(addr) {
        Some(addr) => Ok(NonNull::slice_from_raw_parts(addr, layout.size())),
        None => Err(AllocError),
    }
}

/// Stateless allocator over the process default resource.
///
/// Every call fetches the *current* default, so an allocator value made
/// before boot installed the real resource still does the right thing.
/// Calls run inside a scheduler critical section: the default resource's
/// bookkeeping is not assumed self-synchronising against preemption.
#[derive(Clone, Copy, Default, Debug)]
pub struct DefaultResourceAllocator;

unsafe impl Allocator for DefaultResourceAllocator {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        let _cs = SchedCriticalSection::enter();
        allocate_from(default_resource(), layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        let _cs = SchedCriticalSection::enter();
        default_resource().deallocate(ptr.as_ptr(), layout.size(), layout.align());
    }
}

/// A scoped lock an allocator holds across each call.
pub trait Locker {
    /// The guard; dropped when the call finishes.
    type Guard;

    /// Acquires the lock.
    fn acquire() -> Self::Guard;
}

/// No locking: for single-threaded or externally synchronised contexts.
#[derive(Clone, Copy, Default, Debug)]
pub struct NullLocker;

impl Locker for NullLocker {
    type Guard = ();

    fn acquire() {}
}

/// Scheduler critical section: for resources shared between preemptible
/// threads.
#[derive(Clone, Copy, Default, Debug)]
pub struct SchedLocker;

impl Locker for SchedLocker {
    type Guard = SchedCriticalSection;

    fn acquire() -> SchedCriticalSection {
        SchedCriticalSection::enter()
    }
}

/// Allocator bound to one resource, holding a [`Locker`] across each call.
///
/// The lock policy is a type parameter so the same kernel object code can
/// run lock-free in a single-threaded context ([`NullLocker`]) or under
/// the scheduler critical section ([`SchedLocker`]).
pub struct SyncResourceAllocator<L: Locker = NullLocker> {
    resource: &'static dyn MemoryResource,
    _locker: PhantomData<L>,
}

impl<L: Locker> SyncResourceAllocator<L> {
    /// Binds the allocator to `resource`.
    pub fn new(resource: &'static dyn MemoryResource) -> Self {
        Self {
            resource,
            _locker: PhantomData,
        }
    }

    /// Binds the allocator to whatever the default resource is right now.
    pub fn from_default() -> Self {
        Self::new(default_resource())
    }

    /// The bound resource.
    pub fn resource(&self) -> &'static dyn MemoryResource {
        self.resource
    }
}

impl<L: Locker> Clone for SyncResourceAllocator<L> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<L: Locker> Copy for SyncResourceAllocator<L> {}

impl<L: Locker> PartialEq for SyncResourceAllocator<L> {
    /// Adapters are equal iff their resources are: blocks may then flow
    /// between them.
    fn eq(&self, other: &Self) -> bool {
        self.resource.is_equal(other.resource)
    }
}

unsafe impl<L: Locker> Allocator for SyncResourceAllocator<L> {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        let _guard = L::acquire();
        allocate_from(self.resource, layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        let _guard = L::acquire();
        self.resource
            .deallocate(ptr.as_ptr(), layout.size(), layout.align());
    }
}

/// Allocates one `T` from `allocator`, constructed in place, returned as
/// an owning box whose drop frees through a copy of the same allocator.
///
/// On failure the value is dropped and nothing leaks.
pub fn allocate_unique<T, A: Allocator>(allocator: A, value: T) -> Result<Box<T, A>, AllocError> {
    Box::try_new_in(value, allocator)
}
