//! Platform primitives the allocator is built on.
//!
//! The allocator consumes, but does not implement, the kernel's page allocator, its
//! transient page mapping and the user/kernel copy primitive. These traits are the
//! seam between the two; [`crate::software`] provides an emulated implementation.

use alloc::sync::Arc;
use core::ops::DerefMut;

use crate::{FrameNumber, ZoneDescriptor, ZoneId};

/// The platform's single-page allocator and mapping primitives.
pub trait PageProvider: Send + Sync {
    /// A transient mapping of one page. Unmapped when dropped.
    type Mapping<'a>: DerefMut<Target = [u8]>
    where
        Self: 'a;

    /// Allocates one page from `zone`.
    fn alloc_page(&self, zone: ZoneId) -> Option<FrameNumber>;

    /// Returns a page to the platform.
    fn free_page(&self, frame: FrameNumber);

    /// Maps `frame` into the kernel's address space.
    ///
    /// The mapping covers exactly one page.
    fn map_page(&self, frame: FrameNumber) -> Option<Self::Mapping<'_>>;

    /// Returns the zone list of the node that owns `probe`.
    fn node_zones(&self, probe: FrameNumber) -> &[ZoneDescriptor];

    /// Returns true if the scheduler wants the current task to give up the CPU.
    fn need_resched(&self) -> bool;

    /// Voluntarily yields the CPU.
    fn yield_now(&self);
}

impl<P: PageProvider + ?Sized> PageProvider for Arc<P> {
    type Mapping<'a>
        = P::Mapping<'a>
    where
        Self: 'a;

    fn alloc_page(&self, zone: ZoneId) -> Option<FrameNumber> {
        (**self).alloc_page(zone)
    }

    fn free_page(&self, frame: FrameNumber) {
        (**self).free_page(frame)
    }

    fn map_page(&self, frame: FrameNumber) -> Option<Self::Mapping<'_>> {
        (**self).map_page(frame)
    }

    fn node_zones(&self, probe: FrameNumber) -> &[ZoneDescriptor] {
        (**self).node_zones(probe)
    }

    fn need_resched(&self) -> bool {
        (**self).need_resched()
    }

    fn yield_now(&self) {
        (**self).yield_now()
    }
}

/// Yields if the scheduler asks for it.
#[inline]
pub fn cond_resched<P: PageProvider + ?Sized>(provider: &P) {
    if provider.need_resched() {
        provider.yield_now();
    }
}

/// Errors from the user/kernel copy primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum UserCopyError {
    /// Part of the user range is not mapped in the caller's address space.
    #[error("bad user address {addr:#x} (+{len} bytes)")]
    Fault { addr: u64, len: usize },
}

/// The caller's address space, as seen from a control-file handler.
pub trait UserMemory {
    /// Copies `dst.len()` bytes from user address `src`.
    fn copy_from_user(&self, src: u64, dst: &mut [u8]) -> Result<(), UserCopyError>;

    /// Copies `src` to user address `dst`.
    fn copy_to_user(&self, dst: u64, src: &[u8]) -> Result<(), UserCopyError>;
}
