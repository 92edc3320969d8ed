//! Memory zones and the zone locator.
//!
//! The platform keeps one live [`ZoneDescriptor`] per zone on each memory node. The
//! allocator never owns a descriptor; it locates one through a throwaway probe page
//! and reads its counters.

use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::PageProvider;

/// The memory zones the allocator manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ZoneId {
    /// Memory the kernel can address directly.
    LowMem = 0,
    /// Memory that must be mapped before it can be touched.
    HighMem = 1,
}

impl ZoneId {
    /// Every zone, in control-tree creation order.
    pub const ALL: [ZoneId; 2] = [ZoneId::LowMem, ZoneId::HighMem];

    /// Returns the index of this zone in per-zone tables.
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Returns the name of this zone's control directory.
    pub const fn dir_name(self) -> &'static str {
        match self {
            ZoneId::LowMem => "low_mem",
            ZoneId::HighMem => "high_mem",
        }
    }

    /// Returns the `mem_type` value used for this zone on the wire.
    pub const fn mem_type(self) -> i32 {
        self as i32
    }

    /// Parses a wire `mem_type` value.
    pub const fn from_mem_type(mem_type: i32) -> Option<Self> {
        match mem_type {
            0 => Some(ZoneId::LowMem),
            1 => Some(ZoneId::HighMem),
            _ => None,
        }
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Live per-zone counters, owned by the platform.
///
/// Modeled after the kernel's `struct zone`: the free count moves as pages are
/// allocated and freed, the minimum is the watermark allocations must respect.
#[derive(Debug)]
pub struct ZoneDescriptor {
    id: ZoneId,
    free_pages: AtomicUsize,
    min_pages: AtomicUsize,
}

impl ZoneDescriptor {
    /// Creates a descriptor with the given counters.
    pub const fn new(id: ZoneId, free_pages: usize, min_pages: usize) -> Self {
        Self {
            id,
            free_pages: AtomicUsize::new(free_pages),
            min_pages: AtomicUsize::new(min_pages),
        }
    }

    /// Returns the zone this descriptor belongs to.
    pub fn id(&self) -> ZoneId {
        self.id
    }

    /// Returns the current number of free pages.
    pub fn free_pages(&self) -> usize {
        self.free_pages.load(Ordering::Acquire)
    }

    /// Returns the minimum number of pages that must stay free.
    pub fn min_pages(&self) -> usize {
        self.min_pages.load(Ordering::Acquire)
    }

    /// Reads both counters.
    ///
    /// The two loads are independent, so a snapshot taken while pages move may be torn.
    /// Status reporting tolerates that.
    pub fn snapshot(&self) -> ZoneSnapshot {
        ZoneSnapshot {
            free_pages: self.free_pages(),
            min_pages: self.min_pages(),
        }
    }

    /// Records that a page left the free pool (platform side).
    pub fn page_taken(&self) {
        self.free_pages.fetch_sub(1, Ordering::AcqRel);
    }

    /// Records that a page returned to the free pool (platform side).
    pub fn page_returned(&self) {
        self.free_pages.fetch_add(1, Ordering::AcqRel);
    }
}

/// A point-in-time copy of a zone's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ZoneSnapshot {
    pub free_pages: usize,
    pub min_pages: usize,
}

impl ZoneSnapshot {
    /// Counters of a zone that could not be located.
    pub const EMPTY: ZoneSnapshot = ZoneSnapshot {
        free_pages: 0,
        min_pages: 0,
    };

    /// Largest number of pages that can be taken while keeping one page above the
    /// reserve.
    pub const fn allocatable(&self) -> usize {
        self.free_pages
            .saturating_sub(self.min_pages)
            .saturating_sub(1)
    }
}

/// Errors from the zone locator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ZoneError {
    /// The node has no zone of the requested kind, or the probe page could not be
    /// allocated.
    #[error("no {0} zone found")]
    NotFound(ZoneId),
}

/// Locates the live descriptor for `zone`.
///
/// A probe page is allocated only to discover the zone list of the node it came from
/// and is released before returning.
pub fn resolve_zone_descriptor<P: PageProvider + ?Sized>(
    provider: &P,
    zone: ZoneId,
) -> Result<&ZoneDescriptor, ZoneError> {
    let probe = provider
        .alloc_page(ZoneId::LowMem)
        .ok_or(ZoneError::NotFound(zone))?;
    let descriptor = provider
        .node_zones(probe)
        .iter()
        .find(|descriptor| descriptor.id() == zone);
    provider.free_page(probe);
    descriptor.ok_or(ZoneError::NotFound(zone))
}

/// Reads the counters of `zone`, treating a missing zone as having no capacity.
pub(crate) fn zone_snapshot<P: PageProvider + ?Sized>(provider: &P, zone: ZoneId) -> ZoneSnapshot {
    match resolve_zone_descriptor(provider, zone) {
        Ok(descriptor) => descriptor.snapshot(),
        Err(err) => {
            log::debug!("{err}; reporting zero capacity");
            ZoneSnapshot::EMPTY
        }
    }
}
