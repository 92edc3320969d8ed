#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Burn-in page allocator
//!
//! A two-zone page allocator driven entirely through procfs-style control files. It
//! provides:
//!
//! - Block allocation from the low (directly addressable) and high memory zones, with
//!   high-memory pages tracked through low "index" pages.
//! - Bounded, mapped page reads and writes on behalf of user-space diagnostics.
//! - A control-file tree (`allocate_pages`, `<id>_read`, `<id>_write`, `free_pages`)
//!   that translates file writes into allocate / access / release operations.
//! - Software emulation of the platform (page frames, procfs, user memory) for testing
//!   outside a kernel.

extern crate alloc;

mod accessor;
mod allocator;
mod module;
mod numbers;
mod platform;
mod procfs;
mod protocol;
mod registry;
mod surface;
mod zone;

#[cfg(any(test, feature = "software-emulation"))]
pub mod software;

pub use accessor::Transfer;
pub use allocator::{AllocError, Allocation, PageAllocator, index_overhead};
pub use module::{DEFAULT_ROOT, InitError, ModuleConfig, PageAllocModule};
pub use numbers::{BlockId, FrameNumber};
pub use platform::{PageProvider, UserCopyError, UserMemory, cond_resched};
pub use procfs::{ControlFile, FileMode, NodeId, ProcEntry, ProcError, ProcFs};
pub use protocol::{
    BlockBitmap, FreeRequest, LIBERATOR_SIZE, PAGE_REQUEST_SIZE, PageRequest, ProtocolError,
    parse_page_count,
};
pub use registry::{Block, BlockRegistry, IndexPage, PageTable, RegistryError};
pub use surface::SurfaceError;
pub use zone::{ZoneDescriptor, ZoneError, ZoneId, ZoneSnapshot, resolve_zone_descriptor};

/// Size of a page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Size of a page handle as stored in an index page.
pub const POINTER_SIZE: usize = core::mem::size_of::<usize>();

/// Number of high-memory page references a single index page holds.
pub const PAGES_PER_PAGE: usize = PAGE_SIZE / POINTER_SIZE;

/// Number of block slots in each zone's registry.
pub const MAX_PAGE_BLOCKS: usize = 128;
