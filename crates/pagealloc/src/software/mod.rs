//! Software emulation of the platform for testing and development.
//!
//! Provides host-side stand-ins for everything the allocator consumes from the kernel:
//!
//! - [`EmulatedPlatform`]: page frames split into zones, with live zone counters,
//!   fault injection and a scheduler tick that asks for a yield every few checks.
//! - [`EmulatedProcFs`]: an in-memory control tree that dispatches reads and writes to
//!   the registered handlers.
//! - [`UserArena`]: a flat "user address space" for handlers to copy to and from.

mod memory;
mod procfs;
mod user;

pub use memory::{EmulatedMapping, EmulatedPlatform, ZoneConfig};
pub use procfs::EmulatedProcFs;
pub use user::UserArena;
