//! Frame and block number types.
//!
//! Newtypes for the opaque page handles returned by the platform and for the small
//! integer identifiers that name a block inside a zone's registry.

use core::fmt;

use crate::MAX_PAGE_BLOCKS;

/// Macro to define common number newtype functionality.
///
/// Generates the structure, raw accessors and formatting shared by frame and block
/// numbers.
macro_rules! impl_number_common {
    ($name:ident, $repr:ty, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name($repr);

        impl $name {
            /// Returns the raw number as an index.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

impl_number_common!(
    FrameNumber,
    usize,
    "A physical page frame handed out by the platform's page allocator.\n\n\
     The allocator never interprets the number; it is only passed back to the platform\n\
     to map or free the frame."
);

impl FrameNumber {
    /// Creates a new frame number.
    #[inline]
    pub const fn new(number: usize) -> Self {
        Self(number)
    }
}

impl_number_common!(
    BlockId,
    u16,
    "Identifier of a block within a zone's registry.\n\n\
     Always below [`MAX_PAGE_BLOCKS`]; unique within its zone while the block is live."
);

impl BlockId {
    /// Creates a block id, returning `None` if it is outside the registry.
    #[inline]
    pub const fn new(id: usize) -> Option<Self> {
        if id < MAX_PAGE_BLOCKS {
            Some(Self(id as u16))
        } else {
            None
        }
    }

    /// Creates a block id from its wire representation.
    #[inline]
    pub const fn from_wire(id: u16) -> Option<Self> {
        Self::new(id as usize)
    }

    /// Returns the wire representation of this id.
    #[inline]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Iterates over every id a registry can hold.
    pub fn all() -> impl Iterator<Item = BlockId> {
        (0..MAX_PAGE_BLOCKS as u16).map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_id_bounds() {
        assert!(BlockId::new(0).is_some());
        assert!(BlockId::new(MAX_PAGE_BLOCKS - 1).is_some());
        assert!(BlockId::new(MAX_PAGE_BLOCKS).is_none());
        assert!(BlockId::from_wire(u16::MAX).is_none());
    }

    #[test]
    fn block_id_all_covers_registry() {
        assert_eq!(BlockId::all().count(), MAX_PAGE_BLOCKS);
        assert_eq!(BlockId::all().last().map(BlockId::as_usize), Some(MAX_PAGE_BLOCKS - 1));
    }

    #[test]
    fn formats() {
        let frame = FrameNumber::new(42);
        assert_eq!(format!("{:?}", frame), "FrameNumber(42)");
        assert_eq!(format!("{}", frame), "42");

        let block = BlockId::new(7).unwrap();
        assert_eq!(format!("{:?}", block), "BlockId(7)");
        assert_eq!(block.as_u16(), 7);
    }
}
