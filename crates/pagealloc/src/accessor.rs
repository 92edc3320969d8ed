//! Mapped page access.
//!
//! The only place page contents are copied. The whole resolve/map/copy/unmap
//! sequence runs with the zone lock held so a block cannot be released under it.

use crate::{BlockId, PAGE_SIZE, PageAllocator, PageProvider, ZoneId};

/// Direction and buffer of a page transfer.
pub enum Transfer<'a> {
    /// Copy from the page into the buffer.
    Read(&'a mut [u8]),
    /// Copy from the buffer into the page.
    Write(&'a [u8]),
}

impl Transfer<'_> {
    /// Returns the number of bytes the caller asked to move.
    pub fn len(&self) -> usize {
        match self {
            Transfer::Read(buffer) => buffer.len(),
            Transfer::Write(buffer) => buffer.len(),
        }
    }

    /// Returns true if the transfer moves no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<P: PageProvider> PageAllocator<P> {
    /// Copies between logical page `logical_page` of a block and the transfer buffer.
    ///
    /// At most one page is moved. Returns the number of bytes copied: zero when the
    /// page is outside the block, the slot is empty, or the page cannot be mapped.
    pub fn access_page(
        &self,
        zone: ZoneId,
        block: BlockId,
        logical_page: u64,
        transfer: Transfer<'_>,
    ) -> usize {
        let registry = self.zone(zone).registry.lock();

        if !registry.verify_memory_range(logical_page, 0, block) {
            log::trace!("{zone}: page {logical_page} is outside block {block}");
            return 0;
        }

        let Some(frame) = registry
            .block(block)
            .and_then(|live| live.table().resolve(logical_page as usize))
        else {
            return 0;
        };

        let Some(mut page) = self.provider().map_page(frame) else {
            log::warn!("{zone}: failed to map {frame:?}");
            return 0;
        };

        let size = transfer.len().min(PAGE_SIZE);
        match transfer {
            Transfer::Read(buffer) => buffer[..size].copy_from_slice(&page[..size]),
            Transfer::Write(buffer) => page[..size].copy_from_slice(&buffer[..size]),
        }
        size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::software::{EmulatedPlatform, ZoneConfig};
    use crate::{FrameNumber, PAGES_PER_PAGE};

    fn allocator() -> PageAllocator<EmulatedPlatform> {
        PageAllocator::new(EmulatedPlatform::new(&[
            ZoneConfig::new(ZoneId::LowMem, 1000, 100),
            ZoneConfig::new(ZoneId::HighMem, PAGES_PER_PAGE * 2 + 32, 16),
        ]))
    }

    fn fill(allocator: &PageAllocator<EmulatedPlatform>, zone: ZoneId, block: BlockId, pages: usize, byte: u8) {
        let pattern = [byte; PAGE_SIZE];
        for page in 0..pages as u64 {
            assert_eq!(
                allocator.access_page(zone, block, page, Transfer::Write(&pattern)),
                PAGE_SIZE
            );
        }
    }

    fn assert_filled(allocator: &PageAllocator<EmulatedPlatform>, zone: ZoneId, block: BlockId, pages: usize, byte: u8) {
        let mut buffer = [0u8; PAGE_SIZE];
        for page in 0..pages as u64 {
            assert_eq!(
                allocator.access_page(zone, block, page, Transfer::Read(&mut buffer)),
                PAGE_SIZE
            );
            assert!(buffer.iter().all(|&b| b == byte), "page {page} of {zone}");
        }
    }

    #[test]
    fn low_round_trip() {
        let allocator = allocator();
        let free_before = allocator.provider().free_pages(ZoneId::LowMem);

        let allocation = allocator.allocate_block(ZoneId::LowMem, 10).unwrap();
        assert_eq!(allocation.pages, 10);

        fill(&allocator, ZoneId::LowMem, allocation.block, 10, 0xAA);
        assert_filled(&allocator, ZoneId::LowMem, allocation.block, 10, 0xAA);

        allocator.release_block(ZoneId::LowMem, allocation.block);
        assert_eq!(allocator.provider().free_pages(ZoneId::LowMem), free_before);
    }

    #[test]
    fn high_round_trip_across_index_boundary() {
        let allocator = allocator();
        let pages = PAGES_PER_PAGE + 3;

        let allocation = allocator.allocate_block(ZoneId::HighMem, pages).unwrap();
        assert_eq!(allocation.pages, pages);

        fill(&allocator, ZoneId::HighMem, allocation.block, pages, 0x5C);
        assert_filled(&allocator, ZoneId::HighMem, allocation.block, pages, 0x5C);
    }

    #[test]
    fn distinct_pages_across_index_pages() {
        let allocator = allocator();
        let allocation = allocator
            .allocate_block(ZoneId::HighMem, PAGES_PER_PAGE + 1)
            .unwrap();

        let (first, second) = {
            let registry = allocator.zone(ZoneId::HighMem).registry.lock();
            let table = registry.block(allocation.block).unwrap().table();
            (table.resolve(0), table.resolve(PAGES_PER_PAGE))
        };
        let first: FrameNumber = first.unwrap();
        let second: FrameNumber = second.unwrap();
        assert_ne!(first, second);

        allocator.access_page(ZoneId::HighMem, allocation.block, 0, Transfer::Write(&[1; 16]));
        allocator.access_page(
            ZoneId::HighMem,
            allocation.block,
            PAGES_PER_PAGE as u64,
            Transfer::Write(&[2; 16]),
        );

        let mut buffer = [0u8; 16];
        allocator.access_page(ZoneId::HighMem, allocation.block, 0, Transfer::Read(&mut buffer));
        assert_eq!(buffer, [1; 16]);
    }

    #[test]
    fn out_of_range_access_moves_nothing() {
        let allocator = allocator();
        let target = allocator.allocate_block(ZoneId::LowMem, 4).unwrap().block;
        let neighbour = allocator.allocate_block(ZoneId::LowMem, 4).unwrap().block;
        fill(&allocator, ZoneId::LowMem, neighbour, 4, 0x11);

        let pattern = [0xFF; PAGE_SIZE];
        assert_eq!(
            allocator.access_page(ZoneId::LowMem, target, 4, Transfer::Write(&pattern)),
            0
        );
        assert_eq!(
            allocator.access_page(ZoneId::LowMem, target, u64::MAX, Transfer::Write(&pattern)),
            0
        );

        let mut buffer = [0u8; PAGE_SIZE];
        assert_eq!(
            allocator.access_page(ZoneId::LowMem, target, 4, Transfer::Read(&mut buffer)),
            0
        );
        assert_filled(&allocator, ZoneId::LowMem, neighbour, 4, 0x11);
    }

    #[test]
    fn access_to_released_block_moves_nothing() {
        let allocator = allocator();
        let block = allocator.allocate_block(ZoneId::LowMem, 2).unwrap().block;
        allocator.release_block(ZoneId::LowMem, block);

        let mut buffer = [0u8; 8];
        assert_eq!(
            allocator.access_page(ZoneId::LowMem, block, 0, Transfer::Read(&mut buffer)),
            0
        );
    }

    #[test]
    fn transfer_is_bounded_to_one_page() {
        let allocator = allocator();
        let block = allocator.allocate_block(ZoneId::LowMem, 2).unwrap().block;

        let oversized = alloc::vec![0x42u8; PAGE_SIZE * 2];
        assert_eq!(
            allocator.access_page(ZoneId::LowMem, block, 0, Transfer::Write(&oversized)),
            PAGE_SIZE
        );

        let mut partial = [0u8; 100];
        assert_eq!(
            allocator.access_page(ZoneId::LowMem, block, 0, Transfer::Read(&mut partial)),
            100
        );
        assert!(partial.iter().all(|&b| b == 0x42));
        assert_filled(&allocator, ZoneId::LowMem, block, 1, 0x42);
    }
}
