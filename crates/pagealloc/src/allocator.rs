//! Page block allocation.
//!
//! A block is filled one page at a time from the platform allocator. The zone lock
//! is taken only to claim a registry slot and to install the finished page table;
//! the page allocation calls themselves, and the voluntary yields between them, run
//! without it.

use alloc::vec::Vec;

use crate::registry::{Block, BlockRegistry, IndexPage, PageTable, RegistryError};
use crate::zone::zone_snapshot;
use crate::{
    BlockId, FrameNumber, PAGE_SIZE, PAGES_PER_PAGE, POINTER_SIZE, PageProvider, ZoneDescriptor,
    ZoneId, ZoneSnapshot, cond_resched, resolve_zone_descriptor,
};

/// Errors that can occur while allocating a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    /// A block of zero pages was requested.
    #[error("zero pages requested")]
    ZeroPages,
    /// The zone has no pages left above its reserve.
    #[error("{0} has no pages above its reserve")]
    Exhausted(ZoneId),
    /// Not a single page could be obtained from the platform.
    #[error("out of memory in {0}")]
    OutOfMemory(ZoneId),
    /// The zone's registry has no free slot.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// The result of a successful block allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Id of the new block.
    pub block: BlockId,
    /// Number of logical pages actually allocated. May be less than requested.
    pub pages: usize,
}

/// Number of extra low pages needed to hold the page table of a `pages`-page block.
pub const fn index_overhead(pages: usize) -> usize {
    pages * POINTER_SIZE / PAGE_SIZE + 1
}

/// A filled block whose registry slot is still reserved.
pub(crate) struct PendingBlock {
    zone: ZoneId,
    block: BlockId,
    table: PageTable,
}

impl PendingBlock {
    pub fn block(&self) -> BlockId {
        self.block
    }
}

/// The live counters an allocation is checked against, located once per request.
struct Reserve<'a> {
    low: Option<&'a ZoneDescriptor>,
    high: Option<&'a ZoneDescriptor>,
}

impl<'a> Reserve<'a> {
    fn locate<P: PageProvider + ?Sized>(provider: &'a P, zone: ZoneId) -> Self {
        let locate = |zone| match resolve_zone_descriptor(provider, zone) {
            Ok(descriptor) => Some(descriptor),
            Err(err) => {
                log::debug!("{err}; reporting zero capacity");
                None
            }
        };
        let low = locate(ZoneId::LowMem);
        let high = match zone {
            ZoneId::LowMem => None,
            ZoneId::HighMem => locate(ZoneId::HighMem),
        };
        Self { low, high }
    }

    /// Pages `zone` can still give while keeping one page above its reserve.
    fn budget(&self, zone: ZoneId) -> usize {
        let descriptor = match zone {
            ZoneId::LowMem => self.low,
            ZoneId::HighMem => self.high,
        };
        descriptor.map_or(0, |descriptor| descriptor.snapshot().allocatable())
    }

    fn has_room(&self, zone: ZoneId) -> bool {
        self.budget(zone) > 0
    }
}

/// One zone: its registry behind the zone lock.
pub(crate) struct PageZone {
    pub(crate) registry: spin::Mutex<BlockRegistry>,
}

impl PageZone {
    fn new(zone: ZoneId) -> Self {
        Self {
            registry: spin::Mutex::new(BlockRegistry::new(zone)),
        }
    }
}

/// The two-zone page allocator.
///
/// Owns the per-zone registries and the platform they draw pages from. Every
/// operation names its zone explicitly; the zones never share a lock.
pub struct PageAllocator<P> {
    provider: P,
    zones: [PageZone; 2],
}

impl<P: PageProvider> PageAllocator<P> {
    /// Creates an allocator with empty registries.
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            zones: [PageZone::new(ZoneId::LowMem), PageZone::new(ZoneId::HighMem)],
        }
    }

    /// Returns the platform this allocator draws pages from.
    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub(crate) fn zone(&self, zone: ZoneId) -> &PageZone {
        &self.zones[zone.index()]
    }

    /// Reads the live counters of `zone`; a zone the node lacks reads as empty.
    pub fn zone_snapshot(&self, zone: ZoneId) -> ZoneSnapshot {
        zone_snapshot(&self.provider, zone)
    }

    /// Allocates a block of up to `requested` pages in `zone`.
    ///
    /// Requests larger than the zone can safely give are clamped down rather than
    /// rejected, so callers must use [`Allocation::pages`] rather than assume the
    /// request was met.
    pub fn allocate_block(&self, zone: ZoneId, requested: usize) -> Result<Allocation, AllocError> {
        let pending = self.prepare_block(zone, requested)?;
        Ok(self.install_block(pending))
    }

    /// Fills a block but leaves its slot reserved. Nothing can see or release the
    /// block until it is passed to [`install_block`](Self::install_block).
    pub(crate) fn prepare_block(
        &self,
        zone: ZoneId,
        requested: usize,
    ) -> Result<PendingBlock, AllocError> {
        if requested == 0 {
            return Err(AllocError::ZeroPages);
        }

        let reserve = Reserve::locate(&self.provider, zone);
        let pages = Self::clamp_request(zone, requested, &reserve)?;
        if pages < requested {
            log::debug!("{zone}: clamped request of {requested} pages to {pages}");
        }

        let block = self.zone(zone).registry.lock().reserve_slot()?;

        let table = match zone {
            ZoneId::LowMem => self.fill_direct(pages, &reserve),
            ZoneId::HighMem => self.fill_indexed(pages, &reserve),
        };

        let allocated = table.page_count();
        if allocated == 0 {
            table.release(&self.provider);
            self.zone(zone).registry.lock().cancel(block);
            log::warn!("{zone}: could not allocate a single page");
            return Err(AllocError::OutOfMemory(zone));
        }

        log::debug!("{zone}: filled block {block} with {allocated} of {requested} pages");
        Ok(PendingBlock { zone, block, table })
    }

    /// Makes a prepared block live.
    pub(crate) fn install_block(&self, pending: PendingBlock) -> Allocation {
        let PendingBlock { zone, block, table } = pending;
        let allocation = Allocation {
            block,
            pages: table.page_count(),
        };
        self.zone(zone)
            .registry
            .lock()
            .install(block, Block::new(table));
        allocation
    }

    /// Frees a prepared block's pages and returns its slot to the pool.
    pub(crate) fn abandon_block(&self, pending: PendingBlock) -> usize {
        let PendingBlock { zone, block, table } = pending;
        let freed = table.release(&self.provider);
        self.zone(zone).registry.lock().cancel(block);
        log::debug!("{zone}: abandoned block {block} ({freed} frames)");
        freed
    }

    /// Clamps a request to what the zone can give without touching its reserve,
    /// leaving room for the page table itself.
    fn clamp_request(zone: ZoneId, requested: usize, reserve: &Reserve<'_>) -> Result<usize, AllocError> {
        let low_budget = reserve.budget(ZoneId::LowMem);

        let pages = match zone {
            ZoneId::LowMem => {
                let pages = requested.min(low_budget);
                let overhead = index_overhead(pages);
                if pages + overhead > low_budget {
                    low_budget.saturating_sub(overhead)
                } else {
                    pages
                }
            }
            ZoneId::HighMem => {
                let pages = requested.min(reserve.budget(ZoneId::HighMem));
                // Index pages come out of low memory.
                let index_budget = low_budget.saturating_sub(index_overhead(pages));
                pages.min(index_budget * PAGES_PER_PAGE)
            }
        };

        if pages == 0 {
            log::warn!("{zone}: no pages available above the reserve");
            return Err(AllocError::Exhausted(zone));
        }
        Ok(pages)
    }

    /// Allocates up to `pages` low pages, stopping at the first failure.
    ///
    /// The zone's reserve is checked again before every page; concurrent fills draw on
    /// the same budget the request was clamped against.
    fn fill_direct(&self, pages: usize, reserve: &Reserve<'_>) -> PageTable {
        let mut frames = Vec::with_capacity(pages);
        while frames.len() < pages {
            if !reserve.has_room(ZoneId::LowMem) {
                log::debug!("low_mem: reserve reached after {} pages", frames.len());
                break;
            }
            let Some(frame) = self.provider.alloc_page(ZoneId::LowMem) else {
                log::debug!("low_mem: page allocation failed after {} pages", frames.len());
                break;
            };
            frames.push(frame);
            cond_resched(&self.provider);
        }
        PageTable::Direct(frames)
    }

    /// Allocates up to `pages` high pages, referenced through low index pages.
    ///
    /// If a high page cannot be allocated the index page being filled is kept with
    /// whatever prefix it already holds.
    fn fill_indexed(&self, pages: usize, reserve: &Reserve<'_>) -> PageTable {
        let mut index_pages = Vec::with_capacity(pages.div_ceil(PAGES_PER_PAGE));
        let mut remaining = pages;

        while remaining > 0 {
            if !reserve.has_room(ZoneId::LowMem) {
                log::debug!("high_mem: low reserve reached, no room for an index page");
                break;
            }
            let Some(frame) = self.provider.alloc_page(ZoneId::LowMem) else {
                log::debug!("high_mem: index page allocation failed");
                break;
            };
            self.zero_page(frame);
            cond_resched(&self.provider);

            let mut index = IndexPage::new(frame);
            let mut exhausted = false;
            while remaining > 0 && !index.is_full() {
                let high = if reserve.has_room(ZoneId::HighMem) {
                    self.provider.alloc_page(ZoneId::HighMem)
                } else {
                    None
                };
                match high {
                    Some(high) => {
                        index.push(high);
                        remaining -= 1;
                        cond_resched(&self.provider);
                    }
                    None => {
                        log::debug!("high_mem: page allocation failed with {remaining} to go");
                        exhausted = true;
                        break;
                    }
                }
            }

            if index.is_empty() {
                self.provider.free_page(index.frame());
            } else {
                index_pages.push(index);
            }
            if exhausted {
                break;
            }
        }

        PageTable::Indexed(index_pages)
    }

    fn zero_page(&self, frame: FrameNumber) {
        if let Some(mut page) = self.provider.map_page(frame) {
            page.fill(0);
        }
    }

    /// Returns true iff `page_number + sector` lies inside block `block` of `zone`.
    pub fn verify_memory_range(
        &self,
        zone: ZoneId,
        page_number: u64,
        sector: u64,
        block: BlockId,
    ) -> bool {
        self.zone(zone)
            .registry
            .lock()
            .verify_memory_range(page_number, sector, block)
    }

    /// Returns the first free block id of `zone`.
    pub fn find_free_slot(&self, zone: ZoneId) -> Result<BlockId, RegistryError> {
        self.zone(zone).registry.lock().find_free_slot()
    }

    /// Releases block `block` of `zone` and returns how many frames were freed.
    ///
    /// Releasing an empty slot is a no-op that returns zero.
    pub fn release_block(&self, zone: ZoneId, block: BlockId) -> usize {
        match self.detach_block(zone, block) {
            Some(taken) => self.free_detached(zone, block, taken),
            None => 0,
        }
    }

    /// Removes a live block from the registry without freeing its pages.
    pub(crate) fn detach_block(&self, zone: ZoneId, block: BlockId) -> Option<Block> {
        let taken = self.zone(zone).registry.lock().take(block);
        if taken.is_none() {
            log::trace!("{zone}: block {block} is not allocated");
        }
        taken
    }

    /// Frees the pages of a block removed by [`detach_block`](Self::detach_block).
    pub(crate) fn free_detached(&self, zone: ZoneId, block: BlockId, taken: Block) -> usize {
        let pages = taken.page_count();
        let freed = taken.release(&self.provider);
        log::debug!("{zone}: released block {block} ({pages} pages, {freed} frames)");
        freed
    }

    /// Releases every listed block of `zone` and returns the total frames freed.
    pub fn release_blocks(&self, zone: ZoneId, blocks: impl IntoIterator<Item = BlockId>) -> usize {
        blocks
            .into_iter()
            .map(|block| self.release_block(zone, block))
            .sum()
    }

    /// Returns the live blocks of `zone` and their page counts.
    pub fn live_blocks(&self, zone: ZoneId) -> Vec<(BlockId, usize)> {
        self.zone(zone).registry.lock().live_blocks().collect()
    }

    /// Returns the number of pages in block `block` of `zone`.
    pub fn allocated_pages(&self, zone: ZoneId, block: BlockId) -> usize {
        self.zone(zone).registry.lock().allocated_pages(block)
    }
}
