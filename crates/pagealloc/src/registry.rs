//! Per-zone block registry.
//!
//! Each zone keeps a fixed table of [`MAX_PAGE_BLOCKS`] slots. A slot is either free,
//! reserved by an allocation that is still filling its page table, or owns a live
//! [`Block`]. The registry is only touched with its zone's lock held; it exclusively
//! owns every page handle of the blocks it tracks.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::{BlockId, FrameNumber, MAX_PAGE_BLOCKS, PAGES_PER_PAGE, PageProvider, ZoneId};

/// Errors from registry slot management.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Every slot in the zone is in use.
    #[error("all {MAX_PAGE_BLOCKS} block slots of {0} are in use")]
    Full(ZoneId),
}

/// A low page whose contents reference up to [`PAGES_PER_PAGE`] high pages.
///
/// Entries are filled front to back; the first empty entry terminates the list.
pub struct IndexPage {
    frame: FrameNumber,
    entries: Box<[Option<FrameNumber>]>,
}

impl IndexPage {
    /// Creates an empty index page backed by the low page `frame`.
    pub fn new(frame: FrameNumber) -> Self {
        Self {
            frame,
            entries: alloc::vec![None; PAGES_PER_PAGE].into_boxed_slice(),
        }
    }

    /// Returns the low page backing this index page.
    pub fn frame(&self) -> FrameNumber {
        self.frame
    }

    /// Returns the high page in `slot`, or `None` past the end of the list.
    pub fn get(&self, slot: usize) -> Option<FrameNumber> {
        self.entries.get(slot).copied().flatten()
    }

    /// Returns the number of high pages referenced.
    pub fn len(&self) -> usize {
        self.frames().count()
    }

    /// Returns true if no high page is referenced.
    pub fn is_empty(&self) -> bool {
        self.get(0).is_none()
    }

    /// Returns true if every entry is in use.
    pub fn is_full(&self) -> bool {
        self.entries.last().is_some_and(Option::is_some)
    }

    /// Appends a high page. Returns false if the page is full.
    pub fn push(&mut self, frame: FrameNumber) -> bool {
        match self.entries.iter_mut().find(|entry| entry.is_none()) {
            Some(entry) => {
                *entry = Some(frame);
                true
            }
            None => false,
        }
    }

    /// Iterates over the referenced high pages.
    pub fn frames(&self) -> impl Iterator<Item = FrameNumber> + '_ {
        self.entries.iter().map_while(|entry| *entry)
    }
}

/// The page handles owned by a block.
pub enum PageTable {
    /// Low memory: one entry per logical page.
    Direct(Vec<FrameNumber>),
    /// High memory: logical page `n` lives in index page `n / PAGES_PER_PAGE`, slot
    /// `n % PAGES_PER_PAGE`.
    Indexed(Vec<IndexPage>),
}

impl PageTable {
    /// Returns the number of logical pages in the table.
    pub fn page_count(&self) -> usize {
        match self {
            PageTable::Direct(frames) => frames.len(),
            PageTable::Indexed(index_pages) => index_pages.iter().map(IndexPage::len).sum(),
        }
    }

    /// Resolves a logical page to the frame holding its data.
    pub fn resolve(&self, logical_page: usize) -> Option<FrameNumber> {
        match self {
            PageTable::Direct(frames) => frames.get(logical_page).copied(),
            PageTable::Indexed(index_pages) => index_pages
                .get(logical_page / PAGES_PER_PAGE)?
                .get(logical_page % PAGES_PER_PAGE),
        }
    }

    /// Frees every page the table owns and returns how many frames went back.
    ///
    /// High pages are released before the index pages that reference them.
    pub fn release<P: PageProvider + ?Sized>(self, provider: &P) -> usize {
        match self {
            PageTable::Direct(frames) => {
                for &frame in &frames {
                    provider.free_page(frame);
                }
                frames.len()
            }
            PageTable::Indexed(index_pages) => {
                let mut freed = 0;
                for frame in index_pages.iter().flat_map(IndexPage::frames) {
                    provider.free_page(frame);
                    freed += 1;
                }
                for index_page in &index_pages {
                    provider.free_page(index_page.frame());
                    freed += 1;
                }
                freed
            }
        }
    }
}

/// A live allocation.
pub struct Block {
    page_count: usize,
    table: PageTable,
}

impl Block {
    /// Wraps a filled page table.
    pub fn new(table: PageTable) -> Self {
        Self {
            page_count: table.page_count(),
            table,
        }
    }

    /// Returns the number of logical pages in the block.
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// Returns the block's page table.
    pub fn table(&self) -> &PageTable {
        &self.table
    }

    /// Releases the block's pages; see [`PageTable::release`].
    pub fn release<P: PageProvider + ?Sized>(self, provider: &P) -> usize {
        self.table.release(provider)
    }
}

enum Slot {
    Free,
    /// Claimed by an allocation that is filling its table outside the lock.
    Reserved,
    Live(Block),
}

/// The block table of one zone.
pub struct BlockRegistry {
    zone: ZoneId,
    slots: Box<[Slot]>,
}

impl BlockRegistry {
    /// Creates an empty registry for `zone`.
    pub fn new(zone: ZoneId) -> Self {
        Self {
            zone,
            slots: (0..MAX_PAGE_BLOCKS).map(|_| Slot::Free).collect(),
        }
    }

    /// Returns the zone this registry belongs to.
    pub fn zone(&self) -> ZoneId {
        self.zone
    }

    /// Returns the first slot with no pages allocated.
    pub fn find_free_slot(&self) -> Result<BlockId, RegistryError> {
        self.slots
            .iter()
            .position(|slot| matches!(slot, Slot::Free))
            .and_then(BlockId::new)
            .ok_or(RegistryError::Full(self.zone))
    }

    /// Claims the first free slot so no concurrent allocation can take it.
    pub fn reserve_slot(&mut self) -> Result<BlockId, RegistryError> {
        let id = self.find_free_slot()?;
        self.slots[id.as_usize()] = Slot::Reserved;
        Ok(id)
    }

    /// Returns a reserved slot to the free pool.
    pub fn cancel(&mut self, id: BlockId) {
        let slot = &mut self.slots[id.as_usize()];
        if matches!(slot, Slot::Reserved) {
            *slot = Slot::Free;
        }
    }

    /// Installs a filled block into a slot previously returned by
    /// [`reserve_slot`](Self::reserve_slot).
    pub fn install(&mut self, id: BlockId, block: Block) {
        debug_assert!(matches!(self.slots[id.as_usize()], Slot::Reserved));
        self.slots[id.as_usize()] = Slot::Live(block);
    }

    /// Returns the live block in `id`.
    pub fn block(&self, id: BlockId) -> Option<&Block> {
        match &self.slots[id.as_usize()] {
            Slot::Live(block) => Some(block),
            _ => None,
        }
    }

    /// Returns the number of pages allocated to `id`; zero for an empty slot.
    pub fn allocated_pages(&self, id: BlockId) -> usize {
        self.block(id).map_or(0, Block::page_count)
    }

    /// Returns true iff `page_number + sector` lies inside block `id`.
    pub fn verify_memory_range(&self, page_number: u64, sector: u64, id: BlockId) -> bool {
        page_number
            .checked_add(sector)
            .is_some_and(|page| page < self.allocated_pages(id) as u64)
    }

    /// Removes the live block in `id`, leaving the slot free.
    ///
    /// Returns `None` for a slot that is free or still being filled.
    pub fn take(&mut self, id: BlockId) -> Option<Block> {
        let slot = &mut self.slots[id.as_usize()];
        if !matches!(slot, Slot::Live(_)) {
            return None;
        }
        match core::mem::replace(slot, Slot::Free) {
            Slot::Live(block) => Some(block),
            _ => None,
        }
    }

    /// Iterates over the live blocks and their page counts.
    pub fn live_blocks(&self) -> impl Iterator<Item = (BlockId, usize)> + '_ {
        BlockId::all()
            .filter_map(|id| self.block(id).map(|block| (id, block.page_count())))
    }
}
