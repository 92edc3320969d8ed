//! Module lifecycle: building the control tree and tearing it down.

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use crate::surface::{AllocateFile, LiberatorFile, ModuleState, ZoneStat, ZoneStatFile};
use crate::{
    Allocation, BlockId, FileMode, NodeId, PageAllocator, PageProvider, ProcEntry, ProcError,
    ProcFs, SurfaceError, ZoneId,
};

/// Name of the control tree's root directory unless configured otherwise.
pub const DEFAULT_ROOT: &str = "pagealloc";

/// Load-time configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleConfig {
    /// Name of the top-level control directory.
    pub root: String,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            root: String::from(DEFAULT_ROOT),
        }
    }
}

/// Errors that can occur while loading the module.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InitError {
    #[error("failed to build control tree: {0}")]
    Proc(#[from] ProcError),
}

/// One zone's directory and files. Fields drop top to bottom, so a partially built
/// zone unwinds children first.
struct ZoneEntries<'a, F: ProcFs> {
    allocated: ProcEntry<'a, F>,
    allocate_pages: ProcEntry<'a, F>,
    pages_min: ProcEntry<'a, F>,
    free_pages: ProcEntry<'a, F>,
    dir: ProcEntry<'a, F>,
}

impl<'a, F: ProcFs + 'static> ZoneEntries<'a, F> {
    fn create<P: PageProvider + 'static>(
        fs: &'a F,
        root: NodeId,
        zone: ZoneId,
        state: &Weak<ModuleState<P, F>>,
    ) -> Result<Self, ProcError> {
        let dir = ProcEntry::mkdir(fs, Some(root), zone.dir_name())?;
        let free_pages = ProcEntry::file(
            fs,
            dir.id(),
            "free_pages",
            FileMode::ReadOnly,
            Arc::new(ZoneStatFile::new(state.clone(), zone, ZoneStat::FreePages)),
        )?;
        let pages_min = ProcEntry::file(
            fs,
            dir.id(),
            "pages_min",
            FileMode::ReadOnly,
            Arc::new(ZoneStatFile::new(state.clone(), zone, ZoneStat::PagesMin)),
        )?;
        let allocate_pages = ProcEntry::file(
            fs,
            dir.id(),
            "allocate_pages",
            FileMode::ReadWrite,
            Arc::new(AllocateFile::new(state.clone(), zone)),
        )?;
        let allocated = ProcEntry::mkdir(fs, Some(dir.id()), "allocated_pages")?;

        Ok(Self {
            allocated,
            allocate_pages,
            pages_min,
            free_pages,
            dir,
        })
    }

    fn allocated_dir(&self) -> NodeId {
        self.allocated.id()
    }

    /// Keeps every entry and returns them in creation order.
    fn commit(self) -> [NodeId; 5] {
        let Self {
            allocated,
            allocate_pages,
            pages_min,
            free_pages,
            dir,
        } = self;
        [
            dir.commit(),
            free_pages.commit(),
            pages_min.commit(),
            allocate_pages.commit(),
            allocated.commit(),
        ]
    }
}

/// A loaded instance of the allocator.
///
/// [`PageAllocModule::init`] builds the control tree under the configured root:
///
/// ```text
/// <root>/
///   low_mem/  free_pages  pages_min  allocate_pages  allocated_pages/
///   high_mem/ free_pages  pages_min  allocate_pages  allocated_pages/
///   free_pages
/// ```
///
/// Dropping the module (or calling [`PageAllocModule::exit`]) releases every live
/// block and removes the tree.
pub struct PageAllocModule<P, F>
where
    P: PageProvider + 'static,
    F: ProcFs + 'static,
{
    state: Arc<ModuleState<P, F>>,
    /// Nodes in creation order.
    nodes: Vec<NodeId>,
}

impl<P, F> PageAllocModule<P, F>
where
    P: PageProvider + 'static,
    F: ProcFs + 'static,
{
    /// Loads the module. On failure everything created so far is removed again.
    pub fn init(provider: P, fs: Arc<F>, config: &ModuleConfig) -> Result<Self, InitError> {
        let state = Arc::new(ModuleState::new(
            PageAllocator::new(provider),
            Arc::clone(&fs),
        ));
        let weak = Arc::downgrade(&state);

        let root = ProcEntry::mkdir(&*fs, None, &config.root)?;
        let low = ZoneEntries::create(&*fs, root.id(), ZoneId::LowMem, &weak)?;
        let high = ZoneEntries::create(&*fs, root.id(), ZoneId::HighMem, &weak)?;
        let liberator = ProcEntry::file(
            &*fs,
            root.id(),
            "free_pages",
            FileMode::WriteOnly,
            Arc::new(LiberatorFile::new(weak)),
        )?;

        state.set_allocated_dirs([low.allocated_dir(), high.allocated_dir()]);

        let mut nodes = Vec::with_capacity(12);
        nodes.push(root.commit());
        nodes.extend(low.commit());
        nodes.extend(high.commit());
        nodes.push(liberator.commit());

        log::info!("{}: control tree ready", config.root);
        Ok(Self { state, nodes })
    }

    /// Returns the underlying allocator.
    pub fn allocator(&self) -> &PageAllocator<P> {
        self.state.allocator()
    }

    /// Allocates a block the way a write to `allocate_pages` does, publishing its files.
    pub fn allocate(&self, zone: ZoneId, pages: usize) -> Result<Allocation, SurfaceError> {
        self.state.allocate(zone, pages)
    }

    /// Releases a block the way the liberator does. Returns the frames freed.
    pub fn release(&self, zone: ZoneId, block: BlockId) -> usize {
        self.state.release(zone, block)
    }

    /// Unloads the module.
    pub fn exit(self) {}
}

impl<P, F> Drop for PageAllocModule<P, F>
where
    P: PageProvider + 'static,
    F: ProcFs + 'static,
{
    fn drop(&mut self) {
        let freed = self.state.release_all();
        for node in self.nodes.drain(..).rev() {
            self.state.fs().remove(node);
        }
        log::info!("control tree removed, {freed} frames returned");
    }
}
