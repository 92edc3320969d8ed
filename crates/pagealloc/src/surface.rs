//! Control-file handlers.
//!
//! Each file in the control tree is backed by a small handler that holds a weak
//! reference to the shared [`ModuleState`]. Once the module is torn down the
//! references stop upgrading and every handler turns into a no-op.

use alloc::boxed::Box;
use alloc::format;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec;
use core::fmt::Write as _;

use crate::{
    AllocError, Allocation, BlockId, ControlFile, FileMode, FreeRequest, MAX_PAGE_BLOCKS, NodeId,
    PAGE_SIZE, PageAllocator, PageProvider, PageRequest, ProcEntry, ProcError, ProcFs,
    ProtocolError, Transfer, UserMemory, ZoneId, cond_resched, parse_page_count,
};

/// Errors from control-surface operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SurfaceError {
    #[error(transparent)]
    Alloc(#[from] AllocError),
    /// The block's files could not be created; the block has been released.
    #[error(transparent)]
    Proc(#[from] ProcError),
    /// The control tree has not been built.
    #[error("control tree is not ready")]
    NotReady,
}

/// A block, named by its zone and id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockKey {
    pub zone: ZoneId,
    pub block: BlockId,
}

impl BlockKey {
    /// Decodes a page request aimed at this block.
    fn decode(&self, input: &[u8]) -> Result<PageRequest, ProtocolError> {
        let request = PageRequest::decode(input)?;
        let block = request.block()?;
        if block != self.block {
            return Err(ProtocolError::BlockMismatch {
                file: self.block.as_u16(),
                request: request.block_id,
            });
        }
        Ok(request)
    }
}

#[derive(Debug, Clone, Copy)]
struct BlockFiles {
    read: NodeId,
    write: NodeId,
}

/// State shared between the module and its control-file handlers.
pub(crate) struct ModuleState<P, F> {
    allocator: PageAllocator<P>,
    fs: Arc<F>,
    allocated_dirs: spin::Once<[NodeId; 2]>,
    block_files: [spin::Mutex<Box<[Option<BlockFiles>]>>; 2],
}

impl<P, F> ModuleState<P, F>
where
    P: PageProvider + 'static,
    F: ProcFs + 'static,
{
    pub fn new(allocator: PageAllocator<P>, fs: Arc<F>) -> Self {
        Self {
            allocator,
            fs,
            allocated_dirs: spin::Once::new(),
            block_files: [
                spin::Mutex::new(vec![None; MAX_PAGE_BLOCKS].into_boxed_slice()),
                spin::Mutex::new(vec![None; MAX_PAGE_BLOCKS].into_boxed_slice()),
            ],
        }
    }

    pub fn allocator(&self) -> &PageAllocator<P> {
        &self.allocator
    }

    pub fn fs(&self) -> &F {
        &self.fs
    }

    /// Records the `allocated_pages` directory of each zone. Only the first call has
    /// any effect.
    pub fn set_allocated_dirs(&self, dirs: [NodeId; 2]) {
        self.allocated_dirs.call_once(|| dirs);
    }

    /// Allocates a block and publishes its `<id>_read` and `<id>_write` files.
    pub fn allocate(self: &Arc<Self>, zone: ZoneId, pages: usize) -> Result<Allocation, SurfaceError> {
        let dir = self
            .allocated_dirs
            .get()
            .map(|dirs| dirs[zone.index()])
            .ok_or(SurfaceError::NotReady)?;

        // The slot stays reserved until its files are recorded. Release skips
        // reserved slots.
        let pending = self.allocator.prepare_block(zone, pages)?;
        let key = BlockKey {
            zone,
            block: pending.block(),
        };

        match self.publish(dir, key) {
            Ok(files) => {
                let mut block_files = self.block_files[zone.index()].lock();
                block_files[key.block.as_usize()] = Some(files);
                Ok(self.allocator.install_block(pending))
            }
            Err(err) => {
                log::warn!("{zone}: failed to publish block {}: {err}", key.block);
                self.allocator.abandon_block(pending);
                Err(err.into())
            }
        }
    }

    fn publish(self: &Arc<Self>, dir: NodeId, key: BlockKey) -> Result<BlockFiles, ProcError> {
        let fs = &*self.fs;
        let read = ProcEntry::file(
            fs,
            dir,
            &format!("{}_read", key.block),
            FileMode::WriteOnly,
            Arc::new(BlockReadFile {
                state: Arc::downgrade(self),
                key,
            }),
        )?;
        let write = ProcEntry::file(
            fs,
            dir,
            &format!("{}_write", key.block),
            FileMode::WriteOnly,
            Arc::new(BlockWriteFile {
                state: Arc::downgrade(self),
                key,
            }),
        )?;

        Ok(BlockFiles {
            read: read.commit(),
            write: write.commit(),
        })
    }

    /// Removes a block's files, then returns its pages. Returns the frames freed.
    pub fn release(&self, zone: ZoneId, block: BlockId) -> usize {
        let (files, taken) = {
            let mut block_files = self.block_files[zone.index()].lock();
            let taken = self.allocator.detach_block(zone, block);
            (block_files[block.as_usize()].take(), taken)
        };
        if let Some(files) = files {
            self.fs.remove(files.read);
            self.fs.remove(files.write);
        }
        taken.map_or(0, |taken| self.allocator.free_detached(zone, block, taken))
    }

    /// Releases every live block of both zones.
    pub fn release_all(&self) -> usize {
        ZoneId::ALL
            .into_iter()
            .flat_map(|zone| {
                self.allocator
                    .live_blocks(zone)
                    .into_iter()
                    .map(move |(block, _)| (zone, block))
            })
            .map(|(zone, block)| self.release(zone, block))
            .sum()
    }

    /// Runs a `<id>_read` request: copies up to `data_size` bytes of each page in the
    /// span to consecutive slots of the user buffer.
    fn read_pages(&self, key: BlockKey, request: &PageRequest, user: &dyn UserMemory) -> usize {
        let size = transfer_size(request);
        let mut buffer = vec![0u8; size];
        let mut transferred = 0;

        for offset in 0..span(request) {
            if !self
                .allocator
                .verify_memory_range(key.zone, request.page_number, offset, key.block)
            {
                log::debug!(
                    "{}: read of page {} + {offset} is outside block {}",
                    key.zone,
                    request.page_number,
                    key.block
                );
                break;
            }

            let page = request.page_number + offset;
            let copied = self
                .allocator
                .access_page(key.zone, key.block, page, Transfer::Read(&mut buffer));
            if copied == 0 {
                break;
            }

            let Some(dst) = (size as u64)
                .checked_mul(offset)
                .and_then(|skip| request.data.checked_add(skip))
            else {
                break;
            };
            if let Err(err) = user.copy_to_user(dst, &buffer[..copied]) {
                log::debug!("{}: {err}", key.zone);
                break;
            }

            transferred += copied;
            cond_resched(self.allocator.provider());
        }
        transferred
    }

    /// Runs a `<id>_write` request: copies `data_size` bytes from the user buffer once
    /// and writes them to each page in the span.
    fn write_pages(&self, key: BlockKey, request: &PageRequest, user: &dyn UserMemory) -> usize {
        let mut buffer = vec![0u8; transfer_size(request)];
        if let Err(err) = user.copy_from_user(request.data, &mut buffer) {
            log::debug!("{}: {err}", key.zone);
            return 0;
        }

        let mut transferred = 0;
        for offset in 0..span(request) {
            if !self
                .allocator
                .verify_memory_range(key.zone, request.page_number, offset, key.block)
            {
                log::debug!(
                    "{}: write of page {} + {offset} is outside block {}",
                    key.zone,
                    request.page_number,
                    key.block
                );
                break;
            }

            let page = request.page_number + offset;
            let copied = self
                .allocator
                .access_page(key.zone, key.block, page, Transfer::Write(&buffer));
            if copied == 0 {
                break;
            }

            transferred += copied;
            cond_resched(self.allocator.provider());
        }
        transferred
    }
}

/// Bytes moved per page: `data_size`, capped at one page.
fn transfer_size(request: &PageRequest) -> usize {
    usize::try_from(request.data_size).map_or(PAGE_SIZE, |size| size.min(PAGE_SIZE))
}

/// Pages touched by a request. A zero span still touches the first page.
fn span(request: &PageRequest) -> u64 {
    u64::from(request.pages_span.max(1))
}

/// Which counter a zone status file reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ZoneStat {
    FreePages,
    PagesMin,
}

/// `<zone>/free_pages` and `<zone>/pages_min`.
pub(crate) struct ZoneStatFile<P, F> {
    state: Weak<ModuleState<P, F>>,
    zone: ZoneId,
    stat: ZoneStat,
}

impl<P, F> ZoneStatFile<P, F> {
    pub fn new(state: Weak<ModuleState<P, F>>, zone: ZoneId, stat: ZoneStat) -> Self {
        Self { state, zone, stat }
    }
}

impl<P, F> ControlFile for ZoneStatFile<P, F>
where
    P: PageProvider + 'static,
    F: ProcFs + 'static,
{
    fn read(&self, out: &mut String) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        let snapshot = state.allocator().zone_snapshot(self.zone);
        let value = match self.stat {
            ZoneStat::FreePages => snapshot.free_pages,
            ZoneStat::PagesMin => snapshot.min_pages,
        };
        let _ = writeln!(out, "{value}");
    }
}

/// `<zone>/allocate_pages`: write a page count to allocate a block, read to list the
/// zone's live blocks as `<id>:<pages>` lines.
pub(crate) struct AllocateFile<P, F> {
    state: Weak<ModuleState<P, F>>,
    zone: ZoneId,
}

impl<P, F> AllocateFile<P, F> {
    pub fn new(state: Weak<ModuleState<P, F>>, zone: ZoneId) -> Self {
        Self { state, zone }
    }
}

impl<P, F> ControlFile for AllocateFile<P, F>
where
    P: PageProvider + 'static,
    F: ProcFs + 'static,
{
    fn read(&self, out: &mut String) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        for (block, pages) in state.allocator().live_blocks(self.zone) {
            let _ = writeln!(out, "{block}:{pages}");
        }
    }

    fn write(&self, input: &[u8], _user: &dyn UserMemory) -> usize {
        let Some(state) = self.state.upgrade() else {
            return 0;
        };
        let Some(pages) = parse_page_count(input) else {
            log::debug!("{}: ignoring malformed page count", self.zone);
            return 0;
        };

        match state.allocate(self.zone, pages) {
            Ok(allocation) => {
                log::info!(
                    "{}: block {} holds {} pages",
                    self.zone,
                    allocation.block,
                    allocation.pages
                );
                input.len()
            }
            Err(err) => {
                log::warn!("{}: allocation of {pages} pages failed: {err}", self.zone);
                0
            }
        }
    }
}

/// `allocated_pages/<id>_read`.
struct BlockReadFile<P, F> {
    state: Weak<ModuleState<P, F>>,
    key: BlockKey,
}

impl<P, F> ControlFile for BlockReadFile<P, F>
where
    P: PageProvider + 'static,
    F: ProcFs + 'static,
{
    fn write(&self, input: &[u8], user: &dyn UserMemory) -> usize {
        let Some(state) = self.state.upgrade() else {
            return 0;
        };
        match self.key.decode(input) {
            Ok(request) => state.read_pages(self.key, &request, user),
            Err(err) => {
                log::debug!("{}: ignoring read request: {err}", self.key.zone);
                0
            }
        }
    }
}

/// `allocated_pages/<id>_write`.
struct BlockWriteFile<P, F> {
    state: Weak<ModuleState<P, F>>,
    key: BlockKey,
}

impl<P, F> ControlFile for BlockWriteFile<P, F>
where
    P: PageProvider + 'static,
    F: ProcFs + 'static,
{
    fn write(&self, input: &[u8], user: &dyn UserMemory) -> usize {
        let Some(state) = self.state.upgrade() else {
            return 0;
        };
        match self.key.decode(input) {
            Ok(request) => state.write_pages(self.key, &request, user),
            Err(err) => {
                log::debug!("{}: ignoring write request: {err}", self.key.zone);
                0
            }
        }
    }
}

/// The top-level `free_pages` file.
pub(crate) struct LiberatorFile<P, F> {
    state: Weak<ModuleState<P, F>>,
}

impl<P, F> LiberatorFile<P, F> {
    pub fn new(state: Weak<ModuleState<P, F>>) -> Self {
        Self { state }
    }
}

impl<P, F> ControlFile for LiberatorFile<P, F>
where
    P: PageProvider + 'static,
    F: ProcFs + 'static,
{
    fn write(&self, input: &[u8], _user: &dyn UserMemory) -> usize {
        let Some(state) = self.state.upgrade() else {
            return 0;
        };
        let request = match FreeRequest::decode(input) {
            Ok(request) => request,
            Err(err) => {
                log::debug!("ignoring free request: {err}");
                return 0;
            }
        };

        let freed: usize = request
            .blocks
            .iter()
            .map(|block| state.release(request.zone, block))
            .sum();
        log::info!("{}: freed {freed} frames", request.zone);
        input.len()
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::software::{EmulatedPlatform, EmulatedProcFs, UserArena, ZoneConfig};

    type State = ModuleState<EmulatedPlatform, EmulatedProcFs>;

    fn state() -> Arc<State> {
        let platform = EmulatedPlatform::new(&[
            ZoneConfig::new(ZoneId::LowMem, 512, 32),
            ZoneConfig::new(ZoneId::HighMem, 256, 16),
        ]);
        let fs = Arc::new(EmulatedProcFs::new());
        let low = fs.mkdir(None, "low").unwrap();
        let high = fs.mkdir(None, "high").unwrap();

        let state = Arc::new(ModuleState::new(PageAllocator::new(platform), fs));
        state.set_allocated_dirs([low, high]);
        state
    }

    fn request(block: BlockId, page_number: u64, pages_span: u32, data_size: u64, data: u64) -> [u8; 32] {
        PageRequest {
            page_number,
            block_id: block.as_u16(),
            pages_span,
            data_size,
            data,
        }
        .encode()
    }

    #[test]
    fn allocation_publishes_block_files() {
        let state = state();
        let allocation = state.allocate(ZoneId::HighMem, 4).unwrap();
        assert_eq!(allocation.block.as_usize(), 0);
        assert_eq!(state.fs().list("high"), ["0_read", "0_write"]);

        state.release(ZoneId::HighMem, allocation.block);
        assert!(state.fs().list("high").is_empty());
        assert!(state.allocator().live_blocks(ZoneId::HighMem).is_empty());
    }

    #[test]
    fn allocation_before_tree_is_rejected() {
        let platform = EmulatedPlatform::new(&[ZoneConfig::new(ZoneId::LowMem, 64, 4)]);
        let state = Arc::new(ModuleState::new(
            PageAllocator::new(platform),
            Arc::new(EmulatedProcFs::new()),
        ));
        assert_eq!(
            state.allocate(ZoneId::LowMem, 1),
            Err(SurfaceError::NotReady)
        );
        assert_eq!(state.allocator().provider().allocated_frames(), 0);
    }

    #[test]
    fn failed_publish_releases_block() {
        let state = state();
        state.fs().fail_on_create("0_write");

        assert_eq!(
            state.allocate(ZoneId::LowMem, 8),
            Err(SurfaceError::Proc(ProcError::CreateFailed("0_write".into())))
        );
        assert!(state.fs().list("low").is_empty());
        assert_eq!(state.allocator().provider().free_pages(ZoneId::LowMem), 512);
    }

    /// Frees low block 0 whenever its write file is created, standing in for a
    /// liberator write that lands while the block is being published.
    struct FreeingFs {
        inner: EmulatedProcFs,
        state: spin::Once<Weak<ModuleState<EmulatedPlatform, FreeingFs>>>,
        freed: AtomicUsize,
    }

    impl ProcFs for FreeingFs {
        fn mkdir(&self, parent: Option<NodeId>, name: &str) -> Result<NodeId, ProcError> {
            self.inner.mkdir(parent, name)
        }

        fn create_file(
            &self,
            parent: NodeId,
            name: &str,
            mode: FileMode,
            handler: Arc<dyn ControlFile>,
        ) -> Result<NodeId, ProcError> {
            if name == "0_write" {
                if let Some(state) = self.state.get().and_then(Weak::upgrade) {
                    let freed = state.release(ZoneId::LowMem, BlockId::new(0).unwrap());
                    self.freed.fetch_add(freed, Ordering::AcqRel);
                }
            }
            self.inner.create_file(parent, name, mode, handler)
        }

        fn remove(&self, node: NodeId) {
            self.inner.remove(node);
        }
    }

    #[test]
    fn release_during_publish_leaves_block_intact() {
        let fs = Arc::new(FreeingFs {
            inner: EmulatedProcFs::new(),
            state: spin::Once::new(),
            freed: AtomicUsize::new(0),
        });
        let low = fs.mkdir(None, "low").unwrap();
        let high = fs.mkdir(None, "high").unwrap();
        let platform = EmulatedPlatform::new(&[ZoneConfig::new(ZoneId::LowMem, 256, 16)]);
        let state = Arc::new(ModuleState::new(PageAllocator::new(platform), Arc::clone(&fs)));
        fs.state.call_once(|| Arc::downgrade(&state));
        state.set_allocated_dirs([low, high]);

        let allocation = state.allocate(ZoneId::LowMem, 4).unwrap();
        assert_eq!(fs.freed.load(Ordering::Acquire), 0);
        assert_eq!(
            state.allocator().live_blocks(ZoneId::LowMem),
            [(allocation.block, 4)]
        );
        assert_eq!(fs.inner.list("low"), ["0_read", "0_write"]);

        assert_eq!(state.release(ZoneId::LowMem, allocation.block), 4);
        assert!(fs.inner.list("low").is_empty());

        // The id is reusable and its files can be created again.
        let again = state.allocate(ZoneId::LowMem, 2).unwrap();
        assert_eq!(again.block, allocation.block);
        assert_eq!(fs.inner.list("low"), ["0_read", "0_write"]);
        assert_eq!(fs.freed.load(Ordering::Acquire), 0);
    }

    #[test]
    fn write_then_read_through_handlers() {
        let state = state();
        let user = UserArena::new(4 * PAGE_SIZE);
        let block = state.allocate(ZoneId::LowMem, 3).unwrap().block;
        let key = BlockKey {
            zone: ZoneId::LowMem,
            block,
        };

        let src = user.alloc(PAGE_SIZE).unwrap();
        user.write(src, &[0xC3; PAGE_SIZE]).unwrap();
        let written = state.fs().write(
            "low/0_write",
            &request(block, 0, 3, PAGE_SIZE as u64, src),
            &user,
        );
        assert_eq!(written, Some(3 * PAGE_SIZE));

        let dst = user.alloc(3 * PAGE_SIZE).unwrap();
        let read = state.fs().write(
            "low/0_read",
            &request(block, 0, 3, PAGE_SIZE as u64, dst),
            &user,
        );
        assert_eq!(read, Some(3 * PAGE_SIZE));
        assert!(user.read(dst, 3 * PAGE_SIZE).unwrap().iter().all(|&b| b == 0xC3));

        // Handlers and direct calls agree.
        let partial = state.read_pages(
            key,
            &PageRequest::decode(&request(block, 2, 0, 16, dst)).unwrap(),
            &user,
        );
        assert_eq!(partial, 16);
    }

    #[test]
    fn span_stops_at_block_end() {
        let state = state();
        let user = UserArena::new(2 * PAGE_SIZE);
        let block = state.allocate(ZoneId::HighMem, 2).unwrap().block;
        let src = user.alloc(PAGE_SIZE).unwrap();

        let written = state.fs().write(
            "high/0_write",
            &request(block, 1, 5, PAGE_SIZE as u64, src),
            &user,
        );
        assert_eq!(written, Some(PAGE_SIZE));
    }

    #[test]
    fn mismatched_or_malformed_requests_are_ignored() {
        let state = state();
        let user = UserArena::new(PAGE_SIZE);
        let first = state.allocate(ZoneId::LowMem, 1).unwrap().block;
        let second = state.allocate(ZoneId::LowMem, 1).unwrap().block;
        let src = user.alloc(16).unwrap();

        assert_eq!(
            state
                .fs()
                .write("low/0_write", &request(second, 0, 1, 16, src), &user),
            Some(0)
        );
        assert_eq!(state.fs().write("low/0_write", &[0u8; 16], &user), Some(0));
        assert_eq!(
            state
                .fs()
                .write("low/0_write", &request(first, 0, 1, 16, 0), &user),
            Some(0)
        );
    }

    #[test]
    fn user_fault_stops_read() {
        let state = state();
        let user = UserArena::new(PAGE_SIZE);
        let block = state.allocate(ZoneId::LowMem, 2).unwrap().block;
        let dst = user.alloc(PAGE_SIZE).unwrap();

        // Room for the first page only.
        let read = state.fs().write(
            "low/0_read",
            &request(block, 0, 2, PAGE_SIZE as u64, dst),
            &user,
        );
        assert_eq!(read, Some(PAGE_SIZE));
    }

    #[test]
    fn allocate_file_lists_live_blocks() {
        let state = state();
        let file = AllocateFile::new(Arc::downgrade(&state), ZoneId::LowMem);
        let user = UserArena::new(16);

        assert_eq!(file.write(b"7\n", &user), 2);
        assert_eq!(file.write(b"3", &user), 1);
        assert_eq!(file.write(b"zero", &user), 0);

        let mut listing = String::new();
        file.read(&mut listing);
        assert_eq!(listing, "0:7\n1:3\n");
    }

    #[test]
    fn zone_stat_files_track_counters() {
        let state = state();
        let free = ZoneStatFile::new(Arc::downgrade(&state), ZoneId::HighMem, ZoneStat::FreePages);
        let min = ZoneStatFile::new(Arc::downgrade(&state), ZoneId::HighMem, ZoneStat::PagesMin);

        let render = |file: &dyn ControlFile| {
            let mut out = String::new();
            file.read(&mut out);
            out
        };
        assert_eq!(render(&free), "256\n");
        assert_eq!(render(&min), "16\n");

        state.allocate(ZoneId::HighMem, 10).unwrap();
        assert_eq!(render(&free), "246\n");
    }

    #[test]
    fn liberator_frees_flagged_blocks() {
        let state = state();
        let liberator = LiberatorFile::new(Arc::downgrade(&state));
        let user = UserArena::new(16);
        let a = state.allocate(ZoneId::LowMem, 2).unwrap().block;
        let b = state.allocate(ZoneId::LowMem, 2).unwrap().block;
        let c = state.allocate(ZoneId::LowMem, 2).unwrap().block;

        let request = FreeRequest {
            zone: ZoneId::LowMem,
            blocks: [a, c].into_iter().collect(),
        };
        assert_eq!(liberator.write(&request.encode(), &user), crate::LIBERATOR_SIZE);
        assert_eq!(state.allocator().live_blocks(ZoneId::LowMem), [(b, 2)]);
        assert_eq!(state.fs().list("low"), ["1_read", "1_write"]);

        assert_eq!(liberator.write(&[0u8; 4], &user), 0);
    }

    #[test]
    fn handlers_go_quiet_after_teardown() {
        let state = state();
        let file = AllocateFile::new(Arc::downgrade(&state), ZoneId::LowMem);
        let liberator = LiberatorFile::new(Arc::downgrade(&state));
        let user = UserArena::new(16);
        drop(state);

        assert_eq!(file.write(b"4", &user), 0);
        assert_eq!(liberator.write(&[0u8; crate::LIBERATOR_SIZE], &user), 0);
        let mut out = String::new();
        file.read(&mut out);
        assert!(out.is_empty());
    }
}
