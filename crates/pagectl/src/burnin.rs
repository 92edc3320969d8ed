//! Memory burn-in over the control files.
//!
//! Each pass allocates a block through `allocate_pages`, fills every page with a
//! pattern through `<id>_write`, reads each page back through `<id>_read` and frees
//! the block through the liberator. Zones are exercised in parallel.

use std::collections::BTreeMap;

use pagealloc::software::{EmulatedProcFs, UserArena};
use pagealloc::{
    BlockId, FreeRequest, LIBERATOR_SIZE, PAGE_SIZE, PageRequest, UserCopyError, ZoneId,
};
use rayon::prelude::*;

/// What to run.
#[derive(Debug, Clone)]
pub struct Plan {
    /// Base byte pattern; rotated by one bit each pass.
    pub pattern: u8,
    /// Pages to request per pass.
    pub pages: usize,
    pub passes: usize,
    pub zones: Vec<ZoneId>,
}

/// Outcome of one zone's burn-in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ZoneReport {
    pub passes: usize,
    pub pages_tested: usize,
    /// Pages that came back different from what was written.
    pub bad_pages: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum BurnInError {
    #[error("{zone}: request for {pages} pages was refused")]
    AllocationRefused { zone: ZoneId, pages: usize },
    #[error("{0}: allocation did not produce a new block")]
    NoNewBlock(ZoneId),
    #[error("control file {0} is missing")]
    MissingFile(String),
    #[error("{zone}: block {block}: wrote {actual} of {expected} bytes")]
    ShortWrite {
        zone: ZoneId,
        block: BlockId,
        expected: usize,
        actual: usize,
    },
    #[error("{zone}: block {block} page {page}: read {actual} bytes")]
    ShortRead {
        zone: ZoneId,
        block: BlockId,
        page: usize,
        actual: usize,
    },
    #[error("{zone}: liberator refused to free block {block}")]
    FreeRefused { zone: ZoneId, block: BlockId },
    #[error("user buffer could not be reserved")]
    UserBuffer,
    #[error(transparent)]
    UserCopy(#[from] UserCopyError),
}

/// Runs `plan` against the control tree at `root`, one zone per worker.
pub fn run(
    fs: &EmulatedProcFs,
    root: &str,
    plan: &Plan,
) -> Vec<(ZoneId, Result<ZoneReport, BurnInError>)> {
    plan.zones
        .par_iter()
        .map(|&zone| (zone, run_zone(fs, root, zone, plan)))
        .collect()
}

/// Runs every pass of `plan` against one zone.
pub fn run_zone(
    fs: &EmulatedProcFs,
    root: &str,
    zone: ZoneId,
    plan: &Plan,
) -> Result<ZoneReport, BurnInError> {
    let files = ZoneFiles::new(root, zone);
    let buffers = Buffers::new()?;

    let mut report = ZoneReport::default();
    for pass in 0..plan.passes {
        let pattern = plan.pattern.rotate_left(pass as u32);
        buffers.user.write(buffers.src, &[pattern; PAGE_SIZE])?;

        let (block, pages) = allocate(fs, &files, zone, plan.pages, &buffers.user)?;
        log::debug!("{zone}: pass {pass}: block {block} with {pages} pages, pattern {pattern:#04x}");

        let outcome = fill_and_verify(fs, &files, zone, (block, pages), pattern, &buffers);
        free(fs, &files, zone, block, &buffers.user)?;

        let bad_pages = outcome?;
        if bad_pages > 0 {
            log::error!("{zone}: pass {pass}: {bad_pages} of {pages} pages failed verification");
        }
        report.passes += 1;
        report.pages_tested += pages;
        report.bad_pages += bad_pages;
    }

    log::info!(
        "{zone}: {} passes, {} pages tested, {} bad",
        report.passes,
        report.pages_tested,
        report.bad_pages
    );
    Ok(report)
}

/// A caller address space with one page to write from and one to read into.
struct Buffers {
    user: UserArena,
    src: u64,
    dst: u64,
}

impl Buffers {
    fn new() -> Result<Self, BurnInError> {
        let user = UserArena::new(2 * PAGE_SIZE);
        let src = user.alloc(PAGE_SIZE).ok_or(BurnInError::UserBuffer)?;
        let dst = user.alloc(PAGE_SIZE).ok_or(BurnInError::UserBuffer)?;
        Ok(Self { user, src, dst })
    }
}

struct ZoneFiles {
    allocate: String,
    allocated_dir: String,
    liberator: String,
}

impl ZoneFiles {
    fn new(root: &str, zone: ZoneId) -> Self {
        Self {
            allocate: format!("{root}/{zone}/allocate_pages"),
            allocated_dir: format!("{root}/{zone}/allocated_pages"),
            liberator: format!("{root}/free_pages"),
        }
    }

    fn read_file(&self, block: BlockId) -> String {
        format!("{}/{block}_read", self.allocated_dir)
    }

    fn write_file(&self, block: BlockId) -> String {
        format!("{}/{block}_write", self.allocated_dir)
    }
}

/// Parses an `allocate_pages` listing into block ids and page counts.
fn parse_listing(listing: &str) -> BTreeMap<u16, usize> {
    listing
        .lines()
        .filter_map(|line| {
            let (id, pages) = line.split_once(':')?;
            Some((id.trim().parse().ok()?, pages.trim().parse().ok()?))
        })
        .collect()
}

fn listing(fs: &EmulatedProcFs, files: &ZoneFiles) -> Result<BTreeMap<u16, usize>, BurnInError> {
    fs.read(&files.allocate)
        .map(|listing| parse_listing(&listing))
        .ok_or_else(|| BurnInError::MissingFile(files.allocate.clone()))
}

/// Allocates a block and finds it by diffing the zone's listing.
fn allocate(
    fs: &EmulatedProcFs,
    files: &ZoneFiles,
    zone: ZoneId,
    pages: usize,
    user: &UserArena,
) -> Result<(BlockId, usize), BurnInError> {
    let before = listing(fs, files)?;

    let accepted = fs
        .write(&files.allocate, pages.to_string().as_bytes(), user)
        .ok_or_else(|| BurnInError::MissingFile(files.allocate.clone()))?;
    if accepted == 0 {
        return Err(BurnInError::AllocationRefused { zone, pages });
    }

    listing(fs, files)?
        .into_iter()
        .find(|(id, _)| !before.contains_key(id))
        .and_then(|(id, pages)| Some((BlockId::from_wire(id)?, pages)))
        .ok_or(BurnInError::NoNewBlock(zone))
}

/// Writes `pattern` over the whole block, then reads every page back. Returns the
/// number of pages that did not match.
fn fill_and_verify(
    fs: &EmulatedProcFs,
    files: &ZoneFiles,
    zone: ZoneId,
    (block, pages): (BlockId, usize),
    pattern: u8,
    buffers: &Buffers,
) -> Result<usize, BurnInError> {
    let Buffers { user, src, dst } = buffers;
    let write = PageRequest {
        page_number: 0,
        block_id: block.as_u16(),
        pages_span: pages as u32,
        data_size: PAGE_SIZE as u64,
        data: *src,
    };
    let expected = pages * PAGE_SIZE;
    let path = files.write_file(block);
    let written = fs
        .write(&path, &write.encode(), user)
        .ok_or(BurnInError::MissingFile(path))?;
    if written != expected {
        return Err(BurnInError::ShortWrite {
            zone,
            block,
            expected,
            actual: written,
        });
    }

    let path = files.read_file(block);
    let mut bad_pages = 0;
    for page in 0..pages {
        let read = PageRequest {
            page_number: page as u64,
            pages_span: 1,
            data: *dst,
            ..write
        };
        let actual = fs
            .write(&path, &read.encode(), user)
            .ok_or_else(|| BurnInError::MissingFile(path.clone()))?;
        if actual != PAGE_SIZE {
            return Err(BurnInError::ShortRead {
                zone,
                block,
                page,
                actual,
            });
        }

        let contents = user.read(*dst, PAGE_SIZE)?;
        if let Some(offset) = contents.iter().position(|&byte| byte != pattern) {
            log::warn!(
                "{zone}: block {block} page {page}: byte {offset} is {:#04x}, expected {pattern:#04x}",
                contents[offset]
            );
            bad_pages += 1;
        }
    }
    Ok(bad_pages)
}

fn free(
    fs: &EmulatedProcFs,
    files: &ZoneFiles,
    zone: ZoneId,
    block: BlockId,
    user: &UserArena,
) -> Result<(), BurnInError> {
    let request = FreeRequest {
        zone,
        blocks: [block].into_iter().collect(),
    };
    let accepted = fs
        .write(&files.liberator, &request.encode(), user)
        .ok_or_else(|| BurnInError::MissingFile(files.liberator.clone()))?;
    if accepted != LIBERATOR_SIZE {
        return Err(BurnInError::FreeRefused { zone, block });
    }
    Ok(())
}
