//! Emulated page frames and zones.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::{FrameNumber, PAGE_SIZE, PageProvider, ZoneDescriptor, ZoneId};

/// Budget value meaning "no injected failure".
const UNLIMITED: usize = usize::MAX;

/// How many scheduler checks pass before a yield is requested, unless overridden.
const DEFAULT_RESCHED_EVERY: usize = 32;

/// Size and watermark of one emulated zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneConfig {
    pub zone: ZoneId,
    pub pages: usize,
    pub min_pages: usize,
}

impl ZoneConfig {
    pub const fn new(zone: ZoneId, pages: usize, min_pages: usize) -> Self {
        Self {
            zone,
            pages,
            min_pages,
        }
    }
}

struct Frame {
    zone: ZoneId,
    allocated: AtomicBool,
    /// Backing bytes, materialized on first map.
    data: spin::Mutex<Vec<u8>>,
}

/// A single emulated memory node.
///
/// Frames are numbered contiguously, low memory first. A zone that is not configured
/// is absent from the node's zone list, the way a machine without high memory has no
/// high zone at all.
pub struct EmulatedPlatform {
    frames: Box<[Frame]>,
    free_lists: [spin::Mutex<Vec<FrameNumber>>; 2],
    zones: Vec<ZoneDescriptor>,
    budgets: [AtomicUsize; 2],
    resched_every: usize,
    ticks: AtomicUsize,
    yields: AtomicUsize,
}

impl EmulatedPlatform {
    /// Creates a node with the given zones. Later duplicates of a zone are ignored.
    pub fn new(configs: &[ZoneConfig]) -> Self {
        let mut frames = Vec::new();
        let mut free_lists = [Vec::new(), Vec::new()];
        let mut zones = Vec::new();

        for zone in ZoneId::ALL {
            let Some(config) = configs.iter().find(|config| config.zone == zone) else {
                continue;
            };

            let start = frames.len();
            frames.extend((0..config.pages).map(|_| Frame {
                zone,
                allocated: AtomicBool::new(false),
                data: spin::Mutex::new(Vec::new()),
            }));
            // Reversed so that pops hand out the lowest frame first.
            free_lists[zone.index()] = (start..frames.len()).rev().map(FrameNumber::new).collect();
            zones.push(ZoneDescriptor::new(zone, config.pages, config.min_pages));
        }

        let [low, high] = free_lists;
        Self {
            frames: frames.into_boxed_slice(),
            free_lists: [spin::Mutex::new(low), spin::Mutex::new(high)],
            zones,
            budgets: [AtomicUsize::new(UNLIMITED), AtomicUsize::new(UNLIMITED)],
            resched_every: DEFAULT_RESCHED_EVERY,
            ticks: AtomicUsize::new(0),
            yields: AtomicUsize::new(0),
        }
    }

    /// Requests a yield every `every` scheduler checks.
    pub fn with_resched_every(mut self, every: usize) -> Self {
        self.resched_every = every.max(1);
        self
    }

    /// Lets `remaining` more allocations from `zone` succeed, then fails the rest.
    pub fn fail_after(&self, zone: ZoneId, remaining: usize) {
        self.budgets[zone.index()].store(remaining, Ordering::Release);
    }

    /// Removes any injected failure from `zone`.
    pub fn clear_failures(&self, zone: ZoneId) {
        self.budgets[zone.index()].store(UNLIMITED, Ordering::Release);
    }

    /// Returns the free-page counter of `zone`, or zero if the node has no such zone.
    pub fn free_pages(&self, zone: ZoneId) -> usize {
        self.descriptor(zone).map_or(0, ZoneDescriptor::free_pages)
    }

    /// Returns the number of frames currently handed out, across all zones.
    pub fn allocated_frames(&self) -> usize {
        self.frames
            .iter()
            .filter(|frame| frame.allocated.load(Ordering::Acquire))
            .count()
    }

    /// Returns how many times a task yielded through [`PageProvider::yield_now`].
    pub fn yields(&self) -> usize {
        self.yields.load(Ordering::Acquire)
    }

    fn descriptor(&self, zone: ZoneId) -> Option<&ZoneDescriptor> {
        self.zones.iter().find(|descriptor| descriptor.id() == zone)
    }

    fn take_budget(&self, zone: ZoneId) -> bool {
        self.budgets[zone.index()]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |budget| match budget {
                UNLIMITED => Some(UNLIMITED),
                0 => None,
                n => Some(n - 1),
            })
            .is_ok()
    }
}

/// A mapped emulated frame. The frame stays locked until the mapping is dropped.
pub struct EmulatedMapping<'a>(spin::MutexGuard<'a, Vec<u8>>);

impl Deref for EmulatedMapping<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl DerefMut for EmulatedMapping<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

impl PageProvider for EmulatedPlatform {
    type Mapping<'a> = EmulatedMapping<'a>;

    fn alloc_page(&self, zone: ZoneId) -> Option<FrameNumber> {
        let frame = {
            let mut free_list = self.free_lists[zone.index()].lock();
            if free_list.is_empty() {
                return None;
            }
            // Only allocations that would have succeeded count against the budget.
            if !self.take_budget(zone) {
                log::trace!("{zone}: injected allocation failure");
                return None;
            }
            free_list.pop()?
        };
        self.frames[frame.as_usize()]
            .allocated
            .store(true, Ordering::Release);
        if let Some(descriptor) = self.descriptor(zone) {
            descriptor.page_taken();
        }
        Some(frame)
    }

    fn free_page(&self, frame: FrameNumber) {
        let Some(entry) = self.frames.get(frame.as_usize()) else {
            log::error!("freeing unknown {frame:?}");
            return;
        };
        if !entry.allocated.swap(false, Ordering::AcqRel) {
            log::error!("double free of {frame:?}");
            return;
        }

        self.free_lists[entry.zone.index()].lock().push(frame);
        if let Some(descriptor) = self.descriptor(entry.zone) {
            descriptor.page_returned();
        }
    }

    fn map_page(&self, frame: FrameNumber) -> Option<EmulatedMapping<'_>> {
        let entry = self.frames.get(frame.as_usize())?;
        if !entry.allocated.load(Ordering::Acquire) {
            log::error!("mapping free {frame:?}");
            return None;
        }

        let mut data = entry.data.lock();
        if data.is_empty() {
            data.resize(PAGE_SIZE, 0);
        }
        Some(EmulatedMapping(data))
    }

    fn node_zones(&self, _probe: FrameNumber) -> &[ZoneDescriptor] {
        &self.zones
    }

    fn need_resched(&self) -> bool {
        self.ticks.fetch_add(1, Ordering::Relaxed) + 1 >= self.resched_every
    }

    fn yield_now(&self) {
        self.ticks.store(0, Ordering::Relaxed);
        self.yields.fetch_add(1, Ordering::AcqRel);
        std::thread::yield_now();
    }
}
