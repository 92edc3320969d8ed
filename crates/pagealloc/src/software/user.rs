//! Emulated user address space.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::{UserCopyError, UserMemory};

/// First address of every arena. Address zero is never valid.
const BASE: u64 = 0x1000;

/// A flat user address space with a bump allocator.
///
/// Buffers are carved out with [`UserArena::alloc`] and addressed by the returned user
/// address, which is what a control-file descriptor carries.
pub struct UserArena {
    memory: spin::Mutex<Vec<u8>>,
    next_alloc: AtomicUsize,
    size: usize,
}

impl UserArena {
    /// Creates an arena of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            memory: spin::Mutex::new(alloc::vec![0u8; size]),
            next_alloc: AtomicUsize::new(0),
            size,
        }
    }

    /// Reserves `len` bytes, 16-byte aligned. Returns their user address.
    pub fn alloc(&self, len: usize) -> Option<u64> {
        const ALIGN: usize = 16;

        loop {
            let current = self.next_alloc.load(Ordering::Relaxed);
            let aligned = (current + ALIGN - 1) & !(ALIGN - 1);
            let end = aligned.checked_add(len)?;
            if end > self.size {
                return None;
            }

            if self
                .next_alloc
                .compare_exchange(current, end, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return Some(BASE + aligned as u64);
            }
        }
    }

    /// Copies `data` into the arena at `addr`.
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<(), UserCopyError> {
        let range = self.range(addr, data.len())?;
        self.memory.lock()[range].copy_from_slice(data);
        Ok(())
    }

    /// Copies `len` bytes out of the arena at `addr`.
    pub fn read(&self, addr: u64, len: usize) -> Result<Vec<u8>, UserCopyError> {
        let range = self.range(addr, len)?;
        Ok(self.memory.lock()[range].to_vec())
    }

    fn range(&self, addr: u64, len: usize) -> Result<core::ops::Range<usize>, UserCopyError> {
        let fault = UserCopyError::Fault { addr, len };
        let start = addr
            .checked_sub(BASE)
            .and_then(|offset| usize::try_from(offset).ok())
            .ok_or(fault)?;
        let end = start.checked_add(len).ok_or(fault)?;
        if end > self.size {
            return Err(fault);
        }
        Ok(start..end)
    }
}

impl UserMemory for UserArena {
    fn copy_from_user(&self, src: u64, dst: &mut [u8]) -> Result<(), UserCopyError> {
        let range = self.range(src, dst.len())?;
        dst.copy_from_slice(&self.memory.lock()[range]);
        Ok(())
    }

    fn copy_to_user(&self, dst: u64, src: &[u8]) -> Result<(), UserCopyError> {
        self.write(dst, src)
    }
}
