//! Shared memory between the host and the remote cores
//!
//! A `SharedRegion` is an anonymous `MAP_SHARED` mapping. Everything placed in
//! it is accessed as naturally aligned 32-bit atomics: the remote side gives
//! no coherence guarantee beyond ordered stores and explicit barriers, so no
//! code here may rely on plain loads or stores.

// Offsets are always validated before pointer arithmetic; the mapping is
// page-aligned so 4-byte alignment of validated offsets holds.
#![allow(clippy::cast_ptr_alignment)]

use crate::error::{Result, SchedError};
use rustix::mm::{mmap_anonymous, munmap, MapFlags, ProtFlags};
use std::sync::atomic::AtomicU32;

/// Anonymous shared mapping holding channel rings
pub struct SharedRegion {
    /// Mapped pointer
    ptr: *mut u8,
    /// Size of the mapping (page multiple)
    size: usize,
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("ptr", &format_args!("{:p}", self.ptr))
            .field("size", &self.size)
            .finish()
    }
}

// SAFETY: Send - SharedRegion owns the mapping exclusively. Moving between threads
// doesn't invalidate it (mappings are process-wide). No thread-local state.
unsafe impl Send for SharedRegion {}

// SAFETY: Sync - all access goes through `AtomicU32` references; concurrent atomic
// access from several threads is exactly what the region is for.
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Map at least `len` bytes of zeroed shared memory
    ///
    /// # Errors
    ///
    /// Returns an error if the mapping fails.
    pub fn map(len: usize) -> Result<Self> {
        let page = rustix::param::page_size();
        let size = len.max(1).div_ceil(page) * page;

        // SAFETY: mmap_anonymous with a null hint creates a fresh mapping; no existing
        // memory is aliased. Invariants: (1) size is a non-zero page multiple;
        // (2) the kernel zero-fills anonymous pages; (3) ptr valid for size bytes or Err.
        let ptr = unsafe {
            mmap_anonymous(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
            )
            .map_err(|e| SchedError::shared_memory(format!("Failed to map {size} bytes: {e}")))?
        };

        tracing::debug!("Mapped shared region at {:p}, size={:#x}", ptr, size);

        Ok(Self {
            ptr: ptr.cast(),
            size,
        })
    }

    /// 32-bit word at `offset`
    ///
    /// # Panics
    ///
    /// Panics if `offset` is not 4-byte aligned or `offset + 4` exceeds the
    /// mapping.
    pub fn word(&self, offset: usize) -> &AtomicU32 {
        assert!(offset % 4 == 0, "Unaligned shared word offset {offset:#x}");
        assert!(offset + 4 <= self.size, "Shared word offset out of bounds");
        // SAFETY: ptr from mmap in map(), valid for self.size bytes for the lifetime of
        // &self. Invariants: (1) offset+4 <= size; (2) offset 4-aligned and the base is
        // page-aligned; (3) memory is zero-initialised, a valid AtomicU32 bit pattern;
        // (4) only atomic access is ever made to this memory.
        unsafe { &*self.ptr.add(offset).cast::<AtomicU32>() }
    }

    /// Get region size
    pub const fn size(&self) -> usize {
        self.size
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/size are exactly the mapping created in map(); Drop runs at most
        // once and no &AtomicU32 can outlive &self.
        unsafe {
            let _ = munmap(self.ptr.cast(), self.size);
        }
        tracing::debug!("Unmapped shared region ({:#x} bytes)", self.size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn region_is_zeroed_and_page_sized() {
        let region = SharedRegion::map(10).unwrap();
        assert!(region.size() >= 10);
        assert_eq!(region.size() % rustix::param::page_size(), 0);
        assert_eq!(region.word(0).load(Ordering::Relaxed), 0);
    }

    #[test]
    fn words_are_shared_across_threads() {
        let region = std::sync::Arc::new(SharedRegion::map(64).unwrap());
        let writer = std::sync::Arc::clone(&region);
        std::thread::spawn(move || writer.word(8).store(0xdead_beef, Ordering::Release))
            .join()
            .unwrap();
        assert_eq!(region.word(8).load(Ordering::Acquire), 0xdead_beef);
    }

    #[test]
    #[should_panic(expected = "Unaligned")]
    fn unaligned_word_panics() {
        let region = SharedRegion::map(64).unwrap();
        let _ = region.word(2);
    }
}
