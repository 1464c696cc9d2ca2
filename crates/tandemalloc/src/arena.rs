//! Simulated memory system backing the allocation engine.
//!
//! Models the virtual memory available to the heap as one contiguous,
//! page-aligned region with a break pointer that only ever moves up. Keeping
//! the heap simulated lets the engine interleave freely with the allocator
//! this crate is itself compiled against.

use crate::util::{round_to_chunk, CHUNK_SIZE};
use core::ptr::NonNull;
use log::error;
use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use thiserror::Error;

/// Failure surfaced by every allocation-producing path of the engine.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The arena refused an extension.
    #[error("arena exhausted: requested {requested} bytes with {available} remaining")]
    OutOfMemory { requested: usize, available: usize },
}

/// A monotonic byte arena with an sbrk-like extension operation.
pub struct Arena {
    base: NonNull<u8>,
    layout: Layout,
    brk: usize,
    limit: usize,
}

impl Arena {
    /// Reserve `limit` bytes of backing storage. The capacity is rounded up
    /// to whole pages and the region starts page aligned, so chunk bases
    /// carved from it preserve payload alignment.
    pub fn new(limit: usize) -> Self {
        let limit = round_to_chunk(limit.max(CHUNK_SIZE));
        let layout =
            Layout::from_size_align(limit, CHUNK_SIZE).expect("arena capacity overflows a Layout");
        let base = unsafe { alloc(layout) };
        let base = NonNull::new(base).unwrap_or_else(|| handle_alloc_error(layout));
        Arena {
            base,
            layout,
            brk: 0,
            limit,
        }
    }

    /// Extend the heap by `incr` bytes and return the start address of the
    /// new area. The heap cannot be shrunk.
    pub fn extend(&mut self, incr: usize) -> Result<*mut u8, AllocError> {
        let available = self.limit - self.brk;
        if incr > available {
            error!("arena extension of {incr} bytes refused ({} of {} in use)", self.brk, self.limit);
            return Err(AllocError::OutOfMemory {
                requested: incr,
                available,
            });
        }
        let old_brk = unsafe { self.base.as_ptr().add(self.brk) };
        self.brk += incr;
        Ok(old_brk)
    }

    /// Rewind the break pointer, making the heap empty again. The backing
    /// storage is kept for reuse.
    pub fn reset_brk(&mut self) {
        self.brk = 0;
    }

    /// Address of the first heap byte.
    pub fn lo(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// One past the last mapped heap byte.
    pub fn hi(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.brk) }
    }

    /// Bytes handed out so far.
    pub fn heap_size(&self) -> usize {
        self.brk
    }

    /// Total reservable bytes.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// System page size.
    pub fn page_size() -> usize {
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }

    /// Whether `p` points into the mapped portion of the arena.
    pub fn contains(&self, p: *const u8) -> bool {
        let p = p as usize;
        let lo = self.base.as_ptr() as usize;
        p >= lo && p < lo + self.brk
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}
