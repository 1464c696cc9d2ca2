use crate::arena::{AllocError, Arena};
use crate::check::{self, CheckReport};
use crate::config::Config;
use crate::large::{tags, LargeHeap};
use crate::slab::size_class;
use crate::slab::SlabPool;
use crate::util::{DWORD, WORD};
use core::ptr;
use std::io;

/// The hybrid allocation engine: a segregated slab pool for small requests
/// and a boundary-tag heap for everything larger, sharing one arena.
///
/// All state lives in the engine value, so tests can run several engines
/// side by side. A single logical mutator is assumed throughout; every
/// operation restores the structural invariants before returning.
pub struct Engine {
    arena: Arena,
    pool: SlabPool,
    heap: LargeHeap,
}

impl Engine {
    /// Build an engine over `arena`.
    pub fn new(arena: Arena) -> Self {
        Engine {
            arena,
            pool: SlabPool::new(),
            heap: LargeHeap::new(),
        }
    }

    /// A fresh engine over a fresh arena of `bytes` capacity.
    pub fn with_capacity(bytes: usize) -> Self {
        Engine::new(Arena::new(bytes))
    }

    /// An engine configured from the process environment.
    pub fn from_env() -> Self {
        Engine::with_capacity(Config::from_env().heap_limit)
    }

    /// Reset every allocator head, abandoning all outstanding blocks.
    /// Performs no arena work; meant to pair with a fresh arena.
    pub fn init(&mut self) -> Result<(), AllocError> {
        self.pool.reset();
        self.heap.reset();
        Ok(())
    }

    /// Allocate `size` bytes of uninitialized storage. Returns null when
    /// `size` is zero or the arena is exhausted.
    pub fn malloc(&mut self, size: usize) -> *mut u8 {
        if size == 0 {
            return ptr::null_mut();
        }
        let result = match size_class::class_index(size) {
            Some(class) => self.pool.alloc(&mut self.arena, class),
            None => self.heap.alloc(&mut self.arena, size),
        };
        result.unwrap_or(ptr::null_mut())
    }

    /// Release a block. `free(null)` is a no-op.
    ///
    /// # Safety
    /// A non-null `ptr` must be a live pointer produced by this engine's
    /// `malloc`, `calloc`, or `realloc` and not yet freed.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        // Owner resolution: the slab lists decide; anything they do not
        // claim belongs to the boundary-tag heap.
        match self.pool.chunk_of(ptr) {
            Some(chunk) => self.pool.free(chunk, ptr),
            None => self.heap.free(ptr),
        }
    }

    /// Resize a block per the C99 realloc contract, except that resizing to
    /// zero frees the block and returns the original pointer. On allocation
    /// failure the old block is left untouched and null is returned.
    ///
    /// # Safety
    /// A non-null `ptr` must be a live pointer produced by this engine.
    pub unsafe fn realloc(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
        if size == 0 {
            self.free(ptr);
            return ptr;
        }
        if ptr.is_null() {
            return self.malloc(size);
        }

        if let Some(chunk) = self.pool.chunk_of(ptr) {
            let slot_size = (*chunk).slot_size() as usize;
            if size <= slot_size {
                return ptr;
            }
            let new_ptr = self.malloc(size);
            if new_ptr.is_null() {
                return ptr::null_mut();
            }
            ptr::copy_nonoverlapping(ptr, new_ptr, slot_size);
            self.pool.free(chunk, ptr);
            return new_ptr;
        }

        if let Some(same) = self.heap.resize_in_place(ptr, size) {
            return same;
        }

        // The block must move: allocate, copy the old payload, release.
        let old_size = tags::size_at(tags::header(ptr));
        let new_ptr = self.malloc(size);
        if new_ptr.is_null() {
            return ptr::null_mut();
        }
        ptr::copy_nonoverlapping(ptr, new_ptr, old_size - DWORD);
        self.heap.free(ptr);
        new_ptr
    }

    /// Allocate zeroed storage for `num` objects of `size` bytes each.
    /// Returns null when the byte count overflows or the arena is exhausted.
    pub fn calloc(&mut self, num: usize, size: usize) -> *mut u8 {
        let total = match num.checked_mul(size) {
            Some(total) => total,
            None => return ptr::null_mut(),
        };
        let ptr = self.malloc(total);
        if !ptr.is_null() {
            unsafe { ptr::write_bytes(ptr, 0, total) };
        }
        ptr
    }

    /// Usable bytes behind a live pointer: the slot size for slab slots,
    /// the block size minus the header word for large blocks.
    ///
    /// # Safety
    /// A non-null `ptr` must be a live pointer produced by this engine.
    pub unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
        if ptr.is_null() {
            return 0;
        }
        if let Some(chunk) = self.pool.chunk_of(ptr) {
            return (*chunk).slot_size() as usize;
        }
        tags::size_at(tags::header(ptr)) - WORD
    }

    /// Walk both structures and validate every observable invariant.
    /// `verbose` prints the full layout to stdout; errors are always
    /// printed. Diagnostics never mutate state.
    pub fn check_heap(&self, verbose: bool) -> CheckReport {
        let stdout = io::stdout();
        check::run(&self.pool, &self.heap, verbose, &mut stdout.lock())
    }

    /// The arena backing this engine.
    pub fn arena(&self) -> &Arena {
        &self.arena
    }
}
