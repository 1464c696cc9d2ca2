//! Explicit-free-list allocator with boundary-tag coalescing.
//!
//! Serves every request the slab pool turns away. Blocks live inside large
//! chunks obtained from the arena; each chunk carries an always-allocated
//! prologue pair and a zero-size allocated epilogue word, so coalescing can
//! never run past a chunk boundary. The boundary tags are the sole source of
//! block-layout truth; the doubly linked free list is a secondary index kept
//! consistent in the same operation that rewrites any tag.

pub mod tags;

use crate::arena::{AllocError, Arena};
use crate::util::{round_to_align, round_to_chunk, DWORD, MIN_LARGE_BLOCK, WORD};
use core::ptr;
use log::trace;

/// Bytes of a large chunk not covered by its initial free block: the
/// previous-chunk link, the recorded span, alignment padding, the prologue
/// pair, and the epilogue word.
pub const CHUNK_OVERHEAD: usize = 32;

/// Offset of the recorded span inside a chunk.
const SPAN_OFFSET: usize = 8;

/// Offset of the prologue header inside a chunk.
pub const PROLOGUE_OFFSET: usize = 20;

/// Offset of the first block's payload inside a chunk.
pub const FIRST_PAYLOAD_OFFSET: usize = 32;

/// Total block size needed to satisfy a request of `size` payload bytes:
/// the payload plus its header word, aligned, but never below the minimum
/// block size.
#[inline]
pub fn block_size(size: usize) -> usize {
    round_to_align(size + WORD).max(MIN_LARGE_BLOCK)
}

/// Arena span of a chunk able to host one block of `block_size` bytes: the
/// smallest page multiple fitting the block plus the chunk overhead.
#[inline]
pub fn chunk_span(block_size: usize) -> usize {
    round_to_chunk(block_size + CHUNK_OVERHEAD)
}

/// The boundary-tag heap.
pub struct LargeHeap {
    /// Head of the doubly linked free list (a payload pointer).
    free_head: *mut u8,
    /// Newest chunk base; each chunk links back to the one seeded before it.
    chunk_head: *mut u8,
}

impl LargeHeap {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        LargeHeap {
            free_head: ptr::null_mut(),
            chunk_head: ptr::null_mut(),
        }
    }

    /// Forget every block and chunk. The chunks stay in the arena.
    pub fn reset(&mut self) {
        self.free_head = ptr::null_mut();
        self.chunk_head = ptr::null_mut();
    }

    /// Head of the free list (diagnostics).
    #[inline]
    pub fn free_head(&self) -> *mut u8 {
        self.free_head
    }

    /// Iterate seeded chunks as `(base, span)` pairs, newest first.
    pub fn chunks(&self) -> ChunkIter {
        ChunkIter {
            cursor: self.chunk_head,
        }
    }

    /// Allocate a block able to hold `size` payload bytes.
    pub fn alloc(&mut self, arena: &mut Arena, size: usize) -> Result<*mut u8, AllocError> {
        let need = block_size(size);
        let bp = match self.find(need) {
            Some(bp) => bp,
            None => self.add_chunk(arena, need)?,
        };
        unsafe { self.place(bp, need) };
        Ok(bp)
    }

    /// First-fit search of the free list.
    fn find(&self, need: usize) -> Option<*mut u8> {
        let mut bp = self.free_head;
        while !bp.is_null() {
            unsafe {
                let hdr = tags::header(bp);
                if !tags::is_alloc(hdr) && tags::size_at(hdr) >= need {
                    return Some(bp);
                }
                bp = tags::next_free(bp);
            }
        }
        None
    }

    /// Seed a fresh chunk able to host one `need`-byte block and return its
    /// free block.
    fn add_chunk(&mut self, arena: &mut Arena, need: usize) -> Result<*mut u8, AllocError> {
        let span = chunk_span(need);
        let chunk = arena.extend(span)?;
        let free_size = span - CHUNK_OVERHEAD;
        trace!("seeding large chunk {chunk:p}, span {span}");
        unsafe {
            // Preamble: link to the previously seeded chunk plus the span,
            // both for the diagnostic walk only.
            (chunk as *mut usize).write_unaligned(self.chunk_head as usize);
            tags::put(chunk.add(SPAN_OFFSET), span as u32);

            tags::put(chunk.add(PROLOGUE_OFFSET), tags::pack(DWORD, true, true));
            tags::put(chunk.add(PROLOGUE_OFFSET + WORD), tags::pack(DWORD, true, true));

            let bp = chunk.add(FIRST_PAYLOAD_OFFSET);
            tags::put(tags::header(bp), tags::pack(free_size, true, false));
            tags::put(tags::footer(bp), tags::pack(free_size, true, false));

            // Epilogue: zero-size allocated sentinel. The block before it is
            // free, so its predecessor bit starts clear.
            tags::put(chunk.add(span - WORD), tags::pack(0, false, true));

            self.chunk_head = chunk;
            self.insert(bp);
            Ok(bp)
        }
    }

    /// Insert `bp` at the head of the free list.
    ///
    /// # Safety
    /// `bp` must be the payload pointer of a free block not on the list.
    unsafe fn insert(&mut self, bp: *mut u8) {
        let old = self.free_head;
        tags::set_next_free(bp, old);
        tags::set_prev_free(bp, ptr::null_mut());
        if !old.is_null() {
            tags::set_prev_free(old, bp);
        }
        self.free_head = bp;
    }

    /// Unlink `bp` from the free list.
    ///
    /// # Safety
    /// `bp` must be on the list with intact link words.
    unsafe fn remove(&mut self, bp: *mut u8) {
        let prev = tags::prev_free(bp);
        let next = tags::next_free(bp);
        if prev.is_null() {
            self.free_head = next;
        } else {
            tags::set_next_free(prev, next);
        }
        if !next.is_null() {
            tags::set_prev_free(next, prev);
        }
    }

    /// Mark the free block `bp` allocated for a `need`-byte request,
    /// splitting off the tail when it can stand alone as a free block.
    ///
    /// # Safety
    /// `bp` must be a free block on the list with `size >= need`.
    unsafe fn place(&mut self, bp: *mut u8, need: usize) {
        let hdr = tags::header(bp);
        let avail = tags::size_at(hdr);
        let prev = tags::prev_alloc(hdr);

        if avail - need >= MIN_LARGE_BLOCK {
            tags::put(hdr, tags::pack(need, prev, true));
            let rest = tags::next_block(bp);
            let rest_size = avail - need;
            tags::put(tags::header(rest), tags::pack(rest_size, true, false));
            tags::put(tags::footer(rest), tags::pack(rest_size, true, false));
            self.insert(rest);
            self.remove(bp);
        } else {
            tags::put(hdr, tags::pack(avail, prev, true));
            let next = tags::next_block(bp);
            tags::set_prev_alloc(tags::header(next));
            if !tags::is_alloc(tags::header(next)) {
                tags::set_prev_alloc(tags::footer(next));
            }
            self.remove(bp);
        }
    }

    /// Release an allocated block.
    ///
    /// # Safety
    /// `bp` must be a live payload pointer previously produced by [`alloc`]
    /// or preserved by [`resize_in_place`].
    ///
    /// [`alloc`]: LargeHeap::alloc
    /// [`resize_in_place`]: LargeHeap::resize_in_place
    pub unsafe fn free(&mut self, bp: *mut u8) {
        let hdr = tags::header(bp);
        let size = tags::size_at(hdr);
        let prev = tags::prev_alloc(hdr);

        tags::put(hdr, tags::pack(size, prev, false));
        tags::put(tags::footer(bp), tags::pack(size, prev, false));

        let next = tags::next_block(bp);
        tags::clear_prev_alloc(tags::header(next));
        if !tags::is_alloc(tags::header(next)) {
            tags::clear_prev_alloc(tags::footer(next));
        }

        self.insert(bp);
        self.coalesce(bp);
    }

    /// Merge the free block `bp` with its free physical neighbors. Returns
    /// the payload pointer of the merged block.
    ///
    /// # Safety
    /// `bp` must be a free block already on the list.
    unsafe fn coalesce(&mut self, bp: *mut u8) -> *mut u8 {
        let size = tags::size_at(tags::header(bp));
        let prev_is_alloc = tags::prev_alloc(tags::header(bp));
        let next = tags::next_block(bp);
        let next_is_alloc = tags::is_alloc(tags::header(next));

        match (prev_is_alloc, next_is_alloc) {
            (true, true) => {
                trace!("coalesce {bp:p}: both neighbors allocated");
                bp
            }
            (true, false) => {
                trace!("coalesce {bp:p}: merge with successor");
                let merged = size + tags::size_at(tags::header(next));
                tags::put(tags::header(bp), tags::pack(merged, true, false));
                tags::put(tags::footer(bp), tags::pack(merged, true, false));
                self.remove(next);
                bp
            }
            (false, true) => {
                trace!("coalesce {bp:p}: merge with predecessor");
                let prev = tags::prev_block(bp);
                let merged = size + tags::size_at(tags::header(prev));
                // The block before a free predecessor is allocated, by the
                // coalescing invariant.
                tags::put(tags::header(prev), tags::pack(merged, true, false));
                tags::put(tags::footer(prev), tags::pack(merged, true, false));
                self.remove(bp);
                prev
            }
            (false, false) => {
                trace!("coalesce {bp:p}: merge both neighbors");
                let prev = tags::prev_block(bp);
                let merged =
                    size + tags::size_at(tags::header(prev)) + tags::size_at(tags::header(next));
                tags::put(tags::header(prev), tags::pack(merged, true, false));
                tags::put(tags::footer(prev), tags::pack(merged, true, false));
                self.remove(bp);
                self.remove(next);
                prev
            }
        }
    }

    /// Try to resize the allocated block `bp` in place. `Some(bp)` means the
    /// block now covers `size` payload bytes at its old address; None means
    /// it must move.
    ///
    /// # Safety
    /// `bp` must be a live payload pointer of this heap.
    pub unsafe fn resize_in_place(&mut self, bp: *mut u8, size: usize) -> Option<*mut u8> {
        let need = block_size(size);
        let hdr = tags::header(bp);
        let old = tags::size_at(hdr);

        if need == old {
            return Some(bp);
        }
        if need < old {
            self.shrink(bp, need, old);
            return Some(bp);
        }

        // Growth: absorb the physical successor when it is free and large
        // enough to cover the difference.
        let next = tags::next_block(bp);
        if tags::is_alloc(tags::header(next)) {
            return None;
        }
        let total = old + tags::size_at(tags::header(next));
        if total < need {
            return None;
        }

        // Unlink the successor before its link words are overwritten.
        self.remove(next);
        let prev = tags::prev_alloc(hdr);
        if total - need >= MIN_LARGE_BLOCK {
            tags::put(hdr, tags::pack(need, prev, true));
            let rest = tags::next_block(bp);
            let rest_size = total - need;
            tags::put(tags::header(rest), tags::pack(rest_size, true, false));
            tags::put(tags::footer(rest), tags::pack(rest_size, true, false));
            // The block past the remainder keeps the clear predecessor bit
            // it carried while the successor was free.
            self.insert(rest);
        } else {
            tags::put(hdr, tags::pack(total, prev, true));
            let after = tags::next_block(bp);
            tags::set_prev_alloc(tags::header(after));
            if !tags::is_alloc(tags::header(after)) {
                tags::set_prev_alloc(tags::footer(after));
            }
        }
        Some(bp)
    }

    /// Split `need` bytes off the front of the allocated block `bp`, freeing
    /// the tail when it can stand alone.
    ///
    /// # Safety
    /// `bp` must be a live payload pointer with block size `old >= need`.
    unsafe fn shrink(&mut self, bp: *mut u8, need: usize, old: usize) {
        if old - need < MIN_LARGE_BLOCK {
            // Tail too small to carry its own tags; keep the block as is.
            return;
        }
        let prev = tags::prev_alloc(tags::header(bp));
        tags::put(tags::header(bp), tags::pack(need, prev, true));

        let rest = tags::next_block(bp);
        let rest_size = old - need;
        tags::put(tags::header(rest), tags::pack(rest_size, true, false));
        tags::put(tags::footer(rest), tags::pack(rest_size, true, false));

        let after = tags::next_block(rest);
        tags::clear_prev_alloc(tags::header(after));
        if !tags::is_alloc(tags::header(after)) {
            tags::clear_prev_alloc(tags::footer(after));
        }

        self.insert(rest);
        self.coalesce(rest);
    }
}

/// Iterator over seeded chunks, newest first.
pub struct ChunkIter {
    cursor: *mut u8,
}

impl Iterator for ChunkIter {
    type Item = (*mut u8, usize);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor.is_null() {
            return None;
        }
        let base = self.cursor;
        unsafe {
            let span = tags::get(base.add(SPAN_OFFSET)) as usize;
            self.cursor = (base as *const usize).read_unaligned() as *mut u8;
            Some((base, span))
        }
    }
}
