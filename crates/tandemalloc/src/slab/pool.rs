use crate::arena::{AllocError, Arena};
use crate::slab::bitmap::Occupancy;
use crate::slab::size_class::{self, NUM_CLASSES};
use crate::slab::SLAB_HEADER_BYTES;
use crate::util::CHUNK_SIZE;
use core::mem;
use core::ptr;
use log::trace;

/// Header at the front of every 4 KiB slab chunk. The remaining bytes of
/// the chunk are an array of fixed-size slots.
#[repr(C)]
pub struct Slab {
    /// Next chunk serving the same class (null terminates the list).
    next: *mut Slab,
    /// One bit per slot; set means allocated.
    occupancy: Occupancy,
    /// Fixed slot size, one of the class bounds.
    slot_size: u32,
    /// Smallest request this class serves. Diagnostics only.
    min_size: u32,
}

const _: () = assert!(mem::size_of::<Slab>() == SLAB_HEADER_BYTES);

impl Slab {
    /// Slots this chunk holds.
    #[inline]
    pub fn capacity(&self) -> usize {
        size_class::capacity(self.slot_size)
    }

    #[inline]
    pub fn slot_size(&self) -> u32 {
        self.slot_size
    }

    #[inline]
    pub fn min_size(&self) -> u32 {
        self.min_size
    }

    #[inline]
    pub fn next(&self) -> *mut Slab {
        self.next
    }

    #[inline]
    pub fn occupancy(&self) -> &Occupancy {
        &self.occupancy
    }

    /// Base address of slot `index`.
    ///
    /// # Safety
    /// `self` must live at the front of a mapped chunk and `index` must be
    /// below `capacity()`.
    unsafe fn slot_addr(&self, index: usize) -> *mut u8 {
        let base = self as *const Slab as *mut u8;
        base.add(SLAB_HEADER_BYTES + index * self.slot_size as usize)
    }
}

/// The segregated pool: one chunk list per small size class, newest chunk
/// first. Chunks are never returned to the arena.
pub struct SlabPool {
    heads: [*mut Slab; NUM_CLASSES],
}

impl SlabPool {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        SlabPool {
            heads: [ptr::null_mut(); NUM_CLASSES],
        }
    }

    /// Drop every chunk list. The chunks themselves stay in the arena.
    pub fn reset(&mut self) {
        self.heads = [ptr::null_mut(); NUM_CLASSES];
    }

    /// Head of the chunk list for `class` (diagnostics).
    #[inline]
    pub fn head(&self, class: usize) -> *mut Slab {
        self.heads[class]
    }

    /// Allocate one slot from `class`, growing the chunk list when every
    /// existing chunk is full.
    pub fn alloc(&mut self, arena: &mut Arena, class: usize) -> Result<*mut u8, AllocError> {
        if self.heads[class].is_null() {
            self.grow(arena, class)?;
        }

        let mut chunk = self.heads[class];
        loop {
            // Chunks are searched newest first; within a chunk the lowest
            // free slot wins.
            let slab = unsafe { &mut *chunk };
            let capacity = slab.capacity();
            if let Some(slot) = slab.occupancy.acquire_lowest(capacity) {
                return Ok(unsafe { slab.slot_addr(slot) });
            }
            chunk = if slab.next.is_null() {
                self.grow(arena, class)?
            } else {
                slab.next
            };
        }
    }

    /// Carve a fresh chunk out of the arena and link it at the class head.
    fn grow(&mut self, arena: &mut Arena, class: usize) -> Result<*mut Slab, AllocError> {
        let base = arena.extend(CHUNK_SIZE)?;
        let slab = base as *mut Slab;
        unsafe {
            slab.write(Slab {
                next: self.heads[class],
                occupancy: Occupancy::new(),
                slot_size: size_class::slot_size(class),
                min_size: size_class::min_size(class),
            });
        }
        trace!(
            "new slab chunk {base:p} for class {}",
            size_class::slot_size(class)
        );
        self.heads[class] = slab;
        Ok(slab)
    }

    /// Find the chunk owning `ptr`, searching every class list. None means
    /// the pointer does not belong to the pool.
    pub fn chunk_of(&self, ptr: *const u8) -> Option<*mut Slab> {
        let p = ptr as usize;
        for &head in &self.heads {
            let mut chunk = head;
            while !chunk.is_null() {
                let base = chunk as usize;
                // Payload addresses start past the header, so the strict
                // lower bound can never exclude a real slot.
                if p > base && p < base + CHUNK_SIZE {
                    return Some(chunk);
                }
                chunk = unsafe { (*chunk).next };
            }
        }
        None
    }

    /// Release the slot holding `ptr` back to `chunk`.
    ///
    /// # Safety
    /// `chunk` must be the chunk returned by `chunk_of(ptr)` and `ptr` must
    /// be a live slot address produced by `alloc`. Releasing a slot twice is
    /// undefined.
    pub unsafe fn free(&mut self, chunk: *mut Slab, ptr: *const u8) {
        let slab = &mut *chunk;
        let first_slot = chunk as usize + SLAB_HEADER_BYTES;
        let slot = (ptr as usize - first_slot) / slab.slot_size as usize;
        slab.occupancy.release(slot);
    }

    /// Total live slots across every chunk (diagnostics).
    pub fn live_slots(&self) -> usize {
        let mut live = 0;
        for &head in &self.heads {
            let mut chunk = head;
            while !chunk.is_null() {
                let slab = unsafe { &*chunk };
                live += slab.occupancy.live_count();
                chunk = slab.next;
            }
        }
        live
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slab::size_class::capacity;

    fn pool_and_arena() -> (SlabPool, Arena) {
        (SlabPool::new(), Arena::new(64 * CHUNK_SIZE))
    }

    #[test]
    fn slots_are_dense_and_header_offset() {
        let (mut pool, mut arena) = pool_and_arena();
        let a = pool.alloc(&mut arena, 0).unwrap();
        let b = pool.alloc(&mut arena, 0).unwrap();
        let head = pool.head(0) as usize;
        assert_eq!(a as usize, head + SLAB_HEADER_BYTES);
        assert_eq!(b as usize, a as usize + 16);
    }

    #[test]
    fn full_chunk_spills_into_a_new_one() {
        let (mut pool, mut arena) = pool_and_arena();
        let cap = capacity(16);
        for _ in 0..cap {
            pool.alloc(&mut arena, 0).unwrap();
        }
        let first = pool.head(0);
        let spilled = pool.alloc(&mut arena, 0).unwrap();
        let second = pool.head(0);
        assert_ne!(first, second, "a fresh chunk must be linked at the head");
        assert_eq!(spilled as usize, second as usize + SLAB_HEADER_BYTES);
        assert_eq!(arena.heap_size(), 2 * CHUNK_SIZE);
    }

    #[test]
    fn freed_slot_is_reused_first() {
        let (mut pool, mut arena) = pool_and_arena();
        let slots: Vec<_> = (0..5).map(|_| pool.alloc(&mut arena, 1).unwrap()).collect();
        let chunk = pool.chunk_of(slots[2]).unwrap();
        unsafe { pool.free(chunk, slots[2]) };
        let again = pool.alloc(&mut arena, 1).unwrap();
        assert_eq!(again, slots[2]);
    }

    #[test]
    fn owner_lookup_spans_classes_and_chunks() {
        let (mut pool, mut arena) = pool_and_arena();
        let small = pool.alloc(&mut arena, 0).unwrap();
        let big = pool.alloc(&mut arena, 6).unwrap();
        let small_chunk = pool.chunk_of(small).unwrap();
        let big_chunk = pool.chunk_of(big).unwrap();
        assert_ne!(small_chunk, big_chunk);
        assert_eq!(unsafe { (*small_chunk).slot_size() }, 16);
        assert_eq!(unsafe { (*big_chunk).slot_size() }, 578);
        assert!(pool.chunk_of(ptr::null()).is_none());
    }

    #[test]
    fn reset_forgets_every_chunk() {
        let (mut pool, mut arena) = pool_and_arena();
        let p = pool.alloc(&mut arena, 3).unwrap();
        pool.reset();
        assert!(pool.chunk_of(p).is_none());
        assert_eq!(pool.live_slots(), 0);
    }

    #[test]
    fn exhausted_arena_propagates() {
        let mut pool = SlabPool::new();
        let mut arena = Arena::new(CHUNK_SIZE);
        pool.alloc(&mut arena, 0).unwrap();
        // Arena is one chunk; a second class cannot grow.
        assert!(pool.alloc(&mut arena, 1).is_err());
    }
}
