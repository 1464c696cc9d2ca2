use crate::slab::SLAB_HEADER_BYTES;
use crate::util::{CHUNK_SIZE, LARGE_THRESHOLD};

/// Number of small size classes.
pub const NUM_CLASSES: usize = 7;

/// Payload upper bound of each class, sorted ascending. A request lands in
/// the first class whose bound is not below it; anything past the last bound
/// is routed to the boundary-tag heap.
pub static CLASS_BOUNDS: [u32; NUM_CLASSES] = [16, 32, 48, 64, 128, 269, 578];

/// Look up the class index for a request. None routes to the large
/// allocator.
#[inline]
pub fn class_index(size: usize) -> Option<usize> {
    if size > LARGE_THRESHOLD {
        return None;
    }
    CLASS_BOUNDS.iter().position(|&bound| size <= bound as usize)
}

/// Slot size of a class.
#[inline]
pub fn slot_size(class: usize) -> u32 {
    CLASS_BOUNDS[class]
}

/// Smallest request a class serves: one past the previous class's bound.
#[inline]
pub fn min_size(class: usize) -> u32 {
    if class == 0 {
        1
    } else {
        CLASS_BOUNDS[class - 1] + 1
    }
}

/// Slots a single chunk with the given slot size holds.
#[inline]
pub fn capacity(slot_size: u32) -> usize {
    (CHUNK_SIZE - SLAB_HEADER_BYTES) / slot_size as usize
}
