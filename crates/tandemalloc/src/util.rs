/// Boundary-tag word size (bytes).
pub const WORD: usize = 4;

/// Free-list link word size (bytes).
pub const DWORD: usize = 8;

/// Alignment of payload addresses, where the slot size permits it.
pub const MIN_ALIGN: usize = 16;

/// Chunk granularity: slab chunks are exactly this many bytes, large chunks
/// a multiple of it.
pub const CHUNK_SIZE: usize = 4096;

/// Largest request served by the slab pool; anything bigger goes to the
/// boundary-tag heap.
pub const LARGE_THRESHOLD: usize = 578;

/// Minimum total size of a block on the explicit free list, including its
/// header, footer, and both link words.
pub const MIN_LARGE_BLOCK: usize = 592;

/// Default capacity of the simulated arena (20 MiB).
pub const DEFAULT_HEAP_LIMIT: usize = 20 * (1 << 20);

/// Round a byte count up to the next payload alignment boundary.
#[inline(always)]
pub const fn round_to_align(bytes: usize) -> usize {
    (bytes + MIN_ALIGN - 1) & !(MIN_ALIGN - 1)
}

/// Round a byte count up to whole chunks.
#[inline(always)]
pub const fn round_to_chunk(bytes: usize) -> usize {
    (bytes + CHUNK_SIZE - 1) & !(CHUNK_SIZE - 1)
}
