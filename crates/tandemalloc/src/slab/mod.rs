pub mod bitmap;
pub mod pool;
pub mod size_class;

/// Bytes at the front of every slab chunk reserved for its header.
pub const SLAB_HEADER_BYTES: usize = 48;

pub use pool::{Slab, SlabPool};
