//! Memory allocators
//!
//! [`buddy`] owns every physical frame; [`slab`] carves buddy blocks into
//! fixed-size kernel objects.

pub mod buddy;
pub mod slab;

#[cfg(test)]
mod tests_prop;

pub use buddy::{BuddyStats, FrameAllocator, FrameFlags, PageFrame};
pub use slab::{ObjectCache, SLAB_END, SlabCache, SlabGeometry, SlabStats};
