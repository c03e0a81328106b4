#![cfg(test)]
//! Property tests for the frame and slab allocators
//!
//! TEST_SCOPE:
//!   - buddy conservation under arbitrary allocate/free sequences
//!   - coalescing returns the allocator to its initial block layout
//!   - slab alloc/free keeps the live-object count and list state consistent

extern crate alloc;

use alloc::vec::Vec;

use proptest::prelude::*;

use super::buddy::FrameAllocator;
use super::slab::SlabCache;
use crate::config::{MAX_ORDER, ORDER_COUNT};
use crate::error::{Fatal, MmError};
use crate::physical::{PAGE_SIZE, PhysAddr};
use crate::testing::Arena;

#[derive(Debug, Clone)]
enum Op {
    Alloc(usize),
    Free(usize),
}

fn arb_ops() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            (0usize..=4).prop_map(Op::Alloc),
            any::<usize>().prop_map(Op::Free),
        ],
        1..200,
    )
}

fn layout(frames: &FrameAllocator) -> [usize; ORDER_COUNT] {
    core::array::from_fn(|order| frames.free_blocks(order))
}

proptest! {
    #[test]
    fn buddy_conservation(ops in arb_ops()) {
        let arena = Arena::new(1024 + 64);
        let frames = arena.frames();
        let initial = layout(frames);
        let mut live: Vec<(PhysAddr, usize)> = Vec::new();

        for op in ops {
            match op {
                Op::Alloc(order) => match frames.alloc_order(order) {
                    Ok(pa) => {
                        prop_assert_eq!((pa.0 - frames.base()) % (PAGE_SIZE << order), 0);
                        live.push((pa, order));
                    }
                    Err(e) => prop_assert_eq!(e, MmError::Fatal(Fatal::OutOfFrames)),
                },
                Op::Free(pick) if !live.is_empty() => {
                    let (pa, _) = live.swap_remove(pick % live.len());
                    frames.free(pa).unwrap();
                }
                Op::Free(_) => {}
            }
            let allocated: usize = live.iter().map(|(_, order)| 1usize << order).sum();
            prop_assert_eq!(frames.free_frames() + allocated, frames.total_frames());
            prop_assert!(frames.check_invariants());
        }

        for (pa, _) in live.drain(..) {
            frames.free(pa).unwrap();
        }
        prop_assert_eq!(layout(frames), initial);
        prop_assert_eq!(frames.free_blocks(MAX_ORDER), 1);
    }

    #[test]
    fn slab_alloc_free_consistency(
        size in 1usize..600,
        align_shift in 0u32..7,
        picks in prop::collection::vec(any::<Option<usize>>(), 1..300),
    ) {
        let arena = Arena::new(256);
        let cache = SlabCache::create("prop", size, 1 << align_shift, arena.frames().clone()).unwrap();
        let mut live = Vec::new();

        for pick in picks {
            match pick {
                None => {
                    let obj = cache.alloc().unwrap();
                    prop_assert_eq!(obj.as_ptr() as usize % (1 << align_shift), 0);
                    live.push(obj);
                }
                Some(i) if !live.is_empty() => {
                    let obj = live.swap_remove(i % live.len());
                    cache.free(obj).unwrap();
                }
                Some(_) => {}
            }
            let stats = cache.stats();
            prop_assert_eq!(stats.in_use, live.len());
            let capacity = (stats.partial + stats.full) * cache.geometry().capacity;
            prop_assert!(stats.in_use <= capacity);
            prop_assert!(stats.full * cache.geometry().capacity <= stats.in_use);
        }

        for obj in live.drain(..) {
            cache.free(obj).unwrap();
        }
        cache.destroy().unwrap();
        prop_assert_eq!(arena.frames().free_frames(), 256);
    }
}
