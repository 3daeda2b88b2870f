//! Tests for the buddy allocator: region setup, split/merge behavior, and
//! the free-list invariants.

extern crate std;

use self::std::boxed::Box;
use self::std::dbg;
use self::std::vec;
use self::std::vec::Vec;

use super::*;

/// Blocks in the largest test region.
const TEST_BLOCKS: usize = 64;

/// A block-aligned buffer backing a test allocator.
#[repr(align(4096))]
struct Region([u8; TEST_BLOCKS * BLOCK_SIZE]);

fn region() -> Box<Region> {
    Box::new(Region([0; TEST_BLOCKS * BLOCK_SIZE]))
}

fn buddy_with(region: &mut Region, blocks: usize) -> &mut BuddyAllocator {
    unsafe {
        BuddyAllocator::init(region.0.as_mut_ptr(), blocks)
            .expect("buddy init failed")
            .as_mut()
    }
}

/// Collects every (order, base index) pair reachable from the free lists.
fn free_chunks(buddy: &BuddyAllocator) -> Vec<(usize, usize)> {
    let mut chunks = Vec::new();
    for order in 0..MAX_ORDER {
        let mut cursor = buddy.free_lists[order];
        while let Some(chunk) = cursor {
            chunks.push((order, buddy.index_of(chunk.as_ptr().cast()).number()));
            cursor = unsafe { chunk.as_ref().next };
        }
    }
    chunks
}

/// Asserts that free chunks cover disjoint block ranges, that every chunk is
/// aligned to its own span, and that no two same-order chunks are buddies.
fn assert_free_list_invariants(buddy: &BuddyAllocator) {
    let chunks = free_chunks(buddy);
    for (i, &(order, base)) in chunks.iter().enumerate() {
        let span = 1usize << order;
        assert_eq!(base % span, 0, "chunk at {} not aligned to span {}", base, span);
        for &(other_order, other_base) in &chunks[i + 1..] {
            let other_span = 1usize << other_order;
            let disjoint = base + span <= other_base || other_base + other_span <= base;
            assert!(
                disjoint,
                "free chunks overlap: ({}, {}) and ({}, {})",
                order, base, other_order, other_base
            );
            if order == other_order {
                assert!(
                    BlockIndex(base).partner(span).number() != other_base,
                    "uncoalesced buddies at order {}: {} and {}",
                    order,
                    base,
                    other_base
                );
            }
        }
    }
}

#[test]
fn rejects_null_and_undersized_regions() {
    unsafe {
        assert!(BuddyAllocator::init(core::ptr::null_mut(), TEST_BLOCKS).is_none());
    }
    let mut region = region();
    unsafe {
        assert!(BuddyAllocator::init(region.0.as_mut_ptr(), 0).is_none());
    }
}

#[test]
fn header_only_region_has_no_space() {
    assert_eq!(BuddyAllocator::header_blocks(), 1);
    let mut region = region();
    let buddy = buddy_with(&mut region, 1);
    assert_eq!(buddy.free_block_count(), 0);
    assert!(buddy.take(1).is_none());
}

#[test]
fn init_lays_out_one_chunk_per_set_bit() {
    let mut region = region();
    let buddy = buddy_with(&mut region, TEST_BLOCKS);
    assert_eq!(buddy.total_blocks(), 63);
    assert_eq!(buddy.free_block_count(), 63);

    let mut chunks = free_chunks(buddy);
    chunks.sort();
    // 63 = 0b111111: one chunk per set bit, largest first, contiguous.
    assert_eq!(chunks, vec![(0, 62), (1, 60), (2, 56), (3, 48), (4, 32), (5, 0)]);
    assert_free_list_invariants(buddy);
}

#[test]
fn chunk_size_rounds_to_powers_of_two() {
    assert_eq!(chunk_size(0), None);
    assert_eq!(chunk_size(1), Some(ChunkSize { order: 0, blocks: 1 }));
    assert_eq!(chunk_size(BLOCK_SIZE), Some(ChunkSize { order: 0, blocks: 1 }));
    assert_eq!(chunk_size(BLOCK_SIZE + 1), Some(ChunkSize { order: 1, blocks: 2 }));
    assert_eq!(chunk_size(3 * BLOCK_SIZE), Some(ChunkSize { order: 2, blocks: 4 }));
    assert_eq!(
        chunk_size(BLOCK_SIZE << (MAX_ORDER - 1)),
        Some(ChunkSize {
            order: MAX_ORDER - 1,
            blocks: 1 << (MAX_ORDER - 1),
        })
    );
    assert_eq!(chunk_size(BLOCK_SIZE << MAX_ORDER), None);
}

#[test]
fn partner_alternates_sides() {
    assert_eq!(BlockIndex(0).partner(1).number(), 1);
    assert_eq!(BlockIndex(1).partner(1).number(), 0);
    assert_eq!(BlockIndex(2).partner(1).number(), 3);
    // 4 is an odd multiple of 4, 8 an even one.
    assert_eq!(BlockIndex(4).partner(4).number(), 0);
    assert_eq!(BlockIndex(8).partner(4).number(), 12);
    assert_eq!(BlockIndex(12).partner(4).number(), 8);
}

#[test]
fn take_splits_down_to_target_order() {
    let mut region = region();
    // 33 blocks: after the header a single order-5 chunk remains.
    let buddy = buddy_with(&mut region, 33);
    assert_eq!(buddy.free_block_count(), 32);

    let chunk = buddy.take(BLOCK_SIZE).expect("take failed");
    assert_eq!(buddy.free_block_count(), 31);
    // Each split leaves one upper half behind, at every order below 5.
    for order in 0..5 {
        assert_eq!(buddy.chunks_at(order), 1, "order {}", order);
    }
    assert_eq!(buddy.chunks_at(5), 0);
    assert_free_list_invariants(buddy);

    unsafe { buddy.give(chunk, BLOCK_SIZE) };
    assert_eq!(buddy.free_block_count(), 32);
    assert_eq!(buddy.chunks_at(5), 1);
    for order in 0..5 {
        assert_eq!(buddy.chunks_at(order), 0, "order {}", order);
    }
}

#[test]
fn give_keeps_chunk_when_buddy_is_taken() {
    let mut region = region();
    let buddy = buddy_with(&mut region, 33);
    let a = buddy.take(BLOCK_SIZE).unwrap();
    let b = buddy.take(BLOCK_SIZE).unwrap();

    // `a` and `b` came out of the same order-1 split; with `b` still taken,
    // giving `a` back must not merge anything.
    unsafe { buddy.give(a, BLOCK_SIZE) };
    assert_eq!(buddy.chunks_at(0), 1);
    assert_free_list_invariants(buddy);

    // Returning `b` re-merges all the way back up to a single order-5 chunk.
    unsafe { buddy.give(b, BLOCK_SIZE) };
    assert_eq!(buddy.chunks_at(0), 0);
    assert_eq!(buddy.chunks_at(5), 1);
    assert_eq!(buddy.free_block_count(), 32);
}

#[test]
fn take_needs_a_chunk_at_or_above_target_order() {
    let mut region = region();
    // avail = 3 blocks: one order-1 chunk and one order-0 chunk.
    let buddy = buddy_with(&mut region, 4);
    assert_eq!(buddy.free_block_count(), 3);

    assert!(buddy.take(4 * BLOCK_SIZE).is_none());
    assert!(buddy.take(3 * BLOCK_SIZE).is_none());
    assert_eq!(buddy.free_block_count(), 3);

    let chunk = buddy.take(2 * BLOCK_SIZE).unwrap();
    assert_eq!(buddy.free_block_count(), 1);
    unsafe { buddy.give(chunk, 2 * BLOCK_SIZE) };
    assert_eq!(buddy.free_block_count(), 3);
    assert_free_list_invariants(buddy);
}

#[test]
fn mixed_sequence_conserves_blocks() {
    let mut region = region();
    let buddy = buddy_with(&mut region, TEST_BLOCKS);
    let before = buddy.free_block_count();

    let a = buddy.take(5 * BLOCK_SIZE).unwrap(); // 8 blocks
    let b = buddy.take(BLOCK_SIZE / 2).unwrap(); // 1 block
    let c = buddy.take(16 * BLOCK_SIZE).unwrap(); // 16 blocks
    assert_free_list_invariants(buddy);
    assert_eq!(buddy.free_block_count(), before - 25);

    unsafe { buddy.give(a, 5 * BLOCK_SIZE) };
    let d = buddy.take(2 * BLOCK_SIZE).unwrap();
    unsafe { buddy.give(c, 16 * BLOCK_SIZE) };
    unsafe { buddy.give(b, BLOCK_SIZE / 2) };
    unsafe { buddy.give(d, 2 * BLOCK_SIZE) };

    assert_eq!(buddy.free_block_count(), before);
    assert_free_list_invariants(buddy);
    dbg!(&buddy);
}

#[test]
fn exhaustion_then_full_give_back_restores_count() {
    let mut region = region();
    let buddy = buddy_with(&mut region, TEST_BLOCKS);

    let mut taken = Vec::new();
    while let Some(chunk) = buddy.take(BLOCK_SIZE) {
        taken.push(chunk);
    }
    assert_eq!(taken.len(), 63);
    assert_eq!(buddy.free_block_count(), 0);

    for chunk in taken {
        unsafe { buddy.give(chunk, BLOCK_SIZE) };
    }
    assert_eq!(buddy.free_block_count(), 63);
    assert_free_list_invariants(buddy);
}
