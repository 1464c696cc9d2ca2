//! Round-trip scenarios over the engine and the boundary-tag heap,
//! checking the global invariants after every interesting transition:
//! slab fill/spill, split/coalesce round trips, owner resolution, and the
//! in-place and copying realloc paths.

use tandemalloc::large::{tags, LargeHeap, FIRST_PAYLOAD_OFFSET};
use tandemalloc::{Arena, Engine};

/// Collect the sizes of every block on the heap's free list.
fn free_list_sizes(heap: &LargeHeap) -> Vec<usize> {
    let mut sizes = Vec::new();
    let mut bp = heap.free_head();
    while !bp.is_null() {
        unsafe {
            sizes.push(tags::size_at(tags::header(bp)));
            bp = tags::next_free(bp);
        }
    }
    sizes.sort_unstable();
    sizes
}

// ---------------------------------------------------------------------------
// Slab fill and spill
// ---------------------------------------------------------------------------

#[test]
fn small_fill_spills_into_a_second_chunk_and_drains_clean() {
    let mut e = Engine::with_capacity(1 << 20);

    // A class-16 chunk holds (4096 - 48) / 16 = 253 slots.
    let mut ptrs: Vec<*mut u8> = (0..253)
        .map(|_| {
            let p = e.malloc(16);
            assert!(!p.is_null());
            p
        })
        .collect();
    assert_eq!(e.check_heap(false).slab_chunks, 1);

    // Slot 254 forces a fresh chunk.
    let spill = e.malloc(16);
    assert!(!spill.is_null());
    let report = e.check_heap(false);
    assert_eq!(report.slab_chunks, 2);
    assert_eq!(report.live_slots, 254);
    ptrs.push(spill);

    for p in ptrs {
        unsafe { e.free(p) };
    }
    let report = e.check_heap(false);
    assert_eq!(report.live_slots, 0, "every occupancy vector must drain");
    assert!(report.is_ok());
}

// ---------------------------------------------------------------------------
// Large split and coalesce
// ---------------------------------------------------------------------------

#[test]
fn large_split_and_coalesce_leaves_one_block_per_chunk() {
    let mut arena = Arena::new(1 << 20);
    let mut heap = LargeHeap::new();

    // Exercised against the boundary-tag heap directly, so sub-threshold
    // sizes take the large path too. The first seven requests carve up one
    // 4 KiB chunk; the 4092-byte request seeds a second, 8 KiB one.
    let sizes = [64usize, 256, 128, 512, 1024, 32, 4092];
    let blocks: Vec<*mut u8> = sizes
        .iter()
        .map(|&size| heap.alloc(&mut arena, size).unwrap())
        .collect();
    assert_eq!(heap.chunks().count(), 2);
    assert_eq!(arena.heap_size(), 4096 + 8192);

    // Release in an order that exercises all four coalesce cases, the
    // middle allocation last.
    for idx in [1usize, 4, 0, 3, 5, 6, 2] {
        unsafe { heap.free(blocks[idx]) };
    }

    // Each chunk must collapse back to a single free block spanning its
    // whole free region (span minus the 32-byte chunk overhead).
    assert_eq!(free_list_sizes(&heap), vec![4064, 8160]);
    for (base, span) in heap.chunks() {
        let bp = unsafe { base.add(FIRST_PAYLOAD_OFFSET) };
        unsafe {
            assert!(!tags::is_alloc(tags::header(bp)));
            assert_eq!(tags::size_at(tags::header(bp)), span - 32);
        }
    }
}

#[test]
fn freeing_between_allocated_neighbors_keeps_blocks_apart() {
    let mut arena = Arena::new(1 << 20);
    let mut heap = LargeHeap::new();
    let a = heap.alloc(&mut arena, 600).unwrap();
    let b = heap.alloc(&mut arena, 600).unwrap();
    let c = heap.alloc(&mut arena, 600).unwrap();
    unsafe { heap.free(b) };
    // No neighbor of b is free, so nothing merges.
    assert_eq!(free_list_sizes(&heap), vec![608, 4064 - 3 * 608]);
    unsafe {
        heap.free(a);
        heap.free(c);
    }
    assert_eq!(free_list_sizes(&heap), vec![4064]);
}

// ---------------------------------------------------------------------------
// Owner resolution
// ---------------------------------------------------------------------------

#[test]
fn every_release_finds_its_owner() {
    let mut e = Engine::with_capacity(1 << 20);
    let sizes = [16usize, 32, 48, 64, 128, 269, 578, 2000];
    let ptrs: Vec<*mut u8> = sizes
        .iter()
        .enumerate()
        .map(|(i, &size)| {
            let p = e.malloc(size);
            assert!(!p.is_null());
            unsafe { std::ptr::write_bytes(p, (i + 1) as u8, size) };
            p
        })
        .collect();

    // One chunk per class plus one large chunk.
    let report = e.check_heap(false);
    assert_eq!(report.slab_chunks, 7);
    assert_eq!(report.large_chunks, 1);

    for &p in ptrs.iter().rev() {
        unsafe { e.free(p) };
    }

    let report = e.check_heap(true);
    assert!(report.is_ok(), "verbose walk found errors");
    assert_eq!(report.live_slots, 0);
    assert_eq!(report.free_blocks, report.large_chunks);
}

// ---------------------------------------------------------------------------
// Realloc paths
// ---------------------------------------------------------------------------

#[test]
fn realloc_grows_into_the_following_free_block() {
    let mut arena = Arena::new(1 << 20);
    let mut heap = LargeHeap::new();

    let a = heap.alloc(&mut arena, 256).unwrap();
    let blocker = heap.alloc(&mut arena, 256).unwrap();
    unsafe { heap.free(blocker) };

    // 270 still fits the 592-byte minimum block: same pointer, no tag work.
    let r = unsafe { heap.resize_in_place(a, 270) };
    assert_eq!(r, Some(a));
    unsafe { assert_eq!(tags::size_at(tags::header(a)), 592) };

    // 700 outgrows the block; the freed neighbor is absorbed and the tail
    // split back off, all without moving the payload.
    let r = unsafe { heap.resize_in_place(a, 700) };
    assert_eq!(r, Some(a));
    unsafe { assert_eq!(tags::size_at(tags::header(a)), 704) };
    assert_eq!(free_list_sizes(&heap), vec![4064 - 704]);
}

#[test]
fn realloc_copies_when_the_neighbor_is_too_small() {
    let mut e = Engine::with_capacity(1 << 20);

    // Three abutting 608-byte blocks; freeing the middle one leaves a gap
    // too small to grow the first block to 1312 bytes in place.
    let a = e.malloc(600);
    let b = e.malloc(600);
    let c = e.malloc(600);
    assert!(!a.is_null() && !b.is_null() && !c.is_null());
    for i in 0..600usize {
        unsafe { a.add(i).write((i % 249) as u8) };
    }
    unsafe { e.free(b) };

    let r = unsafe { e.realloc(a, 1300) };
    assert!(!r.is_null());
    assert_ne!(r, a, "the block had to move");
    // The copy carries the old payload: the 608-byte block moves 600 bytes,
    // exactly the bytes written above.
    for i in 0..600usize {
        assert_eq!(unsafe { r.add(i).read() }, (i % 249) as u8, "byte {i} lost");
    }

    // The old block was released and merged with the freed middle one.
    let report = e.check_heap(false);
    assert!(report.is_ok());
    assert_eq!(report.free_blocks, 2);
    unsafe {
        e.free(r);
        e.free(c);
    }
    let report = e.check_heap(false);
    assert!(report.is_ok());
    assert_eq!(report.free_blocks, report.large_chunks);
}

#[test]
fn realloc_small_to_large_copies_the_slot_and_frees_it() {
    let mut e = Engine::with_capacity(1 << 20);
    let p = e.malloc(64);
    assert!(!p.is_null());
    for i in 0..64usize {
        unsafe { p.add(i).write(i as u8) };
    }
    assert_eq!(e.check_heap(false).live_slots, 1);

    let q = unsafe { e.realloc(p, 2000) };
    assert!(!q.is_null());
    assert_ne!(q, p);
    assert!(unsafe { e.usable_size(q) } >= 2000);
    // The slot's 64 bytes travel; the slot itself is released.
    for i in 0..64usize {
        assert_eq!(unsafe { q.add(i).read() }, i as u8);
    }
    let report = e.check_heap(false);
    assert_eq!(report.live_slots, 0);
    assert!(report.is_ok());
}

// ---------------------------------------------------------------------------
// Invariants under churn
// ---------------------------------------------------------------------------

#[test]
fn invariants_hold_through_mixed_churn() {
    let mut e = Engine::with_capacity(8 << 20);
    let mut rng: u64 = 0x9e37_79b9_7f4a_7c15;
    let mut next = move || {
        rng = rng
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        rng >> 33
    };

    let mut live: Vec<(*mut u8, usize)> = Vec::new();
    for step in 0..4096u32 {
        let roll = next();
        if live.len() < 128 && (roll & 1 == 0 || live.is_empty()) {
            let size = (roll as usize >> 1) % 2048 + 1;
            let p = e.malloc(size);
            assert!(!p.is_null(), "malloc({size}) failed at step {step}");
            unsafe {
                p.write(size as u8);
                p.add(size - 1).write(size as u8);
            }
            live.push((p, size));
        } else {
            let victim = roll as usize % live.len();
            let (p, size) = live.swap_remove(victim);
            unsafe {
                assert_eq!(p.read(), size as u8, "front byte clobbered");
                assert_eq!(p.add(size - 1).read(), size as u8, "back byte clobbered");
                e.free(p);
            }
        }
        if step % 512 == 0 {
            assert!(e.check_heap(false).is_ok(), "corruption at step {step}");
        }
    }

    for (p, _) in live.drain(..) {
        unsafe { e.free(p) };
    }
    let report = e.check_heap(false);
    assert!(report.is_ok());
    assert_eq!(report.live_slots, 0);
    assert_eq!(report.free_blocks, report.large_chunks);
}
