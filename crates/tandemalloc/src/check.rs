//! Read-only consistency walk over both allocator structures.
//!
//! The walker validates every structural invariant it can observe and
//! optionally prints the full layout, in the spirit of a heap checker that
//! is safe to call at any point between public operations. It never mutates
//! allocator state.

use crate::large::{tags, LargeHeap, FIRST_PAYLOAD_OFFSET, PROLOGUE_OFFSET};
use crate::slab::bitmap::MAX_SLOTS;
use crate::slab::size_class::{self, CLASS_BOUNDS, NUM_CLASSES};
use crate::slab::SlabPool;
use crate::util::{DWORD, MIN_ALIGN, MIN_LARGE_BLOCK, WORD};
use std::io::Write;

/// Outcome of a heap walk. `errors` counts every violated invariant; the
/// remaining fields describe the population the walk visited.
#[derive(Debug, Default, Clone)]
pub struct CheckReport {
    /// Slab chunks across all classes.
    pub slab_chunks: usize,
    /// Allocated slots across all slab chunks.
    pub live_slots: usize,
    /// Seeded large chunks.
    pub large_chunks: usize,
    /// Blocks between prologue and epilogue, all chunks.
    pub blocks: usize,
    /// Free blocks discovered by the physical walk.
    pub free_blocks: usize,
    /// Entries on the explicit free list.
    pub free_list_len: usize,
    /// Invariant violations.
    pub errors: usize,
}

impl CheckReport {
    pub fn is_ok(&self) -> bool {
        self.errors == 0
    }
}

macro_rules! emit {
    ($out:expr, $($arg:tt)*) => {{
        let _ = writeln!($out, $($arg)*);
    }};
}

/// Walk both structures, validating invariants and printing the layout when
/// `verbose` is set. Errors are always printed.
pub(crate) fn run(
    pool: &SlabPool,
    heap: &LargeHeap,
    verbose: bool,
    out: &mut dyn Write,
) -> CheckReport {
    let mut report = CheckReport::default();
    check_slabs(pool, verbose, out, &mut report);
    check_blocks(heap, verbose, out, &mut report);
    check_free_list(heap, verbose, out, &mut report);
    if report.free_list_len != report.free_blocks {
        report.errors += 1;
        emit!(
            out,
            "Error: free list holds {} entries but the walk found {} free blocks",
            report.free_list_len,
            report.free_blocks
        );
    }
    report
}

fn check_slabs(pool: &SlabPool, verbose: bool, out: &mut dyn Write, report: &mut CheckReport) {
    for class in 0..NUM_CLASSES {
        let mut chunk = pool.head(class);
        while !chunk.is_null() {
            let slab = unsafe { &*chunk };
            report.slab_chunks += 1;
            report.live_slots += slab.occupancy().live_count();

            if verbose {
                emit!(
                    out,
                    "({:p})  |  Size: {:3} - {:<3}  |  Next: {:p}  |  Capacity: {}",
                    chunk,
                    slab.min_size(),
                    slab.slot_size(),
                    slab.next(),
                    slab.capacity()
                );
                let lanes = slab.occupancy().lanes();
                emit!(
                    out,
                    "Status: [{:#018x}:{:#018x}:{:#018x}:{:#018x}]",
                    lanes[3],
                    lanes[2],
                    lanes[1],
                    lanes[0]
                );
            }

            if slab.slot_size() != size_class::slot_size(class) {
                report.errors += 1;
                emit!(
                    out,
                    "Error: chunk {:p} serves slot size {} on the class-{} list",
                    chunk,
                    slab.slot_size(),
                    CLASS_BOUNDS[class]
                );
            }
            if slab.min_size() != size_class::min_size(class) {
                report.errors += 1;
                emit!(
                    out,
                    "Error: chunk {:p} records min size {} (want {})",
                    chunk,
                    slab.min_size(),
                    size_class::min_size(class)
                );
            }
            for slot in slab.capacity()..MAX_SLOTS {
                if slab.occupancy().is_set(slot) {
                    report.errors += 1;
                    emit!(
                        out,
                        "Error: chunk {:p} occupancy bit {} is past capacity {}",
                        chunk,
                        slot,
                        slab.capacity()
                    );
                }
            }

            chunk = slab.next();
        }
    }
}

fn check_blocks(heap: &LargeHeap, verbose: bool, out: &mut dyn Write, report: &mut CheckReport) {
    for (base, span) in heap.chunks() {
        report.large_chunks += 1;
        if verbose {
            emit!(out, "chunk {:p}: span {}", base, span);
        }

        unsafe {
            let pro_hdr = base.add(PROLOGUE_OFFSET);
            let pro_ftr = base.add(PROLOGUE_OFFSET + WORD);
            if verbose {
                emit!(
                    out,
                    "{:p}: Prologue: header: [{}:{}{}] | footer: [{}:{}{}]",
                    pro_hdr,
                    tags::size_at(pro_hdr),
                    alloc_char(tags::prev_alloc(pro_hdr)),
                    alloc_char(tags::is_alloc(pro_hdr)),
                    tags::size_at(pro_ftr),
                    alloc_char(tags::prev_alloc(pro_ftr)),
                    alloc_char(tags::is_alloc(pro_ftr))
                );
            }
            if tags::get(pro_hdr) != tags::get(pro_ftr) {
                report.errors += 1;
                emit!(out, "Error: Bad prologue - header and footer disagree");
            }
            if tags::size_at(pro_hdr) != DWORD || !tags::is_alloc(pro_hdr) {
                report.errors += 1;
                emit!(out, "Error: Bad prologue - wrong size or allocation bit");
            }

            let end = base as usize + span;
            let mut bp = base.add(FIRST_PAYLOAD_OFFSET);
            let mut prev_was_alloc = true;
            let mut prev_was_free = false;
            loop {
                let hdr = tags::header(bp);
                let size = tags::size_at(hdr);

                if size == 0 {
                    // Epilogue.
                    if verbose {
                        emit!(
                            out,
                            "{:p}: Epilogue: [0:{}{}]",
                            hdr,
                            alloc_char(tags::prev_alloc(hdr)),
                            alloc_char(tags::is_alloc(hdr))
                        );
                    }
                    if !tags::is_alloc(hdr) {
                        report.errors += 1;
                        emit!(out, "Error: Bad epilogue - allocation bit clear");
                    }
                    if hdr as usize != end - WORD {
                        report.errors += 1;
                        emit!(out, "Error: Bad epilogue - not at the chunk end");
                    }
                    if tags::prev_alloc(hdr) != prev_was_alloc {
                        report.errors += 1;
                        emit!(out, "Error: epilogue predecessor bit is stale");
                    }
                    break;
                }

                report.blocks += 1;
                let allocated = tags::is_alloc(hdr);

                if verbose {
                    print_block(out, bp, allocated);
                }
                if bp as usize % MIN_ALIGN != 0 {
                    report.errors += 1;
                    emit!(out, "Error: {:p} is not {} byte aligned", bp, MIN_ALIGN);
                }
                if size < MIN_LARGE_BLOCK {
                    report.errors += 1;
                    emit!(
                        out,
                        "Error: block size {} is below the minimum {}",
                        size,
                        MIN_LARGE_BLOCK
                    );
                }
                if size % MIN_ALIGN != 0 {
                    report.errors += 1;
                    emit!(out, "Error: block size {} is not {} byte aligned", size, MIN_ALIGN);
                }
                if tags::prev_alloc(hdr) != prev_was_alloc {
                    report.errors += 1;
                    emit!(
                        out,
                        "Error: {:p} predecessor bit disagrees with the previous block",
                        bp
                    );
                }
                if !allocated {
                    report.free_blocks += 1;
                    if tags::get(hdr) != tags::get(tags::footer(bp)) {
                        report.errors += 1;
                        emit!(out, "Error: {:p} header does not match footer", bp);
                    }
                    if prev_was_free {
                        report.errors += 1;
                        emit!(out, "Error: {:p} follows another free block", bp);
                    }
                }

                prev_was_free = !allocated;
                prev_was_alloc = allocated;
                // The epilogue's payload address is exactly the chunk end,
                // so only an overshoot past it is a torn size field.
                let next = tags::next_block(bp);
                if next as usize > end || next as usize <= bp as usize {
                    report.errors += 1;
                    emit!(out, "Error: block at {:p} runs past its chunk", bp);
                    break;
                }
                bp = next;
            }
        }
    }
}

fn check_free_list(heap: &LargeHeap, verbose: bool, out: &mut dyn Write, report: &mut CheckReport) {
    if verbose {
        emit!(out, "Free list check:");
    }
    let mut bp = heap.free_head();
    let mut prev = core::ptr::null_mut();
    while !bp.is_null() {
        unsafe {
            let next = tags::next_free(bp);
            if verbose {
                emit!(out, "{:p}: next: {:p}, prev: {:p}", bp, next, tags::prev_free(bp));
            }
            if tags::prev_free(bp) != prev {
                report.errors += 1;
                emit!(out, "Error: Bad free list pointers at {:p}", bp);
            }
            if tags::is_alloc(tags::header(bp)) {
                report.errors += 1;
                emit!(out, "Error: allocated block {:p} is on the free list", bp);
            }
            report.free_list_len += 1;
            if report.free_list_len > report.blocks {
                report.errors += 1;
                emit!(out, "Error: free list is longer than the heap has blocks");
                break;
            }
            prev = bp;
            bp = next;
        }
    }
}

fn print_block(out: &mut dyn Write, bp: *mut u8, allocated: bool) {
    unsafe {
        let hdr = tags::header(bp);
        if allocated {
            emit!(
                out,
                "{:p}: header: [{}:{}{}]",
                bp,
                tags::size_at(hdr),
                alloc_char(tags::prev_alloc(hdr)),
                alloc_char(tags::is_alloc(hdr))
            );
        } else {
            let ftr = tags::footer(bp);
            emit!(
                out,
                "{:p}: header: [{}:{}{}] | next: {:p} | prev: {:p} | footer: [{}:{}{}]",
                bp,
                tags::size_at(hdr),
                alloc_char(tags::prev_alloc(hdr)),
                alloc_char(tags::is_alloc(hdr)),
                tags::next_free(bp),
                tags::prev_free(bp),
                tags::size_at(ftr),
                alloc_char(tags::prev_alloc(ftr)),
                alloc_char(tags::is_alloc(ftr))
            );
        }
    }
}

fn alloc_char(bit: bool) -> char {
    if bit {
        'a'
    } else {
        'f'
    }
}
