#![no_main]

use libfuzzer_sys::fuzz_target;
use tandemalloc::Engine;

/// Interpret the input as a sequence of allocator operations.
///
/// Each operation is encoded as:
///   byte 0: opcode (0=malloc, 1=free, 2=realloc, 3=calloc)
///   byte 1-2: size (little-endian u16)
///   byte 3: slot index (which tracked pointer to operate on)
///
/// Up to 64 live pointers are tracked; the run ends with a full sweep and a
/// consistency check of the drained heap.
const MAX_SLOTS: usize = 64;

fuzz_target!(|data: &[u8]| {
    let mut engine = Engine::with_capacity(32 << 20);
    let mut slots: [*mut u8; MAX_SLOTS] = [std::ptr::null_mut(); MAX_SLOTS];

    let mut i = 0;
    while i + 4 <= data.len() {
        let opcode = data[i] & 0x03;
        let size = u16::from_le_bytes([data[i + 1], data[i + 2]]) as usize;
        let slot = (data[i + 3] as usize) % MAX_SLOTS;
        i += 4;

        match opcode {
            0 => {
                if !slots[slot].is_null() {
                    unsafe { engine.free(slots[slot]) };
                }
                let ptr = engine.malloc(size);
                slots[slot] = ptr;
                if !ptr.is_null() {
                    unsafe {
                        std::ptr::write_bytes(ptr, 0xaa, size.min(256));
                    }
                }
            }
            1 => {
                if !slots[slot].is_null() {
                    unsafe { engine.free(slots[slot]) };
                    slots[slot] = std::ptr::null_mut();
                }
            }
            2 => {
                if slots[slot].is_null() {
                    continue;
                }
                let ptr = unsafe { engine.realloc(slots[slot], size) };
                if size == 0 {
                    // Resizing to zero frees the block and hands back the
                    // stale pointer; drop it.
                    slots[slot] = std::ptr::null_mut();
                } else if !ptr.is_null() {
                    slots[slot] = ptr;
                    unsafe {
                        std::ptr::write_bytes(ptr, 0xbb, size.min(256));
                    }
                }
                // A null result leaves the old block live in its slot.
            }
            3 => {
                if !slots[slot].is_null() {
                    unsafe { engine.free(slots[slot]) };
                }
                let num = (size & 0xff).max(1);
                let each = (size >> 8).max(1);
                let ptr = engine.calloc(num, each);
                slots[slot] = ptr;
                if !ptr.is_null() {
                    let bytes = unsafe { std::slice::from_raw_parts(ptr, num * each) };
                    assert!(bytes.iter().all(|&b| b == 0));
                }
            }
            _ => unreachable!(),
        }
    }

    for slot in 0..MAX_SLOTS {
        if !slots[slot].is_null() {
            unsafe { engine.free(slots[slot]) };
        }
    }
    let report = engine.check_heap(false);
    assert!(report.is_ok());
    assert_eq!(report.live_slots, 0);
});
