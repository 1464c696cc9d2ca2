#![no_main]

use libfuzzer_sys::fuzz_target;
use tandemalloc::Engine;

// Exercise size boundaries: interpret the input as a series of u32 sizes,
// allocate each, write the full extent, verify alignment and usable size,
// and free. The 269 and 578 slot sizes are not multiples of 16 and give no
// alignment guarantee, so alignment is only asserted outside those classes.

fuzz_target!(|data: &[u8]| {
    let mut engine = Engine::with_capacity(32 << 20);

    let mut i = 0;
    while i + 4 <= data.len() {
        let raw_size = u32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
        i += 4;

        // Cap size to keep a single request inside the arena.
        let size = (raw_size as usize) % (1024 * 1024);

        let ptr = engine.malloc(size);
        if size == 0 {
            assert!(ptr.is_null(), "malloc(0) must return null");
            continue;
        }
        if ptr.is_null() {
            continue; // Arena exhaustion is fine.
        }

        let irregular_class = (129..=269).contains(&size) || (270..=578).contains(&size);
        if !irregular_class {
            assert_eq!(
                (ptr as usize) % 16,
                0,
                "malloc({size}) returned unaligned pointer {ptr:p}"
            );
        }

        // Write the full extent and read it back.
        unsafe {
            std::ptr::write_bytes(ptr, 0xbb, size);
        }
        for j in 0..size {
            assert_eq!(unsafe { *ptr.add(j) }, 0xbb);
        }

        let usable = unsafe { engine.usable_size(ptr) };
        assert!(
            usable >= size,
            "usable_size({size}) = {usable} < requested size"
        );

        unsafe { engine.free(ptr) };

        if size < 65536 {
            let cptr = engine.calloc(1, size);
            if !cptr.is_null() {
                for j in 0..std::cmp::min(size, 4096) {
                    assert_eq!(unsafe { *cptr.add(j) }, 0, "calloc not zeroed at {j}");
                }
                unsafe { engine.free(cptr) };
            }
        }
    }

    assert!(engine.check_heap(false).is_ok());
});
