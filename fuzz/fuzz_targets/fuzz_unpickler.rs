#![no_main]

use libfuzzer_sys::fuzz_target;
use pyro_wire::{dumps, loads};

fuzz_target!(|data: &[u8]| {
    // Anything that decodes must encode again
    if let Ok(value) = loads(data) {
        let _ = dumps(&value, 2);
    }
});
