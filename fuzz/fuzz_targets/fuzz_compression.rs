#![no_main]

use libfuzzer_sys::fuzz_target;
use pyro_wire::utils::compression::{compress, decompress_with_limit};

fuzz_target!(|data: &[u8]| {
    // Round trip must hold for any input
    if let Ok(compressed) = compress(data) {
        let restored = decompress_with_limit(&compressed, data.len().max(1));
        assert_eq!(restored.ok().as_deref(), Some(data));
    }

    // Raw input must never panic and never exceed the limit
    if let Ok(out) = decompress_with_limit(data, 64 * 1024) {
        assert!(out.len() <= 64 * 1024);
    }
});
