#![no_main]

use libfuzzer_sys::fuzz_target;

use tilecache::proxy::path::fuzzing::map_and_check;

fuzz_target!(|data: &[u8]| {
    let input = String::from_utf8_lossy(data);
    map_and_check(input.as_ref());
    if !input.starts_with('/') {
        map_and_check(&format!("/{input}"));
    }
});
