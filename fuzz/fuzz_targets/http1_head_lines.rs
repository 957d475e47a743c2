#![no_main]

use libfuzzer_sys::fuzz_target;

use tilecache::proxy::http::codec::{parse_request_line, parse_status_line};

fuzz_target!(|data: &[u8]| {
    let Ok(line) = std::str::from_utf8(data) else {
        return;
    };
    let _ = parse_request_line(line);
    let _ = parse_status_line(line);
});
