#![no_main]

use libfuzzer_sys::fuzz_target;
use tracehook::headers::{parse_line, HeaderSet};

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        // Parsing must never panic, and an accepted line must render back
        // to something that parses to the same pair
        if let Ok((name, value)) = parse_line(input) {
            let set: HeaderSet = [(name.clone(), value.clone())].into_iter().collect();
            let rendered = set.to_lines();
            assert_eq!(parse_line(&rendered[0]), Ok((name, value)));
        }
        let _ = HeaderSet::from_lines(input.lines());
    }
});
