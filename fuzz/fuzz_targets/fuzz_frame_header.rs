#![no_main]

use libfuzzer_sys::fuzz_target;
use milli_sslstream::record::{detect_framing, try_get_frame_header, Framing, MAX_RECORD_PAYLOAD};

fuzz_target!(|data: &[u8]| {
    // Never panics; no framing reports an oversized record.
    let framing = detect_framing(data);
    for framing in [framing, Framing::Unknown, Framing::Ssl3Plus, Framing::Ssl2] {
        if let Ok(Some(header)) = try_get_frame_header(data, framing) {
            assert!(header.length <= MAX_RECORD_PAYLOAD);
            assert!(header.frame_size() >= header.header_size);
        }
    }
});
