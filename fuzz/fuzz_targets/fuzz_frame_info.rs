#![no_main]

use libfuzzer_sys::fuzz_target;
use milli_sslstream::record::hello::{
    iter_handshake_messages, parse_alpn_list, parse_client_hello, parse_hello_extensions,
    try_get_frame_info,
};
use milli_sslstream::record::Framing;

fuzz_target!(|data: &[u8]| {
    let _ = try_get_frame_info(data, Framing::Unknown);
    let _ = try_get_frame_info(data, Framing::Ssl3Plus);

    for message in iter_handshake_messages(data).flatten() {
        if let Some(hello) = parse_client_hello(message.1) {
            let _ = parse_hello_extensions(hello.extensions, true);
        }
    }
    let _ = parse_alpn_list(data);
});
