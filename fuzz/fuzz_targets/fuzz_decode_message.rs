#![no_main]

use fraiseql_conn::postgres::protocol::decode_message;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Decode back-to-back messages the way the receive loop does: stop on
    // "need more data" or a protocol error, never panic.
    let mut offset = 0;
    while offset < data.len() {
        match decode_message(&data[offset..]) {
            Ok(Some((_, consumed))) => {
                assert!(consumed >= 5 && offset + consumed <= data.len());
                offset += consumed;
            }
            Ok(None) | Err(_) => break,
        }
    }
});
