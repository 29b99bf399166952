#![no_main]

use fraiseql_conn::postgres::scram::ScramClient;
use libfuzzer_sys::arbitrary::{Arbitrary, Unstructured};
use libfuzzer_sys::fuzz_target;

#[derive(Debug)]
struct ScramInput {
    password: String,
    server_nonce_suffix: String,
    server_first_tail: String,
    server_final: String,
}

impl<'a> Arbitrary<'a> for ScramInput {
    fn arbitrary(u: &mut Unstructured<'a>) -> libfuzzer_sys::arbitrary::Result<Self> {
        Ok(Self {
            password: u.arbitrary()?,
            server_nonce_suffix: u.arbitrary()?,
            server_first_tail: u.arbitrary()?,
            server_final: u.arbitrary()?,
        })
    }
}

fuzz_target!(|input: ScramInput| {
    let client = ScramClient::new(input.password);
    let first = client.client_first();

    // Echo the client nonce so parsing gets past the nonce check
    let client_nonce = first.rsplit("r=").next().unwrap_or_default();
    let server_first = format!(
        "r={}{},{}",
        client_nonce, input.server_nonce_suffix, input.server_first_tail
    );

    if let Ok((_, state)) = client.client_final(&server_first) {
        let _ = client.verify_server_final(&input.server_final, &state);
    }
});
