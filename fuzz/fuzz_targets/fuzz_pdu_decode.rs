#![no_main]

use dcerpc_engine::core::pdu::{AuthLayout, Pdu, PduHeader};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Header parsing, body decoding and trailer location must reject, never panic
    let _ = PduHeader::parse(data);
    let _ = AuthLayout::locate(data);
    if let Ok(pdu) = Pdu::decode(data) {
        let _ = pdu.encode();
    }
});
