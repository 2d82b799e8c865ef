#![no_main]

use bytes::BytesMut;
use dcerpc_engine::core::codec::PduCodec;
use dcerpc_engine::core::fragment::Reassembler;
use dcerpc_engine::core::pdu::Pdu;
use libfuzzer_sys::fuzz_target;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    let mut buf = BytesMut::from(data);
    let mut codec = PduCodec::default();
    let mut reassembler = Reassembler::new(64 * 1024);
    while let Ok(Some(frag)) = codec.decode(&mut buf) {
        if let Ok(pdu) = Pdu::decode(&frag) {
            let _ = reassembler.push(pdu);
        }
    }
});
