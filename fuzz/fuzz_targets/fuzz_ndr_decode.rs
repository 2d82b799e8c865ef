#![no_main]

use dcerpc_engine::core::ndr::{self, DecodeLimits, TypeDesc};
use dcerpc_engine::core::syntax::NdrFormat;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Some((&selector, bytes)) = data.split_first() else {
        return;
    };
    let fmt = if selector & 1 == 0 {
        NdrFormat::ndr20()
    } else {
        NdrFormat::ndr64()
    };
    let desc = TypeDesc::Struct(vec![
        TypeDesc::U16,
        TypeDesc::unique(TypeDesc::wide_string()),
        TypeDesc::full(TypeDesc::conformant(TypeDesc::U32)),
        TypeDesc::conformant(TypeDesc::unique(TypeDesc::U64)),
    ]);
    // Conformance counts come straight from the input; the limits keep
    // allocation bounded.
    let _ = ndr::decode_with_limits(bytes, &desc, &fmt, DecodeLimits::default());
});
