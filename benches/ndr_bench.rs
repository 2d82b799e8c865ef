use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use dcerpc_engine::core::ndr::{self, from_ndr, to_ndr, TypeDesc, Value};
use dcerpc_engine::core::syntax::NdrFormat;

fn record_desc() -> TypeDesc {
    TypeDesc::Struct(vec![
        TypeDesc::U32,
        TypeDesc::U64,
        TypeDesc::unique(TypeDesc::wide_string()),
        TypeDesc::conformant(TypeDesc::U32),
    ])
}

fn record(len: usize) -> Value {
    Value::Struct(vec![
        Value::U32(7),
        Value::U64(0x0102_0304_0506_0708),
        Value::pointer(Value::String("workstation".into())),
        Value::Array((0..len as u32).map(Value::U32).collect()),
    ])
}

#[allow(clippy::unwrap_used)]
fn bench_ndr_record(c: &mut Criterion) {
    let mut group = c.benchmark_group("ndr_record");
    let desc = record_desc();

    for (name, fmt) in [("ndr20", NdrFormat::ndr20()), ("ndr64", NdrFormat::ndr64())] {
        for &len in &[16usize, 1024, 16 * 1024] {
            let value = record(len);
            let wire = ndr::encode(&value, &desc, &fmt).unwrap();
            group.throughput(Throughput::Bytes(wire.len() as u64));

            group.bench_function(format!("encode_{name}_{len}"), |b| {
                b.iter_batched(
                    || value.clone(),
                    |v| ndr::encode(&v, &desc, &fmt).unwrap(),
                    BatchSize::SmallInput,
                )
            });
            group.bench_function(format!("decode_{name}_{len}"), |b| {
                b.iter(|| {
                    let decoded = ndr::decode(&wire, &desc, &fmt);
                    assert!(decoded.is_ok());
                })
            });
        }
    }

    group.finish();
}

#[allow(clippy::unwrap_used)]
fn bench_ndr_typed(c: &mut Criterion) {
    let mut group = c.benchmark_group("ndr_typed");
    let fmt = NdrFormat::ndr20();
    let args = (42u32, "lookup".to_string(), vec![0u8; 4096]);
    let wire = to_ndr(&args, &fmt).unwrap();
    group.throughput(Throughput::Bytes(wire.len() as u64));

    group.bench_function("to_ndr", |b| b.iter(|| to_ndr(&args, &fmt).unwrap()));
    group.bench_function("from_ndr", |b| {
        b.iter(|| {
            let decoded = from_ndr::<(u32, String, Vec<u8>)>(&wire, &fmt);
            assert!(decoded.is_ok());
        })
    });

    group.finish();
}

criterion_group!(benches, bench_ndr_record, bench_ndr_typed);
criterion_main!(benches);
