// Criterion benchmarks for the dccrpc-common wire codec
//
// Run benchmarks with:
//   cargo bench -p dccrpc-common
//
// For detailed output with plots:
//   cargo bench -p dccrpc-common -- --save-baseline main

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use dccrpc_common::serialization::SerializationFormat;
use dccrpc_common::transport::{Codec, WireOptions};
use dccrpc_common::{CallSpec, Request, Response};
use serde_json::json;

fn call_request(items: usize) -> Request {
    let data: Vec<String> = (0..items).map(|i| format!("item_{}", i)).collect();
    let spec = CallSpec::new("set_attributes").arg(json!({ "data": data }));
    Request::new("call", serde_json::to_value(spec).unwrap_or_default())
}

fn codec(format: SerializationFormat, compress: bool) -> Codec {
    Codec::new(WireOptions {
        format,
        compress,
        ..WireOptions::default()
    })
}

fn bench_encode_request(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_request");

    let small = call_request(1);
    let large = call_request(1000);

    group.bench_function("json_small", |b| {
        let codec = codec(SerializationFormat::Json, true);
        b.iter(|| codec.encode_request(black_box(&small)));
    });

    group.bench_function("msgpack_small", |b| {
        let codec = codec(SerializationFormat::Msgpack, true);
        b.iter(|| codec.encode_request(black_box(&small)));
    });

    group.bench_function("json_large_uncompressed", |b| {
        let codec = codec(SerializationFormat::Json, false);
        b.iter(|| codec.encode_request(black_box(&large)));
    });

    group.bench_function("json_large_compressed", |b| {
        let codec = codec(SerializationFormat::Json, true);
        b.iter(|| codec.encode_request(black_box(&large)));
    });

    group.bench_function("msgpack_large_compressed", |b| {
        let codec = codec(SerializationFormat::Msgpack, true);
        b.iter(|| codec.encode_request(black_box(&large)));
    });

    group.finish();
}

fn bench_decode_response(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_response");

    let values: Vec<f64> = (0..2000).map(|i| i as f64 * 0.5).collect();
    let response = Response::ok(1, json!({ "values": values }));

    for (name, format, compress) in [
        ("json", SerializationFormat::Json, false),
        ("json_compressed", SerializationFormat::Json, true),
        ("msgpack", SerializationFormat::Msgpack, false),
        ("msgpack_compressed", SerializationFormat::Msgpack, true),
    ] {
        let codec = codec(format, compress);
        let frame = codec.encode_response(&response, format).unwrap_or_default();
        group.bench_function(name, |b| {
            b.iter(|| codec.decode_response(black_box(&frame)));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_encode_request, bench_decode_response);
criterion_main!(benches);
