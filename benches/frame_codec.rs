use cardbeam::ble::frame::{decode, decode_legacy, encode, strip_manufacturer_prefix, Opcode};
use cardbeam::ble::packet::{create_transfer_packet, parse_transfer_packet};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn bench_frame(c: &mut Criterion) {
    let nonce = Some([0xde, 0xad, 0xbe, 0xef]);
    c.bench_function("encode_request", |b| {
        b.iter(|| encode(Opcode::Request, black_box('J'), nonce, black_box("abc123def456")))
    });

    let mut observed = vec![0xFF, 0xFF];
    observed.extend(encode(Opcode::Ready, 'K', nonce, "card-0123456789"));
    c.bench_function("strip_and_decode", |b| {
        b.iter(|| decode(strip_manufacturer_prefix(black_box(&observed))))
    });

    let legacy = br#"{"t":"READY","uid":"user-123","ts":1700000000000}"#;
    c.bench_function("decode_legacy_json", |b| {
        b.iter(|| decode_legacy(black_box(legacy)))
    });
}

fn bench_packet(c: &mut Criterion) {
    let packet = create_transfer_packet("aB3dE5gH7jK9mN1pQ3sT", "Alice");
    c.bench_function("parse_transfer_packet", |b| {
        b.iter(|| parse_transfer_packet(black_box(&packet)))
    });
}

criterion_group!(benches, bench_frame, bench_packet);
criterion_main!(benches);
