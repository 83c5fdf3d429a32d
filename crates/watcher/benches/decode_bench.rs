//! Record decoding benchmarks

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use watcher::{decode, encode_record, EventMask, WatchId, DEFAULT_BUFFER_SIZE};

/// Fill roughly one read buffer with records of the given name length
fn buffer_of(name_len: usize) -> Vec<u8> {
    let name = vec![b'n'; name_len];
    let mut buf = Vec::with_capacity(DEFAULT_BUFFER_SIZE);
    let mut cookie = 0;
    while buf.len() < DEFAULT_BUFFER_SIZE {
        cookie += 1;
        buf.extend(encode_record(WatchId(1), EventMask::CREATED, cookie, Some(&name)));
    }
    buf
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");

    for name_len in [8usize, 64, 255] {
        let buf = buffer_of(name_len);
        group.throughput(Throughput::Bytes(buf.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(name_len), &buf, |b, buf| {
            b.iter(|| decode(black_box(buf)).count());
        });
    }

    group.finish();
}

fn bench_decode_nameless(c: &mut Criterion) {
    let record = encode_record(WatchId(1), EventMask::SELF_DELETED, 0, None);
    let buf = record.repeat(DEFAULT_BUFFER_SIZE / record.len());

    c.bench_function("decode_nameless", |b| {
        b.iter(|| decode(black_box(&buf)).count());
    });
}

criterion_group!(benches, bench_decode, bench_decode_nameless);
criterion_main!(benches);
