use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use sessiond::config::FramingConfig;
use sessiond::framing::{FramingPolicy, PatternMatcher};

fn bench_byte_classification(c: &mut Criterion) {
    let policy = FramingPolicy::new(&FramingConfig::default(), None, false);
    let mut group = c.benchmark_group("byte_classification");

    for size in [64usize, 1024, 8192] {
        let input: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &input, |b, input| {
            b.iter(|| {
                let mut kept = 0usize;
                for &byte in input {
                    if policy.is_line_terminator(byte)
                        || policy.is_ignored(byte)
                        || policy.is_backspace(byte)
                    {
                        continue;
                    }
                    kept += 1;
                }
                black_box(kept)
            })
        });
    }
    group.finish();
}

fn bench_pattern_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("pattern_scan");

    for size in [256usize, 4096] {
        let mut input: Vec<u8> = (0..size).map(|i| (i % 197) as u8).collect();
        let len = input.len();
        input[len - 3..].copy_from_slice(b"##!");
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &input, |b, input| {
            b.iter(|| {
                let mut matcher = PatternMatcher::new(b"##!");
                let mut hit = false;
                for &byte in input {
                    if matcher.push(byte) {
                        hit = true;
                        break;
                    }
                }
                black_box(hit)
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_byte_classification, bench_pattern_scan);
criterion_main!(benches);
