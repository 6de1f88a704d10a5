//! Throughput benchmarks

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use nanotest_core::core::image::DeploymentBlob;
use nanotest_core::core::model::{build_scaffold, TestCase};
use nanotest_core::core::parser::{classify_line, parse_output};
use std::hint::black_box;

fn sample(tests: usize) -> (Vec<TestCase>, String) {
    let cases: Vec<TestCase> = (0..tests)
        .map(|i| TestCase::new(format!("Tests.Bench.Case{i}"), format!("Case{i}"), "bin/Tests.pe"))
        .collect();

    let mut output = String::from("booting\nReady.\n");
    for i in 0..tests {
        output.push_str(&format!("Case{i} says hello\n"));
        match i % 3 {
            0 => output.push_str(&format!("Test passed: Case{i}, {}\n", i * 100)),
            1 => output.push_str(&format!("Test failed: Case{i}, Expected {i} but was 0\n")),
            _ => output.push_str(&format!("Test skipped: Case{i}, not on this board\n")),
        }
    }
    output.push_str("Done.\n");
    (cases, output)
}

fn parser_benchmark(c: &mut Criterion) {
    let (cases, output) = sample(500);

    let mut group = c.benchmark_group("parser");
    group.throughput(Throughput::Bytes(output.len() as u64));

    group.bench_function("parse_output", |b| {
        b.iter(|| {
            let mut results = build_scaffold(&cases);
            let stats = parse_output(black_box(&output), &mut results);
            black_box(stats)
        })
    });

    group.bench_function("classify_line", |b| {
        b.iter(|| {
            let found = black_box(&output)
                .lines()
                .filter(|line| classify_line(line).is_some())
                .count();
            black_box(found)
        })
    });

    group.finish();
}

fn blob_benchmark(c: &mut Criterion) {
    let images: Vec<Vec<u8>> = (0..8).map(|i| vec![0x5A; 64 * 1024 + i]).collect();
    let blob = DeploymentBlob::from_raw(images);

    let mut group = c.benchmark_group("deployment");
    group.throughput(Throughput::Bytes(blob.total_size() as u64));

    group.bench_function("deep_copy", |b| {
        b.iter(|| black_box(black_box(&blob).deep_copy()))
    });

    group.finish();
}

criterion_group!(benches, parser_benchmark, blob_benchmark);
criterion_main!(benches);
