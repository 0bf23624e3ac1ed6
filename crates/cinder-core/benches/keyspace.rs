//! Micro-benchmarks for keyspace hot paths.
//!
//! Measures the raw data structures without channels or protocol
//! overhead. Run with `cargo bench -p cinder-core -- keyspace`.

use std::hint::black_box;
use std::sync::Arc;

use bytes::Bytes;
use cinder_core::keyspace::Keyspace;
use cinder_core::object::Object;
use cinder_core::types::Value;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

const KEY_COUNT: usize = 10_000;

fn make_object(size: usize) -> Arc<Object> {
    Arc::new(Object::new(Value::String(Bytes::from(vec![b'x'; size]))))
}

fn populated_keyspace(value_size: usize) -> Keyspace {
    let mut ks = Keyspace::new();
    let template = make_object(value_size);
    for i in 0..KEY_COUNT {
        let key = Bytes::from(format!("key:{i}"));
        ks.insert(&key, Arc::clone(&template));
    }
    ks
}

fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("keyspace_lookup");

    for size in [64, 1024, 16384] {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{size}B")),
            &size,
            |b, &size| {
                let mut ks = populated_keyspace(size);
                let key = Bytes::from("key:5000");
                b.iter(|| {
                    let _ = black_box(ks.find(&key));
                });
            },
        );
    }

    group.finish();
}

fn bench_insert_overwrite(c: &mut Criterion) {
    let mut group = c.benchmark_group("keyspace_insert");

    group.bench_function("fresh", |b| {
        let mut ks = Keyspace::new();
        let mut i = 0u64;
        let obj = make_object(64);
        b.iter(|| {
            let key = Bytes::from(format!("bench:{i}"));
            i += 1;
            ks.insert(&key, Arc::clone(&obj));
        });
    });

    group.bench_function("overwrite", |b| {
        let mut ks = populated_keyspace(64);
        let key = Bytes::from("key:5000");
        let obj = make_object(64);
        b.iter(|| {
            ks.update_value(&key, Arc::clone(&obj));
        });
    });

    group.finish();
}

fn bench_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("keyspace_scan");

    group.bench_function("full_walk_count_10", |b| {
        let ks = populated_keyspace(64);
        b.iter(|| {
            let mut cursor = 0;
            loop {
                let (next, keys) = ks.scan(cursor, 10);
                black_box(&keys);
                if next == 0 {
                    break;
                }
                cursor = next;
            }
        });
    });

    group.finish();
}

fn bench_snapshot_fork(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot");

    group.bench_function("fork_and_release", |b| {
        let mut ks = populated_keyspace(64);
        let mut checkpoint = 1;
        b.iter(|| {
            let snap = ks.fork(checkpoint);
            checkpoint += 1;
            black_box(snap.size());
            ks.end_snapshot(snap);
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_lookup,
    bench_insert_overwrite,
    bench_scan,
    bench_snapshot_fork
);
criterion_main!(benches);
