//! Commit throughput with and without concurrent committers.
//!
//! Concurrent committers share log forces through group commit, so the
//! per-commit cost should drop as the number of threads grows.

use std::{hint::black_box, sync::Arc, thread, time::Duration};

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use tempfile::TempDir;
use txstore::{StoreConfig, TruncationConfig, TxStore};

fn open_store(dir: &TempDir) -> TxStore {
    let config = StoreConfig::new(dir.path())
        .with_group_commit_window(Duration::from_millis(2))
        .with_truncation(TruncationConfig {
            automatic: true,
            target_log_size: 1024 * 1024,
            ..TruncationConfig::default()
        });
    TxStore::open(config).expect("open store")
}

fn commit_one(store: &TxStore, value: i32) {
    let xid = store.begin().expect("begin");
    let rid = store.alloc(xid, 4).expect("alloc");
    store.set(xid, rid, &value.to_be_bytes()).expect("set");
    black_box(store.commit(xid).expect("commit"));
}

fn bench_single_committer(c: &mut Criterion) {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(&dir);
    let mut value = 0;
    c.bench_function("commit/single", |b| {
        b.iter(|| {
            commit_one(&store, value);
            value = value.wrapping_add(1);
        })
    });
    store.close().expect("close");
}

fn bench_concurrent_committers(c: &mut Criterion) {
    let mut group = c.benchmark_group("commit/concurrent");
    let dir = TempDir::new().expect("tempdir");
    let store = Arc::new(open_store(&dir));

    for threads in [2, 4, 8] {
        group.bench_with_input(BenchmarkId::new("committers", threads), &threads, |b, &threads| {
            b.iter(|| {
                let handles: Vec<_> = (0..threads)
                    .map(|t| {
                        let store = Arc::clone(&store);
                        thread::spawn(move || {
                            for i in 0..10 {
                                commit_one(&store, (t * 10 + i) as i32);
                            }
                        })
                    })
                    .collect();
                for handle in handles {
                    handle.join().expect("join");
                }
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_single_committer, bench_concurrent_committers);
criterion_main!(benches);
