//! Benchmark for the per-volume lock registry
//!
//! Every mutating RPC takes and drops one lock, so this is on the hot path
//! of each call.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use jiva_csi::lock::{node_key, VolumeLocks};

fn bench_lock_unlock(c: &mut Criterion) {
    let mut group = c.benchmark_group("volume_locks");
    group.throughput(Throughput::Elements(1));

    group.bench_function("lock_unlock_fresh_key", |b| {
        let locks = VolumeLocks::new();
        let mut counter = 0u64;

        b.iter(|| {
            counter += 1;
            let guard = locks.try_lock(format!("pvc-{}", counter), "CreateVolume");
            black_box(guard.is_ok());
        });
    });

    group.bench_function("lock_unlock_node_key", |b| {
        let locks = VolumeLocks::new();
        b.iter(|| {
            let guard = locks.try_lock(node_key(black_box("pvc-1"), black_box("node-a")), "NodeStageVolume");
            black_box(guard.is_ok());
        });
    });

    group.finish();
}

fn bench_contended_key(c: &mut Criterion) {
    let mut group = c.benchmark_group("volume_locks");
    group.throughput(Throughput::Elements(1));

    // One key held for the whole run; every attempt fails fast
    let locks = VolumeLocks::new();
    let _held = locks.try_lock("pvc-busy", "ControllerExpandVolume");

    group.bench_function("rejected_while_held", |b| {
        b.iter(|| {
            let attempt = locks.try_lock(black_box("pvc-busy"), "ControllerExpandVolume");
            black_box(attempt.is_err());
        });
    });

    group.finish();
}

fn bench_concurrent_volumes(c: &mut Criterion) {
    let mut group = c.benchmark_group("volume_locks");
    group.throughput(Throughput::Elements(100));

    let locks = VolumeLocks::new();
    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => panic!("cannot start runtime: {}", e),
    };

    group.bench_function("concurrent_100_volumes", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut handles = Vec::new();
                for i in 0..100 {
                    let locks = locks.clone();
                    handles.push(tokio::spawn(async move {
                        let key = format!("pvc-{:03}", i);
                        let guard = locks.try_lock(key, "CreateVolume");
                        tokio::task::yield_now().await;
                        drop(guard);
                    }));
                }
                for handle in handles {
                    let _ = handle.await;
                }
            });
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_lock_unlock,
    bench_contended_key,
    bench_concurrent_volumes
);
criterion_main!(benches);
