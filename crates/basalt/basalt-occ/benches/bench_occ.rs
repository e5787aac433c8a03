use basalt_events::Heartbeat;
use basalt_occ::{HeapRegion, RetryPolicy, StateMonitor};
use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use std::mem::size_of;

fn bench_atomics(c: &mut Criterion) {
    let heap = HeapRegion::new_zeroed(64);
    let cell = heap.region().cell(0).unwrap();

    let mut group = c.benchmark_group("atomic");
    group.throughput(Throughput::Elements(1));

    group.bench_function("cas (hit)", |b| {
        let mut v = cell.load();
        b.iter(|| {
            black_box(cell.compare_and_swap(v, v + 1));
            v += 1;
        });
    });

    group.bench_function("cas (miss)", |b| {
        b.iter(|| black_box(cell.compare_and_swap(black_box(-1), 0)));
    });

    group.bench_function("store", |b| {
        b.iter(|| cell.store(black_box(7)));
    });

    group.bench_function("load", |b| {
        b.iter(|| black_box(cell.load()));
    });

    group.finish();
}

fn bench_doorbell(c: &mut Criterion) {
    let heap = HeapRegion::new_zeroed(64);
    let bell = heap.region().doorbell(0).unwrap();

    let mut group = c.benchmark_group("doorbell");
    group.throughput(Throughput::Elements(1));

    group.bench_function("ring", |b| {
        b.iter(|| black_box(bell.ring(black_box(3))));
    });

    group.bench_function("check", |b| {
        b.iter(|| black_box(bell.check()));
    });

    group.finish();
}

fn bench_versioned(c: &mut Criterion) {
    let heap = HeapRegion::new_zeroed(64 + size_of::<Heartbeat>());
    // SAFETY: the bench owns the region.
    let slot = unsafe { heap.region().slot::<Heartbeat>(0, 64) }.unwrap();
    let policy = RetryPolicy::unbounded();
    let beat = Heartbeat::new(1, 2, 3);

    let mut group = c.benchmark_group("versioned");
    group.throughput(Throughput::Elements(1));

    group.bench_function("write (uncontended)", |b| {
        b.iter(|| black_box(slot.write(black_box(beat), &policy).unwrap()));
    });

    group.bench_function("read (stable)", |b| {
        b.iter(|| black_box(slot.read()));
    });

    group.finish();
}

fn bench_monitor(c: &mut Criterion) {
    let path = std::env::temp_dir().join(format!("basalt_bench_{}", std::process::id()));
    let monitor = StateMonitor::create(&path, size_of::<Heartbeat>()).unwrap();
    let slot = monitor.slot::<Heartbeat>().unwrap();
    let bell = monitor.doorbell();
    let policy = RetryPolicy::unbounded();

    let mut group = c.benchmark_group("monitor");
    group.throughput(Throughput::Elements(1));

    let mut seq = 0u64;
    group.bench_function("write + ring", |b| {
        b.iter(|| {
            seq += 1;
            slot.write(Heartbeat::new(seq, 0, 0), &policy).unwrap();
            black_box(bell.ring(seq as i64));
        });
    });

    drop(group);
    drop(monitor);
    let _ = StateMonitor::unlink(&path);
}

criterion_group!(benches, bench_atomics, bench_doorbell, bench_versioned, bench_monitor);
criterion_main!(benches);
