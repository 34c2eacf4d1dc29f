use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

use criterion::Criterion;
use mirt::Schedule;

const N: usize = 1 << 16;

pub fn bench(c: &mut Criterion) {
    let rt = super::runtime();
    let data: Vec<u64> = (0..N as u64).collect();
    let mut group = c.benchmark_group("worksharing");
    for (name, schedule) in [
        ("static", Schedule::Static(None)),
        ("static_64", Schedule::Static(Some(64))),
        ("dynamic_64", Schedule::Dynamic(Some(64))),
        ("guided", Schedule::Guided(None)),
    ] {
        group.bench_function(name, |b| {
            b.iter(|| {
                let sum = AtomicU64::new(0);
                rt.parallel(None, |w| {
                    let local = Cell::new(0);
                    w.for_loop_nowait(0..N, schedule, |i| local.set(local.get() + data[i]));
                    sum.fetch_add(local.get(), Ordering::Relaxed);
                });
                assert_eq!(sum.into_inner(), (N as u64) * (N as u64 - 1) / 2);
            })
        });
    }
    group.bench_function("empty_region", |b| b.iter(|| rt.parallel(None, |_| {})));
    group.finish();
}
