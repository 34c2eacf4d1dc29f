use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use criterion::{black_box, Criterion};
use mirt::Worker;

fn fib_seq(n: u64) -> u64 {
    if n < 2 {
        n
    } else {
        fib_seq(n - 1) + fib_seq(n - 2)
    }
}

fn fib(w: &Worker, n: u64, cutoff: u64) -> u64 {
    if n < cutoff {
        return fib_seq(n);
    }
    let x = Arc::new(AtomicU64::new(0));
    {
        let x = x.clone();
        w.spawn(move |w| x.store(fib(w, n - 1, cutoff), Ordering::Relaxed));
    }
    let y = fib(w, n - 2, cutoff);
    w.task_wait();
    x.load(Ordering::Relaxed) + y
}

pub fn bench(c: &mut Criterion) {
    let rt = super::runtime();
    let mut group = c.benchmark_group("tasks");
    for cutoff in [10, 15, 20] {
        group.bench_function(format!("fib25_cutoff{}", cutoff), |b| {
            b.iter(|| {
                let result = fib(rt.master(), black_box(25), cutoff);
                assert_eq!(result, 75025);
            })
        });
    }
    group.bench_function("spawn_1000_empty", |b| {
        b.iter(|| {
            for _ in 0..1000 {
                rt.spawn(|_| {});
            }
            rt.task_wait();
        })
    });
    group.finish();
}
