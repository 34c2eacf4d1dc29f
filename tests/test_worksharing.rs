use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use mirt::util::options::{AffinityKind, ConfigProvider, MapConfigProvider};
use mirt::util::topology::Topology;
use mirt::{Runtime, RuntimeBuilder, Schedule};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const POOL: usize = 4;

fn runtime_with(provider: Arc<MapConfigProvider>) -> Runtime {
    let provider: Arc<dyn ConfigProvider> = provider;
    let mut builder = RuntimeBuilder::with_provider(provider);
    builder.options_mut().workers = POOL;
    builder.options_mut().thread_affinity = AffinityKind::OsDefault;
    builder.topology(Topology::uniform(2, 2)).build().unwrap()
}

fn runtime() -> Runtime {
    runtime_with(Arc::new(MapConfigProvider::new()))
}

/// Run a loop over `0..n` on a team of `team` and return how often each index was visited.
fn visits(rt: &Runtime, team: usize, n: usize, schedule: Schedule) -> Vec<usize> {
    let hits: Vec<AtomicUsize> = (0..n).map(|_| AtomicUsize::new(0)).collect();
    rt.parallel(Some(team), |w| {
        w.for_loop(0..n, schedule, |i| {
            hits[i].fetch_add(1, Ordering::Relaxed);
        });
    });
    hits.into_iter().map(|h| h.into_inner()).collect()
}

const SCHEDULES: [Schedule; 8] = [
    Schedule::Static(None),
    Schedule::Static(Some(1)),
    Schedule::Static(Some(10)),
    Schedule::Dynamic(None),
    Schedule::Dynamic(Some(16)),
    Schedule::Guided(None),
    Schedule::Guided(Some(5)),
    Schedule::Runtime,
];

#[test]
fn every_schedule_covers_the_range_once() {
    let rt = runtime();
    for team in 1..=POOL {
        for schedule in SCHEDULES {
            let hits = visits(&rt, team, 128, schedule);
            assert!(
                hits.iter().all(|&h| h == 1),
                "{:?} on {} workers: {:?}",
                schedule,
                team,
                hits
            );
        }
    }
}

#[test]
fn random_ranges_and_chunks() {
    let rt = runtime();
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    for _ in 0..50 {
        let n = rng.random_range(0..2000);
        let chunk = Some(rng.random_range(1..64));
        let team = rng.random_range(1..=POOL);
        let schedule = match rng.random_range(0..3) {
            0 => Schedule::Static(chunk),
            1 => Schedule::Dynamic(chunk),
            _ => Schedule::Guided(chunk),
        };
        let hits = visits(&rt, team, n, schedule);
        assert!(hits.iter().all(|&h| h == 1), "{:?} n={} team={}", schedule, n, team);
    }
}

#[test]
fn runtime_schedule_from_provider() {
    let provider = Arc::new(MapConfigProvider::new());
    let rt = runtime_with(provider.clone());
    let gold: usize = (0..128).sum();

    let sum_with = |schedule: Schedule| {
        let sum = AtomicUsize::new(0);
        rt.parallel(None, |w| {
            w.for_loop(0..128, schedule, |i| {
                sum.fetch_add(i, Ordering::Relaxed);
            });
        });
        sum.into_inner()
    };

    assert_eq!(sum_with(Schedule::Static(None)), gold);
    provider.set("schedule", "static,10");
    assert_eq!(sum_with(Schedule::Runtime), gold);
    provider.set("schedule", "guided,3");
    assert_eq!(sum_with(Schedule::Runtime), gold);
    // A malformed value falls back to the built options.
    provider.set("schedule", "whatever");
    assert_eq!(sum_with(Schedule::Runtime), gold);
}

#[test]
fn static_blocks_follow_member_index() {
    let rt = runtime();
    let owner: Vec<AtomicUsize> = (0..10).map(|_| AtomicUsize::new(usize::MAX)).collect();
    rt.parallel(Some(3), |w| {
        w.for_loop(0..10, Schedule::Static(None), |i| {
            owner[i].store(w.thread_num(), Ordering::Relaxed);
        });
    });
    let owner: Vec<usize> = owner.into_iter().map(|o| o.into_inner()).collect();
    assert_eq!(owner, vec![0, 0, 0, 0, 1, 1, 1, 2, 2, 2]);
}

#[test]
fn consecutive_loops_and_nowait() {
    let rt = runtime();
    let first = AtomicUsize::new(0);
    let second = AtomicUsize::new(0);
    rt.parallel(None, |w| {
        for _ in 0..10 {
            w.for_loop_nowait(0..100, Schedule::Dynamic(Some(3)), |_| {
                first.fetch_add(1, Ordering::Relaxed);
            });
            w.for_loop_nowait(0..50, Schedule::Guided(None), |_| {
                second.fetch_add(1, Ordering::Relaxed);
            });
        }
        w.barrier();
    });
    assert_eq!(first.into_inner(), 1000);
    assert_eq!(second.into_inner(), 500);
}

#[test]
fn loop_outside_a_region() {
    let rt = runtime();
    let sum = AtomicUsize::new(0);
    rt.for_loop(0..128, Schedule::Dynamic(None), |i| {
        sum.fetch_add(i, Ordering::Relaxed);
    });
    assert_eq!(sum.into_inner(), 8128);
}
