use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use mirt::util::constants::BYTES_IN_MBYTE;
use mirt::util::memory::Binding;
use mirt::util::options::{AffinityKind, MapConfigProvider, MemoryPolicy};
use mirt::{AccessMode, Footprint, PlacementHint, Runtime, RuntimeBuilder, RuntimeError};

/// Four workers on two synthetic nodes: workers 0 and 1 on node 0, workers 2 and 3 on node 1.
fn runtime(policy: &str) -> Runtime {
    let mut builder = RuntimeBuilder::with_provider(Arc::new(MapConfigProvider::new()));
    assert!(builder.set_option("topology", "uniform:2x2"));
    assert!(builder.set_option("workers", "4"));
    assert!(builder.set_option("memory_policy", policy));
    assert!(builder.set_option("numa_footprint", "4096"));
    builder.options_mut().thread_affinity = AffinityKind::OsDefault;
    builder.build().unwrap()
}

#[test]
fn topology_from_options() {
    let rt = runtime("coarse");
    assert_eq!(rt.topology().num_nodes(), 2);
    assert_eq!(rt.topology().num_cores(), 4);
    assert_eq!(rt.options().memory_policy, MemoryPolicy::Coarse);
    assert_eq!(rt.master().node(), 0);
}

#[test]
fn allocate_on_hinted_node() {
    let rt = runtime("coarse");
    let start = rt.allocate(BYTES_IN_MBYTE, Some(1)).unwrap();
    let info = rt.allocator().lookup(start + 100usize).unwrap();
    assert_eq!(info.binding, Binding::Node(1));
    assert_eq!(rt.allocator().total_allocated(), BYTES_IN_MBYTE);
    rt.release(start, BYTES_IN_MBYTE).unwrap();
    assert_eq!(rt.allocator().total_allocated(), 0);
}

#[test]
fn invalid_node_is_an_error() {
    let rt = runtime("coarse");
    assert!(matches!(
        rt.allocate(100, Some(5)),
        Err(RuntimeError::InvalidNode {
            node: 5,
            available: 2
        })
    ));
}

#[test]
fn written_data_pulls_the_task_to_its_node() {
    let rt = runtime("coarse");
    let size = BYTES_IN_MBYTE;
    let start = rt.allocate(size, Some(1)).unwrap();
    let done = Arc::new(AtomicUsize::new(0));
    {
        let done = done.clone();
        rt.create_task(
            vec![Footprint::bytes(start, size, AccessMode::Write)],
            None,
            move |w| {
                // Stealing may still move the task, but only after it was placed on node 1.
                assert!(w.ordinal() < 4);
                done.fetch_add(1, Ordering::SeqCst);
            },
        );
    }
    rt.task_wait();
    assert_eq!(done.load(Ordering::SeqCst), 1);

    let stat = rt.statistics();
    assert_eq!(stat["tasks.placed-remote.count"], "1");
    assert_eq!(stat["tasks.comm.count"], "1");
    // All bytes are one hop from node 0 and local to node 1.
    assert_eq!(stat["comm-cost.total"], (size as u64 * 10).to_string());
    rt.release(start, size).unwrap();
}

#[test]
fn small_footprints_stay_with_the_creator() {
    let rt = runtime("coarse");
    let start = rt.allocate(1024, Some(1)).unwrap();
    rt.create_task(
        vec![Footprint::bytes(start, 1024, AccessMode::ReadWrite)],
        None,
        |_| {},
    );
    rt.task_wait();
    assert_eq!(rt.statistics()["tasks.placed-remote.count"], "0");
    rt.release(start, 1024).unwrap();
}

#[test]
fn interleaved_data_is_uniform() {
    let rt = runtime("fine");
    let size = 4 * BYTES_IN_MBYTE;
    let start = rt.allocate(size, None).unwrap();
    assert_eq!(rt.allocator().lookup(start).unwrap().binding, Binding::Interleave);
    rt.create_task(
        vec![Footprint::bytes(start, size, AccessMode::Write)],
        None,
        |_| {},
    );
    rt.task_wait();
    assert_eq!(rt.statistics()["tasks.placed-remote.count"], "0");
    rt.release(start, size).unwrap();
}

#[test]
fn node_hint_beats_footprints() {
    let rt = runtime("coarse");
    let size = BYTES_IN_MBYTE;
    let start = rt.allocate(size, Some(1)).unwrap();
    rt.create_task(
        vec![Footprint::bytes(start, size, AccessMode::Write)],
        Some(PlacementHint::Node(0)),
        |_| {},
    );
    rt.task_wait();
    let stat = rt.statistics();
    // Node 0 holds the master and worker 1, so the task may stay or go to worker 1.
    assert!(stat["tasks.placed-remote.count"] == "0" || stat["tasks.placed-remote.count"] == "1");
    assert_eq!(stat["tasks.comm.count"], "0");
    rt.release(start, size).unwrap();
}

#[test]
fn tasks_write_to_numa_memory() {
    let rt = runtime("local");
    const ROWS: usize = 64;
    const COLS: usize = 1024;
    let bytes = ROWS * COLS * std::mem::size_of::<u64>();
    let start = rt.allocate(bytes, None).unwrap();
    let base = Footprint::new(start, COLS, std::mem::size_of::<u64>(), 0, ROWS - 1, AccessMode::Write);
    for row in 0..ROWS {
        let footprint = base.rows(row, row).part_of(start);
        rt.create_task(vec![footprint], None, move |_| {
            let row_start = footprint.start_address().unwrap().to_mut_ptr::<u64>();
            for col in 0..COLS {
                // SAFETY: Every task writes its own row of a live allocation.
                unsafe { *row_start.add(col) = (row * COLS + col) as u64 };
            }
        });
    }
    rt.task_wait();
    let data = unsafe { std::slice::from_raw_parts(start.to_ptr::<u64>(), ROWS * COLS) };
    assert!(data.iter().enumerate().all(|(i, v)| *v == i as u64));
    rt.release(start, bytes).unwrap();
}

#[test]
fn work_stealing_policy_ignores_footprints() {
    let mut builder = RuntimeBuilder::with_provider(Arc::new(MapConfigProvider::new()));
    assert!(builder.set_option("topology", "uniform:2x2"));
    assert!(builder.set_option("workers", "4"));
    assert!(builder.set_option("numa_footprint", "4096"));
    assert!(builder.set_option("sched_policy", "ws"));
    builder.options_mut().thread_affinity = AffinityKind::OsDefault;
    let rt = builder.build().unwrap();
    let size = BYTES_IN_MBYTE;
    let start = rt.allocate(size, Some(1)).unwrap();
    rt.create_task(
        vec![Footprint::bytes(start, size, AccessMode::Write)],
        None,
        |_| {},
    );
    rt.task_wait();
    let stat = rt.statistics();
    assert_eq!(stat["tasks.placed-remote.count"], "0");
    assert_eq!(stat["tasks.comm.count"], "0");
    rt.release(start, size).unwrap();
}

#[test]
fn footprint_beyond_the_address_space_is_ignored() {
    let rt = runtime("coarse");
    let start = rt.allocate(4096, Some(1)).unwrap();
    let done = Arc::new(AtomicUsize::new(0));
    {
        let done = done.clone();
        // The rows span more bytes than the address space holds.
        let footprint = Footprint::new(start, usize::MAX / 2, 4, 0, 0, AccessMode::Read);
        rt.create_task(vec![footprint], None, move |_| {
            done.fetch_add(1, Ordering::SeqCst);
        });
    }
    rt.task_wait();
    assert_eq!(done.load(Ordering::SeqCst), 1);
    assert_eq!(rt.statistics()["tasks.comm.count"], "0");
    rt.release(start, 4096).unwrap();
    // Dropping the runtime must not wait for a task that was never queued.
    drop(rt);
}
