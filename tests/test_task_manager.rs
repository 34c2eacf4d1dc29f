use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use mirt::task_manager;
use mirt::util::options::{AffinityKind, MapConfigProvider};
use mirt::{AccessMode, Footprint, RuntimeBuilder, Schedule};

lazy_static::lazy_static! {
    // There is one process runtime, so the tests in this file take turns.
    static ref PROCESS_RUNTIME_LOCK: Mutex<()> = Mutex::default();
}

fn serial(f: impl FnOnce()) {
    let _guard = PROCESS_RUNTIME_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    f()
}

fn create(workers: usize) {
    let provider: MapConfigProvider = [("topology", "uniform:2x2")].into_iter().collect();
    let mut builder = RuntimeBuilder::with_provider(Arc::new(provider));
    builder.options_mut().workers = workers;
    builder.options_mut().thread_affinity = AffinityKind::OsDefault;
    task_manager::runtime_create_with(builder);
}

#[test]
fn directives() {
    serial(|| {
        create(4);
        assert!(task_manager::is_runtime_active());
        assert_eq!(task_manager::get_pool_size(), 4);
        assert_eq!(task_manager::get_num_workers(), 4);
        assert_eq!(task_manager::get_thread_num(), 0);

        let members = AtomicUsize::new(0);
        let singles = AtomicUsize::new(0);
        let sum = AtomicUsize::new(0);
        let critical = AtomicUsize::new(0);
        task_manager::parallel(3, || {
            members.fetch_add(1, Ordering::SeqCst);
            assert_eq!(task_manager::get_num_workers(), 3);
            assert_eq!(task_manager::team_level(), 1);
            task_manager::single(|| singles.fetch_add(1, Ordering::SeqCst));
            task_manager::for_loop(0..128, Schedule::Guided(None), |i| {
                sum.fetch_add(i, Ordering::Relaxed);
            });
            task_manager::critical(Some("c"), || {
                let v = critical.load(Ordering::Relaxed);
                critical.store(v + 1, Ordering::Relaxed);
            });
            task_manager::barrier();
        });
        assert_eq!(members.into_inner(), 3);
        assert_eq!(singles.into_inner(), 1);
        assert_eq!(sum.into_inner(), 8128);
        assert_eq!(critical.into_inner(), 3);

        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let count = count.clone();
            task_manager::spawn(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        task_manager::task_wait();
        assert_eq!(count.load(Ordering::SeqCst), 100);

        let size = 1 << 20;
        let start = task_manager::allocate(size, Some(1));
        let count2 = count.clone();
        task_manager::create_task(
            move || {
                count2.fetch_add(1, Ordering::SeqCst);
            },
            vec![Footprint::bytes(start, size, AccessMode::Read)],
            None,
        );
        task_manager::task_wait();
        assert_eq!(count.load(Ordering::SeqCst), 101);
        task_manager::release(start, size);

        task_manager::sleep_ms(1);
        task_manager::runtime_destroy();
        assert!(!task_manager::is_runtime_active());
    })
}

#[test]
fn create_twice_fails() {
    serial(|| {
        create(2);
        let again = panic::catch_unwind(|| create(2));
        assert!(again.is_err());
        // The first runtime is untouched.
        assert_eq!(task_manager::get_pool_size(), 2);
        task_manager::runtime_destroy();
    })
}

#[test]
fn calls_need_a_runtime() {
    serial(|| {
        assert!(!task_manager::is_runtime_active());
        let result = panic::catch_unwind(task_manager::get_num_workers);
        assert!(result.is_err());
        let result = panic::catch_unwind(AssertUnwindSafe(task_manager::runtime_destroy));
        assert!(result.is_err());
    })
}

#[test]
fn invalid_node_is_fatal() {
    serial(|| {
        create(2);
        let result = panic::catch_unwind(|| task_manager::allocate(64, Some(7)));
        task_manager::runtime_destroy();
        let err = result.unwrap_err();
        let message = err.downcast_ref::<String>().unwrap();
        assert!(message.contains("NUMA node 7 does not exist"), "{}", message);
    })
}
