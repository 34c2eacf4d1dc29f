use std::sync::Arc;

use criterion::Criterion;
use mirt::util::options::{AffinityKind, MapConfigProvider};
use mirt::{Runtime, RuntimeBuilder};

mod tasks;
mod worksharing;

/// Four unpinned workers on two synthetic nodes, so the NUMA paths are exercised on any machine.
pub(crate) fn runtime() -> Runtime {
    let provider: MapConfigProvider = [("topology", "uniform:2x2")].into_iter().collect();
    let mut builder = RuntimeBuilder::with_provider(Arc::new(provider));
    builder.options_mut().workers = 4;
    builder.options_mut().thread_affinity = AffinityKind::OsDefault;
    builder.build().unwrap()
}

pub fn bench(c: &mut Criterion) {
    tasks::bench(c);
    worksharing::bench(c);
}
