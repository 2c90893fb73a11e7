//! Channel Driver Performance Benchmarks
//!
//! Measures descriptor throughput of the dummy backend, with and without the
//! per-operation state persistence a channel handle performs.
//!
//! # Running
//!
//! ```bash
//! cargo bench -p daq-driver-rorc
//! ```
//!
//! Point `RORC_BENCH_ROOT` at a tmpfs (e.g. `/dev/shm`) to keep disk latency
//! out of the persistence numbers.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use daq_driver_rorc::{
    BackendSelection, CardId, ChannelBackend, ChannelFactory, ChannelId, ChannelParameters,
    DescriptorFifo, DummyChannel, GeneratorPattern, PageBuffer, RorcConfig,
};
use std::env;
use tempfile::TempDir;

fn bench_root() -> TempDir {
    match env::var("RORC_BENCH_ROOT") {
        Ok(dir) => tempfile::tempdir_in(dir).unwrap(),
        Err(_) => tempfile::tempdir().unwrap(),
    }
}

fn params(page_size: usize, generator: bool) -> ChannelParameters {
    let builder = ChannelParameters::builder().page_size(page_size).page_count(64);
    let builder = if generator {
        builder.generator(GeneratorPattern::Incremental)
    } else {
        builder
    };
    builder.build().unwrap()
}

/// Push/pop cycles straight on the backend, no persistence
fn bench_backend_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("dummy_backend_cycle");

    for &(page_size, generator) in &[(8192, false), (8192, true), (65536, true)] {
        let root = bench_root();
        let params = params(page_size, generator);
        let path = root.path().join("pages");
        let buffer = PageBuffer::open_or_create(&path, &params).unwrap();
        let channel = ChannelId::new(CardId::dummy(), 0);
        let fifo = DescriptorFifo::new(channel.clone(), params.page_count);
        let mut backend = DummyChannel::open(channel, &params, fifo, &path).unwrap();

        group.throughput(Throughput::Bytes(page_size as u64));
        let label = format!("{}B_gen_{}", page_size, generator);
        group.bench_function(BenchmarkId::from_parameter(label), |b| {
            let mut index = 0u32;
            b.iter(|| {
                let page = buffer.descriptor(index, backend.bus_addresses()[index as usize]).unwrap();
                backend.push_page(page).unwrap();
                black_box(backend.pop_completed().unwrap());
                index = (index + 1) % params.page_count;
            })
        });
    }

    group.finish();
}

/// Push/pop cycles through a channel handle, persisting after each operation
fn bench_handle_cycle(c: &mut Criterion) {
    let root = bench_root();
    let config = RorcConfig::default()
        .with_root_dir(root.path())
        .with_backend(BackendSelection::Dummy);
    let factory = ChannelFactory::new(config);
    let mut handle = factory
        .get_channel(&CardId::new(1), 0, &params(8192, false))
        .unwrap();

    let mut group = c.benchmark_group("channel_handle_cycle");
    group.throughput(Throughput::Elements(1));
    group.bench_function("push_pop_persisted", |b| {
        b.iter(|| {
            let page = handle.next_free_page().unwrap();
            handle.push_page(page).unwrap();
            black_box(handle.pop_completed().unwrap());
        })
    });
    group.finish();

    handle.close().unwrap();
}

criterion_group!(benches, bench_backend_cycle, bench_handle_cycle);
criterion_main!(benches);
