//! Criterion benchmarks for the record-mode hot path.
//!
//! Record mode drains the hardware buffer on every poll, so the per-poll
//! cost bounds the sustainable streaming rate.
//!
//! Key metrics:
//! - Scan push throughput into the capture ring
//! - Drain planning overhead per poll
//! - End-to-end record poll cost against the simulated device
//!
//! Run with: cargo bench --bench record_drain

use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mixsig_daq::instrument::{AcquisitionMode, ChannelSelector, Instrument};
use mixsig_daq::record::{DrainTracker, SampleRing};
use mixsig_daq::sim::{Signal, SimDevice};
use mixsig_daq::Device;

/// Push scans of two channels into rings of different depth.
fn sample_ring_push(c: &mut Criterion) {
    let mut group = c.benchmark_group("sample_ring_push");

    for capacity in [1024usize, 8192, 65_536] {
        let mut ring = SampleRing::<f64>::new(2, capacity);
        let scan = [0.5, -0.5];

        group.throughput(Throughput::Elements(capacity as u64));
        group.bench_with_input(BenchmarkId::new("fill", capacity), &capacity, |b, &n| {
            b.iter(|| {
                for _ in 0..n {
                    ring.push(black_box(&scan));
                }
            });
        });
    }

    group.finish();
}

/// Plan and finish drains with and without overflow.
fn drain_tracker(c: &mut Criterion) {
    let mut group = c.benchmark_group("drain_tracker");

    for (name, per_poll) in [("within_capacity", 1_000u64), ("overflowing", 20_000)] {
        group.bench_function(name, |b| {
            let mut tracker = DrainTracker::new(8192);
            let mut produced = 0u64;
            b.iter(|| {
                produced += per_poll;
                let plan = tracker.plan(black_box(produced));
                tracker.finish(&plan, produced);
                black_box(plan);
            });
        });
    }

    group.finish();
}

/// Full record polls: 1 ms of data per poll at different sample rates.
fn record_poll(c: &mut Criterion) {
    let mut group = c.benchmark_group("record_poll");

    for rate_hz in [100_000.0, 1_000_000.0, 5_000_000.0] {
        let (backend, handle) = SimDevice::new();
        let device = Device::new(backend);
        handle.set_analog_signal(0, Signal::sine(1.0, 1000.0));
        handle.set_analog_signal(1, Signal::Constant(0.25));

        let mut scope = device.analog_in().unwrap();
        scope.set_mode(AcquisitionMode::Record).unwrap();
        scope.set_channel_enable(ChannelSelector::Index(1), true).unwrap();
        scope.set_sample_rate(rate_hz).unwrap();
        scope.configure(false, true).unwrap();

        let per_poll = (rate_hz / 1000.0) as u64;
        group.throughput(Throughput::Elements(per_poll * 2));
        group.bench_with_input(BenchmarkId::new("poll", rate_hz as u64), &rate_hz, |b, _| {
            b.iter(|| {
                handle.advance(Duration::from_millis(1));
                scope.poll(true).unwrap();
                black_box(scope.record_status().unwrap());
            });
        });
    }

    group.finish();
}

criterion_group!(benches, sample_ring_push, drain_tracker, record_poll);
criterion_main!(benches);
