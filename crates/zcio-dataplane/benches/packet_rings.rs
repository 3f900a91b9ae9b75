//! Packet ring and dispatch benchmarks
//!
//! Target: <100ns per ring operation on the hot path

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use zcio_core::{DynamicRing, Packet, PacketList, Ring};
use zcio_dataplane::{Dispatcher, DispatcherConfig, NullTask};

fn ring_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring");

    group.bench_function("fixed_insert_extract", |b| {
        let ring: Ring<u64, 1024> = Ring::new();
        b.iter(|| {
            let _ = ring.insert(black_box(42));
            black_box(ring.extract())
        })
    });

    group.bench_function("dynamic_insert_extract", |b| {
        let ring: DynamicRing<u64> = DynamicRing::new(1024);
        b.iter(|| {
            let _ = ring.insert(black_box(42));
            black_box(ring.extract())
        })
    });

    group.finish();
}

fn packet_list_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_list");

    for batch in [32usize, 256].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(batch), batch, |b, &batch| {
            let payload = [0u8; 64];
            b.iter(|| {
                let mut list = PacketList::new();
                for _ in 0..batch {
                    list.append(Packet::copied(black_box(&payload)).unwrap());
                }
                while let Some(p) = list.pop_front() {
                    black_box(p.len());
                }
            })
        });
    }

    group.finish();
}

fn dispatch_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");

    group.bench_function("push_drain", |b| {
        let (dispatcher, mut consumer) =
            Dispatcher::new(1, DispatcherConfig::default(), Arc::new(NullTask));
        let mut producer = dispatcher.producer(0).unwrap();
        let payload = [0u8; 64];
        b.iter(|| {
            for _ in 0..32 {
                producer.push(Packet::copied(black_box(&payload)).unwrap());
            }
            consumer.run_task(&mut |p| {
                black_box(p.len());
            })
        })
    });

    group.finish();
}

criterion_group!(benches, ring_benchmark, packet_list_benchmark, dispatch_benchmark);
criterion_main!(benches);
