//! Launch planning and push/pop round trips on the simulated runtime

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mirror_core::{compute_launch_plan, AcceleratorRuntime, CapabilityDescriptor, MirroredBuffer, SimRuntime, Transfer};
use std::sync::Arc;

fn benchmark_launch_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("launch_plan");
    let capability = CapabilityDescriptor::new(2048, 6, 256);

    for n in [100u64, 10_000, 393_215, 10_000_000] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter(|| black_box(compute_launch_plan(black_box(&capability), black_box(n)).unwrap()));
        });
    }

    group.finish();
}

fn benchmark_verify_coverage(c: &mut Criterion) {
    let mut group = c.benchmark_group("verify_coverage");
    let capability = CapabilityDescriptor::new(2048, 6, 256);

    for n in [1_000u64, 1_000_000] {
        let plan = compute_launch_plan(&capability, n).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter(|| plan.verify_coverage(black_box(n)).unwrap());
        });
    }

    group.finish();
}

fn benchmark_push_pop(c: &mut Criterion) {
    let mut group = c.benchmark_group("push_pop");

    for size in [1_024usize, 65_536, 1_048_576] {
        group.throughput(Throughput::Bytes((size * std::mem::size_of::<f32>() * 2) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &n| {
            let runtime: Arc<dyn AcceleratorRuntime> = Arc::new(SimRuntime::new());
            let mut buffer = MirroredBuffer::<f32>::new(runtime, n).unwrap();
            buffer.host_mut().unwrap().fill(1.0);

            b.iter(|| {
                buffer.push(Transfer::Sync).unwrap();
                buffer.pop(Transfer::Sync).unwrap();
                black_box(buffer.host().unwrap()[0]);
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_launch_plan,
    benchmark_verify_coverage,
    benchmark_push_pop
);
criterion_main!(benches);
