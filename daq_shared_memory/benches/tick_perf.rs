//! Producer tick and session poll benchmarks

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use daq::layout::{ElementLayout, PrimitiveType};
use daq_shared_memory::{
    ProcessImage, SessionId, TaskControl, TaskScheduler, TaskSetup, VariableRegistry, create_task,
};
use std::hint::black_box;
use std::sync::Arc;

/// Task with `n` f64 signals, all transmitted.
fn task_with_signals(n: usize) -> (TaskScheduler, TaskControl, ProcessImage) {
    let mut registry = VariableRegistry::new(1);
    for i in 0..n {
        registry
            .register_signal(
                &format!("/bench/s{i}"),
                0,
                1,
                ElementLayout::scalar(PrimitiveType::F64),
                i * 8,
            )
            .unwrap();
    }
    registry.finalize();
    let registry = Arc::new(registry);
    let image = ProcessImage::for_registry(&registry);
    let (mut task, control) = create_task(&registry, &TaskSetup::new(0, 0.001)).unwrap();

    let all: Vec<usize> = (0..n).collect();
    control.subscribe(SessionId::next(), &all).unwrap();
    task.tick(&image, None);
    (task, control, image)
}

/// Benchmark one tick for different transmitted set sizes
fn bench_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("tick");
    for n in [1usize, 16, 256] {
        let (mut task, _control, image) = task_with_signals(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| task.tick(black_box(&image), None));
        });
    }
    group.finish();
}

/// Benchmark a cursor catching up on 100 frames
fn bench_poll(c: &mut Criterion) {
    let (mut task, control, image) = task_with_signals(16);
    let mut cursor = control.attach();

    c.bench_function("poll_100_frames_16_signals", |b| {
        b.iter(|| {
            for _ in 0..100 {
                task.tick(&image, None);
            }
            let mut bytes = 0;
            cursor.poll(|event| {
                if let daq_shared_memory::CursorEvent::Data(frame) = event {
                    bytes += frame.raw_values().len();
                }
            });
            black_box(bytes);
        });
    });
}

criterion_group!(benches, bench_tick, bench_poll);
criterion_main!(benches);
