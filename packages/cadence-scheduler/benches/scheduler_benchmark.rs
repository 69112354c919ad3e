use cadence_scheduler::{AsyncOperation, EventLoop, ManualClock};
use criterion::{Criterion, black_box, criterion_group, criterion_main};

fn manual_loop() -> EventLoop {
    EventLoop::builder().clock(ManualClock::new()).build()
}

fn benchmark_microtasks(c: &mut Criterion) {
    c.bench_function("queue_microtask 1000", |b| {
        b.iter(|| {
            let lp = manual_loop();
            for _ in 0..1000 {
                lp.queue_microtask(|_| {
                    black_box(1 + 1);
                });
            }
            lp.tick();
        })
    });
}

fn benchmark_timers(c: &mut Criterion) {
    c.bench_function("set_timeout 1000 staggered", |b| {
        b.iter(|| {
            let lp = manual_loop();
            for i in 0..1000u64 {
                lp.set_timeout(i % 50, |_| {
                    black_box(1 + 1);
                });
            }
            lp.run().ok();
        })
    });
}

fn benchmark_operations(c: &mut Criterion) {
    c.bench_function("settle 1000 operations", |b| {
        b.iter(|| {
            let lp = manual_loop();
            for i in 0..1000u32 {
                let op: AsyncOperation<u32, ()> = lp.create_operation();
                op.on_settled(|_, outcome| {
                    black_box(outcome.ok());
                });
                op.complete(i).ok();
            }
            lp.run().ok();
        })
    });
}

criterion_group!(
    benches,
    benchmark_microtasks,
    benchmark_timers,
    benchmark_operations
);
criterion_main!(benches);
