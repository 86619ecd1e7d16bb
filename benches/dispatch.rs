use criterion::{black_box, criterion_group, criterion_main, Criterion};

use rtc_session_engine::thread::{ContextKind, Dispatcher};

fn bench_dispatch(c: &mut Criterion) {
    let dispatcher = Dispatcher::new().expect("spawn contexts");
    let mut group = c.benchmark_group("dispatch");

    group.bench_function("invoke_cross_context", |b| {
        b.iter(|| {
            dispatcher
                .run_on(ContextKind::Worker, || black_box(21u64) * 2)
                .expect("worker running")
        })
    });

    let worker = dispatcher.worker();
    group.bench_function("invoke_inline", |b| {
        // Run the whole timing loop on the worker so every invoke is inline.
        let inner = worker.clone();
        b.iter_custom(|iters| {
            let inner = inner.clone();
            worker
                .invoke(move || {
                    let start = std::time::Instant::now();
                    for _ in 0..iters {
                        let value = inner.invoke(|| black_box(21u64) * 2).expect("inline");
                        black_box(value);
                    }
                    start.elapsed()
                })
                .expect("worker running")
        })
    });

    group.bench_function("network_to_worker_hop", |b| {
        let network = dispatcher.network();
        let worker = dispatcher.worker();
        b.iter(|| {
            let worker = worker.clone();
            network
                .invoke(move || worker.invoke(|| black_box(7u32)).expect("worker running"))
                .expect("network running")
        })
    });

    group.finish();
}

criterion_group!(benches, bench_dispatch);
criterion_main!(benches);
