use anvilq::config::{QueueSpec, RetryPolicy};
use anvilq::core::scheduler::WeightedScheduler;
use anvilq::utils::calculate_backoff;
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;

fn bench_idle_backoff(c: &mut Criterion) {
    c.bench_function("calculate_backoff", |b| {
        b.iter(|| {
            for attempt in 1..32 {
                black_box(calculate_backoff(black_box(attempt), black_box(7)));
            }
        })
    });
}

fn bench_retry_delay(c: &mut Criterion) {
    let mut group = c.benchmark_group("retry_delay");
    let policies = [
        ("fixed", RetryPolicy::fixed(5, 500)),
        ("linear", RetryPolicy::linear(5)),
        ("exponential", RetryPolicy::exponential(5)),
    ];
    for (name, policy) in policies {
        group.bench_with_input(BenchmarkId::from_parameter(name), &policy, |b, policy| {
            b.iter(|| {
                for retry in 1..=5 {
                    black_box(policy.delay_for(black_box(retry)));
                }
            })
        });
    }
    group.finish();
}

fn bench_weighted_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("weighted_dispatch");
    for queues in [3usize, 10, 50] {
        let specs: Vec<QueueSpec> = (0..queues)
            .map(|i| QueueSpec::new(format!("q{}", i), (i as u32 % 6) + 1))
            .collect();
        group.bench_with_input(BenchmarkId::from_parameter(queues), &specs, |b, specs| {
            let mut scheduler = WeightedScheduler::new(specs);
            b.iter(|| black_box(scheduler.next(|name| !name.ends_with('0'))))
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_idle_backoff,
    bench_retry_delay,
    bench_weighted_dispatch
);
criterion_main!(benches);
