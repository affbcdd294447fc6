use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use std::time::Duration;

use fairq_core::{Outcome, TenantId, UserId, WorkerId};
use fairq_infra::config::QueueConfig;
use fairq_infra::service::TaskService;

const VIS: Duration = Duration::from_secs(30);

fn service() -> TaskService {
    let config = QueueConfig::default()
        .with_user_cap(1_000_000)
        .with_global_cap(1_000_000);
    TaskService::in_memory(config)
}

fn fill(svc: &TaskService, tasks: usize, users: usize) {
    let tenant = TenantId::parse("bench").unwrap();
    for i in 0..tasks {
        let user = UserId::parse(format!("u{}", i % users)).unwrap();
        svc.submit_task(tenant.clone(), user, serde_json::json!({ "n": i }), None)
            .unwrap();
    }
}

fn bench_enqueue(c: &mut Criterion) {
    let mut group = c.benchmark_group("enqueue");
    for tasks in [100usize, 1_000] {
        group.throughput(Throughput::Elements(tasks as u64));
        group.bench_with_input(BenchmarkId::from_parameter(tasks), &tasks, |b, &tasks| {
            b.iter(|| {
                let svc = service();
                fill(&svc, black_box(tasks), 10);
            });
        });
    }
    group.finish();
}

/// Full lifecycle: lease every task and complete it.
fn bench_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("dequeue_complete");
    for users in [1usize, 10, 100] {
        let tasks = 1_000;
        group.throughput(Throughput::Elements(tasks as u64));
        group.bench_with_input(BenchmarkId::new("users", users), &users, |b, &users| {
            b.iter_batched(
                || {
                    let svc = service();
                    fill(&svc, tasks, users);
                    svc
                },
                |svc| {
                    let worker = WorkerId::parse("bench-worker").unwrap();
                    while let Some(leased) = svc.queue().try_dequeue(&worker, VIS).unwrap() {
                        svc.complete(&leased.task.task_id, &leased.lease.lease_token, Outcome::Succeeded)
                            .unwrap();
                    }
                    black_box(svc)
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

fn bench_batch_progress(c: &mut Criterion) {
    let svc = service();
    let tenant = TenantId::parse("bench").unwrap();
    let batch = svc.batches().create_batch(&tenant, 1_000).unwrap();

    c.bench_function("batch_progress", |b| {
        b.iter(|| svc.get_batch_progress(black_box(&batch.batch_id)).unwrap());
    });
}

criterion_group!(benches, bench_enqueue, bench_drain, bench_batch_progress);
criterion_main!(benches);
