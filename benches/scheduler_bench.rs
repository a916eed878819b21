use criterion::{black_box, criterion_group, criterion_main, Criterion};
use dmclock::{ClientInfo, PullQueue, QueueConfig, ReqParams};
use std::time::Duration;

fn bench_config() -> QueueConfig {
    QueueConfig {
        idle_age: Duration::from_secs(60),
        erase_age: Duration::from_secs(120),
        check_time: Duration::from_secs(10),
        ..QueueConfig::default()
    }
}

fn bench_add_request(c: &mut Criterion) {
    let mut group = c.benchmark_group("pull_queue");

    group.bench_function("add_request", |b| {
        let queue: PullQueue<u32, u64> = PullQueue::new(bench_config(), |_client: &u32| {
            ClientInfo::new(100.0, 1.0, 0.0, 0.0, 0)
        })
        .unwrap();
        let mut i = 0u64;
        b.iter(|| {
            queue.add_request_at(black_box(i), (i % 16) as u32, ReqParams::new(1, 1, 1), 0.0, 0.0);
            i += 1;
        });
    });

    group.bench_function("add_then_pull", |b| {
        let queue: PullQueue<u32, u64> = PullQueue::new(bench_config(), |_client: &u32| {
            ClientInfo::new(0.0, 1.0, 0.0, 0.0, 0)
        })
        .unwrap();
        let mut i = 0u64;
        b.iter(|| {
            queue.add_request_at(black_box(i), (i % 16) as u32, ReqParams::new(1, 1, 1), 0.0, 0.0);
            black_box(queue.pull_request_at(f64::from(u32::MAX)));
            i += 1;
        });
    });

    group.finish();
}

fn bench_pull_contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("pull_contended");

    group.bench_function("pull_64_clients", |b| {
        let queue: PullQueue<u32, u64> = PullQueue::new(bench_config(), |_client: &u32| {
            ClientInfo::new(10.0, 1.0, 0.0, 0.0, 0)
        })
        .unwrap();
        // deep backlog across many clients so pulls always succeed
        for i in 0..64_000u64 {
            queue.add_request_at(i, (i % 64) as u32, ReqParams::new(1, 1, 1), 0.0, 0.0);
        }
        let mut now = 0.0;
        b.iter(|| {
            now += 0.001;
            black_box(queue.pull_request_at(now));
        });
    });

    group.finish();
}

criterion_group!(benches, bench_add_request, bench_pull_contended);
criterion_main!(benches);
