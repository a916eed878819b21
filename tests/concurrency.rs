// Concurrent enqueue / pull / remove against one queue: whatever the
// interleaving, every request is accounted for exactly once.

use crossbeam_channel::unbounded;
use dmclock::{ClientInfo, PhaseType, PullQueue, PullReq, PushQueue, QueueConfig, ReqParams};
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn test_config() -> QueueConfig {
    QueueConfig {
        idle_age: Duration::from_secs(60),
        erase_age: Duration::from_secs(120),
        check_time: Duration::from_secs(5),
        ..QueueConfig::default()
    }
}

#[test]
fn concurrent_enqueue_and_pull_conserves_requests() {
    const PRODUCERS: u64 = 3;
    const PER_PRODUCER: u64 = 500;

    let queue: Arc<PullQueue<u32, u64>> = Arc::new(
        PullQueue::new(test_config(), |_client: &u32| {
            ClientInfo::new(0.0, 1.0, 0.0, 0.0, 0)
        })
        .expect("valid config"),
    );

    let mut producers = Vec::new();
    for p in 0..PRODUCERS {
        let queue = Arc::clone(&queue);
        producers.push(thread::spawn(move || {
            let mut rng = rand::thread_rng();
            for i in 0..PER_PRODUCER {
                let id = p * PER_PRODUCER + i;
                queue.add_request(id, p as u32, ReqParams::new(1, 1, 1));
                if rng.gen_bool(0.05) {
                    thread::yield_now();
                }
            }
        }));
    }

    let consumer_queue = Arc::clone(&queue);
    let consumer = thread::spawn(move || {
        let mut seen = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(30);
        while seen.len() < (PRODUCERS * PER_PRODUCER) as usize && Instant::now() < deadline {
            match consumer_queue.pull_request() {
                PullReq::Returning { request, .. } => seen.push(request),
                _ => thread::yield_now(),
            }
        }
        seen
    });

    for producer in producers {
        producer.join().expect("producer panicked");
    }
    let seen = consumer.join().expect("consumer panicked");

    let unique: HashSet<u64> = seen.iter().copied().collect();
    assert_eq!(seen.len(), (PRODUCERS * PER_PRODUCER) as usize);
    assert_eq!(unique.len(), seen.len(), "duplicate dispatches");
    assert!(queue.is_empty());
}

#[test]
fn remove_by_client_races_cleanly_with_dispatch() {
    const TOTAL: u64 = 400;

    let queue: Arc<PullQueue<u32, u64>> = Arc::new(
        PullQueue::new(test_config(), |_client: &u32| {
            ClientInfo::new(0.0, 1.0, 0.0, 0.0, 0)
        })
        .expect("valid config"),
    );

    for i in 0..TOTAL {
        queue.add_request(i, (i % 2) as u32, ReqParams::new(1, 1, 1));
    }

    let puller_queue = Arc::clone(&queue);
    let puller = thread::spawn(move || {
        let mut pulled = Vec::new();
        loop {
            match puller_queue.pull_request() {
                PullReq::Returning { request, .. } => pulled.push(request),
                PullReq::Empty => break,
                PullReq::Future(_) => thread::yield_now(),
            }
        }
        pulled
    });

    // rip client 1's queue out from under the puller
    let mut removed = Vec::new();
    queue.remove_by_client(&1, false, |request| removed.push(request));

    let pulled = puller.join().expect("puller panicked");
    let mut all: Vec<u64> = pulled.iter().chain(removed.iter()).copied().collect();
    all.sort_unstable();
    all.dedup();
    assert_eq!(
        all.len(),
        TOTAL as usize,
        "requests lost or duplicated across dispatch and removal"
    );
}

#[test]
fn push_queue_delivers_from_concurrent_producers() {
    const PRODUCERS: u64 = 2;
    const PER_PRODUCER: u64 = 300;

    let (tx, rx) = unbounded();
    let queue: Arc<PushQueue<u32, u64>> = Arc::new(
        PushQueue::new(
            test_config(),
            |_client: &u32| ClientInfo::new(0.0, 1.0, 0.0, 0.0, 0),
            Box::new(|| true),
            Box::new(move |_client: &u32, request: u64, _phase: PhaseType| {
                let _ = tx.send(request);
            }),
        )
        .expect("valid config"),
    );

    let mut producers = Vec::new();
    for p in 0..PRODUCERS {
        let queue = Arc::clone(&queue);
        producers.push(thread::spawn(move || {
            for i in 0..PER_PRODUCER {
                queue.add_request(p * PER_PRODUCER + i, p as u32, ReqParams::new(1, 1, 1));
            }
        }));
    }
    for producer in producers {
        producer.join().expect("producer panicked");
    }

    let mut seen = HashSet::new();
    let deadline = Instant::now() + Duration::from_secs(30);
    while seen.len() < (PRODUCERS * PER_PRODUCER) as usize && Instant::now() < deadline {
        queue.request_completed();
        while let Ok(request) = rx.try_recv() {
            seen.insert(request);
        }
    }
    assert_eq!(seen.len(), (PRODUCERS * PER_PRODUCER) as usize);
}
