// Closed-loop simulation binary.
//
// Drives a pull queue with a handful of synthetic clients whose QoS knobs
// differ, feeds every completion back through a service tracker, and logs
// per-client dispatch counts once a second until Ctrl+C (or --seconds).

use crossbeam_channel::bounded;
use dmclock::{ClientInfo, PhaseType, PullQueue, PullReq, QueueConfig, ServiceTracker};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;

const SERVER_ID: u32 = 1;
const BACKLOG_PER_CLIENT: usize = 16;

/// Command-line options parsed from program arguments.
struct CliOptions {
    /// Number of synthetic clients.
    clients: u32,
    /// Stop after this many seconds; 0 runs until Ctrl+C.
    seconds: u64,
}

fn parse_cli_options() -> CliOptions {
    let mut clients = 3;
    let mut seconds = 0;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        let (key, value) = match arg.split_once('=') {
            Some((key, value)) => (key.to_string(), Some(value.to_string())),
            None => (arg, args.next()),
        };
        match (key.as_str(), value) {
            ("--clients", Some(value)) => clients = value.parse().unwrap_or(clients),
            ("--seconds", Some(value)) => seconds = value.parse().unwrap_or(seconds),
            _ => {}
        }
    }
    CliOptions { clients, seconds }
}

/// QoS mix: client 0 is reservation-backed, client 1 is weight-heavy,
/// everyone else is weight 1 with a rate limit.
fn client_qos(client: &u32) -> ClientInfo {
    match client {
        0 => ClientInfo::new(100.0, 1.0, 0.0, 0.0, 0),
        1 => ClientInfo::new(0.0, 4.0, 0.0, 0.0, 0),
        _ => ClientInfo::new(0.0, 1.0, 200.0, 0.0, 0),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let options = parse_cli_options();

    let queue: Arc<PullQueue<u32, u64>> =
        Arc::new(PullQueue::new(QueueConfig::default(), client_qos)?);
    let tracker: Arc<ServiceTracker<u32>> = Arc::new(ServiceTracker::default());

    let running = Arc::new(AtomicBool::new(true));
    let ctrlc_running = Arc::clone(&running);
    ctrlc::set_handler(move || {
        ctrlc_running.store(false, Ordering::Relaxed);
    })?;

    // completions flow back to the tracker on a separate thread, the way
    // responses would arrive from a remote server
    let (done_tx, done_rx) = bounded::<(u32, PhaseType)>(1024);
    let responder_tracker = Arc::clone(&tracker);
    let responder = thread::spawn(move || {
        for (_, phase) in done_rx {
            responder_tracker.track_resp(&SERVER_ID, phase, 4096);
        }
    });

    let deadline = (options.seconds > 0)
        .then(|| Instant::now() + Duration::from_secs(options.seconds));
    let mut dispatched = vec![0u64; options.clients as usize];
    let mut request_id = 0u64;
    let mut last_report = Instant::now();

    info!(clients = options.clients, "simulation started");
    while running.load(Ordering::Relaxed) {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }

        // keep every client backlogged
        while queue.request_count() < BACKLOG_PER_CLIENT * options.clients as usize {
            let client = (request_id % u64::from(options.clients)) as u32;
            let params = tracker.get_req_params(&SERVER_ID);
            queue.add_request(request_id, client, params);
            request_id += 1;
        }

        match queue.pull_request() {
            PullReq::Returning { client, phase, .. } => {
                dispatched[client as usize] += 1;
                let _ = done_tx.send((client, phase));
            }
            PullReq::Future(when) => {
                let wait = (when - dmclock::now()).clamp(0.0, 0.1);
                thread::sleep(Duration::from_secs_f64(wait));
            }
            PullReq::Empty => thread::sleep(Duration::from_millis(1)),
        }

        if last_report.elapsed() >= Duration::from_secs(1) {
            let stats = queue.stats();
            info!(
                per_client = ?dispatched,
                reservation = stats.reservation_dispatches,
                priority = stats.priority_dispatches,
                "dispatch totals"
            );
            last_report = Instant::now();
        }
    }

    drop(done_tx);
    responder.join().expect("responder thread panicked");
    info!(total = dispatched.iter().sum::<u64>(), "simulation finished");
    println!("{queue}");
    println!("{tracker}");
    Ok(())
}
