//! Client-side service tracker.
//!
//! One tracker per caller process accumulates the service observed from
//! each server and turns it into the `(delta, rho, cost)` feedback triple
//! attached to every outbound request: completions from anywhere,
//! reservation-phase completions, and bytes served since the last request
//! sent to that particular server.
//!
//! Two background jobs run against the same state: a cleanup pass that
//! forgets servers not contacted within `clean_age`, and a per-second rate
//! pass that maintains current and peak rates plus a short rolling window
//! of samples for the operator dump.

use crate::clock::{self, Time};
use crate::qos::{PhaseType, ReqParams};
use crate::timer::PeriodicTask;
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

/// Samples kept in the per-server rolling rate window.
const RATE_WINDOW: usize = 32;
/// Samples averaged by the operator dump.
const RATE_DUMP_SPAN: usize = 30;

/// Per-server accounting.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    /// Counter values captured when the last request went to this server.
    delta_prev_req: u64,
    rho_prev_req: u64,
    cost_prev_req: u64,
    /// Responses from this server since that request.
    my_delta: u32,
    my_rho: u32,
    my_cost: u32,

    /// Running totals feeding the rate job.
    sum_delta_self: u64,
    sum_delta_prev: u64,
    sum_rho_self: u64,
    sum_rho_prev: u64,
    sum_cost_self: u64,
    sum_cost_prev: u64,
    rate_delta: u32,
    rate_rho: u32,
    rate_cost: u32,
    rate_delta_peak: u32,
    rate_rho_peak: u32,
    rate_cost_peak: u32,

    /// Ring of the most recent (ops, bytes) per-second samples.
    recent_rates: Vec<(u32, u32)>,
    rates_idx: u32,
}

impl ServerInfo {
    fn new(delta_prev_req: u64, rho_prev_req: u64, cost_prev_req: u64) -> Self {
        ServerInfo {
            delta_prev_req,
            rho_prev_req,
            cost_prev_req,
            my_delta: 0,
            my_rho: 0,
            my_cost: 0,
            sum_delta_self: 0,
            sum_delta_prev: 0,
            sum_rho_self: 0,
            sum_rho_prev: 0,
            sum_cost_self: 0,
            sum_cost_prev: 0,
            rate_delta: 0,
            rate_rho: 0,
            rate_cost: 0,
            rate_delta_peak: 0,
            rate_rho_peak: 0,
            rate_cost_peak: 0,
            recent_rates: Vec::new(),
            rates_idx: 0,
        }
    }

    /// A request just went out; snapshot the counters and reset the
    /// own-response tallies.
    fn req_update(&mut self, delta: u64, rho: u64, cost: u64) {
        self.delta_prev_req = delta;
        self.rho_prev_req = rho;
        self.cost_prev_req = cost;
        self.my_delta = 0;
        self.my_rho = 0;
        self.my_cost = 0;
    }

    /// A response just came back from this server.
    fn resp_update(&mut self, phase: PhaseType, cost: u32) {
        self.my_delta += 1;
        self.sum_delta_self += 1;
        if phase == PhaseType::Reservation {
            self.my_rho += 1;
            self.sum_rho_self += 1;
        }
        self.my_cost += cost;
        self.sum_cost_self += u64::from(cost);
    }

    fn sample_rates(&mut self) {
        self.rate_delta = (self.sum_delta_self - self.sum_delta_prev) as u32;
        self.rate_rho = (self.sum_rho_self - self.sum_rho_prev) as u32;
        self.rate_cost = (self.sum_cost_self - self.sum_cost_prev) as u32;
        self.sum_delta_prev = self.sum_delta_self;
        self.sum_rho_prev = self.sum_rho_self;
        self.sum_cost_prev = self.sum_cost_self;

        self.rate_delta_peak = self.rate_delta_peak.max(self.rate_delta);
        self.rate_rho_peak = self.rate_rho_peak.max(self.rate_rho);
        self.rate_cost_peak = self.rate_cost_peak.max(self.rate_cost);

        let sample = (self.rate_delta, self.rate_cost);
        if self.recent_rates.len() < RATE_WINDOW {
            self.recent_rates.push(sample);
        } else {
            self.recent_rates[self.rates_idx as usize % RATE_WINDOW] = sample;
        }
        self.rates_idx += 1;
    }

    /// Average (ops, bytes) over the most recent dump span.
    fn average_rates(&self) -> Option<(u64, u64)> {
        if self.rates_idx < 1 || self.recent_rates.is_empty() {
            return None;
        }
        let len = self.recent_rates.len();
        let mut ops: u64 = 0;
        let mut bytes: u64 = 0;
        let mut idx = (self.rates_idx as usize - 1) % len;
        for _ in 0..RATE_DUMP_SPAN {
            ops += u64::from(self.recent_rates[idx].0);
            bytes += u64::from(self.recent_rates[idx].1);
            idx = if idx == 0 { len - 1 } else { idx - 1 };
        }
        let span = RATE_DUMP_SPAN as u64;
        Some(((ops + span / 2) / span, (bytes + span / 2) / span))
    }
}

struct TrackerState<S> {
    /// Completions observed from any server. Starts at 1; zero is the
    /// cleanup sentinel.
    delta_counter: u64,
    /// Reservation-phase completions.
    rho_counter: u64,
    /// Bytes observed.
    cost_bytes: u64,
    server_map: HashMap<S, ServerInfo>,
    mark_points: VecDeque<(Time, u64)>,
}

struct TrackerShared<S> {
    state: Mutex<TrackerState<S>>,
    clean_age: Duration,
}

/// Accumulates observed service per server and produces the feedback
/// triple for outbound requests.
pub struct ServiceTracker<S>
where
    S: Eq + Hash + Clone + Send + 'static,
{
    shared: Arc<TrackerShared<S>>,
    _cleaner: PeriodicTask,
    _rate_job: PeriodicTask,
}

impl<S> Default for ServiceTracker<S>
where
    S: Eq + Hash + Clone + Send + 'static,
{
    fn default() -> Self {
        ServiceTracker::new(Duration::from_secs(300), Duration::from_secs(600))
    }
}

impl<S> ServiceTracker<S>
where
    S: Eq + Hash + Clone + Send + 'static,
{
    /// Both timings must be given together so a caller can't shorten the
    /// cleanup period without thinking about the age it enforces.
    pub fn new(clean_every: Duration, clean_age: Duration) -> Self {
        let shared = Arc::new(TrackerShared {
            state: Mutex::new(TrackerState {
                delta_counter: 1,
                rho_counter: 1,
                cost_bytes: 1,
                server_map: HashMap::new(),
                mark_points: VecDeque::new(),
            }),
            clean_age,
        });

        let cleaner_shared = Arc::clone(&shared);
        let cleaner = PeriodicTask::spawn("dmclock-tracker-clean", clean_every, move || {
            Self::do_clean(&cleaner_shared, clock::now());
        });

        let rate_shared = Arc::clone(&shared);
        let rate_job = PeriodicTask::spawn(
            "dmclock-tracker-rates",
            Duration::from_secs(1),
            move || Self::do_rate_calc(&rate_shared),
        );

        ServiceTracker {
            shared,
            _cleaner: cleaner,
            _rate_job: rate_job,
        }
    }

    /// Feedback triple for the next request to `server`. A server seen for
    /// the first time gets `(1, 1, 1)`.
    pub fn get_req_params(&self, server: &S) -> ReqParams {
        let mut state = self.shared.state.lock();
        let (delta_counter, rho_counter, cost_bytes) =
            (state.delta_counter, state.rho_counter, state.cost_bytes);
        match state.server_map.entry(server.clone()) {
            Entry::Vacant(entry) => {
                entry.insert(ServerInfo::new(delta_counter, rho_counter, cost_bytes));
                ReqParams::new(1, 1, 1)
            }
            Entry::Occupied(mut entry) => {
                let info = entry.get_mut();
                let delta =
                    1 + delta_counter - info.delta_prev_req - u64::from(info.my_delta);
                let rho = 1 + rho_counter - info.rho_prev_req - u64::from(info.my_rho);
                let cost = cost_bytes - info.cost_prev_req - u64::from(info.my_cost);
                info.req_update(delta_counter, rho_counter, cost_bytes);
                ReqParams::new(delta as u32, rho as u32, cost as u32)
            }
        }
    }

    /// Fold a response from `server` into the counters. `cost` is the
    /// byte-cost the server reported for the request.
    pub fn track_resp(&self, server: &S, phase: PhaseType, cost: u32) {
        let mut state = self.shared.state.lock();
        let (delta_counter, rho_counter, cost_bytes) =
            (state.delta_counter, state.rho_counter, state.cost_bytes);
        // a vacant entry means the response had no preceding request: the
        // record was cleaned up in between, or the caller never asked for
        // params
        state
            .server_map
            .entry(server.clone())
            .or_insert_with(|| ServerInfo::new(delta_counter, rho_counter, cost_bytes))
            .resp_update(phase, cost);
        state.delta_counter += 1;
        if phase == PhaseType::Reservation {
            state.rho_counter += 1;
        }
        state.cost_bytes += u64::from(cost);
    }

    pub fn server_count(&self) -> usize {
        self.shared.state.lock().server_map.len()
    }

    /// One cleanup pass at `now`; normally driven by the internal timer,
    /// exposed for operators and tests.
    pub fn cleanup(&self, now: Time) {
        Self::do_clean(&self.shared, now);
    }

    /// One rate-sampling pass; normally driven by the per-second timer.
    pub fn sample_rates(&self) {
        Self::do_rate_calc(&self.shared);
    }

    /// Record a mark point, find the newest one older than `clean_age`,
    /// and drop every server whose last request predates it.
    fn do_clean(shared: &TrackerShared<S>, now: Time) {
        let mut state = shared.state.lock();
        let mark = (now, state.delta_counter);
        state.mark_points.push_back(mark);

        let age = shared.clean_age.as_secs_f64();
        let mut earliest = 0;
        while let Some(&(mark_time, mark_counter)) = state.mark_points.front() {
            if mark_time <= now - age {
                earliest = mark_counter;
                state.mark_points.pop_front();
            } else {
                break;
            }
        }

        if earliest > 0 {
            state
                .server_map
                .retain(|_, info| info.delta_prev_req > earliest);
        }
    }

    fn do_rate_calc(shared: &TrackerShared<S>) {
        let mut state = shared.state.lock();
        for info in state.server_map.values_mut() {
            info.sample_rates();
        }
    }
}

impl<S> fmt::Display for ServiceTracker<S>
where
    S: Eq + Hash + Clone + Send + fmt::Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        writeln!(f, "service tracker: {} servers", state.server_map.len())?;
        let mut sum_ops = 0;
        let mut sum_bytes = 0;
        for (server, info) in &state.server_map {
            let Some((avg_ops, avg_bytes)) = info.average_rates() else {
                continue;
            };
            writeln!(
                f,
                "  {:?} ops:[{}|{},{}].{} bytes:[{}|{},{}]",
                server,
                info.rate_delta,
                info.rate_delta_peak,
                avg_ops,
                info.rate_rho,
                info.rate_cost,
                info.rate_cost_peak,
                avg_bytes,
            )?;
            sum_ops += avg_ops;
            sum_bytes += avg_bytes;
        }
        writeln!(
            f,
            "  average over last {RATE_DUMP_SPAN}s: ops {sum_ops}, bytes {sum_bytes} ({:.2} MB/s)",
            sum_bytes as f64 / (1 << 20) as f64
        )
    }
}
