//! Pull driver: the consumer loop asks for the next request.
//!
//! The queue owns no threads beyond the cleanup timer; every public
//! operation is synchronous and returns promptly.

use crate::clock::{self, Time};
use crate::config::{ConfigError, QueueConfig};
use crate::qos::{ClientInfo, PhaseType, ReqParams};
use crate::scheduler::queue::{HeapId, NextReq, QueueBase, SchedStats};
use crate::timer::PeriodicTask;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

/// Outcome of a [`PullQueue::pull_request`] call.
#[derive(Debug)]
pub enum PullReq<C, R> {
    /// A request is being handed back, with the phase that funded it.
    Returning {
        client: C,
        request: R,
        phase: PhaseType,
    },
    /// Nothing dispatchable yet; the earliest time a retry can succeed.
    Future(Time),
    /// No pending requests at all.
    Empty,
}

impl<C, R> PullReq<C, R> {
    pub fn is_returning(&self) -> bool {
        matches!(self, PullReq::Returning { .. })
    }

    pub fn is_future(&self) -> bool {
        matches!(self, PullReq::Future(_))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, PullReq::Empty)
    }
}

/// dmClock priority queue, pull flavor.
///
/// `C` identifies clients (hashable, cloneable); `R` is the request type,
/// owned by the queue from enqueue until dispatch.
pub struct PullQueue<C, R>
where
    C: Eq + Hash + Clone + Send + 'static,
    R: Send + 'static,
{
    base: Arc<QueueBase<C, R>>,
    _cleaner: PeriodicTask,
}

impl<C, R> PullQueue<C, R>
where
    C: Eq + Hash + Clone + Send + 'static,
    R: Send + 'static,
{
    /// Build a queue; `client_info_f` resolves the QoS record for clients
    /// seen for the first time and must be pure and non-blocking.
    pub fn new<F>(config: QueueConfig, client_info_f: F) -> Result<Self, ConfigError>
    where
        F: Fn(&C) -> ClientInfo + Send + Sync + 'static,
    {
        let base = Arc::new(QueueBase::new(config, Box::new(client_info_f))?);
        let cleaner_base = Arc::clone(&base);
        let cleaner = PeriodicTask::spawn("dmclock-cleanup", base.config.check_time, move || {
            cleaner_base.cleanup(clock::now());
        });
        Ok(PullQueue {
            base,
            _cleaner: cleaner,
        })
    }

    /// Enqueue at the current time with no extra reservation cost.
    pub fn add_request(&self, request: R, client_id: C, params: ReqParams) {
        self.add_request_at(request, client_id, params, clock::now(), 0.0);
    }

    /// Enqueue with an explicit arrival time and an additive reservation
    /// cost. Infallible once the client record exists.
    pub fn add_request_at(
        &self,
        request: R,
        client_id: C,
        params: ReqParams,
        time: Time,
        cost: f64,
    ) {
        let mut state = self.base.state.lock();
        self.base
            .do_add_request(&mut state, request, &client_id, params, time, cost, None);
    }

    /// Enqueue carrying a QoS override; a changed `version` triggers the
    /// hot-update re-tag, an invalid record falls back to the stored one.
    pub fn add_request_with_info(
        &self,
        request: R,
        client_id: C,
        info: ClientInfo,
        params: ReqParams,
        time: Time,
        cost: f64,
    ) {
        let mut state = self.base.state.lock();
        self.base.do_add_request(
            &mut state,
            request,
            &client_id,
            params,
            time,
            cost,
            Some(info),
        );
    }

    pub fn pull_request(&self) -> PullReq<C, R> {
        self.pull_request_at(clock::now())
    }

    /// Run the selection algorithm at `now` and pop the winner, if any.
    pub fn pull_request_at(&self, now: Time) -> PullReq<C, R> {
        let mut state = self.base.state.lock();
        match self.base.do_next_request(&mut state, now) {
            NextReq::Empty => PullReq::Empty,
            NextReq::Future(when) => PullReq::Future(when),
            NextReq::Returning { heap, limit_break } => {
                let (client, request) = self.base.pop_request(&mut state, heap);
                let phase = match heap {
                    HeapId::Reservation => {
                        state.stats.reservation_dispatches += 1;
                        PhaseType::Reservation
                    }
                    HeapId::Ready => {
                        self.base.reduce_reservation_tags(&mut state, &client);
                        state.stats.priority_dispatches += 1;
                        PhaseType::Priority
                    }
                };
                if limit_break {
                    state.stats.limit_break_dispatches += 1;
                }
                PullReq::Returning {
                    client,
                    request,
                    phase,
                }
            }
        }
    }

    /// Drain all of one client's pending requests into `accum`, in queue
    /// order (or reversed).
    pub fn remove_by_client<F>(&self, client: &C, reverse: bool, mut accum: F)
    where
        F: FnMut(R),
    {
        let mut state = self.base.state.lock();
        self.base
            .do_remove_by_client(&mut state, client, reverse, &mut accum);
    }

    /// Move every request matching `filter` out of the queue, across all
    /// clients; returns whether anything matched. O(total requests).
    pub fn remove_by_req_filter<F, A>(&self, mut filter: F, mut accum: A, backwards: bool) -> bool
    where
        F: FnMut(&R) -> bool,
        A: FnMut(R),
    {
        let mut state = self.base.state.lock();
        self.base
            .do_remove_by_req_filter(&mut state, &mut filter, &mut accum, backwards)
    }

    pub fn is_empty(&self) -> bool {
        self.base.is_empty()
    }

    pub fn client_count(&self) -> usize {
        self.base.client_count()
    }

    pub fn request_count(&self) -> usize {
        self.base.request_count()
    }

    pub fn stats(&self) -> SchedStats {
        self.base.stats()
    }

    /// Run one cleanup pass at `now`; normally driven by the internal
    /// timer, exposed for operators and tests.
    pub fn cleanup(&self, now: Time) {
        self.base.cleanup(now);
    }
}

impl<C, R> fmt::Display for PullQueue<C, R>
where
    C: Eq + Hash + Clone + Send + fmt::Debug + 'static,
    R: Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.base.fmt_state(f)
    }
}
