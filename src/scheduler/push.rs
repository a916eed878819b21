//! Push driver: the queue feeds a server through callbacks.
//!
//! After every enqueue and every `request_completed`, the queue re-runs
//! selection: a dispatchable request is submitted through `handle`
//! immediately (under the queue lock); a future event arms the
//! scheduling-ahead thread, which sleeps on a deadline condvar and re-runs
//! selection when the deadline passes. Teardown raises `finishing`, wakes
//! the thread once and joins it.

use crate::clock::{self, Time, TIME_ZERO};
use crate::config::{ConfigError, QueueConfig};
use crate::qos::{ClientInfo, PhaseType, ReqParams};
use crate::scheduler::queue::{HeapId, NextReq, QueueBase, QueueState, SchedStats};
use crate::timer::PeriodicTask;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Reports whether the server can absorb another request right now.
pub type CanHandleFn = Box<dyn Fn() -> bool + Send + Sync>;
/// Accepts a dispatched request and the phase that funded it.
pub type HandleFn<C, R> = Box<dyn Fn(&C, R, PhaseType) + Send + Sync>;

struct SchedAhead {
    when: Mutex<Time>,
    cv: Condvar,
}

struct PushInner<C, R> {
    base: QueueBase<C, R>,
    can_handle_f: CanHandleFn,
    handle_f: HandleFn<C, R>,
    sched: SchedAhead,
}

/// dmClock priority queue, push flavor.
pub struct PushQueue<C, R>
where
    C: Eq + Hash + Clone + Send + 'static,
    R: Send + 'static,
{
    inner: Arc<PushInner<C, R>>,
    ahead_thread: Option<JoinHandle<()>>,
    _cleaner: PeriodicTask,
}

impl<C, R> PushQueue<C, R>
where
    C: Eq + Hash + Clone + Send + 'static,
    R: Send + 'static,
{
    pub fn new<F>(
        config: QueueConfig,
        client_info_f: F,
        can_handle_f: CanHandleFn,
        handle_f: HandleFn<C, R>,
    ) -> Result<Self, ConfigError>
    where
        F: Fn(&C) -> ClientInfo + Send + Sync + 'static,
    {
        let base = QueueBase::new(config, Box::new(client_info_f))?;
        let inner = Arc::new(PushInner {
            base,
            can_handle_f,
            handle_f,
            sched: SchedAhead {
                when: Mutex::new(TIME_ZERO),
                cv: Condvar::new(),
            },
        });

        let ahead_inner = Arc::clone(&inner);
        let ahead_thread = thread::Builder::new()
            .name("dmclock-sched-ahead".to_string())
            .spawn(move || ahead_inner.run_sched_ahead())
            .expect("failed to spawn scheduling-ahead thread");

        let cleaner_inner = Arc::clone(&inner);
        let cleaner = PeriodicTask::spawn(
            "dmclock-cleanup",
            inner.base.config.check_time,
            move || cleaner_inner.base.cleanup(clock::now()),
        );

        Ok(PushQueue {
            inner,
            ahead_thread: Some(ahead_thread),
            _cleaner: cleaner,
        })
    }

    pub fn add_request(&self, request: R, client_id: C, params: ReqParams) {
        self.add_request_at(request, client_id, params, clock::now(), 0.0);
    }

    pub fn add_request_at(
        &self,
        request: R,
        client_id: C,
        params: ReqParams,
        time: Time,
        cost: f64,
    ) {
        let mut state = self.inner.base.state.lock();
        self.inner
            .base
            .do_add_request(&mut state, request, &client_id, params, time, cost, None);
        self.inner.schedule_request(&mut state);
    }

    pub fn add_request_with_info(
        &self,
        request: R,
        client_id: C,
        info: ClientInfo,
        params: ReqParams,
        time: Time,
        cost: f64,
    ) {
        let mut state = self.inner.base.state.lock();
        self.inner.base.do_add_request(
            &mut state,
            request,
            &client_id,
            params,
            time,
            cost,
            Some(info),
        );
        self.inner.schedule_request(&mut state);
    }

    /// The server finished a request; see whether another one can go.
    pub fn request_completed(&self) {
        let mut state = self.inner.base.state.lock();
        self.inner.schedule_request(&mut state);
    }

    pub fn remove_by_client<F>(&self, client: &C, reverse: bool, mut accum: F)
    where
        F: FnMut(R),
    {
        let mut state = self.inner.base.state.lock();
        self.inner
            .base
            .do_remove_by_client(&mut state, client, reverse, &mut accum);
    }

    pub fn remove_by_req_filter<F, A>(&self, mut filter: F, mut accum: A, backwards: bool) -> bool
    where
        F: FnMut(&R) -> bool,
        A: FnMut(R),
    {
        let mut state = self.inner.base.state.lock();
        self.inner
            .base
            .do_remove_by_req_filter(&mut state, &mut filter, &mut accum, backwards)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.base.is_empty()
    }

    pub fn client_count(&self) -> usize {
        self.inner.base.client_count()
    }

    pub fn request_count(&self) -> usize {
        self.inner.base.request_count()
    }

    pub fn stats(&self) -> SchedStats {
        self.inner.base.stats()
    }

    pub fn cleanup(&self, now: Time) {
        self.inner.base.cleanup(now);
    }
}

impl<C, R> PushInner<C, R>
where
    C: Eq + Hash + Clone,
{
    /// Queue mutex must be held. Submits at most one request; the next
    /// enqueue, completion or deadline re-runs selection.
    fn schedule_request(&self, state: &mut QueueState<C, R>) {
        if !(self.can_handle_f)() {
            return;
        }
        match self.base.do_next_request(state, clock::now()) {
            NextReq::Empty => {}
            NextReq::Future(when) => self.sched_at(when),
            NextReq::Returning { heap, limit_break } => {
                let (client, request) = self.base.pop_request(state, heap);
                let phase = match heap {
                    HeapId::Reservation => {
                        state.stats.reservation_dispatches += 1;
                        PhaseType::Reservation
                    }
                    HeapId::Ready => {
                        state.stats.priority_dispatches += 1;
                        PhaseType::Priority
                    }
                };
                if limit_break {
                    state.stats.limit_break_dispatches += 1;
                }
                (self.handle_f)(&client, request, phase);
                if phase == PhaseType::Priority {
                    self.base.reduce_reservation_tags(state, &client);
                }
            }
        }
    }

    /// Arm (or tighten) the scheduling-ahead deadline.
    fn sched_at(&self, when: Time) {
        let mut armed = self.sched.when.lock();
        if self.base.finishing.load(Ordering::Acquire) {
            return;
        }
        if *armed == TIME_ZERO || when < *armed {
            *armed = when;
            self.sched.cv.notify_one();
        }
    }

    fn run_sched_ahead(&self) {
        loop {
            {
                let mut armed = self.sched.when.lock();
                loop {
                    if self.base.finishing.load(Ordering::Acquire) {
                        return;
                    }
                    if *armed == TIME_ZERO {
                        self.sched.cv.wait(&mut armed);
                        continue;
                    }
                    let now = clock::now();
                    if now >= *armed {
                        break;
                    }
                    let remaining = Duration::from_secs_f64(*armed - now + 1e-6);
                    let _ = self.sched.cv.wait_for(&mut armed, remaining);
                }
                *armed = TIME_ZERO;
            }
            if self.base.finishing.load(Ordering::Acquire) {
                return;
            }
            let mut state = self.base.state.lock();
            self.schedule_request(&mut state);
        }
    }
}

impl<C, R> Drop for PushQueue<C, R>
where
    C: Eq + Hash + Clone + Send + 'static,
    R: Send + 'static,
{
    fn drop(&mut self) {
        self.inner.base.finishing.store(true, Ordering::Release);
        {
            let _armed = self.inner.sched.when.lock();
            self.inner.sched.cv.notify_all();
        }
        if let Some(handle) = self.ahead_thread.take() {
            let _ = handle.join();
        }
    }
}

impl<C, R> fmt::Display for PushQueue<C, R>
where
    C: Eq + Hash + Clone + Send + fmt::Debug + 'static,
    R: Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.base.fmt_state(f)
    }
}
