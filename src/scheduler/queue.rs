//! Shared queue state and the dispatch algorithm.
//!
//! One record per client holds its FIFO of pending requests, its previous
//! tag, and its position in each tag heap. Dispatch walks the heaps in
//! constraint order:
//!
//! 1. Reservation: serve the lowest reservation tag that has come due.
//! 2. Ready promotion: every head request whose limit and bandwidth tags
//!    are both due is flagged ready, floated in the ready heap and sunk in
//!    the limit/bandwidth heaps.
//! 3. Proportion: serve the lowest proportion tag among ready heads.
//! 4. Optional limit break: when enabled and nothing else fires, serve the
//!    lowest proportion (or reservation) tag regardless of limits.
//! 5. Otherwise report the earliest future event, or that the queue is
//!    drained.
//!
//! All mutation happens under the single queue mutex; the heaps are
//! re-adjusted before the lock is released by every path that touches a
//! record.

use crate::clock::{self, min_not_zero, Time, TIME_MAX, TIME_ZERO};
use crate::config::{ConfigError, QueueConfig};
use crate::heap::{Arena, HeapItem, HeapKind, HeapPolicy, ReadyOption, TagHeap, HEAP_SLOTS, NO_POS};
use crate::qos::{ClientInfo, ReqParams};
use crate::tag::{RequestTag, TagField, MAX_TAG, MIN_TAG};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::AtomicBool;
use tracing::{debug, trace};

/// Which heap the next dispatch pops from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HeapId {
    Reservation,
    Ready,
}

/// Outcome of a selection pass.
pub(crate) enum NextReq {
    Returning { heap: HeapId, limit_break: bool },
    Future(Time),
    Empty,
}

/// Dispatch counters, one per phase plus the limit-break escape hatch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SchedStats {
    pub reservation_dispatches: u64,
    pub priority_dispatches: u64,
    pub limit_break_dispatches: u64,
}

/// A queued request together with the tag it was (or will be) ordered by.
pub(crate) struct ClientReq<R> {
    pub tag: RequestTag,
    pub request: R,
}

/// Per-client record: QoS parameters, pending FIFO, previous tag and the
/// bookkeeping the heaps and the cleanup pass need.
pub(crate) struct ClientRec<C, R> {
    pub client: C,
    pub info: ClientInfo,
    pub prev_tag: RequestTag,
    pub requests: VecDeque<ClientReq<R>>,
    /// One-shot proportion rebase applied when the client leaves idle.
    pub prop_delta: f64,
    pub idle: bool,
    pub last_tick: u64,
    /// Feedback seen at the most recent enqueue, used to re-tag the next
    /// head under delayed tag calculation.
    pub cur_delta: u32,
    pub cur_rho: u32,
    pub cur_cost: u32,
    heap_pos: [usize; HEAP_SLOTS],
}

fn assign_unpinned(lhs: &mut f64, rhs: f64) {
    if rhs != MAX_TAG && rhs != MIN_TAG {
        *lhs = rhs;
    }
}

impl<C, R> ClientRec<C, R> {
    fn new(client: C, info: ClientInfo, tick: u64) -> Self {
        ClientRec {
            client,
            info,
            prev_tag: RequestTag::initial(TIME_ZERO),
            requests: VecDeque::new(),
            prop_delta: 0.0,
            idle: true,
            last_tick: tick,
            cur_delta: 1,
            cur_rho: 1,
            cur_cost: 1,
            heap_pos: [NO_POS; HEAP_SLOTS],
        }
    }

    pub fn has_request(&self) -> bool {
        !self.requests.is_empty()
    }

    pub fn next_request(&self) -> Option<&ClientReq<R>> {
        self.requests.front()
    }

    pub fn request_count(&self) -> usize {
        self.requests.len()
    }

    /// Fold a freshly computed tag into `prev_tag`, skipping the ±infinity
    /// sentinels so disabled dimensions never pollute the virtual clocks.
    fn update_req_tag(&mut self, tag: &RequestTag, tick: u64) {
        assign_unpinned(&mut self.prev_tag.reservation, tag.reservation);
        assign_unpinned(&mut self.prev_tag.limit, tag.limit);
        assign_unpinned(&mut self.prev_tag.proportion, tag.proportion);
        assign_unpinned(&mut self.prev_tag.bandwidth, tag.bandwidth);
        self.last_tick = tick;
    }

    fn remove_by_req_filter(
        &mut self,
        filter: &mut dyn FnMut(&R) -> bool,
        accum: &mut dyn FnMut(R),
        backwards: bool,
    ) -> bool {
        let mut any = false;
        let drained: Vec<ClientReq<R>> = self.requests.drain(..).collect();
        if backwards {
            let mut kept = Vec::with_capacity(drained.len());
            for req in drained.into_iter().rev() {
                if filter(&req.request) {
                    any = true;
                    accum(req.request);
                } else {
                    kept.push(req);
                }
            }
            for req in kept.into_iter().rev() {
                self.requests.push_back(req);
            }
        } else {
            for req in drained {
                if filter(&req.request) {
                    any = true;
                    accum(req.request);
                } else {
                    self.requests.push_back(req);
                }
            }
        }
        any
    }
}

impl<C, R> HeapItem for ClientRec<C, R> {
    fn head_tag(&self) -> Option<&RequestTag> {
        self.requests.front().map(|req| &req.tag)
    }
    fn prop_delta(&self) -> f64 {
        self.prop_delta
    }
    fn heap_pos(&self, kind: HeapKind) -> usize {
        self.heap_pos[kind as usize]
    }
    fn set_heap_pos(&mut self, kind: HeapKind, pos: usize) {
        self.heap_pos[kind as usize] = pos;
    }
}

pub(crate) struct QueueState<C, R> {
    pub arena: Arena<ClientRec<C, R>>,
    pub client_map: HashMap<C, usize>,
    pub resv_heap: TagHeap,
    pub limit_heap: TagHeap,
    pub bandw_heap: TagHeap,
    pub ready_heap: TagHeap,
    pub prop_heap: Option<TagHeap>,
    /// Incremented on every enqueue; ages are measured in ticks.
    pub tick: u64,
    mark_points: VecDeque<(Time, u64)>,
    last_erase_point: u64,
    pub stats: SchedStats,
}

pub(crate) type ClientInfoFn<C> = Box<dyn Fn(&C) -> ClientInfo + Send + Sync>;

/// State shared by the pull and push drivers.
pub(crate) struct QueueBase<C, R> {
    pub config: QueueConfig,
    pub client_info_f: ClientInfoFn<C>,
    pub state: Mutex<QueueState<C, R>>,
    pub finishing: AtomicBool,
}

impl<C, R> QueueBase<C, R>
where
    C: Eq + Hash + Clone,
{
    pub fn new(config: QueueConfig, client_info_f: ClientInfoFn<C>) -> Result<Self, ConfigError> {
        config.validate()?;
        let branching = config.heap_branching as usize;
        let heap = |kind, field, ready, use_prop_delta| {
            TagHeap::new(
                kind,
                HeapPolicy {
                    field,
                    ready,
                    use_prop_delta,
                },
                branching,
            )
        };
        let prop_heap = config.use_prop_heap.then(|| {
            heap(
                HeapKind::Proportion,
                TagField::Proportion,
                ReadyOption::Ignore,
                true,
            )
        });
        Ok(QueueBase {
            state: Mutex::new(QueueState {
                arena: Arena::new(),
                client_map: HashMap::new(),
                resv_heap: heap(
                    HeapKind::Reservation,
                    TagField::Reservation,
                    ReadyOption::Ignore,
                    false,
                ),
                limit_heap: heap(HeapKind::Limit, TagField::Limit, ReadyOption::Lowers, false),
                bandw_heap: heap(
                    HeapKind::Bandwidth,
                    TagField::Bandwidth,
                    ReadyOption::Lowers,
                    false,
                ),
                ready_heap: heap(
                    HeapKind::Ready,
                    TagField::Proportion,
                    ReadyOption::Raises,
                    true,
                ),
                prop_heap,
                tick: 0,
                mark_points: VecDeque::new(),
                last_erase_point: 0,
                stats: SchedStats::default(),
            }),
            config,
            client_info_f,
            finishing: AtomicBool::new(false),
        })
    }

    fn adjust_all(&self, state: &mut QueueState<C, R>, key: usize) {
        state.resv_heap.adjust(&mut state.arena, key);
        state.limit_heap.adjust(&mut state.arena, key);
        state.bandw_heap.adjust(&mut state.arena, key);
        state.ready_heap.adjust(&mut state.arena, key);
        if let Some(prop_heap) = state.prop_heap.as_mut() {
            prop_heap.adjust(&mut state.arena, key);
        }
    }

    /// Queue mutex must be held (callers pass the locked state).
    pub fn do_add_request(
        &self,
        state: &mut QueueState<C, R>,
        request: R,
        client_id: &C,
        params: ReqParams,
        time: Time,
        cost: f64,
        info_override: Option<ClientInfo>,
    ) {
        state.tick += 1;
        let tick = state.tick;

        let key = match state.client_map.get(client_id).copied() {
            Some(key) => {
                if let Some(new_info) = info_override {
                    if new_info.valid() && !state.arena.get(key).info.unchanged(&new_info) {
                        self.apply_qos_update(state, key, new_info, time, tick);
                    }
                }
                key
            }
            None => {
                let info = match info_override {
                    Some(override_info) if override_info.valid() => override_info,
                    _ => (self.client_info_f)(client_id),
                };
                let key = state
                    .arena
                    .insert(ClientRec::new(client_id.clone(), info, tick));
                state.client_map.insert(client_id.clone(), key);
                state.resv_heap.push(&mut state.arena, key);
                state.limit_heap.push(&mut state.arena, key);
                state.bandw_heap.push(&mut state.arena, key);
                state.ready_heap.push(&mut state.arena, key);
                if let Some(prop_heap) = state.prop_heap.as_mut() {
                    prop_heap.push(&mut state.arena, key);
                }
                key
            }
        };

        if state.arena.get(key).idle {
            self.rebase_idle_client(state, key, time);
        }

        let rec = state.arena.get_mut(key);
        if self.config.delay_tag_calc && rec.has_request() {
            // Tail request: the real tag is computed when it reaches the
            // head, from the feedback current at that point.
            rec.requests.push_back(ClientReq {
                tag: RequestTag::initial(time),
                request,
            });
        } else {
            let tag = RequestTag::from_params(&rec.prev_tag, &rec.info, params, time, cost);
            rec.update_req_tag(&tag, tick);
            rec.requests.push_back(ClientReq { tag, request });
        }
        rec.cur_delta = params.delta;
        rec.cur_rho = params.rho;
        rec.cur_cost = params.cost;

        self.adjust_all(state, key);
    }

    /// Replace a client's QoS parameters and re-tag everything it has
    /// queued with a neutral `(1,1,1)` feedback triple, so no dimension
    /// starves while the knobs change underneath the queue.
    fn apply_qos_update(
        &self,
        state: &mut QueueState<C, R>,
        key: usize,
        new_info: ClientInfo,
        time: Time,
        tick: u64,
    ) {
        let rec = state.arena.get_mut(key);
        debug!(
            version = new_info.version,
            queued = rec.requests.len(),
            "qos update, re-tagging queued requests"
        );
        rec.info = new_info;
        rec.prev_tag = RequestTag::initial(time);
        rec.last_tick = tick;
        for i in 0..rec.requests.len() {
            let tag = RequestTag::next(&rec.prev_tag, &rec.info, 1, 1, 1, time, 0.0);
            rec.requests[i].tag = tag;
            rec.update_req_tag(&tag, tick);
        }
    }

    /// An idle client's proportion clock has drifted behind real time;
    /// rebase it onto the lowest proportion among the active clients so it
    /// neither leaps ahead of them nor waits out its own stale tag.
    fn rebase_idle_client(&self, state: &mut QueueState<C, R>, key: usize, time: Time) {
        let mut lowest = f64::MAX;
        for (_, other) in state.arena.iter() {
            // the re-activating client is still flagged idle here, so the
            // scan never sees itself
            if other.idle {
                continue;
            }
            let p = match other.next_request() {
                Some(req) => req.tag.proportion + other.prop_delta,
                None => other.prev_tag.proportion + other.prop_delta,
            };
            if p < lowest {
                lowest = p;
            }
        }

        let rec = state.arena.get_mut(key);
        // guard against an all-infinity population
        if lowest < f64::MAX / 3.0 {
            rec.prop_delta = lowest - time;
            trace!(prop_delta = rec.prop_delta, "idle client rebased");
        }
        rec.idle = false;
    }

    /// Selection pass; may flip `ready` flags and reshuffle heaps.
    /// Queue mutex must be held.
    pub fn do_next_request(&self, state: &mut QueueState<C, R>, now: Time) -> NextReq {
        // an empty reservation heap means no clients at all
        if state.resv_heap.is_empty() {
            return NextReq::Empty;
        }

        // reservation phase
        if let Some(top) = state.resv_heap.top() {
            if let Some(req) = state.arena.get(top).next_request() {
                if req.tag.reservation <= now {
                    return NextReq::Returning {
                        heap: HeapId::Reservation,
                        limit_break: false,
                    };
                }
            }
        }

        // promote everything whose limit and bandwidth tags have both come
        // due, walking from whichever heap surfaces it first
        loop {
            let Some(top) = state.limit_heap.top() else {
                break;
            };
            if !self.try_mark_ready(state, top, now) {
                break;
            }
        }
        loop {
            let Some(top) = state.bandw_heap.top() else {
                break;
            };
            if !self.try_mark_ready(state, top, now) {
                break;
            }
        }

        // proportional phase
        if let Some(top) = state.ready_heap.top() {
            if let Some(req) = state.arena.get(top).next_request() {
                if req.tag.ready && req.tag.proportion < MAX_TAG {
                    return NextReq::Returning {
                        heap: HeapId::Ready,
                        limit_break: false,
                    };
                }
            }
        }

        // nothing within constraints; optionally break the limit
        if self.config.allow_limit_break {
            if let Some(top) = state.ready_heap.top() {
                if let Some(req) = state.arena.get(top).next_request() {
                    if req.tag.proportion < MAX_TAG {
                        return NextReq::Returning {
                            heap: HeapId::Ready,
                            limit_break: true,
                        };
                    }
                }
            }
            if let Some(top) = state.resv_heap.top() {
                if let Some(req) = state.arena.get(top).next_request() {
                    if req.tag.reservation < MAX_TAG {
                        return NextReq::Returning {
                            heap: HeapId::Reservation,
                            limit_break: true,
                        };
                    }
                }
            }
        }

        self.next_event(state)
    }

    fn try_mark_ready(&self, state: &mut QueueState<C, R>, key: usize, now: Time) -> bool {
        let rec = state.arena.get_mut(key);
        let promote = match rec.requests.front_mut() {
            Some(req)
                if !req.tag.ready && req.tag.limit <= now && req.tag.bandwidth <= now =>
            {
                req.tag.ready = true;
                true
            }
            _ => false,
        };
        if promote {
            state.ready_heap.promote(&mut state.arena, key);
            state.limit_heap.demote(&mut state.arena, key);
            state.bandw_heap.demote(&mut state.arena, key);
        }
        promote
    }

    /// Read-only variant of the selection pass, used by the diagnostic
    /// dump; never flips `ready` flags.
    pub fn peek_next_request(&self, state: &QueueState<C, R>, now: Time) -> NextReq {
        if state.resv_heap.is_empty() {
            return NextReq::Empty;
        }
        if let Some(top) = state.resv_heap.top() {
            if let Some(req) = state.arena.get(top).next_request() {
                if req.tag.reservation <= now {
                    return NextReq::Returning {
                        heap: HeapId::Reservation,
                        limit_break: false,
                    };
                }
            }
        }
        if let Some(top) = state.ready_heap.top() {
            if let Some(req) = state.arena.get(top).next_request() {
                if req.tag.ready && req.tag.proportion < MAX_TAG {
                    return NextReq::Returning {
                        heap: HeapId::Ready,
                        limit_break: false,
                    };
                }
            }
        }
        if self.config.allow_limit_break {
            if let Some(top) = state.ready_heap.top() {
                if let Some(req) = state.arena.get(top).next_request() {
                    if req.tag.proportion < MAX_TAG {
                        return NextReq::Returning {
                            heap: HeapId::Ready,
                            limit_break: true,
                        };
                    }
                }
            }
            if let Some(top) = state.resv_heap.top() {
                if let Some(req) = state.arena.get(top).next_request() {
                    if req.tag.reservation < MAX_TAG {
                        return NextReq::Returning {
                            heap: HeapId::Reservation,
                            limit_break: true,
                        };
                    }
                }
            }
        }
        self.next_event(state)
    }

    /// Earliest time at which a selection pass could return a request:
    /// the reservation head, or the point where both the limit and the
    /// bandwidth tags of a throttled head have come due.
    fn next_event(&self, state: &QueueState<C, R>) -> NextReq {
        let mut next_call = TIME_MAX;
        if let Some(top) = state.resv_heap.top() {
            if let Some(req) = state.arena.get(top).next_request() {
                next_call = min_not_zero(next_call, req.tag.reservation);
            }
        }
        let mut maybe_limit = TIME_ZERO;
        if let Some(top) = state.limit_heap.top() {
            if let Some(req) = state.arena.get(top).next_request() {
                debug_assert!(!req.tag.ready || req.tag.proportion == MAX_TAG);
                maybe_limit = req.tag.limit;
            }
        }
        let mut maybe_bandw = TIME_ZERO;
        if let Some(top) = state.bandw_heap.top() {
            if let Some(req) = state.arena.get(top).next_request() {
                debug_assert!(!req.tag.ready || req.tag.proportion == MAX_TAG);
                maybe_bandw = req.tag.bandwidth;
            }
        }
        next_call = min_not_zero(next_call, maybe_limit.max(maybe_bandw));
        if next_call < TIME_MAX {
            NextReq::Future(next_call)
        } else {
            NextReq::Empty
        }
    }

    /// Pop the head request of the record at the top of `heap`. Under
    /// delayed tag calculation the new head is re-tagged from the popped
    /// tag, the stored feedback and its original arrival time.
    /// Queue mutex must be held; the top must have a request.
    pub fn pop_request(&self, state: &mut QueueState<C, R>, heap: HeapId) -> (C, R) {
        let top = match heap {
            HeapId::Reservation => state.resv_heap.top(),
            HeapId::Ready => state.ready_heap.top(),
        }
        .expect("selection returned from an empty heap");

        let tick = state.tick;
        let rec = state.arena.get_mut(top);
        let popped = rec.requests.pop_front().expect("heap top had no request");
        let client = rec.client.clone();

        if self.config.delay_tag_calc {
            if let Some(next) = rec.requests.front_mut() {
                let arrival = next.tag.arrival;
                let tag = RequestTag::next(
                    &popped.tag,
                    &rec.info,
                    rec.cur_delta,
                    rec.cur_rho,
                    rec.cur_cost,
                    arrival,
                    0.0,
                );
                next.tag = tag;
                rec.update_req_tag(&tag, tick);
            }
        }

        state.resv_heap.demote(&mut state.arena, top);
        state.limit_heap.adjust(&mut state.arena, top);
        state.bandw_heap.adjust(&mut state.arena, top);
        if let Some(prop_heap) = state.prop_heap.as_mut() {
            prop_heap.demote(&mut state.arena, top);
        }
        state.ready_heap.demote(&mut state.arena, top);

        (client, popped.request)
    }

    /// After a weight-funded dispatch, hand the reservation credit back:
    /// the served request must not also consume the client's reservation.
    /// Queue mutex must be held.
    pub fn reduce_reservation_tags(&self, state: &mut QueueState<C, R>, client_id: &C) {
        let key = *state
            .client_map
            .get(client_id)
            .expect("client erased while its request was being dispatched");
        let rec = state.arena.get_mut(key);
        let inv = rec.info.reservation_inv;
        for req in rec.requests.iter_mut() {
            req.tag.reservation -= inv;
            if self.config.delay_tag_calc {
                // later tags are placeholders; the head recompute applies
                // the reduction transitively through prev_tag
                break;
            }
        }
        rec.prev_tag.reservation -= inv;
        state.resv_heap.promote(&mut state.arena, key);
    }

    /// One cleanup pass: record a mark point, advance the idle and erase
    /// points past marks old enough, then sweep the client map. At most
    /// `erase_max` records are erased per pass; an unfinished sweep
    /// resumes at the next one. Clients with queued requests are never
    /// erased.
    pub fn do_clean(&self, state: &mut QueueState<C, R>, now: Time) {
        state.mark_points.push_back((now, state.tick));

        let erase_age = self.config.erase_age.as_secs_f64();
        let idle_age = self.config.idle_age.as_secs_f64();

        let mut erase_point = state.last_erase_point;
        while let Some(&(mark_time, mark_tick)) = state.mark_points.front() {
            if mark_time <= now - erase_age {
                state.last_erase_point = mark_tick;
                erase_point = mark_tick;
                state.mark_points.pop_front();
            } else {
                break;
            }
        }

        let mut idle_point = 0;
        for &(mark_time, mark_tick) in &state.mark_points {
            if mark_time <= now - idle_age {
                idle_point = mark_tick;
            } else {
                break;
            }
        }

        if erase_point == 0 && idle_point == 0 {
            return;
        }

        let mut erased = 0;
        for key in state.arena.keys() {
            let rec = state.arena.get(key);
            if erase_point > 0
                && erased < self.config.erase_max
                && rec.last_tick <= erase_point
                && !rec.has_request()
            {
                let client = rec.client.clone();
                debug!(last_tick = rec.last_tick, "erasing dormant client");
                state.resv_heap.remove(&mut state.arena, key);
                state.limit_heap.remove(&mut state.arena, key);
                state.bandw_heap.remove(&mut state.arena, key);
                state.ready_heap.remove(&mut state.arena, key);
                if let Some(prop_heap) = state.prop_heap.as_mut() {
                    prop_heap.remove(&mut state.arena, key);
                }
                state.client_map.remove(&client);
                state.arena.remove(key);
                erased += 1;
            } else if idle_point > 0 && rec.last_tick <= idle_point {
                state.arena.get_mut(key).idle = true;
            }
        }
        if erased < self.config.erase_max {
            // sweep finished, nothing left to resume
            state.last_erase_point = 0;
        }
    }

    /// Drain every pending request of one client into `accum`.
    /// Queue mutex must be held.
    pub fn do_remove_by_client(
        &self,
        state: &mut QueueState<C, R>,
        client: &C,
        reverse: bool,
        accum: &mut dyn FnMut(R),
    ) {
        let Some(&key) = state.client_map.get(client) else {
            return;
        };
        let rec = state.arena.get_mut(key);
        let drained: Vec<ClientReq<R>> = rec.requests.drain(..).collect();
        if reverse {
            for req in drained.into_iter().rev() {
                accum(req.request);
            }
        } else {
            for req in drained {
                accum(req.request);
            }
        }
        self.adjust_all(state, key);
    }

    /// Move every request matching `filter` out of the queue, across all
    /// clients. O(total requests). Queue mutex must be held.
    pub fn do_remove_by_req_filter(
        &self,
        state: &mut QueueState<C, R>,
        filter: &mut dyn FnMut(&R) -> bool,
        accum: &mut dyn FnMut(R),
        backwards: bool,
    ) -> bool {
        let mut any_removed = false;
        for key in state.arena.keys() {
            let modified = state
                .arena
                .get_mut(key)
                .remove_by_req_filter(filter, accum, backwards);
            if modified {
                self.adjust_all(state, key);
                any_removed = true;
            }
        }
        any_removed
    }

    // introspection, each taking the lock briefly

    pub fn is_empty(&self) -> bool {
        let state = self.state.lock();
        match state.resv_heap.top() {
            None => true,
            Some(top) => !state.arena.get(top).has_request(),
        }
    }

    pub fn client_count(&self) -> usize {
        self.state.lock().arena.len()
    }

    pub fn request_count(&self) -> usize {
        let state = self.state.lock();
        state
            .arena
            .iter()
            .map(|(_, rec)| rec.request_count())
            .sum()
    }

    pub fn stats(&self) -> SchedStats {
        self.state.lock().stats
    }

    pub fn cleanup(&self, now: Time) {
        let mut state = self.state.lock();
        self.do_clean(&mut state, now);
    }
}

impl<C, R> QueueBase<C, R>
where
    C: Eq + Hash + Clone + fmt::Debug,
{
    /// Operator-facing dump: per-client state, heap tops and the next-event
    /// projection. Read-only.
    pub fn fmt_state(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        let now = clock::now();
        writeln!(
            f,
            "queue {{ tick:{} clients:{} stats:{:?} }}",
            state.tick, state.arena.len(), state.stats
        )?;
        match self.peek_next_request(&state, now) {
            NextReq::Returning { heap, .. } => writeln!(f, "  next: dispatchable via {heap:?}")?,
            NextReq::Future(when) => writeln!(f, "  next: due in {:.6}s", when - now)?,
            NextReq::Empty => writeln!(f, "  next: queue drained")?,
        }
        for (_, rec) in state.arena.iter() {
            write!(
                f,
                "  client {:?} {} {} queued:{}",
                rec.client,
                rec.info,
                if rec.idle { "idle" } else { "active" },
                rec.request_count(),
            )?;
            match rec.next_request() {
                Some(req) => writeln!(f, " head:{}", req.tag)?,
                None => writeln!(f, " head:none")?,
            }
        }
        let top_client = |heap: &TagHeap| {
            heap.top()
                .map(|key| format!("{:?}", state.arena.get(key).client))
                .unwrap_or_else(|| "-".to_string())
        };
        write!(
            f,
            "  tops {{ resv:{} limit:{} bandw:{} ready:{}",
            top_client(&state.resv_heap),
            top_client(&state.limit_heap),
            top_client(&state.bandw_heap),
            top_client(&state.ready_heap),
        )?;
        if let Some(prop_heap) = state.prop_heap.as_ref() {
            write!(f, " prop:{}", top_client(prop_heap))?;
        }
        writeln!(f, " }}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(config: QueueConfig) -> QueueBase<u32, u64> {
        QueueBase::new(
            config,
            Box::new(|_| ClientInfo::new(0.0, 1.0, 0.0, 0.0, 0)),
        )
        .expect("valid config")
    }

    fn enqueue(queue: &QueueBase<u32, u64>, client: u32, request: u64, time: Time) {
        let mut state = queue.state.lock();
        queue.do_add_request(
            &mut state,
            request,
            &client,
            ReqParams::new(1, 1, 1),
            time,
            0.0,
            None,
        );
    }

    #[test]
    fn first_enqueue_creates_the_record() {
        let queue = base(QueueConfig::default());
        enqueue(&queue, 7, 0, 0.0);
        assert_eq!(queue.client_count(), 1);
        assert_eq!(queue.request_count(), 1);
        assert!(!queue.is_empty());
        let state = queue.state.lock();
        let key = state.client_map[&7];
        let rec = state.arena.get(key);
        assert!(!rec.idle);
        assert_eq!(rec.last_tick, 1);
    }

    #[test]
    fn empty_heap_reports_empty() {
        let queue = base(QueueConfig::default());
        let mut state = queue.state.lock();
        assert!(matches!(
            queue.do_next_request(&mut state, 0.0),
            NextReq::Empty
        ));
    }

    #[test]
    fn drained_client_keeps_queue_empty() {
        let queue = base(QueueConfig::default());
        enqueue(&queue, 1, 0, 0.0);
        {
            let mut state = queue.state.lock();
            let next = queue.do_next_request(&mut state, 10.0);
            assert!(matches!(next, NextReq::Returning { .. }));
            let (client, request) = queue.pop_request(&mut state, HeapId::Ready);
            assert_eq!(client, 1);
            assert_eq!(request, 0);
        }
        assert!(queue.is_empty());
        assert_eq!(queue.client_count(), 1);
        let mut state = queue.state.lock();
        assert!(matches!(
            queue.do_next_request(&mut state, 20.0),
            NextReq::Empty
        ));
    }

    #[test]
    fn qos_update_re_tags_queued_requests() {
        let queue = base(QueueConfig::default());
        for i in 0..4 {
            enqueue(&queue, 1, i, 0.0);
        }
        let new_info = ClientInfo::new(0.0, 10.0, 0.0, 0.0, 1);
        {
            let mut state = queue.state.lock();
            queue.do_add_request(
                &mut state,
                4,
                &1,
                ReqParams::new(1, 1, 1),
                1.0,
                0.0,
                Some(new_info),
            );
            let key = state.client_map[&1];
            let rec = state.arena.get(key);
            assert_eq!(rec.info.version, 1);
            assert_eq!(rec.requests.len(), 5);
            // re-tagged chain floors at t=1, then advances in 1/weight steps
            let p0 = rec.requests[0].tag.proportion;
            let p1 = rec.requests[1].tag.proportion;
            assert!((p0 - 1.0).abs() < 1e-9);
            assert!((p1 - 1.1).abs() < 1e-9);
        }
        assert_eq!(queue.request_count(), 5);
    }

    #[test]
    fn invalid_override_is_ignored_for_existing_client() {
        let queue = base(QueueConfig::default());
        enqueue(&queue, 1, 0, 0.0);
        let bogus = ClientInfo::new(10.0, 1.0, 5.0, 0.0, 9);
        let mut state = queue.state.lock();
        queue.do_add_request(
            &mut state,
            1,
            &1,
            ReqParams::new(1, 1, 1),
            0.5,
            0.0,
            Some(bogus),
        );
        let key = state.client_map[&1];
        assert_eq!(state.arena.get(key).info.version, 0);
    }

    #[test]
    fn cleanup_spares_clients_with_queued_requests() {
        let config = QueueConfig {
            idle_age: std::time::Duration::from_secs(10),
            erase_age: std::time::Duration::from_secs(20),
            check_time: std::time::Duration::from_secs(1),
            ..QueueConfig::default()
        };
        let queue = base(config);
        enqueue(&queue, 1, 0, 0.0);
        queue.cleanup(1.0);
        queue.cleanup(12.0);
        {
            let state = queue.state.lock();
            let key = state.client_map[&1];
            assert!(state.arena.get(key).idle);
        }
        queue.cleanup(100.0);
        // last_tick (1) is at or before the erase point, but a request is
        // still queued
        assert_eq!(queue.client_count(), 1);

        // drain it, then age it out
        {
            let mut state = queue.state.lock();
            queue.do_next_request(&mut state, 100.0);
            queue.pop_request(&mut state, HeapId::Ready);
        }
        queue.cleanup(101.0);
        queue.cleanup(200.0);
        assert_eq!(queue.client_count(), 0);
    }

    #[test]
    fn erase_max_bounds_each_pass_and_resumes() {
        let config = QueueConfig {
            idle_age: std::time::Duration::from_secs(10),
            erase_age: std::time::Duration::from_secs(20),
            check_time: std::time::Duration::from_secs(1),
            erase_max: 2,
            ..QueueConfig::default()
        };
        let queue = base(config);
        for client in 0..5 {
            enqueue(&queue, client, 0, 0.0);
            let mut state = queue.state.lock();
            queue.do_next_request(&mut state, 1.0);
            queue.pop_request(&mut state, HeapId::Ready);
        }
        queue.cleanup(2.0);
        queue.cleanup(100.0);
        assert_eq!(queue.client_count(), 3);
        queue.cleanup(101.0);
        assert_eq!(queue.client_count(), 1);
        queue.cleanup(102.0);
        assert_eq!(queue.client_count(), 0);
    }

    #[test]
    fn remove_by_client_drains_in_order() {
        let queue = base(QueueConfig::default());
        for i in 0..3 {
            enqueue(&queue, 1, i, 0.0);
        }
        let mut fw = Vec::new();
        {
            let mut state = queue.state.lock();
            queue.do_remove_by_client(&mut state, &1, false, &mut |r| fw.push(r));
        }
        assert_eq!(fw, vec![0, 1, 2]);
        assert!(queue.is_empty());

        for i in 0..3 {
            enqueue(&queue, 1, i, 0.0);
        }
        let mut bw = Vec::new();
        {
            let mut state = queue.state.lock();
            queue.do_remove_by_client(&mut state, &1, true, &mut |r| bw.push(r));
        }
        assert_eq!(bw, vec![2, 1, 0]);
    }

    #[test]
    fn prop_heap_variant_follows_every_mutation() {
        let config = QueueConfig {
            use_prop_heap: true,
            ..QueueConfig::default()
        };
        let queue = base(config);
        for client in 0..3 {
            enqueue(&queue, client, 0, 0.0);
        }
        let mut state = queue.state.lock();
        assert_eq!(state.prop_heap.as_ref().unwrap().len(), 3);
        assert!(matches!(
            queue.do_next_request(&mut state, 1.0),
            NextReq::Returning { .. }
        ));
        queue.pop_request(&mut state, HeapId::Ready);
        // records stay in the fifth heap after a pop
        assert_eq!(state.prop_heap.as_ref().unwrap().len(), 3);
    }

    #[test]
    fn eager_tag_calc_tags_every_request_at_enqueue() {
        let config = QueueConfig {
            delay_tag_calc: false,
            ..QueueConfig::default()
        };
        let queue = base(config);
        for i in 0..3 {
            enqueue(&queue, 1, i, 0.0);
        }
        let state = queue.state.lock();
        let key = state.client_map[&1];
        let rec = state.arena.get(key);
        // with eager calculation the whole chain is visible up front
        let props: Vec<f64> = rec.requests.iter().map(|r| r.tag.proportion).collect();
        assert!((props[0] - 1.0).abs() < 1e-9);
        assert!((props[1] - 2.0).abs() < 1e-9);
        assert!((props[2] - 3.0).abs() < 1e-9);
    }

    #[test]
    fn remove_by_filter_spans_clients() {
        let queue = base(QueueConfig::default());
        for client in 0..2 {
            for i in 0..4u64 {
                enqueue(&queue, client, i, 0.0);
            }
        }
        let mut odd = Vec::new();
        let removed = {
            let mut state = queue.state.lock();
            queue.do_remove_by_req_filter(
                &mut state,
                &mut |r| r % 2 == 1,
                &mut |r| odd.push(r),
                false,
            )
        };
        assert!(removed);
        assert_eq!(odd.len(), 4);
        assert_eq!(queue.request_count(), 4);
    }
}
