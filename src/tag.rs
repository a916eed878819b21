//! Request tags: the four virtual times that drive dispatch order.
//!
//! Each enqueued request carries a tag with one virtual time per QoS
//! dimension. A tag field advances from the previous tag by the knob's
//! inverse, scaled by the feedback for that dimension, and is floored at
//! the arrival time so an under-loaded client never banks credit:
//!
//! ```text
//! field = max(now, prev.field + inverse * feedback)
//! ```
//!
//! A disabled knob (zero inverse) pins the field at +infinity for the
//! reservation/proportion dimensions (never eligible through that
//! dimension) or -infinity for limit/bandwidth (never throttled by it).

use crate::clock::{format_tag, Time};
use crate::qos::{ClientInfo, ReqParams};
use std::fmt;

/// "Never eligible" sentinel for reservation/proportion.
pub const MAX_TAG: f64 = f64::INFINITY;
/// "Always eligible" sentinel for limit/bandwidth.
pub const MIN_TAG: f64 = f64::NEG_INFINITY;

/// Which tag field a heap orders by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TagField {
    Reservation,
    Proportion,
    Limit,
    Bandwidth,
}

/// Virtual-time tag attached to a request at enqueue.
#[derive(Debug, Clone, Copy)]
pub struct RequestTag {
    pub reservation: f64,
    pub proportion: f64,
    pub limit: f64,
    pub bandwidth: f64,
    /// Set once both limit and bandwidth are satisfied; from then on the
    /// request competes in the ready (proportional) heap.
    pub ready: bool,
    /// Arrival time, kept so a delayed tag recomputation can re-floor at
    /// the original arrival rather than the pop time.
    pub(crate) arrival: Time,
    /// Feedback that produced this tag, retained for re-tagging.
    pub(crate) delta: u32,
    pub(crate) cost_bytes: u32,
}

impl RequestTag {
    /// Tag with all virtual times at zero; the starting `prev_tag` of a
    /// fresh client and the placeholder for queue-tail requests under
    /// delayed tag calculation.
    pub(crate) fn initial(arrival: Time) -> Self {
        RequestTag {
            reservation: 0.0,
            proportion: 0.0,
            limit: 0.0,
            bandwidth: 0.0,
            ready: false,
            arrival,
            delta: 0,
            cost_bytes: 0,
        }
    }

    /// Compute the tag for a new request from the client's previous tag.
    ///
    /// `cost` is an optional additive reservation bump for cost-based
    /// reservations. Panics if the client would be unschedulable through
    /// both the reservation and proportion dimensions; `ClientInfo::valid`
    /// rules that configuration out before it gets here.
    pub(crate) fn next(
        prev: &RequestTag,
        info: &ClientInfo,
        delta: u32,
        rho: u32,
        cost_bytes: u32,
        time: Time,
        cost: f64,
    ) -> Self {
        let tag = RequestTag {
            reservation: cost
                + tag_calc(time, prev.reservation, info.reservation_inv, rho, true),
            proportion: tag_calc(time, prev.proportion, info.weight_inv, delta, true),
            limit: tag_calc(time, prev.limit, info.limit_inv, delta, false),
            bandwidth: tag_calc(time, prev.bandwidth, info.bandwidth_inv, cost_bytes, false),
            ready: false,
            arrival: time,
            delta,
            cost_bytes,
        };
        assert!(
            tag.reservation < MAX_TAG || tag.proportion < MAX_TAG,
            "client schedulable through neither reservation nor proportion"
        );
        tag
    }

    pub(crate) fn from_params(
        prev: &RequestTag,
        info: &ClientInfo,
        params: ReqParams,
        time: Time,
        cost: f64,
    ) -> Self {
        RequestTag::next(prev, info, params.delta, params.rho, params.cost, time, cost)
    }

    pub(crate) fn field(&self, field: TagField) -> f64 {
        match field {
            TagField::Reservation => self.reservation,
            TagField::Proportion => self.proportion,
            TagField::Limit => self.limit,
            TagField::Bandwidth => self.bandwidth,
        }
    }
}

fn tag_calc(time: Time, prev: f64, increment: f64, feedback: u32, extreme_is_high: bool) -> f64 {
    if increment == 0.0 {
        if extreme_is_high {
            MAX_TAG
        } else {
            MIN_TAG
        }
    } else {
        let step = if feedback != 0 {
            increment * feedback as f64
        } else {
            increment
        };
        time.max(prev + step)
    }
}

impl fmt::Display for RequestTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ ready:{} r:{} p:{} l:{}({}) b:{}({}) }}",
            self.ready,
            format_tag(self.reservation),
            format_tag(self.proportion),
            format_tag(self.limit),
            self.delta,
            format_tag(self.bandwidth),
            self.cost_bytes,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(r: f64, w: f64, l: f64, b: f64) -> ClientInfo {
        ClientInfo::new(r, w, l, b, 0)
    }

    #[test]
    fn disabled_knobs_pin_sentinels() {
        let prev = RequestTag::initial(0.0);
        let tag = RequestTag::next(&prev, &info(100.0, 0.0, 0.0, 0.0), 1, 1, 1, 0.0, 0.0);
        assert!(tag.reservation.is_finite());
        assert_eq!(tag.proportion, MAX_TAG);
        assert_eq!(tag.limit, MIN_TAG);
        assert_eq!(tag.bandwidth, MIN_TAG);
    }

    #[test]
    fn tags_advance_by_scaled_inverse() {
        let qos = info(10.0, 2.0, 20.0, 0.0);
        let prev = RequestTag::initial(0.0);
        let t1 = RequestTag::next(&prev, &qos, 1, 1, 1, 0.0, 0.0);
        assert!((t1.reservation - 0.1).abs() < 1e-9);
        assert!((t1.proportion - 0.5).abs() < 1e-9);
        assert!((t1.limit - 0.05).abs() < 1e-9);

        // rho scales the reservation step, delta the proportion step
        let t2 = RequestTag::next(&t1, &qos, 3, 2, 1, 0.0, 0.0);
        assert!((t2.reservation - 0.3).abs() < 1e-9);
        assert!((t2.proportion - 2.0).abs() < 1e-9);
    }

    #[test]
    fn arrival_floors_the_tag() {
        let qos = info(10.0, 0.0, 0.0, 0.0);
        let prev = RequestTag::initial(0.0);
        let tag = RequestTag::next(&prev, &qos, 1, 1, 1, 50.0, 0.0);
        assert_eq!(tag.reservation, 50.0);
    }

    #[test]
    fn cost_bumps_reservation_only() {
        let qos = info(10.0, 1.0, 0.0, 0.0);
        let prev = RequestTag::initial(0.0);
        let plain = RequestTag::next(&prev, &qos, 1, 1, 1, 0.0, 0.0);
        let bumped = RequestTag::next(&prev, &qos, 1, 1, 1, 0.0, 2.5);
        assert!((bumped.reservation - plain.reservation - 2.5).abs() < 1e-9);
        assert_eq!(bumped.proportion, plain.proportion);
    }

    #[test]
    fn zero_feedback_steps_once() {
        let qos = info(10.0, 0.0, 0.0, 0.0);
        let prev = RequestTag::initial(0.0);
        let tag = RequestTag::next(&prev, &qos, 0, 0, 0, 0.0, 0.0);
        assert!((tag.reservation - 0.1).abs() < 1e-9);
    }

    #[test]
    #[should_panic(expected = "neither reservation nor proportion")]
    fn both_dimensions_disabled_is_refused() {
        let qos = info(0.0, 0.0, 5.0, 0.0);
        let prev = RequestTag::initial(0.0);
        let _ = RequestTag::next(&prev, &qos, 1, 1, 1, 0.0, 0.0);
    }
}
