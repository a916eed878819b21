//! Per-client QoS parameters and the distributed feedback types.
//!
//! A client is described by four knobs: a reservation (minimum request
//! rate), a weight (proportional share of surplus), a limit (maximum
//! request rate) and a bandwidth ceiling (maximum byte rate). A knob set to
//! zero is disabled. The multiplicative inverses are precomputed because
//! every tag calculation needs them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Dispatch class attributed to a request when it leaves the queue.
///
/// Callers echo this back in responses so the client-side tracker can tell
/// reservation-funded completions apart from weight-funded ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PhaseType {
    Reservation,
    Priority,
}

/// Feedback triple carried with each outbound request.
///
/// `delta` counts completions from any server since the last request to
/// this one, `rho` counts reservation-phase completions, and `cost` the
/// bytes served. Produced by [`ServiceTracker`](crate::ServiceTracker),
/// consumed by the server-side tag calculation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReqParams {
    pub delta: u32,
    pub rho: u32,
    pub cost: u32,
}

impl ReqParams {
    pub fn new(delta: u32, rho: u32, cost: u32) -> Self {
        ReqParams { delta, rho, cost }
    }
}

/// Serialized shape of [`ClientInfo`]: just the knobs, inverses recomputed
/// on the way back in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct QosKnobs {
    reservation: f64,
    weight: f64,
    limit: f64,
    bandwidth: f64,
    version: u32,
}

impl From<QosKnobs> for ClientInfo {
    fn from(k: QosKnobs) -> Self {
        ClientInfo::new(k.reservation, k.weight, k.limit, k.bandwidth, k.version)
    }
}

impl From<ClientInfo> for QosKnobs {
    fn from(info: ClientInfo) -> Self {
        QosKnobs {
            reservation: info.reservation,
            weight: info.weight,
            limit: info.limit,
            bandwidth: info.bandwidth,
            version: info.version,
        }
    }
}

/// QoS record for one client.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "QosKnobs", into = "QosKnobs")]
pub struct ClientInfo {
    /// Minimum guaranteed request rate (requests/sec); 0 disables.
    pub reservation: f64,
    /// Proportional share of surplus capacity; 0 disables.
    pub weight: f64,
    /// Maximum request rate (requests/sec); 0 disables.
    pub limit: f64,
    /// Maximum byte rate (bytes/sec); 0 disables.
    pub bandwidth: f64,
    /// Bumped whenever any knob changes, so the queue can detect a
    /// hot-update on enqueue.
    pub version: u32,

    pub(crate) reservation_inv: f64,
    pub(crate) weight_inv: f64,
    pub(crate) limit_inv: f64,
    pub(crate) bandwidth_inv: f64,
}

fn inverse(v: f64) -> f64 {
    if v == 0.0 {
        0.0
    } else {
        1.0 / v
    }
}

impl ClientInfo {
    pub fn new(reservation: f64, weight: f64, limit: f64, bandwidth: f64, version: u32) -> Self {
        ClientInfo {
            reservation,
            weight,
            limit,
            bandwidth,
            version,
            reservation_inv: inverse(reservation),
            weight_inv: inverse(weight),
            limit_inv: inverse(limit),
            bandwidth_inv: inverse(bandwidth),
        }
    }

    /// The validity invariant: non-negative knobs, limit (when enabled) at
    /// least the reservation, and at least one of reservation/weight
    /// enabled so the client is schedulable through some dimension.
    pub fn valid(&self) -> bool {
        let invalid = (self.reservation < 0.0
            || self.weight < 0.0
            || self.limit < 0.0
            || self.bandwidth < 0.0)
            || (self.limit > 0.0 && self.limit < self.reservation)
            || (self.reservation == 0.0 && self.weight == 0.0);
        !invalid
    }

    /// True when the knobs and version both match; a `false` result on
    /// enqueue triggers the hot-update re-tag path.
    pub fn unchanged(&self, other: &ClientInfo) -> bool {
        self.reservation == other.reservation
            && self.weight == other.weight
            && self.limit == other.limit
            && self.bandwidth == other.bandwidth
            && self.version == other.version
    }
}

impl fmt::Display for ClientInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ v:{} r:{:.2} w:{:.2} l:{:.2} b:{:.2} }}",
            self.version, self.reservation, self.weight, self.limit, self.bandwidth
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inverses_follow_knobs() {
        let info = ClientInfo::new(100.0, 2.0, 0.0, 4096.0, 1);
        assert_eq!(info.reservation_inv, 0.01);
        assert_eq!(info.weight_inv, 0.5);
        assert_eq!(info.limit_inv, 0.0);
        assert_eq!(info.bandwidth_inv, 1.0 / 4096.0);
    }

    #[test]
    fn validity_rules() {
        assert!(ClientInfo::new(1.0, 1.0, 2.0, 0.0, 0).valid());
        assert!(ClientInfo::new(0.0, 1.0, 0.0, 0.0, 0).valid());
        // limit below reservation
        assert!(!ClientInfo::new(10.0, 1.0, 5.0, 0.0, 0).valid());
        // neither reservation nor weight
        assert!(!ClientInfo::new(0.0, 0.0, 5.0, 0.0, 0).valid());
        // negative knob
        assert!(!ClientInfo::new(-1.0, 1.0, 0.0, 0.0, 0).valid());
    }

    #[test]
    fn unchanged_tracks_version() {
        let a = ClientInfo::new(1.0, 1.0, 0.0, 0.0, 1);
        let same = ClientInfo::new(1.0, 1.0, 0.0, 0.0, 1);
        let bumped = ClientInfo::new(1.0, 1.0, 0.0, 0.0, 2);
        assert!(a.unchanged(&same));
        assert!(!a.unchanged(&bumped));
    }

    #[test]
    fn serde_roundtrip_recomputes_inverses() {
        let info = ClientInfo::new(50.0, 3.0, 100.0, 0.0, 7);
        let json = serde_json_roundtrip(&info);
        assert_eq!(json.reservation_inv, info.reservation_inv);
        assert_eq!(json.weight_inv, info.weight_inv);
        assert_eq!(json.version, 7);
    }

    fn serde_json_roundtrip(info: &ClientInfo) -> ClientInfo {
        // serde_json is not a dependency; go through the intermediate type
        // directly, which is what serde does for us.
        ClientInfo::from(QosKnobs::from(*info))
    }
}
