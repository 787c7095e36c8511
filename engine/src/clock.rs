//! Hybrid logical clock for causal ordering of local events.
//!
//! An [`Hlc`] orders events that have no server version yet. It combines a
//! wall-clock timestamp with a counter and the node id, which gives a total
//! order without trusting clocks to be synchronized.

use crate::{error::Result, DeviceId, Error, Timestamp};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A single hybrid logical clock reading.
///
/// Ordering rules:
/// 1. Higher timestamp wins
/// 2. If timestamps are equal, higher counter wins
/// 3. If both are equal, lexicographically higher node_id wins
///
/// Serialized as `timestamp-counter-nodeId` with zero-padded numeric parts so
/// that string order matches causal order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Hlc {
    /// Milliseconds since the epoch
    pub timestamp: Timestamp,
    /// Tie breaker for events within the same millisecond
    pub counter: u32,
    /// Node that produced the reading
    pub node_id: DeviceId,
}

impl Hlc {
    /// Create a reading from its parts.
    pub fn new(timestamp: Timestamp, counter: u32, node_id: impl Into<DeviceId>) -> Self {
        Self {
            timestamp,
            counter,
            node_id: node_id.into(),
        }
    }

    /// The zero reading for a node.
    pub fn zero(node_id: impl Into<DeviceId>) -> Self {
        Self::new(0, 0, node_id)
    }

    /// Parse the `timestamp-counter-nodeId` form.
    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, '-');
        let (Some(ts), Some(counter), Some(node)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::InvalidHlc(s.to_string()));
        };
        if node.is_empty() {
            return Err(Error::InvalidHlc(s.to_string()));
        }
        let timestamp = ts.parse().map_err(|_| Error::InvalidHlc(s.to_string()))?;
        let counter = counter
            .parse()
            .map_err(|_| Error::InvalidHlc(s.to_string()))?;
        Ok(Self::new(timestamp, counter, node))
    }
}

impl fmt::Display for Hlc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:015}-{:05}-{}", self.timestamp, self.counter, self.node_id)
    }
}

impl FromStr for Hlc {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Hlc::parse(s)
    }
}

impl Ord for Hlc {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then(self.counter.cmp(&other.counter))
            .then_with(|| self.node_id.cmp(&other.node_id))
    }
}

impl PartialOrd for Hlc {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Serialize for Hlc {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Hlc {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Hlc::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// The per-device clock that issues [`Hlc`] readings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HybridClock {
    /// Last reading handed out or observed
    last: Hlc,
}

impl HybridClock {
    /// Create a new clock for a node.
    pub fn new(node_id: impl Into<DeviceId>) -> Self {
        Self {
            last: Hlc::zero(node_id),
        }
    }

    /// The node this clock belongs to.
    pub fn node_id(&self) -> &DeviceId {
        &self.last.node_id
    }

    /// The most recent reading.
    pub fn last(&self) -> &Hlc {
        &self.last
    }

    /// Issue a reading for a local event at wall time `now`.
    ///
    /// Readings are strictly increasing even if the wall clock goes backwards.
    pub fn tick(&mut self, now: Timestamp) -> Hlc {
        if now > self.last.timestamp {
            self.last.timestamp = now;
            self.last.counter = 0;
        } else {
            self.last.counter = self.last.counter.saturating_add(1);
        }
        self.last.clone()
    }

    /// Fold in a reading received from another node.
    ///
    /// Used when remote changes are applied, so later local events sort after
    /// everything already seen.
    pub fn observe(&mut self, remote: &Hlc, now: Timestamp) {
        let max_ts = now.max(self.last.timestamp).max(remote.timestamp);
        let counter = if max_ts == self.last.timestamp && max_ts == remote.timestamp {
            self.last.counter.max(remote.counter)
        } else if max_ts == self.last.timestamp {
            self.last.counter
        } else if max_ts == remote.timestamp {
            remote.counter
        } else {
            0
        };
        self.last.timestamp = max_ts;
        self.last.counter = counter;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn new_clock_starts_at_zero() {
        let clock = HybridClock::new("device-1");
        assert_eq!(clock.last().timestamp, 0);
        assert_eq!(clock.node_id(), "device-1");
    }

    #[test]
    fn tick_uses_wall_clock_when_it_advances() {
        let mut clock = HybridClock::new("device-1");
        let a = clock.tick(1_000);
        let b = clock.tick(2_000);
        assert_eq!(a.timestamp, 1_000);
        assert_eq!(b.timestamp, 2_000);
        assert_eq!(b.counter, 0);
        assert!(a < b);
    }

    #[test]
    fn tick_is_monotonic_when_wall_clock_stalls_or_regresses() {
        let mut clock = HybridClock::new("device-1");
        let a = clock.tick(5_000);
        let b = clock.tick(5_000);
        let c = clock.tick(4_000);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(c.timestamp, 5_000);
        assert_eq!(c.counter, 2);
    }

    #[test]
    fn observe_moves_past_remote_reading() {
        let mut clock = HybridClock::new("device-1");
        clock.tick(1_000);
        clock.observe(&Hlc::new(9_000, 3, "device-2"), 2_000);
        let next = clock.tick(2_000);
        assert!(next > Hlc::new(9_000, 3, "device-2"));
        assert_eq!(next.node_id, "device-1");
    }

    #[test]
    fn ordering_by_node_id_when_time_equal() {
        let a = Hlc::new(5, 1, "node-a");
        let b = Hlc::new(5, 1, "node-b");
        assert!(a < b);
    }

    #[test]
    fn string_form() {
        let hlc = Hlc::new(1_706_745_600_000, 7, "device-x-1");
        let s = hlc.to_string();
        assert_eq!(s, "001706745600000-00007-device-x-1");
        assert_eq!(Hlc::parse(&s).unwrap(), hlc);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Hlc::parse("nope").is_err());
        assert!(Hlc::parse("1-2-").is_err());
        assert!(Hlc::parse("x-2-node").is_err());
    }

    #[test]
    fn serializes_as_string() {
        let hlc = Hlc::new(10, 1, "n");
        let json = serde_json::to_string(&hlc).unwrap();
        assert_eq!(json, "\"000000000000010-00001-n\"");
        let back: Hlc = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hlc);
    }

    proptest! {
        #[test]
        fn prop_string_order_matches_causal_order(
            t1 in 0u64..1_000_000_000_000,
            t2 in 0u64..1_000_000_000_000,
            c1 in 0u32..99_999,
            c2 in 0u32..99_999,
        ) {
            let a = Hlc::new(t1, c1, "node");
            let b = Hlc::new(t2, c2, "node");
            prop_assert_eq!(a.cmp(&b), a.to_string().cmp(&b.to_string()));
        }

        #[test]
        fn prop_ticks_strictly_increase(times in proptest::collection::vec(0u64..10_000, 1..50)) {
            let mut clock = HybridClock::new("device");
            let mut prev = clock.last().clone();
            for now in times {
                let next = clock.tick(now);
                prop_assert!(next > prev);
                prev = next;
            }
        }
    }
}
