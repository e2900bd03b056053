//! Client tag throttling state on the GRV path.
//!
//! The rate keeper owns throttle policy; this module only mirrors the most
//! recent map it sent, hands matching entries back to clients, and counts
//! tag traffic so the rate keeper can attribute load.

use std::collections::HashMap;

use vellum_core::messages::{ClientTagThrottleLimits, ThrottledTagMap};
use vellum_core::types::{TransactionPriority, TransactionTag};

/// Tag traffic counter reported to the rate keeper with each rate request.
#[derive(Debug, Default)]
pub struct TransactionTagCounter {
    counts: HashMap<TransactionTag, u64>,
}

impl TransactionTagCounter {
    pub fn record(&mut self, tags: &[(TransactionTag, u64)]) {
        for (tag, count) in tags {
            *self.counts.entry(tag.clone()).or_default() += count;
        }
    }

    /// Hand the accumulated counts to a rate request and start over.
    pub fn take(&mut self) -> HashMap<TransactionTag, u64> {
        std::mem::take(&mut self.counts)
    }

    pub fn get(&self, tag: &str) -> u64 {
        self.counts.get(tag).copied().unwrap_or(0)
    }
}

/// Mirror of the rate keeper's throttle map.
///
/// Because the whole map is replaced on every rate reply, stale entries need
/// no background expiry; they are dropped lazily when touched.
#[derive(Debug, Default)]
pub struct TagThrottleState {
    throttles: ThrottledTagMap,
}

impl TagThrottleState {
    pub fn replace(&mut self, throttles: ThrottledTagMap) {
        self.throttles = throttles;
    }

    /// The unexpired, finite-rate throttle entries matching a request's tags
    /// at its priority. Unlimited entries mean "no longer throttled" and are
    /// withheld from the client.
    pub fn throttles_for(
        &mut self,
        priority: TransactionPriority,
        tags: &[(TransactionTag, u64)],
        now: f64,
    ) -> HashMap<TransactionTag, ClientTagThrottleLimits> {
        let mut out = HashMap::new();
        let Some(priority_throttles) = self.throttles.get_mut(&priority) else {
            return out;
        };
        for (tag, _) in tags {
            let Some(limits) = priority_throttles.get(tag) else {
                continue;
            };
            if limits.expiration > now {
                if limits.tps_rate.is_finite() {
                    out.insert(tag.clone(), *limits);
                }
            } else {
                priority_throttles.remove(tag);
            }
        }
        out
    }

    /// Tags the rate keeper is tracking, for detailed count reporting.
    pub fn tracked_tags(&self) -> Vec<TransactionTag> {
        self.throttles
            .values()
            .flat_map(|tags| tags.keys().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn throttle_map(
        priority: TransactionPriority,
        tag: &str,
        tps_rate: f64,
        expiration: f64,
    ) -> ThrottledTagMap {
        let mut by_tag = HashMap::new();
        by_tag.insert(tag.to_string(), ClientTagThrottleLimits { tps_rate, expiration });
        let mut map = HashMap::new();
        map.insert(priority, by_tag);
        map
    }

    #[test]
    fn matching_unexpired_entry_is_returned() {
        let mut state = TagThrottleState::default();
        state.replace(throttle_map(TransactionPriority::Default, "hot", 5.0, 100.0));
        let out = state.throttles_for(
            TransactionPriority::Default,
            &[("hot".to_string(), 1)],
            10.0,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out["hot"].tps_rate, 5.0);
    }

    #[test]
    fn expired_entry_is_dropped_from_the_map() {
        let mut state = TagThrottleState::default();
        state.replace(throttle_map(TransactionPriority::Default, "hot", 5.0, 1.0));
        let out = state.throttles_for(
            TransactionPriority::Default,
            &[("hot".to_string(), 1)],
            10.0,
        );
        assert!(out.is_empty());
        assert!(state.tracked_tags().is_empty());
    }

    #[test]
    fn unlimited_rate_is_withheld() {
        let mut state = TagThrottleState::default();
        state.replace(throttle_map(
            TransactionPriority::Default,
            "hot",
            f64::INFINITY,
            100.0,
        ));
        let out = state.throttles_for(
            TransactionPriority::Default,
            &[("hot".to_string(), 1)],
            10.0,
        );
        assert!(out.is_empty());
    }

    #[test]
    fn priorities_are_independent() {
        let mut state = TagThrottleState::default();
        state.replace(throttle_map(TransactionPriority::Batch, "hot", 5.0, 100.0));
        let out = state.throttles_for(
            TransactionPriority::Default,
            &[("hot".to_string(), 1)],
            10.0,
        );
        assert!(out.is_empty());
    }

    #[test]
    fn tag_counter_accumulates_and_drains() {
        let mut counter = TransactionTagCounter::default();
        counter.record(&[("a".to_string(), 2), ("b".to_string(), 1)]);
        counter.record(&[("a".to_string(), 3)]);
        assert_eq!(counter.get("a"), 5);
        let taken = counter.take();
        assert_eq!(taken["b"], 1);
        assert_eq!(counter.get("a"), 0);
    }
}
