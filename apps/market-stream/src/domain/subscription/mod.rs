//! Subscription Management Types
//!
//! Tracks which instruments each in-process consumer is interested in and
//! reduces that interest to the single upstream watch set.
//!
//! # Design
//!
//! The watch registry tracks:
//! - Which instrument keys each consumer has declared interest in
//! - Reference counts per key, so the watch set is the union of all consumers
//!
//! Many consumers can watch the same instrument while the gateway only ever
//! sees one subscription for it. [`diff`] computes the delta between two
//! watch sets so callers can tell whether anything needs to go upstream.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::domain::instrument::InstrumentKey;

// =============================================================================
// Types
// =============================================================================

/// Unique identifier for an in-process consumer.
pub type ConsumerId = u64;

/// Sorted, de-duplicated set of canonical instrument keys.
pub type WatchSet = BTreeSet<InstrumentKey>;

// =============================================================================
// Subscription Delta
// =============================================================================

/// Difference between two watch sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionDelta {
    /// Keys present now but not before.
    pub added: WatchSet,
    /// Keys present before but not now.
    pub removed: WatchSet,
}

impl SubscriptionDelta {
    /// Check if there are any changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Minimal add/remove delta between `previous` and `current`.
///
/// Order and duplicates in either input are irrelevant.
///
/// ```rust
/// use market_stream::domain::instrument::parse_keys;
/// use market_stream::domain::subscription::diff;
///
/// let previous = parse_keys(["A", "B", "C"]).unwrap();
/// let current = parse_keys(["b", "C", "D"]).unwrap();
/// let delta = diff(&previous, &current);
///
/// assert_eq!(delta.added, parse_keys(["D"]).unwrap());
/// assert_eq!(delta.removed, parse_keys(["A"]).unwrap());
/// ```
pub fn diff<'a, P, C>(previous: P, current: C) -> SubscriptionDelta
where
    P: IntoIterator<Item = &'a InstrumentKey>,
    C: IntoIterator<Item = &'a InstrumentKey>,
{
    let previous: BTreeSet<&InstrumentKey> = previous.into_iter().collect();
    let current: BTreeSet<&InstrumentKey> = current.into_iter().collect();

    SubscriptionDelta {
        added: current.difference(&previous).map(|k| (*k).clone()).collect(),
        removed: previous.difference(&current).map(|k| (*k).clone()).collect(),
    }
}

// =============================================================================
// Registry State
// =============================================================================

#[derive(Debug, Default)]
struct RegistryState {
    /// Map from consumer ID to its watched keys.
    consumer_keys: HashMap<ConsumerId, HashSet<InstrumentKey>>,
    /// Map from key to the number of consumers watching it.
    key_refcount: HashMap<InstrumentKey, usize>,
}

impl RegistryState {
    /// Returns keys whose refcount went 0→1.
    fn add(&mut self, consumer: ConsumerId, keys: &WatchSet) -> WatchSet {
        let consumer_set = self.consumer_keys.entry(consumer).or_default();
        let mut added = WatchSet::new();

        for key in keys {
            if !consumer_set.insert(key.clone()) {
                continue;
            }

            let refcount = self.key_refcount.entry(key.clone()).or_insert(0);
            *refcount += 1;

            if *refcount == 1 {
                added.insert(key.clone());
            }
        }

        if consumer_set.is_empty() {
            self.consumer_keys.remove(&consumer);
        }

        added
    }

    /// Returns keys whose refcount went 1→0.
    fn remove(&mut self, consumer: ConsumerId, keys: &WatchSet) -> WatchSet {
        let Some(consumer_set) = self.consumer_keys.get_mut(&consumer) else {
            return WatchSet::new();
        };

        let mut removed = WatchSet::new();
        for key in keys {
            if consumer_set.remove(key) && Self::release_refcount(&mut self.key_refcount, key) {
                removed.insert(key.clone());
            }
        }

        if consumer_set.is_empty() {
            self.consumer_keys.remove(&consumer);
        }

        removed
    }

    fn remove_consumer(&mut self, consumer: ConsumerId) -> WatchSet {
        let Some(consumer_set) = self.consumer_keys.remove(&consumer) else {
            return WatchSet::new();
        };

        consumer_set
            .into_iter()
            .filter(|key| self.release_key(key))
            .collect()
    }

    /// Decrement a refcount. Returns true when the key is no longer watched.
    fn release_key(&mut self, key: &InstrumentKey) -> bool {
        Self::release_refcount(&mut self.key_refcount, key)
    }

    fn release_refcount(
        key_refcount: &mut HashMap<InstrumentKey, usize>,
        key: &InstrumentKey,
    ) -> bool {
        let Some(refcount) = key_refcount.get_mut(key) else {
            return false;
        };
        *refcount = refcount.saturating_sub(1);
        if *refcount == 0 {
            key_refcount.remove(key);
            return true;
        }
        false
    }

    fn watch_set(&self) -> WatchSet {
        self.key_refcount.keys().cloned().collect()
    }
}

// =============================================================================
// Watch Registry
// =============================================================================

/// Thread-safe registry of consumer interest.
///
/// Every mutating call returns the upstream [`SubscriptionDelta`] it caused;
/// an empty delta means the watch set did not change.
///
/// # Example
///
/// ```rust
/// use market_stream::domain::instrument::parse_keys;
/// use market_stream::domain::subscription::WatchRegistry;
///
/// let registry = WatchRegistry::new();
/// let chart = registry.register();
/// let ticker = registry.register();
///
/// // First watcher of RELIANCE changes the watch set
/// let delta = registry.add(chart, &parse_keys(["RELIANCE"]).unwrap());
/// assert_eq!(delta.added.len(), 1);
///
/// // Second watcher of the same key does not
/// let delta = registry.add(ticker, &parse_keys(["reliance"]).unwrap());
/// assert!(delta.is_empty());
///
/// // Still watched by the ticker
/// assert!(registry.release(chart).is_empty());
/// assert_eq!(registry.release(ticker).removed.len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct WatchRegistry {
    state: RwLock<RegistryState>,
    next_consumer: AtomicU64,
}

impl WatchRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a new consumer ID.
    pub fn register(&self) -> ConsumerId {
        self.next_consumer.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Add keys to a consumer's interest.
    pub fn add(&self, consumer: ConsumerId, keys: &WatchSet) -> SubscriptionDelta {
        SubscriptionDelta {
            added: self.state.write().add(consumer, keys),
            removed: WatchSet::new(),
        }
    }

    /// Remove keys from a consumer's interest.
    pub fn remove(&self, consumer: ConsumerId, keys: &WatchSet) -> SubscriptionDelta {
        SubscriptionDelta {
            added: WatchSet::new(),
            removed: self.state.write().remove(consumer, keys),
        }
    }

    /// Replace a consumer's interest with exactly `keys`.
    pub fn replace(&self, consumer: ConsumerId, keys: &WatchSet) -> SubscriptionDelta {
        let mut state = self.state.write();
        let previous = state.watch_set();

        let current: WatchSet = state
            .consumer_keys
            .get(&consumer)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        let stale: WatchSet = current.difference(keys).cloned().collect();

        state.remove(consumer, &stale);
        state.add(consumer, keys);

        diff(&previous, &state.watch_set())
    }

    /// Drop everything a consumer watches.
    pub fn release(&self, consumer: ConsumerId) -> SubscriptionDelta {
        SubscriptionDelta {
            added: WatchSet::new(),
            removed: self.state.write().remove_consumer(consumer),
        }
    }

    /// Union of all consumers' interest.
    #[must_use]
    pub fn watch_set(&self) -> WatchSet {
        self.state.read().watch_set()
    }

    /// Keys watched by one consumer.
    #[must_use]
    pub fn consumer_keys(&self, consumer: ConsumerId) -> WatchSet {
        self.state
            .read()
            .consumer_keys
            .get(&consumer)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Registry statistics.
    #[must_use]
    pub fn stats(&self) -> WatchStats {
        let state = self.state.read();
        WatchStats {
            instrument_count: state.key_refcount.len(),
            consumer_count: state.consumer_keys.len(),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Watch registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchStats {
    /// Number of distinct watched instruments.
    pub instrument_count: usize,
    /// Number of consumers watching at least one instrument.
    pub consumer_count: usize,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::instrument::parse_keys;
    use proptest::prelude::*;

    fn keys(raw: &[&str]) -> WatchSet {
        parse_keys(raw).unwrap()
    }

    #[test]
    fn diff_minimal_delta() {
        let delta = diff(&keys(&["A", "B", "C"]), &keys(&["B", "C", "D"]));

        assert_eq!(delta.added, keys(&["D"]));
        assert_eq!(delta.removed, keys(&["A"]));
    }

    #[test]
    fn diff_equal_sets_is_empty() {
        let a = [
            InstrumentKey::new("A").unwrap(),
            InstrumentKey::new("B").unwrap(),
        ];
        let b = [
            InstrumentKey::new("b").unwrap(),
            InstrumentKey::new("a").unwrap(),
            InstrumentKey::new("A").unwrap(),
        ];

        assert!(diff(&a, &b).is_empty());
    }

    #[test]
    fn add_new_key_changes_watch_set() {
        let registry = WatchRegistry::new();

        let delta = registry.add(1, &keys(&["NIFTY"]));

        assert_eq!(delta.added, keys(&["NIFTY"]));
        assert!(delta.removed.is_empty());
    }

    #[test]
    fn add_existing_key_from_other_consumer() {
        let registry = WatchRegistry::new();

        registry.add(1, &keys(&["NIFTY"]));
        let delta = registry.add(2, &keys(&["NIFTY"]));

        assert!(delta.is_empty());
    }

    #[test]
    fn add_duplicate_for_same_consumer() {
        let registry = WatchRegistry::new();

        registry.add(1, &keys(&["NIFTY"]));
        let delta = registry.add(1, &keys(&["nifty"]));

        assert!(delta.is_empty());
        assert_eq!(registry.stats().instrument_count, 1);
    }

    #[test]
    fn add_partially_existing_keys() {
        let registry = WatchRegistry::new();

        registry.add(1, &keys(&["NIFTY"]));
        let delta = registry.add(2, &keys(&["NIFTY", "BANKNIFTY"]));

        assert_eq!(delta.added, keys(&["BANKNIFTY"]));
    }

    #[test]
    fn remove_with_remaining_consumers() {
        let registry = WatchRegistry::new();

        registry.add(1, &keys(&["NIFTY"]));
        registry.add(2, &keys(&["NIFTY"]));

        let delta = registry.remove(1, &keys(&["NIFTY"]));

        assert!(delta.is_empty());
        assert_eq!(registry.watch_set(), keys(&["NIFTY"]));
    }

    #[test]
    fn remove_last_consumer() {
        let registry = WatchRegistry::new();

        registry.add(1, &keys(&["NIFTY"]));
        let delta = registry.remove(1, &keys(&["NIFTY"]));

        assert_eq!(delta.removed, keys(&["NIFTY"]));
        assert!(registry.watch_set().is_empty());
    }

    #[test]
    fn remove_from_unknown_consumer_no_changes() {
        let registry = WatchRegistry::new();

        registry.add(1, &keys(&["NIFTY"]));
        let delta = registry.remove(2, &keys(&["NIFTY"]));

        assert!(delta.is_empty());
        assert_eq!(registry.watch_set().len(), 1);
    }

    #[test]
    fn replace_swaps_consumer_interest() {
        let registry = WatchRegistry::new();

        registry.add(1, &keys(&["A", "B", "C"]));
        registry.add(2, &keys(&["C"]));

        let delta = registry.replace(1, &keys(&["B", "C", "D"]));

        assert_eq!(delta.added, keys(&["D"]));
        assert_eq!(delta.removed, keys(&["A"]));
        assert_eq!(registry.consumer_keys(1), keys(&["B", "C", "D"]));
    }

    #[test]
    fn replace_with_empty_releases() {
        let registry = WatchRegistry::new();

        registry.add(1, &keys(&["A"]));
        let delta = registry.replace(1, &WatchSet::new());

        assert_eq!(delta.removed, keys(&["A"]));
        assert_eq!(registry.stats(), WatchStats::default());
    }

    #[test]
    fn release_preserves_other_consumers() {
        let registry = WatchRegistry::new();

        registry.add(1, &keys(&["NIFTY", "SENSEX"]));
        registry.add(2, &keys(&["NIFTY"]));

        let delta = registry.release(1);

        assert_eq!(delta.removed, keys(&["SENSEX"]));
        assert_eq!(registry.watch_set(), keys(&["NIFTY"]));
    }

    #[test]
    fn release_unknown_consumer_no_changes() {
        let registry = WatchRegistry::new();
        registry.add(1, &keys(&["NIFTY"]));

        assert!(registry.release(99).is_empty());
    }

    #[test]
    fn register_allocates_distinct_ids() {
        let registry = WatchRegistry::new();
        let a = registry.register();
        let b = registry.register();

        assert_ne!(a, b);
    }

    #[test]
    fn stats_are_accurate() {
        let registry = WatchRegistry::new();

        registry.add(1, &keys(&["NIFTY", "BANKNIFTY"]));
        registry.add(2, &keys(&["NIFTY"]));

        let stats = registry.stats();

        assert_eq!(stats.instrument_count, 2);
        assert_eq!(stats.consumer_count, 2);
    }

    #[test]
    fn thread_safety_concurrent_watches() {
        use std::sync::Arc;
        use std::thread;

        let registry = Arc::new(WatchRegistry::new());
        let mut handles = vec![];

        for i in 0..10u64 {
            let r = Arc::clone(&registry);
            handles.push(thread::spawn(move || {
                let own = format!("SYM{i}");
                r.add(i, &parse_keys([own.as_str(), "SHARED"]).unwrap());
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        let stats = registry.stats();
        assert_eq!(stats.consumer_count, 10);
        // SYM0-SYM9 plus SHARED
        assert_eq!(stats.instrument_count, 11);
    }

    #[test]
    fn thread_safety_concurrent_releases() {
        use std::sync::Arc;
        use std::thread;

        let registry = Arc::new(WatchRegistry::new());
        for i in 0..10u64 {
            registry.add(i, &keys(&["SHARED"]));
        }

        let handles: Vec<_> = (0..10u64)
            .map(|i| {
                let r = Arc::clone(&registry);
                thread::spawn(move || r.release(i))
            })
            .collect();

        let removed: usize = handles
            .into_iter()
            .map(|h| h.join().unwrap().removed.len())
            .sum();

        // Exactly one release observes SHARED leaving the watch set
        assert_eq!(removed, 1);
        assert_eq!(registry.stats(), WatchStats::default());
    }

    fn key_sets() -> impl Strategy<Value = WatchSet> {
        prop::collection::btree_set("[A-E]", 0..5)
            .prop_map(|raw| raw.into_iter().map(|k| InstrumentKey::new(k).unwrap()).collect())
    }

    proptest! {
        #[test]
        fn diff_applied_to_previous_yields_current(prev in key_sets(), curr in key_sets()) {
            let delta = diff(&prev, &curr);

            let mut rebuilt: WatchSet = prev.difference(&delta.removed).cloned().collect();
            rebuilt.extend(delta.added.iter().cloned());

            prop_assert_eq!(rebuilt, curr);
        }

        #[test]
        fn diff_is_disjoint_and_minimal(prev in key_sets(), curr in key_sets()) {
            let delta = diff(&prev, &curr);

            prop_assert!(delta.added.is_disjoint(&delta.removed));
            prop_assert!(delta.added.iter().all(|k| !prev.contains(k)));
            prop_assert!(delta.removed.iter().all(|k| !curr.contains(k)));
            prop_assert_eq!(delta.is_empty(), prev == curr);
        }
    }
}
