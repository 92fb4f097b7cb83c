//! Price Cache
//!
//! Session-scoped store of the latest tick per instrument. Every consumer
//! reads from the same cache, so one upstream subscription serves any number
//! of readers.
//!
//! # Design
//!
//! - Records are stored behind `Arc` and replaced as a whole on upsert, so a
//!   reader never observes a half-written record.
//! - Each upsert is also published on a bounded broadcast channel. Slow
//!   receivers lag and skip updates; the writer is never blocked.
//! - Entries are never evicted. The cache lives as long as its session,
//!   across reconnects.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::domain::instrument::InstrumentKey;
use crate::domain::streaming::TickRecord;

/// Default capacity of the change feed.
pub const DEFAULT_UPDATE_CAPACITY: usize = 4096;

/// Change notification published on every upsert.
#[derive(Debug, Clone)]
pub struct TickUpdate {
    /// Instrument that changed.
    pub key: InstrumentKey,
    /// The record now stored for it.
    pub tick: Arc<TickRecord>,
}

/// Latest-tick store keyed by canonical instrument key.
pub struct PriceCache {
    entries: RwLock<HashMap<InstrumentKey, Arc<TickRecord>>>,
    updates_tx: broadcast::Sender<TickUpdate>,
}

impl std::fmt::Debug for PriceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriceCache")
            .field("len", &self.len())
            .field("receivers", &self.updates_tx.receiver_count())
            .finish()
    }
}

impl Default for PriceCache {
    fn default() -> Self {
        Self::new(DEFAULT_UPDATE_CAPACITY)
    }
}

impl PriceCache {
    /// Create an empty cache whose change feed buffers `capacity` updates.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (updates_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            entries: RwLock::new(HashMap::new()),
            updates_tx,
        }
    }

    /// Replace the record for `key` and publish the change.
    ///
    /// Returns the stored record.
    pub fn upsert(&self, key: InstrumentKey, tick: TickRecord) -> Arc<TickRecord> {
        let tick = Arc::new(tick);
        self.entries.write().insert(key.clone(), Arc::clone(&tick));

        // No receivers is not an error
        let _ = self.updates_tx.send(TickUpdate {
            key,
            tick: Arc::clone(&tick),
        });

        tick
    }

    /// Latest record for a raw key. The key is canonicalized first, so any
    /// casing finds the same entry. Blank keys return `None`.
    #[must_use]
    pub fn get(&self, raw_key: &str) -> Option<Arc<TickRecord>> {
        let key = InstrumentKey::new(raw_key).ok()?;
        self.get_key(&key)
    }

    /// Latest record for a canonical key.
    #[must_use]
    pub fn get_key(&self, key: &InstrumentKey) -> Option<Arc<TickRecord>> {
        self.entries.read().get(key).cloned()
    }

    /// Copy of every entry.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<InstrumentKey, Arc<TickRecord>> {
        self.entries.read().clone()
    }

    /// Number of cached instruments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether nothing has been cached yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Subscribe to the change feed.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TickUpdate> {
        self.updates_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn key(raw: &str) -> InstrumentKey {
        InstrumentKey::new(raw).unwrap()
    }

    #[test]
    fn upsert_replaces_wholesale() {
        let cache = PriceCache::default();
        let first = TickRecord {
            ltp: Some(Decimal::from(100)),
            oi: Some(Decimal::from(5000)),
            ..TickRecord::default()
        };
        cache.upsert(key("NIFTY"), first);
        cache.upsert(key("NIFTY"), TickRecord::with_ltp(Decimal::from(101)));

        let stored = cache.get("NIFTY").unwrap();
        assert_eq!(stored.ltp, Some(Decimal::from(101)));
        // Not merged with the previous record
        assert!(stored.oi.is_none());
    }

    #[test]
    fn upsert_leaves_other_keys_untouched() {
        let cache = PriceCache::default();
        cache.upsert(key("BANKNIFTY"), TickRecord::with_ltp(Decimal::from(48_000)));
        cache.upsert(key("NIFTY"), TickRecord::with_ltp(Decimal::from(100)));
        cache.upsert(key("NIFTY"), TickRecord::with_ltp(Decimal::from(101)));

        assert_eq!(
            cache.get("BANKNIFTY").unwrap().ltp,
            Some(Decimal::from(48_000))
        );
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn get_is_case_insensitive() {
        let cache = PriceCache::default();
        cache.upsert(key("nse_eq|reliance"), TickRecord::with_ltp(Decimal::ONE));

        assert!(cache.get("NSE_EQ|RELIANCE").is_some());
        assert!(cache.get(" nse_eq|Reliance ").is_some());
    }

    #[test]
    fn get_missing_or_blank_is_none() {
        let cache = PriceCache::default();
        assert!(cache.get("NIFTY").is_none());
        assert!(cache.get("").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn snapshot_is_detached() {
        let cache = PriceCache::default();
        cache.upsert(key("A"), TickRecord::with_ltp(Decimal::ONE));
        let snap = cache.snapshot();
        cache.upsert(key("B"), TickRecord::with_ltp(Decimal::TWO));

        assert_eq!(snap.len(), 1);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn upsert_publishes_change() {
        let cache = PriceCache::new(8);
        let mut rx = cache.subscribe();

        cache.upsert(key("NIFTY"), TickRecord::with_ltp(Decimal::from(100)));

        let update = rx.recv().await.unwrap();
        assert_eq!(update.key.as_str(), "NIFTY");
        assert_eq!(update.tick.ltp, Some(Decimal::from(100)));
    }

    #[tokio::test]
    async fn slow_receiver_lags_without_blocking_writer() {
        let cache = PriceCache::new(2);
        let mut rx = cache.subscribe();

        for i in 0..5 {
            cache.upsert(key("NIFTY"), TickRecord::with_ltp(Decimal::from(i)));
        }

        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        assert_eq!(cache.get("NIFTY").unwrap().ltp, Some(Decimal::from(4)));
    }
}
