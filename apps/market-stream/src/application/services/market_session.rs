//! Market Session
//!
//! Composition root for one gateway session: the watch registry, the price
//! cache and the connection manager task. All consumer-facing operations go
//! through [`MarketSession`]; it is constructed explicitly and shared by
//! reference or `Arc`, never through a global.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::application::ports::{Connector, TokenSource, TokenSourceError};
use crate::domain::instrument::{InstrumentKey, KeyError, parse_keys};
use crate::domain::price_cache::{DEFAULT_UPDATE_CAPACITY, PriceCache, TickUpdate};
use crate::domain::session::{AccessToken, SessionError, SessionSnapshot};
use crate::domain::streaming::TickRecord;
use crate::domain::subscription::{
    ConsumerId, SubscriptionDelta, WatchRegistry, WatchSet, WatchStats,
};
use crate::infrastructure::gateway::{
    ConnectionHandle, ConnectionManager, ConnectionSettings, MessageDispatcher,
};
use crate::infrastructure::metrics;

/// Capacity of the session error channel.
const ERROR_CHANNEL_CAPACITY: usize = 64;

/// Settings for a [`MarketSession`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Keep-alive and reconnect timing.
    pub connection: ConnectionSettings,
    /// Capacity of the tick update channel.
    pub tick_channel_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionSettings::default(),
            tick_channel_capacity: DEFAULT_UPDATE_CAPACITY,
        }
    }
}

/// One streaming session against the market data gateway.
///
/// Dropping the session cancels its connection task; prefer
/// [`shutdown`](Self::shutdown) to wait for the transport to close.
pub struct MarketSession {
    id: Uuid,
    cache: Arc<PriceCache>,
    registry: WatchRegistry,
    connection: ConnectionHandle,
    errors_tx: broadcast::Sender<SessionError>,
    /// Serializes registry changes with the watch sets sent to the manager.
    publish: Mutex<()>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MarketSession {
    /// Create a session and spawn its connection task.
    ///
    /// Must be called from within a Tokio runtime. No transport is opened
    /// until [`connect`](Self::connect) is called with a token and at least
    /// one instrument is watched.
    #[must_use]
    pub fn new(config: SessionConfig, connector: Arc<dyn Connector>) -> Self {
        let id = Uuid::new_v4();
        let cache = Arc::new(PriceCache::new(config.tick_channel_capacity));
        let (errors_tx, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let (manager, connection) = ConnectionManager::new(
            config.connection,
            connector,
            MessageDispatcher::new(Arc::clone(&cache)),
            errors_tx.clone(),
            cancel.clone(),
        );
        let task = tokio::spawn(manager.run());

        tracing::info!(session_id = %id, "Market session created");

        Self {
            id,
            cache,
            registry: WatchRegistry::new(),
            connection,
            errors_tx,
            publish: Mutex::new(()),
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    /// Session identifier, used in logs.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    // =========================================================================
    // Interest
    // =========================================================================

    /// Allocate a consumer id for `watch`/`unwatch`/`release`.
    #[must_use]
    pub fn register_consumer(&self) -> ConsumerId {
        self.registry.register()
    }

    /// Add `keys` to the consumer's interest.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError`] if any key is blank; nothing is changed then.
    pub fn watch<I, S>(&self, consumer: ConsumerId, keys: I) -> Result<SubscriptionDelta, KeyError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keys = parse_keys(keys)?;
        Ok(self.change(|registry| registry.add(consumer, &keys)))
    }

    /// Remove `keys` from the consumer's interest.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError`] if any key is blank; nothing is changed then.
    pub fn unwatch<I, S>(
        &self,
        consumer: ConsumerId,
        keys: I,
    ) -> Result<SubscriptionDelta, KeyError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keys = parse_keys(keys)?;
        Ok(self.change(|registry| registry.remove(consumer, &keys)))
    }

    /// Replace the consumer's interest with exactly `keys`.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError`] if any key is blank; nothing is changed then.
    pub fn update_watch<I, S>(
        &self,
        consumer: ConsumerId,
        keys: I,
    ) -> Result<SubscriptionDelta, KeyError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keys = parse_keys(keys)?;
        Ok(self.change(|registry| registry.replace(consumer, &keys)))
    }

    /// Drop all of the consumer's interest.
    pub fn release(&self, consumer: ConsumerId) -> SubscriptionDelta {
        self.change(|registry| registry.release(consumer))
    }

    /// Union of every consumer's interest.
    #[must_use]
    pub fn watched(&self) -> WatchSet {
        self.registry.watch_set()
    }

    /// Registry counts.
    #[must_use]
    pub fn watch_stats(&self) -> WatchStats {
        self.registry.stats()
    }

    fn change(&self, apply: impl FnOnce(&WatchRegistry) -> SubscriptionDelta) -> SubscriptionDelta {
        let _guard = self.publish.lock();
        let delta = apply(&self.registry);
        if !delta.is_empty() {
            let watch = self.registry.watch_set();
            tracing::debug!(
                session_id = %self.id,
                added = delta.added.len(),
                removed = delta.removed.len(),
                watched = watch.len(),
                "Watch set changed"
            );
            metrics::set_watched_instruments(watch.len());
            self.connection.update_watch(watch);
        }
        delta
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Open the stream with `token` for the current watch set.
    ///
    /// Without a token this does nothing. With an empty watch set the token
    /// is kept and the stream opens once something is watched. While a
    /// connection already exists the call is ignored.
    pub fn connect(&self, token: Option<AccessToken>) {
        let _guard = self.publish.lock();
        if token.is_none() {
            tracing::warn!(session_id = %self.id, "Connect requested without an access token");
        }
        self.connection.connect(token, self.registry.watch_set());
    }

    /// Load the token from `source` and [`connect`](Self::connect).
    ///
    /// # Errors
    ///
    /// Returns [`TokenSourceError`] if the token storage cannot be read.
    pub fn connect_from(&self, source: &dyn TokenSource) -> Result<(), TokenSourceError> {
        let token = source.load()?;
        self.connect(token);
        Ok(())
    }

    /// Close the stream and forget the token. Interest and cache are kept;
    /// a later [`connect`](Self::connect) resumes.
    pub fn teardown(&self) {
        tracing::info!(session_id = %self.id, "Session teardown requested");
        self.connection.teardown();
    }

    /// Tear down and stop the connection task, waiting for it to finish.
    pub async fn shutdown(&self) {
        tracing::info!(session_id = %self.id, "Shutting down market session");
        self.cancel.cancel();

        let Some(task) = self.task.lock().take() else {
            return;
        };
        if let Err(e) = task.await {
            tracing::error!(session_id = %self.id, error = %e, "Connection task failed");
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Latest tick for `key`, if any has arrived.
    #[must_use]
    pub fn price(&self, key: &str) -> Option<Arc<TickRecord>> {
        self.cache.get(key)
    }

    /// Every cached tick.
    #[must_use]
    pub fn prices(&self) -> HashMap<InstrumentKey, Arc<TickRecord>> {
        self.cache.snapshot()
    }

    /// Receiver for every applied tick.
    #[must_use]
    pub fn tick_updates(&self) -> broadcast::Receiver<TickUpdate> {
        self.cache.subscribe()
    }

    /// Applied ticks as a stream. Updates missed by a lagging reader are
    /// skipped; the cache still holds the latest value.
    pub fn tick_stream(&self) -> impl Stream<Item = TickUpdate> + Send + 'static {
        BroadcastStream::new(self.cache.subscribe()).filter_map(Result::ok)
    }

    /// Shared price cache.
    #[must_use]
    pub fn cache(&self) -> Arc<PriceCache> {
        Arc::clone(&self.cache)
    }

    /// Current state of the session.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.connection.snapshot()
    }

    /// Receiver notified whenever the snapshot changes.
    #[must_use]
    pub fn status_updates(&self) -> watch::Receiver<SessionSnapshot> {
        self.connection.snapshots()
    }

    /// Receiver for surfaced errors (auth expiry, gateway errors, exhausted
    /// reconnects).
    #[must_use]
    pub fn errors(&self) -> broadcast::Receiver<SessionError> {
        self.errors_tx.subscribe()
    }
}

impl Drop for MarketSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for MarketSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketSession")
            .field("id", &self.id)
            .field("cache", &self.cache)
            .field("registry", &self.registry.stats())
            .finish_non_exhaustive()
    }
}
