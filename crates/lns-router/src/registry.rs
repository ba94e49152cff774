//! Live connection registry.
//!
//! The registry is the only authority on "does this instance own that connection". It is a
//! sharded map; writers are cloned out of their entry before any `.await`, so no shard lock is
//! ever held across a suspension point.

use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("no live connection registered for key")]
    NotFound,
    #[error("connection handle is stale; the connection was replaced")]
    Stale,
    #[error("connection closed")]
    Closed,
}

/// Outbound half of a live connection.
#[async_trait]
pub trait ConnectionWriter: Send + Sync + 'static {
    async fn send(&self, message: Bytes) -> Result<(), SendError>;

    fn is_closed(&self) -> bool;

    /// Start closing the connection. Idempotent.
    fn close(&self);
}

/// Capability for one specific registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryHandle<K> {
    pub key: K,
    pub generation: u64,
}

struct Entry<W: ?Sized> {
    generation: u64,
    writer: Arc<W>,
    last_activity: Instant,
}

pub struct ConnectionRegistry<K, W: ?Sized> {
    entries: DashMap<K, Entry<W>>,
    next_generation: AtomicU64,
}

impl<K, W> Default for ConnectionRegistry<K, W>
where
    K: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static,
    W: ConnectionWriter + ?Sized,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, W> ConnectionRegistry<K, W>
where
    K: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static,
    W: ConnectionWriter + ?Sized,
{
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Register `writer` for `key`, replacing (and closing) any previous connection.
    pub fn register(&self, key: K, writer: Arc<W>) -> RegistryHandle<K> {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let previous = self.entries.insert(
            key.clone(),
            Entry {
                generation,
                writer,
                last_activity: Instant::now(),
            },
        );
        if let Some(previous) = previous {
            tracing::info!(
                target: "lns.registry",
                key = %key,
                replaced_generation = previous.generation,
                generation,
                "connection replaced"
            );
            previous.writer.close();
        } else {
            tracing::debug!(target: "lns.registry", key = %key, generation, "connection registered");
        }
        RegistryHandle { key, generation }
    }

    /// Register and return a guard that deregisters on drop.
    pub fn register_guarded(self: &Arc<Self>, key: K, writer: Arc<W>) -> RegistrationGuard<K, W> {
        let handle = self.register(key, writer);
        RegistrationGuard {
            registry: Arc::clone(self),
            handle,
        }
    }

    /// Remove the entry for `key`, whatever its generation.
    pub fn deregister(&self, key: &K) -> Option<Arc<W>> {
        let (_, entry) = self.entries.remove(key)?;
        tracing::debug!(target: "lns.registry", key = %key, "connection deregistered");
        Some(entry.writer)
    }

    /// Remove the entry only if it still belongs to `handle`.
    pub fn deregister_handle(&self, handle: &RegistryHandle<K>) -> Option<Arc<W>> {
        let (_, entry) = self
            .entries
            .remove_if(&handle.key, |_, entry| entry.generation == handle.generation)?;
        tracing::debug!(
            target: "lns.registry",
            key = %handle.key,
            generation = handle.generation,
            "connection deregistered"
        );
        Some(entry.writer)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn is_current(&self, handle: &RegistryHandle<K>) -> bool {
        self.entries
            .get(&handle.key)
            .is_some_and(|entry| entry.generation == handle.generation)
    }

    pub fn writer(&self, key: &K) -> Option<Arc<W>> {
        self.entries.get(key).map(|entry| entry.writer.clone())
    }

    /// Record activity on the connection.
    pub fn touch(&self, key: &K) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.last_activity = Instant::now();
        }
    }

    pub fn last_activity(&self, key: &K) -> Option<Instant> {
        self.entries.get(key).map(|entry| entry.last_activity)
    }

    /// Send to whatever connection is currently registered for `key`.
    pub async fn send(&self, key: &K, message: Bytes) -> Result<(), SendError> {
        let writer = self.writer(key).ok_or(SendError::NotFound)?;
        if writer.is_closed() {
            return Err(SendError::NotFound);
        }
        writer.send(message).await
    }

    /// Send only if `handle` still names the registered connection.
    pub async fn send_with_handle(
        &self,
        handle: &RegistryHandle<K>,
        message: Bytes,
    ) -> Result<(), SendError> {
        let writer = {
            let entry = self.entries.get(&handle.key).ok_or(SendError::NotFound)?;
            if entry.generation != handle.generation {
                return Err(SendError::Stale);
            }
            entry.writer.clone()
        };
        if writer.is_closed() {
            return Err(SendError::NotFound);
        }
        writer.send(message).await
    }

    /// Remove every entry whose writer reports closed. Returns the removed keys.
    pub fn prune(&self) -> Vec<K> {
        let candidates: Vec<(K, u64)> = self
            .entries
            .iter()
            .filter(|entry| entry.writer.is_closed())
            .map(|entry| (entry.key().clone(), entry.generation))
            .collect();

        let mut removed = Vec::with_capacity(candidates.len());
        for (key, generation) in candidates {
            // Re-checked under the shard lock: a re-registration since the scan survives.
            let gone = self.entries.remove_if(&key, |_, entry| {
                entry.generation == generation && entry.writer.is_closed()
            });
            if gone.is_some() {
                removed.push(key);
            }
        }
        removed
    }

    /// Close and remove every connection silent for at least `max_idle` as of `now`.
    pub fn prune_idle_at(&self, now: Instant, max_idle: Duration) -> Vec<K> {
        let is_idle =
            |entry: &Entry<W>| now.saturating_duration_since(entry.last_activity) >= max_idle;
        let candidates: Vec<(K, u64)> = self
            .entries
            .iter()
            .filter(|entry| is_idle(entry.value()))
            .map(|entry| (entry.key().clone(), entry.generation))
            .collect();

        let mut removed = Vec::with_capacity(candidates.len());
        for (key, generation) in candidates {
            // Activity since the scan keeps the connection.
            let gone = self.entries.remove_if(&key, |_, entry| {
                entry.generation == generation && is_idle(entry)
            });
            if let Some((key, entry)) = gone {
                entry.writer.close();
                removed.push(key);
            }
        }
        removed
    }

    /// Prune every `interval` until `token` is cancelled.
    ///
    /// With `max_idle` set, connections that stayed silent that long are closed as well.
    pub async fn run_pruner(
        self: Arc<Self>,
        interval: Duration,
        max_idle: Option<Duration>,
        token: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {
                    for key in self.prune() {
                        tracing::info!(target: "lns.registry", key = %key, "pruned closed connection");
                    }
                    let Some(max_idle) = max_idle else {
                        continue;
                    };
                    for key in self.prune_idle_at(Instant::now(), max_idle) {
                        tracing::info!(
                            target: "lns.registry",
                            key = %key,
                            idle_ms = max_idle.as_millis() as u64,
                            "closed idle connection"
                        );
                    }
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Scoped registration: dropping the guard deregisters the entry if it is still current.
///
/// Runs on every exit path of the owning task, including cancellation and panics.
pub struct RegistrationGuard<K, W>
where
    K: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static,
    W: ConnectionWriter + ?Sized,
{
    registry: Arc<ConnectionRegistry<K, W>>,
    handle: RegistryHandle<K>,
}

impl<K, W> RegistrationGuard<K, W>
where
    K: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static,
    W: ConnectionWriter + ?Sized,
{
    pub fn handle(&self) -> &RegistryHandle<K> {
        &self.handle
    }
}

impl<K, W> Drop for RegistrationGuard<K, W>
where
    K: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static,
    W: ConnectionWriter + ?Sized,
{
    fn drop(&mut self) {
        self.registry.deregister_handle(&self.handle);
    }
}
