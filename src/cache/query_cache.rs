//! Keyed store of server-fetched query results.
//!
//! Entries are only ever written by a successful fetch or flagged by an
//! invalidation. Invalidation keeps the last value so readers can keep
//! rendering it while the refetch runs.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use super::NamespaceKey;
use crate::config::SyncConfig;

const CHANGE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry {
    pub key: NamespaceKey,
    pub value: serde_json::Value,
    pub fetched_at: DateTime<Utc>,
    pub is_stale: bool,
    /// Age after which the entry counts as stale even without an invalidation.
    pub stale_after: Option<Duration>,
}

impl CacheEntry {
    /// True when the next read should refetch.
    pub fn needs_refetch(&self) -> bool {
        if self.is_stale {
            return true;
        }
        match self.stale_after {
            Some(window) => {
                let age = Utc::now().signed_duration_since(self.fetched_at);
                age.to_std().map(|age| age >= window).unwrap_or(false)
            }
            None => false,
        }
    }

    pub fn value_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.value.clone())
    }
}

/// Change notices delivered to watchers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheChange {
    /// A fetch stored a new value for exactly this key.
    Updated(NamespaceKey),
    /// Every key under this prefix was marked stale.
    Invalidated(NamespaceKey),
}

impl CacheChange {
    pub fn covers(&self, key: &NamespaceKey) -> bool {
        match self {
            CacheChange::Updated(updated) => updated == key,
            CacheChange::Invalidated(prefix) => key.starts_with(prefix),
        }
    }
}

struct CacheInner {
    entries: DashMap<NamespaceKey, CacheEntry>,
    changes: broadcast::Sender<CacheChange>,
    default_stale_after: Option<Duration>,
    /// Bumped by every invalidation; lets a fetch detect that it raced one.
    epoch: AtomicU64,
}

#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<CacheInner>,
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new(None)
    }
}

impl QueryCache {
    pub fn new(default_stale_after: Option<Duration>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            inner: Arc::new(CacheInner {
                entries: DashMap::new(),
                changes,
                default_stale_after,
                epoch: AtomicU64::new(0),
            }),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(Some(Duration::from_millis(config.default_stale_time_ms)))
    }

    pub fn get(&self, key: &NamespaceKey) -> Option<CacheEntry> {
        self.inner.entries.get(key).map(|entry| entry.clone())
    }

    pub fn value(&self, key: &NamespaceKey) -> Option<serde_json::Value> {
        self.inner.entries.get(key).map(|entry| entry.value.clone())
    }

    pub fn is_fresh(&self, key: &NamespaceKey) -> bool {
        self.inner
            .entries
            .get(key)
            .map(|entry| !entry.needs_refetch())
            .unwrap_or(false)
    }

    /// Record a successful fetch under the default freshness policy.
    pub fn store(&self, key: NamespaceKey, value: serde_json::Value) {
        self.store_with_policy(key, value, self.inner.default_stale_after);
    }

    pub fn store_with_policy(
        &self,
        key: NamespaceKey,
        value: serde_json::Value,
        stale_after: Option<Duration>,
    ) {
        self.insert(key, value, stale_after, false);
    }

    fn insert(
        &self,
        key: NamespaceKey,
        value: serde_json::Value,
        stale_after: Option<Duration>,
        is_stale: bool,
    ) {
        let entry = CacheEntry {
            key: key.clone(),
            value,
            fetched_at: Utc::now(),
            is_stale,
            stale_after,
        };
        self.inner.entries.insert(key.clone(), entry);
        trace!(%key, is_stale, "query cache updated");
        let _ = self.inner.changes.send(CacheChange::Updated(key));
    }

    /// Mark every entry under `prefix` stale. Values are kept.
    pub fn invalidate(&self, prefix: &NamespaceKey) -> usize {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);

        let mut marked = 0;
        for mut entry in self.inner.entries.iter_mut() {
            if entry.key().starts_with(prefix) {
                entry.value_mut().is_stale = true;
                marked += 1;
            }
        }

        debug!(%prefix, marked, "query cache invalidated");
        let _ = self.inner.changes.send(CacheChange::Invalidated(prefix.clone()));
        marked
    }

    pub fn invalidate_many(&self, prefixes: &[NamespaceKey]) -> usize {
        prefixes.iter().map(|prefix| self.invalidate(prefix)).sum()
    }

    /// Full resync: mark every entry stale.
    pub fn invalidate_all(&self) -> usize {
        self.invalidate(&NamespaceKey::root())
    }

    pub fn remove(&self, key: &NamespaceKey) -> Option<CacheEntry> {
        self.inner.entries.remove(key).map(|(_, entry)| entry)
    }

    pub fn keys(&self) -> Vec<NamespaceKey> {
        let mut keys: Vec<NamespaceKey> = self
            .inner
            .entries
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn stale_keys(&self) -> Vec<NamespaceKey> {
        let mut keys: Vec<NamespaceKey> = self
            .inner
            .entries
            .iter()
            .filter(|entry| entry.needs_refetch())
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Read-through: return the cached value while fresh, otherwise run
    /// `fetcher` and store its result.
    ///
    /// A failed refetch leaves the previous (stale) value in place. A fetch
    /// that overlapped an invalidation stores its value already stale, since
    /// it may predate the change that was announced.
    pub async fn fetch<F, Fut, E>(&self, key: &NamespaceKey, fetcher: F) -> Result<serde_json::Value, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<serde_json::Value, E>>,
    {
        if let Some(entry) = self.get(key) {
            if !entry.needs_refetch() {
                return Ok(entry.value);
            }
        }

        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        let value = fetcher().await?;
        let raced = self.inner.epoch.load(Ordering::SeqCst) != epoch;
        if raced {
            debug!(%key, "fetch overlapped an invalidation, storing as stale");
        }
        self.insert(key.clone(), value.clone(), self.inner.default_stale_after, raced);
        Ok(value)
    }

    pub fn watch(&self, key: NamespaceKey) -> QueryWatch {
        QueryWatch {
            key,
            cache: self.clone(),
            rx: self.inner.changes.subscribe(),
        }
    }

    pub fn changes(&self) -> broadcast::Receiver<CacheChange> {
        self.inner.changes.subscribe()
    }
}

/// Subscription to one query key: latest value plus a refetch trigger.
pub struct QueryWatch {
    key: NamespaceKey,
    cache: QueryCache,
    rx: broadcast::Receiver<CacheChange>,
}

impl QueryWatch {
    pub fn key(&self) -> &NamespaceKey {
        &self.key
    }

    pub fn latest(&self) -> Option<CacheEntry> {
        self.cache.get(&self.key)
    }

    pub fn needs_refetch(&self) -> bool {
        self.latest().map(|entry| entry.needs_refetch()).unwrap_or(true)
    }

    /// Wait for the next change covering this key. `None` once the cache is gone.
    pub async fn changed(&mut self) -> Option<CacheChange> {
        loop {
            match self.rx.recv().await {
                Ok(change) if change.covers(&self.key) => return Some(change),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(key = %self.key, "query watch lagged, dropped {n} changes");
                    return Some(CacheChange::Invalidated(self.key.clone()));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Refetch through the cache if the entry is missing or stale.
    pub async fn refetch_if_needed<F, Fut, E>(&self, fetcher: F) -> Result<serde_json::Value, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<serde_json::Value, E>>,
    {
        self.cache.fetch(&self.key, fetcher).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn key(segments: &[&str]) -> NamespaceKey {
        NamespaceKey::from(segments)
    }

    #[test]
    fn invalidate_marks_prefix_and_keeps_value() {
        let cache = QueryCache::default();
        cache.store(key(&["workers", "queue"]), json!([1, 2]));
        cache.store(key(&["workers", "history"]), json!([]));
        cache.store(key(&["calendar"]), json!({}));

        let marked = cache.invalidate(&key(&["workers"]));

        assert_eq!(marked, 2);
        let queue = cache.get(&key(&["workers", "queue"])).unwrap();
        assert!(queue.is_stale);
        assert_eq!(queue.value, json!([1, 2]));
        assert!(cache.is_fresh(&key(&["calendar"])));
        assert_eq!(
            cache.stale_keys(),
            vec![key(&["workers", "history"]), key(&["workers", "queue"])]
        );
    }

    #[test]
    fn invalidate_all_marks_everything() {
        let cache = QueryCache::default();
        cache.store(key(&["a"]), json!(1));
        cache.store(key(&["b", "c"]), json!(2));

        assert_eq!(cache.invalidate_all(), 2);
        assert_eq!(cache.stale_keys().len(), 2);
    }

    #[test]
    fn stale_after_window_expires_entry() {
        let cache = QueryCache::default();
        cache.store_with_policy(key(&["email"]), json!([]), Some(Duration::ZERO));
        cache.store_with_policy(key(&["contacts"]), json!([]), None);

        assert!(!cache.is_fresh(&key(&["email"])));
        assert!(cache.is_fresh(&key(&["contacts"])));
    }

    #[tokio::test]
    async fn fetch_reads_through_only_when_needed() {
        let cache = QueryCache::default();
        let calls = AtomicUsize::new(0);
        let calls = &calls;
        let k = key(&["missions"]);

        let fetch = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(json!(["m1"]))
        };

        assert_eq!(cache.fetch(&k, fetch).await.unwrap(), json!(["m1"]));
        assert_eq!(cache.fetch(&k, fetch).await.unwrap(), json!(["m1"]));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        cache.invalidate(&key(&["missions"]));
        cache.fetch(&k, fetch).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(cache.is_fresh(&k));
    }

    #[tokio::test]
    async fn failed_refetch_keeps_stale_value() {
        let cache = QueryCache::default();
        let k = key(&["duties"]);
        cache.store(k.clone(), json!(["old"]));
        cache.invalidate(&k);

        let result = cache
            .fetch(&k, || async { Err::<serde_json::Value, _>("offline") })
            .await;

        assert_eq!(result, Err("offline"));
        let entry = cache.get(&k).unwrap();
        assert!(entry.is_stale);
        assert_eq!(entry.value, json!(["old"]));
    }

    #[tokio::test]
    async fn fetch_racing_an_invalidation_is_stored_stale() {
        let cache = QueryCache::default();
        let k = key(&["priorities"]);
        let racing = cache.clone();

        cache
            .fetch(&k, || async move {
                racing.invalidate(&NamespaceKey::from(["priorities"]));
                Ok::<_, String>(json!(["p1"]))
            })
            .await
            .unwrap();

        let entry = cache.get(&k).unwrap();
        assert_eq!(entry.value, json!(["p1"]));
        assert!(entry.is_stale);
    }

    #[tokio::test]
    async fn watch_wakes_only_for_covering_changes() {
        let cache = QueryCache::default();
        let mut watch = cache.watch(key(&["workers", "queue"]));
        assert!(watch.needs_refetch());

        cache.invalidate(&key(&["calendar"]));
        cache.invalidate(&key(&["workers"]));

        let change = watch.changed().await.unwrap();
        assert_eq!(change, CacheChange::Invalidated(key(&["workers"])));

        cache.store(key(&["workers", "queue"]), json!([]));
        assert_eq!(
            watch.changed().await.unwrap(),
            CacheChange::Updated(key(&["workers", "queue"]))
        );
        assert!(!watch.needs_refetch());

        cache.invalidate(&key(&["workers"]));
        watch.changed().await.unwrap();
        let value = watch
            .refetch_if_needed(|| async { Ok::<_, String>(json!(["w2"])) })
            .await
            .unwrap();
        assert_eq!(value, json!(["w2"]));
        assert_eq!(watch.latest().map(|entry| entry.is_stale), Some(false));
    }
}
