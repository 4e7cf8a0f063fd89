//! Key-addressed cache of asynchronous query results.
//!
//! At most one fetch per key is in flight at a time; later readers await the
//! same shared future. Fetches run on their own task, so a reader that goes
//! away mid-flight never cancels the fetch or loses its result for others.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use lru::LruCache;
use metrics::{counter, histogram};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::infra::gateway::GatewayError;

use super::config::{CacheConfig, QueryOptions};
use super::entry::{CacheEntry, Cacheable, QueryData, QuerySnapshot, QueryStatus};
use super::events::{CacheEvent, Epoch, EventBus, EventKind};
use super::keys::{KeyMatcher, KeyPattern, QueryKey};
use super::lock::{mutex_lock, rw_read, rw_write};

const SOURCE: &str = "cache::store";

type FetchResult = Result<QueryData, GatewayError>;
type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("query {key} failed: {source}")]
    Fetch {
        key: String,
        #[source]
        source: GatewayError,
    },
    #[error("cached value for {key} has an unexpected shape")]
    Shape { key: String },
}

impl QueryError {
    fn fetch(key: &QueryKey, source: GatewayError) -> Self {
        Self::Fetch {
            key: key.to_string(),
            source,
        }
    }

    fn shape(key: &QueryKey) -> Self {
        Self::Shape {
            key: key.to_string(),
        }
    }

    /// The backend failure behind this error, if any.
    pub fn gateway(&self) -> Option<&GatewayError> {
        match self {
            Self::Fetch { source, .. } => Some(source),
            Self::Shape { .. } => None,
        }
    }
}

/// Whether an out-of-band write restarts the staleness window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Baseline {
    Keep,
    Reset,
}

struct InFlight {
    started: Epoch,
    fetch: SharedFetch,
}

enum Lookup {
    Hit(QueryData),
    Pending(SharedFetch),
}

struct Inner {
    config: CacheConfig,
    entries: RwLock<LruCache<QueryKey, CacheEntry>>,
    in_flight: Mutex<HashMap<QueryKey, InFlight>>,
    events: EventBus,
}

/// Cheaply cloneable handle; clones share one store.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<Inner>,
}

impl QueryCache {
    pub fn new(config: CacheConfig) -> Self {
        let capacity = config.capacity;
        Self {
            inner: Arc::new(Inner {
                config,
                entries: RwLock::new(LruCache::new(capacity)),
                in_flight: Mutex::new(HashMap::new()),
                events: EventBus::new(),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn options_for(&self, key: &QueryKey) -> QueryOptions {
        self.inner.config.options_for(key)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.inner.events.subscribe()
    }

    pub fn len(&self) -> usize {
        rw_read(&self.inner.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Fresh cached data, or the result of a (shared) fetch.
    pub async fn get<T, F, Fut>(&self, key: QueryKey, fetcher: F) -> Result<T, QueryError>
    where
        T: Cacheable,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, GatewayError>> + Send + 'static,
    {
        let options = self.options_for(&key);
        self.get_with(key, options, fetcher).await
    }

    pub async fn get_with<T, F, Fut>(
        &self,
        key: QueryKey,
        options: QueryOptions,
        fetcher: F,
    ) -> Result<T, QueryError>
    where
        T: Cacheable,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, GatewayError>> + Send + 'static,
    {
        let fetch = match self.lookup_or_start(&key, options, fetcher) {
            Lookup::Hit(data) => return T::from_data(&data).ok_or_else(|| QueryError::shape(&key)),
            Lookup::Pending(fetch) => fetch,
        };
        let data = fetch
            .await
            .map_err(|source| QueryError::fetch(&key, source))?;
        T::from_data(&data).ok_or_else(|| QueryError::shape(&key))
    }

    /// Explicit retry: mark the key stale, then read it again.
    pub async fn refetch<T, F, Fut>(&self, key: QueryKey, fetcher: F) -> Result<T, QueryError>
    where
        T: Cacheable,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, GatewayError>> + Send + 'static,
    {
        self.invalidate(&key);
        self.get(key, fetcher).await
    }

    /// Current entry state, without touching recency or staleness.
    pub fn entry(&self, key: &QueryKey) -> Option<CacheEntry> {
        rw_read(&self.inner.entries, SOURCE, "entry").peek(key).cloned()
    }

    /// Cached data regardless of staleness; `None` once the entry failed.
    pub fn peek<T: Cacheable>(&self, key: &QueryKey) -> Option<T> {
        let entries = rw_read(&self.inner.entries, SOURCE, "peek");
        entries
            .peek(key)
            .filter(|entry| entry.status != QueryStatus::Error)
            .and_then(|entry| entry.data.as_ref())
            .and_then(T::from_data)
    }

    /// What a view should render for `key`.
    ///
    /// With `previous` set and keep-previous enabled for `key`, a key that has
    /// no data yet shows the previous key's data instead of nothing.
    pub fn snapshot<T: Cacheable>(
        &self,
        key: &QueryKey,
        previous: Option<&QueryKey>,
    ) -> QuerySnapshot<T> {
        let entries = rw_read(&self.inner.entries, SOURCE, "snapshot");
        let mut snapshot = match entries.peek(key) {
            Some(entry) => QuerySnapshot {
                status: entry.status,
                data: match entry.status {
                    QueryStatus::Error => None,
                    _ => entry.data.as_ref().and_then(T::from_data),
                },
                error: entry.error.clone(),
                is_stale: entry.is_stale(),
                is_previous_data: false,
            },
            None => QuerySnapshot::idle(),
        };

        let keeps_previous = self.inner.config.options_for(key).keep_previous_on_refetch;
        if snapshot.data.is_none() && snapshot.status != QueryStatus::Error && keeps_previous {
            let fallback = previous
                .filter(|previous| *previous != key)
                .and_then(|previous| entries.peek(previous))
                .filter(|entry| entry.status != QueryStatus::Error)
                .and_then(|entry| entry.data.as_ref())
                .and_then(T::from_data);
            if let Some(data) = fallback {
                snapshot.data = Some(data);
                snapshot.is_previous_data = true;
            }
        }
        snapshot
    }

    // ------------------------------------------------------------------
    // Invalidation and removal
    // ------------------------------------------------------------------

    /// Mark matching entries stale. Readers keep their data; the next `get` refetches.
    pub fn invalidate<M: KeyMatcher + ?Sized>(&self, matcher: &M) -> usize {
        let mut entries = rw_write(&self.inner.entries, SOURCE, "invalidate");
        let mut count = 0;
        for (key, entry) in entries.iter_mut() {
            if !matcher.matches(key) {
                continue;
            }
            entry.invalidated_at = Some(self.inner.events.publish(EventKind::Invalidated, key));
            count += 1;
        }
        if count > 0 {
            debug!(count, "Invalidated cache entries");
        }
        count
    }

    /// Hard delete; an in-flight fetch for the key is detached and its result dropped.
    pub fn remove(&self, key: &QueryKey) -> bool {
        self.remove_matching(key) > 0
    }

    pub fn remove_matching<M: KeyMatcher + ?Sized>(&self, matcher: &M) -> usize {
        let mut in_flight = mutex_lock(&self.inner.in_flight, SOURCE, "remove.in_flight");
        in_flight.retain(|key, _| !matcher.matches(key));

        let mut entries = rw_write(&self.inner.entries, SOURCE, "remove");
        let doomed: Vec<QueryKey> = entries
            .iter()
            .filter(|(key, _)| matcher.matches(key))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            entries.pop(key);
            self.inner.events.publish(EventKind::Removed, key);
            counter!("libris_query_cache_evict_total", "reason" => "removed").increment(1);
        }
        doomed.len()
    }

    /// Drop everything that belongs to the signed-in user.
    pub fn evict_user_scoped(&self) -> usize {
        let count = self.remove_matching(&KeyPattern::UserScoped);
        if count > 0 {
            info!(count, "Evicted user-scoped cache entries");
        }
        count
    }

    pub fn clear(&self) {
        let count = self.remove_matching(&KeyPattern::All);
        info!(count, "Cleared query cache");
    }

    // ------------------------------------------------------------------
    // Out-of-band writes (mutation coordinator only)
    // ------------------------------------------------------------------

    /// Synchronously replace the data of `key`.
    ///
    /// Returning `None` from `updater` leaves the entry untouched.
    pub(crate) fn set_data<T, U>(&self, key: &QueryKey, baseline: Baseline, updater: U) -> bool
    where
        T: Cacheable,
        U: FnOnce(Option<T>) -> Option<T>,
    {
        let mut entries = rw_write(&self.inner.entries, SOURCE, "set_data");
        let current = entries
            .peek(key)
            .and_then(|entry| entry.data.as_ref())
            .and_then(T::from_data);
        let Some(next) = updater(current) else {
            return false;
        };

        let epoch = self.inner.events.publish(EventKind::Written, key);
        match entries.get_mut(key) {
            Some(entry) => {
                entry.data = Some(next.into_data());
                entry.status = QueryStatus::Success;
                entry.error = None;
                if baseline == Baseline::Reset {
                    entry.fetched_at = Some(Instant::now());
                    entry.fetched_epoch = Some(epoch);
                }
            }
            None => {
                let mut entry = CacheEntry::idle(key.clone(), self.inner.config.stale_after(key));
                entry.data = Some(next.into_data());
                entry.status = QueryStatus::Success;
                if baseline == Baseline::Reset {
                    entry.fetched_at = Some(Instant::now());
                    entry.fetched_epoch = Some(epoch);
                }
                self.insert_entry(&mut entries, entry);
            }
        }
        true
    }

    /// Patch every matching entry that holds data; returns the keys changed.
    pub(crate) fn update_matching<M, F>(&self, matcher: &M, mut patch: F) -> Vec<QueryKey>
    where
        M: KeyMatcher + ?Sized,
        F: FnMut(&QueryKey, &mut QueryData) -> bool,
    {
        let mut entries = rw_write(&self.inner.entries, SOURCE, "update_matching");
        let mut changed = Vec::new();
        for (key, entry) in entries.iter_mut() {
            if !matcher.matches(key) || entry.status == QueryStatus::Error {
                continue;
            }
            let Some(data) = entry.data.as_mut() else {
                continue;
            };
            if patch(key, data) {
                self.inner.events.publish(EventKind::Written, key);
                changed.push(key.clone());
            }
        }
        changed
    }

    /// Clones of every matching entry, for rollback snapshots.
    pub(crate) fn entries_matching<M: KeyMatcher + ?Sized>(&self, matcher: &M) -> Vec<CacheEntry> {
        rw_read(&self.inner.entries, SOURCE, "entries_matching")
            .iter()
            .filter(|(key, _)| matcher.matches(key))
            .map(|(_, entry)| entry.clone())
            .collect()
    }

    /// Put a snapshotted entry back; `None` means it did not exist.
    ///
    /// `expected` is the data the rolled-back write left behind. When the
    /// entry no longer holds it, something else wrote the key since, so the
    /// restored data is marked invalidated. A newer invalidation is never
    /// undone, and a fetch started after the snapshot may still land.
    pub(crate) fn restore(
        &self,
        key: &QueryKey,
        snapshot: Option<CacheEntry>,
        expected: Option<&QueryData>,
    ) {
        let mut entries = rw_write(&self.inner.entries, SOURCE, "restore");
        match snapshot {
            Some(mut entry) => {
                let epoch = self.inner.events.publish(EventKind::Written, key);
                match entries.get_mut(key) {
                    Some(current) => {
                        entry.invalidated_at = entry.invalidated_at.max(current.invalidated_at);
                        if current.data.as_ref() != expected {
                            debug!(key = %key, "Entry changed since snapshot; restored data marked stale");
                            entry.invalidated_at = Some(epoch);
                        }
                        entry.pending = current.pending;
                        *current = entry;
                    }
                    None => self.insert_entry(&mut entries, entry),
                }
            }
            None => {
                if entries.pop(key).is_some() {
                    self.inner.events.publish(EventKind::Removed, key);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Fetch machinery
    // ------------------------------------------------------------------

    fn lookup_or_start<T, F, Fut>(&self, key: &QueryKey, options: QueryOptions, fetcher: F) -> Lookup
    where
        T: Cacheable,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, GatewayError>> + Send + 'static,
    {
        let namespace = key.namespace().as_str();
        let mut in_flight = mutex_lock(&self.inner.in_flight, SOURCE, "lookup.in_flight");

        {
            let mut entries = rw_write(&self.inner.entries, SOURCE, "lookup.entries");
            let fresh = entries
                .get(key)
                .filter(|entry| entry.is_fresh())
                .and_then(|entry| entry.data.clone());
            if let Some(data) = fresh {
                counter!("libris_query_cache_hit_total", "namespace" => namespace).increment(1);
                debug!(key = %key, "Query cache hit");
                return Lookup::Hit(data);
            }
        }

        if let Some(pending) = in_flight.get(key) {
            debug!(key = %key, "Joined in-flight fetch");
            return Lookup::Pending(pending.fetch.clone());
        }

        counter!("libris_query_cache_miss_total", "namespace" => namespace).increment(1);
        let started = self.inner.events.publish(EventKind::FetchStarted, key);
        self.mark_loading(key, started, options);

        let fetch = self.spawn_fetch(key.clone(), started, options, fetcher);
        in_flight.insert(
            key.clone(),
            InFlight {
                started,
                fetch: fetch.clone(),
            },
        );
        Lookup::Pending(fetch)
    }

    fn mark_loading(&self, key: &QueryKey, started: Epoch, options: QueryOptions) {
        let mut entries = rw_write(&self.inner.entries, SOURCE, "mark_loading");
        match entries.get_mut(key) {
            Some(entry) => {
                entry.status = QueryStatus::Loading;
                entry.stale_after = options.stale_after;
                entry.pending = Some(started);
                if entry.error.take().is_some() {
                    entry.data = None;
                }
            }
            None => {
                let mut entry = CacheEntry::idle(key.clone(), options.stale_after);
                entry.status = QueryStatus::Loading;
                entry.pending = Some(started);
                self.insert_entry(&mut entries, entry);
            }
        }
    }

    fn spawn_fetch<T, F, Fut>(
        &self,
        key: QueryKey,
        started: Epoch,
        options: QueryOptions,
        fetcher: F,
    ) -> SharedFetch
    where
        T: Cacheable,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, GatewayError>> + Send + 'static,
    {
        let cache = self.clone();
        let handle = tokio::spawn(async move {
            let began = Instant::now();
            let result = fetch_with_retry(&key, &fetcher, options).await;
            histogram!("libris_query_fetch_ms", "namespace" => key.namespace().as_str())
                .record(began.elapsed().as_secs_f64() * 1000.0);
            cache.complete(&key, started, &result);
            result
        });

        async move {
            handle
                .await
                .unwrap_or_else(|err| Err(GatewayError::network(format!("fetch task failed: {err}"))))
        }
        .boxed()
        .shared()
    }

    fn complete(&self, key: &QueryKey, started: Epoch, result: &FetchResult) {
        {
            let mut in_flight = mutex_lock(&self.inner.in_flight, SOURCE, "complete.in_flight");
            if in_flight
                .get(key)
                .is_some_and(|pending| pending.started == started)
            {
                in_flight.remove(key);
            }

            let mut entries = rw_write(&self.inner.entries, SOURCE, "complete.entries");
            match entries.get_mut(key) {
                Some(entry) if entry.pending == Some(started) => {
                    entry.pending = None;
                    match result {
                        Ok(data) => {
                            entry.data = Some(data.clone());
                            entry.status = QueryStatus::Success;
                            entry.error = None;
                            entry.fetched_at = Some(Instant::now());
                            entry.fetched_epoch = Some(started);
                            self.inner.events.publish(EventKind::Fetched, key);
                        }
                        Err(error) => {
                            entry.data = None;
                            entry.status = QueryStatus::Error;
                            entry.error = Some(error.clone());
                            entry.fetched_epoch = None;
                            self.inner.events.publish(EventKind::Failed, key);
                        }
                    }
                }
                _ => {
                    debug!(key = %key, "Entry replaced or removed during fetch; result not stored");
                }
            }
        }

        if let Err(error) = result {
            counter!(
                "libris_query_fetch_error_total",
                "namespace" => key.namespace().as_str(),
                "kind" => error.kind()
            )
            .increment(1);
            if error.is_unauthorized() {
                self.evict_user_scoped();
            }
        }
    }

    fn insert_entry(&self, entries: &mut LruCache<QueryKey, CacheEntry>, entry: CacheEntry) {
        let key = entry.key.clone();
        let evicted = entries
            .push(key.clone(), entry)
            .map(|(evicted, _)| evicted)
            .filter(|evicted| *evicted != key);
        if let Some(evicted) = evicted {
            counter!("libris_query_cache_evict_total", "reason" => "capacity").increment(1);
            self.inner.events.publish(EventKind::Evicted, &evicted);
            debug!(key = %evicted, "Evicted least recently used entry");
        }
    }
}

async fn fetch_with_retry<T, F, Fut>(key: &QueryKey, fetcher: &F, options: QueryOptions) -> FetchResult
where
    T: Cacheable,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    let mut attempt = 0;
    loop {
        match fetcher().await {
            Ok(value) => return Ok(value.into_data()),
            Err(error) if error.is_retryable() && attempt < options.retry_count => {
                attempt += 1;
                warn!(key = %key, attempt, error = %error, "Query fetch failed; retrying");
                if !options.retry_delay.is_zero() {
                    tokio::time::sleep(options.retry_delay).await;
                }
            }
            Err(error) => {
                warn!(key = %key, kind = error.kind(), error = %error, "Query fetch failed");
                return Err(error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use libris_api_types::Tag;

    use super::*;

    fn cache() -> QueryCache {
        QueryCache::new(CacheConfig {
            retry_delay: Duration::ZERO,
            ..CacheConfig::default()
        })
    }

    fn tags(names: &[&str]) -> Vec<Tag> {
        names
            .iter()
            .enumerate()
            .map(|(id, name)| Tag {
                id: id as i64,
                name: (*name).to_string(),
                color: None,
                book_count: 0,
            })
            .collect()
    }

    fn counting_fetcher(
        calls: Arc<AtomicUsize>,
        result: Result<Vec<Tag>, GatewayError>,
    ) -> impl Fn() -> BoxFuture<'static, Result<Vec<Tag>, GatewayError>> + Send + Sync + 'static
    {
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            let result = result.clone();
            async move { result }.boxed()
        }
    }

    #[tokio::test]
    async fn fresh_entries_are_served_without_fetching() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));

        let first: Vec<Tag> = cache
            .get(QueryKey::tags(), counting_fetcher(calls.clone(), Ok(tags(&["sf"]))))
            .await
            .expect("first read");
        let second: Vec<Tag> = cache
            .get(QueryKey::tags(), counting_fetcher(calls.clone(), Ok(tags(&["other"]))))
            .await
            .expect("second read");

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidation_forces_a_refetch() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = QueryKey::tags();

        let _: Vec<Tag> = cache
            .get(key.clone(), counting_fetcher(calls.clone(), Ok(tags(&["a"]))))
            .await
            .expect("first read");
        assert_eq!(cache.invalidate(&key), 1);
        assert!(cache.entry(&key).expect("entry kept").is_stale());

        let refreshed: Vec<Tag> = cache
            .get(key, counting_fetcher(calls.clone(), Ok(tags(&["b"]))))
            .await
            .expect("second read");
        assert_eq!(refreshed[0].name, "b");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retries_transient_errors_once() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let err = cache
            .get::<Vec<Tag>, _, _>(
                QueryKey::tags(),
                counting_fetcher(calls.clone(), Err(GatewayError::network("down"))),
            )
            .await
            .expect_err("fetch fails");
        assert_eq!(err.gateway(), Some(&GatewayError::network("down")));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let _ = cache
            .get::<Vec<Tag>, _, _>(
                QueryKey::tags(),
                counting_fetcher(calls.clone(), Err(GatewayError::not_found("tags"))),
            )
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_hides_previous_data() {
        let cache = cache();
        let key = QueryKey::tags();
        let calls = Arc::new(AtomicUsize::new(0));
        let _: Vec<Tag> = cache
            .get(key.clone(), counting_fetcher(calls.clone(), Ok(tags(&["a"]))))
            .await
            .expect("first read");
        cache.invalidate(&key);
        let _ = cache
            .get::<Vec<Tag>, _, _>(
                key.clone(),
                counting_fetcher(calls, Err(GatewayError::Forbidden {
                    message: "no".to_string(),
                })),
            )
            .await;

        let entry = cache.entry(&key).expect("entry");
        assert_eq!(entry.status, QueryStatus::Error);
        assert!(entry.data.is_none());
        assert!(cache.peek::<Vec<Tag>>(&key).is_none());
        let snapshot = cache.snapshot::<Vec<Tag>>(&key, None);
        assert!(snapshot.is_error());
        assert!(snapshot.data.is_none());
    }

    #[tokio::test]
    async fn set_data_keeps_the_staleness_baseline() {
        let cache = cache();
        let key = QueryKey::tags();
        assert!(cache.set_data::<Vec<Tag>, _>(&key, Baseline::Keep, |_| Some(tags(&["x"]))));
        assert!(cache.entry(&key).expect("entry").is_stale());

        assert!(cache.set_data::<Vec<Tag>, _>(&key, Baseline::Reset, |current| {
            let mut next = current.unwrap_or_default();
            next.extend(tags(&["y"]));
            Some(next)
        }));
        let entry = cache.entry(&key).expect("entry");
        assert!(entry.is_fresh());
        assert_eq!(cache.peek::<Vec<Tag>>(&key).map(|t| t.len()), Some(2));

        assert!(!cache.set_data::<Vec<Tag>, _>(&key, Baseline::Keep, |_| None));
    }

    #[tokio::test]
    async fn restore_keeps_newer_invalidation() {
        let cache = cache();
        let key = QueryKey::tags();
        cache.set_data::<Vec<Tag>, _>(&key, Baseline::Reset, |_| Some(tags(&["a"])));
        let snapshot = cache.entry(&key);

        cache.set_data::<Vec<Tag>, _>(&key, Baseline::Keep, |_| Some(tags(&["a", "b"])));
        let patched = cache.entry(&key).and_then(|entry| entry.data);
        cache.invalidate(&key);

        cache.restore(&key, snapshot.clone(), patched.as_ref());
        let restored = cache.entry(&key).expect("restored");
        assert_eq!(restored.data, snapshot.and_then(|entry| entry.data));
        assert!(restored.is_stale());
    }

    #[tokio::test]
    async fn restore_over_a_foreign_write_marks_stale() {
        let cache = cache();
        let key = QueryKey::tags();
        cache.set_data::<Vec<Tag>, _>(&key, Baseline::Reset, |_| Some(tags(&["a"])));
        let snapshot = cache.entry(&key);

        cache.set_data::<Vec<Tag>, _>(&key, Baseline::Keep, |_| Some(tags(&["a", "b"])));
        let patched = cache.entry(&key).and_then(|entry| entry.data);
        cache.set_data::<Vec<Tag>, _>(&key, Baseline::Keep, |_| Some(tags(&["c"])));

        cache.restore(&key, snapshot, patched.as_ref());
        assert!(cache.entry(&key).expect("restored").is_stale());
    }

    #[tokio::test]
    async fn untouched_restore_is_exact() {
        let cache = cache();
        let key = QueryKey::tags();
        cache.set_data::<Vec<Tag>, _>(&key, Baseline::Reset, |_| Some(tags(&["a"])));
        let snapshot = cache.entry(&key);
        cache.set_data::<Vec<Tag>, _>(&key, Baseline::Keep, |_| Some(tags(&["a", "b"])));
        let patched = cache.entry(&key).and_then(|entry| entry.data);

        cache.restore(&key, snapshot.clone(), patched.as_ref());
        assert_eq!(cache.entry(&key), snapshot);
        assert!(cache.entry(&key).expect("restored").is_fresh());
    }

    #[tokio::test]
    async fn capacity_bound_evicts_least_recent() {
        let cache = QueryCache::new(CacheConfig {
            capacity: NonZeroUsize::new(2).expect("non-zero"),
            ..CacheConfig::default()
        });
        for id in 1..=3 {
            cache.set_data::<Vec<Tag>, _>(&QueryKey::book_detail(id), Baseline::Reset, |_| {
                Some(Vec::new())
            });
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.entry(&QueryKey::book_detail(1)).is_none());
    }

    #[tokio::test]
    async fn keep_previous_shows_last_page_while_loading() {
        use crate::infra::gateway::BookQuery;
        use libris_api_types::{Book, PageResponse};

        let cache = cache();
        let first = QueryKey::books_list(&BookQuery::default());
        let second = QueryKey::books_list(&BookQuery {
            page: 1,
            ..Default::default()
        });
        cache.set_data::<PageResponse<Book>, _>(&first, Baseline::Reset, |_| {
            Some(PageResponse::empty(0, 12))
        });

        let snapshot = cache.snapshot::<PageResponse<Book>>(&second, Some(&first));
        assert!(snapshot.is_previous_data);
        assert_eq!(snapshot.data.map(|page| page.number), Some(0));

        let detail = cache.snapshot::<Book>(&QueryKey::book_detail(1), Some(&first));
        assert!(detail.data.is_none());
    }
}
