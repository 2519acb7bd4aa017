//! In-memory lookup cache with expiry, optional LRU capacity and single-flight.
//!
//! [`LookupCache`] maps a fingerprint to a previously computed value. Expiry
//! is checked lazily on read. When a capacity is configured, inserting past
//! it evicts the least-recently-used entry.
//!
//! [`LookupCache::get_or_try_insert_with`] coalesces concurrent misses: the
//! first caller for a key runs the fetch, every other caller awaits that
//! outcome instead of issuing its own call. If the leading caller is
//! cancelled, one of the waiters takes over.
//!
//! Time is read from `tokio::time::Instant` so tests can drive expiry with a
//! paused clock.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Expiry used when `now + ttl` does not fit in an [`Instant`].
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Where a value returned by [`LookupCache::get_or_try_insert_with`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    /// A live entry was already cached.
    Hit,
    /// Another caller's in-flight fetch produced it.
    Coalesced,
    /// This caller ran the fetch.
    Fetched,
}

/// A value plus its provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct Cached<V> {
    pub value: V,
    pub source: CacheSource,
}

/// Counters for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub evictions: u64,
    pub expirations: u64,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct Entry<V> {
    value: V,
    #[allow(dead_code)]
    created_at: Instant,
    expires_at: Instant,
    /// Recency stamp, key into `Inner::recency`.
    tick: u64,
}

type Flight<V, E> = watch::Receiver<Option<Result<V, E>>>;

struct Inner<V, E> {
    entries: HashMap<String, Entry<V>>,
    /// tick -> key, oldest first.
    recency: BTreeMap<u64, String>,
    next_tick: u64,
    in_flight: HashMap<String, Flight<V, E>>,
}

impl<V, E> Inner<V, E> {
    fn stamp(&mut self, key: &str) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        self.recency.insert(tick, key.to_string());
        tick
    }

    fn remove(&mut self, key: &str) -> Option<Entry<V>> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.tick);
        Some(entry)
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

enum Join<V, E> {
    Hit(V),
    Wait(Flight<V, E>),
    Lead(watch::Sender<Option<Result<V, E>>>),
}

// ---------------------------------------------------------------------------
// LookupCache
// ---------------------------------------------------------------------------

/// Concurrent TTL cache keyed by fingerprint.
///
/// `E` is the error type shared with single-flight waiters when a fetch fails.
/// Failures are never cached.
pub struct LookupCache<V, E> {
    inner: Mutex<Inner<V, E>>,
    capacity: Option<usize>,
    counters: Counters,
}

impl<V, E> LookupCache<V, E>
where
    V: Clone,
    E: Clone,
{
    /// Create a cache. `capacity: None` means unbounded.
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                recency: BTreeMap::new(),
                next_tick: 0,
                in_flight: HashMap::new(),
            }),
            capacity: capacity.filter(|c| *c > 0),
            counters: Counters::default(),
        }
    }

    /// The state is plain data and stays consistent across a panicking
    /// holder, so a poisoned lock is recovered rather than propagated.
    fn lock(&self) -> MutexGuard<'_, Inner<V, E>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Return the live value for `key`, dropping it if it has expired.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.lock();
        let value = self.live(&mut inner, key);
        match value {
            Some(_) => self.counters.hits.fetch_add(1, Ordering::Relaxed),
            None => self.counters.misses.fetch_add(1, Ordering::Relaxed),
        };
        value
    }

    /// Insert or replace `key`, expiring after `ttl`.
    pub fn set(&self, key: &str, value: V, ttl: Duration) {
        let mut inner = self.lock();
        self.insert(&mut inner, key, value, ttl);
    }

    /// Remove `key`. Returns whether a live or expired entry was present.
    pub fn invalidate(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    /// Drop every entry (in-flight fetches are unaffected).
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.recency.clear();
    }

    /// Eagerly drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.lock();
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            inner.remove(key);
        }
        self.counters
            .expirations
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired.len()
    }

    /// Number of stored entries, including not yet collected expired ones.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
        }
    }

    /// Return the cached value for `key`, or run `fetch` exactly once across
    /// all concurrent callers for the same key and cache a successful result.
    pub async fn get_or_try_insert_with<F>(
        &self,
        key: &str,
        ttl: Duration,
        fetch: F,
    ) -> Result<Cached<V>, E>
    where
        F: Future<Output = Result<V, E>>,
    {
        let sender = loop {
            match self.join(key) {
                Join::Hit(value) => {
                    return Ok(Cached {
                        value,
                        source: CacheSource::Hit,
                    });
                }
                Join::Wait(flight) => {
                    if let Some(outcome) = wait_for(flight).await {
                        self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                        return outcome.map(|value| Cached {
                            value,
                            source: CacheSource::Coalesced,
                        });
                    }
                    // The leader was cancelled; try again.
                    trace!(key, "in-flight leader dropped, rejoining");
                }
                Join::Lead(sender) => break sender,
            }
        };

        let mut guard = FlightGuard {
            cache: self,
            key,
            armed: true,
        };

        let outcome = fetch.await;

        {
            let mut inner = self.lock();
            if let Ok(value) = &outcome {
                self.insert(&mut inner, key, value.clone(), ttl);
            }
            inner.in_flight.remove(key);
            guard.armed = false;
        }
        sender.send_replace(Some(outcome.clone()));

        outcome.map(|value| Cached {
            value,
            source: CacheSource::Fetched,
        })
    }

    fn join(&self, key: &str) -> Join<V, E> {
        let mut inner = self.lock();
        if let Some(value) = self.live(&mut inner, key) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Join::Hit(value);
        }
        if let Some(flight) = inner.in_flight.get(key) {
            return Join::Wait(flight.clone());
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = watch::channel(None);
        inner.in_flight.insert(key.to_string(), receiver);
        Join::Lead(sender)
    }

    fn live(&self, inner: &mut Inner<V, E>, key: &str) -> Option<V> {
        let now = Instant::now();
        let expired = match inner.entries.get(key) {
            None => return None,
            Some(entry) => entry.expires_at <= now,
        };
        if expired {
            inner.remove(key);
            self.counters.expirations.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let tick = inner.stamp(key);
        let entry = inner.entries.get_mut(key)?;
        let old_tick = std::mem::replace(&mut entry.tick, tick);
        let value = entry.value.clone();
        inner.recency.remove(&old_tick);
        Some(value)
    }

    fn insert(&self, inner: &mut Inner<V, E>, key: &str, value: V, ttl: Duration) {
        inner.remove(key);

        if let Some(capacity) = self.capacity {
            while inner.entries.len() >= capacity {
                let Some((_, oldest)) = inner.recency.pop_first() else {
                    break;
                };
                inner.entries.remove(&oldest);
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(key = %oldest, "evicted least recently used entry");
            }
        }

        let now = Instant::now();
        let tick = inner.stamp(key);
        inner.entries.insert(
            key.to_string(),
            Entry {
                value,
                created_at: now,
                expires_at: expiry(now, ttl),
                tick,
            },
        );
    }
}

fn expiry(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Await a leader's outcome. `None` means the leader went away without one.
async fn wait_for<V: Clone, E: Clone>(mut flight: Flight<V, E>) -> Option<Result<V, E>> {
    loop {
        if let Some(outcome) = flight.borrow_and_update().clone() {
            return Some(outcome);
        }
        if flight.changed().await.is_err() {
            return flight.borrow().clone();
        }
    }
}

/// Clears the in-flight marker if the leading future is dropped mid-fetch.
struct FlightGuard<'a, V: Clone, E: Clone> {
    cache: &'a LookupCache<V, E>,
    key: &'a str,
    armed: bool,
}

impl<V: Clone, E: Clone> Drop for FlightGuard<'_, V, E> {
    fn drop(&mut self) {
        if self.armed {
            self.cache.lock().in_flight.remove(self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    type TestCache = LookupCache<String, String>;

    #[tokio::test(start_paused = true)]
    async fn get_returns_value_until_expiry() {
        let cache = TestCache::new(None);
        cache.set("k", "v".into(), Duration::from_secs(60));

        assert_eq!(cache.get("k").as_deref(), Some("v"));
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(cache.get("k").as_deref(), Some("v"));
        assert_eq!(cache.get("k").as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(cache.get("k"), None);
        assert!(cache.is_empty(), "expired entry is dropped on read");
        assert_eq!(cache.stats().expirations, 1);
    }

    #[tokio::test]
    async fn invalidate_removes_entry() {
        let cache = TestCache::new(None);
        cache.set("k", "v".into(), Duration::from_secs(60));
        assert!(cache.invalidate("k"));
        assert!(!cache.invalidate("k"));
        assert_eq!(cache.get("k"), None);
    }

    #[tokio::test]
    async fn set_replaces_value() {
        let cache = TestCache::new(None);
        cache.set("k", "a".into(), Duration::from_secs(60));
        cache.set("k", "b".into(), Duration::from_secs(60));
        assert_eq!(cache.get("k").as_deref(), Some("b"));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn huge_ttl_never_expires() {
        let cache = TestCache::new(None);
        cache.set("k", "v".into(), Duration::from_secs(u64::MAX));
        cache.set("m", "w".into(), Duration::MAX);
        assert_eq!(cache.get("k").as_deref(), Some("v"));
        assert_eq!(cache.get("m").as_deref(), Some("w"));
    }

    #[tokio::test]
    async fn lru_eviction_respects_recent_reads() {
        let cache = TestCache::new(Some(2));
        let ttl = Duration::from_secs(60);
        cache.set("a", "1".into(), ttl);
        cache.set("b", "2".into(), ttl);

        // Touch "a" so "b" becomes the least recently used.
        assert!(cache.get("a").is_some());
        cache.set("c", "3".into(), ttl);

        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn purge_expired_sweeps_only_dead_entries() {
        let cache = TestCache::new(None);
        cache.set("short", "1".into(), Duration::from_secs(5));
        cache.set("long", "2".into(), Duration::from_secs(500));
        tokio::time::advance(Duration::from_secs(10)).await;

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn fetch_result_is_cached() {
        let cache = TestCache::new(None);
        let ttl = Duration::from_secs(60);

        let first = cache
            .get_or_try_insert_with("k", ttl, async { Ok("v".to_string()) })
            .await
            .unwrap();
        assert_eq!(first.source, CacheSource::Fetched);

        let second = cache
            .get_or_try_insert_with("k", ttl, async { Ok("other".to_string()) })
            .await
            .unwrap();
        assert_eq!(second.source, CacheSource::Hit);
        assert_eq!(second.value, "v");
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let cache = TestCache::new(None);
        let ttl = Duration::from_secs(60);

        let err = cache
            .get_or_try_insert_with("k", ttl, async { Err::<String, _>("boom".to_string()) })
            .await
            .unwrap_err();
        assert_eq!(err, "boom");
        assert!(cache.get("k").is_none());

        let ok = cache
            .get_or_try_insert_with("k", ttl, async { Ok("v".to_string()) })
            .await
            .unwrap();
        assert_eq!(ok.source, CacheSource::Fetched);
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_fetch() {
        let cache = Arc::new(TestCache::new(None));
        let calls = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = watch::channel(false);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let calls = calls.clone();
            let mut release = release_rx.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_try_insert_with("same", Duration::from_secs(60), async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        while !*release.borrow_and_update() {
                            if release.changed().await.is_err() {
                                break;
                            }
                        }
                        Ok::<_, String>("shared".to_string())
                    })
                    .await
            }));
        }

        // Let every task reach the cache before the leader finishes.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        release_tx.send_replace(true);

        let mut sources = Vec::new();
        for handle in handles {
            let cached = handle.await.unwrap().unwrap();
            assert_eq!(cached.value, "shared");
            sources.push(cached.source);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            sources.iter().filter(|s| **s == CacheSource::Fetched).count(),
            1
        );
    }

    #[tokio::test]
    async fn waiters_share_leader_error() {
        let cache = Arc::new(TestCache::new(None));
        let calls = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = watch::channel(false);

        let spawn_one = |cache: Arc<TestCache>, calls: Arc<AtomicUsize>| {
            let mut release = release_rx.clone();
            tokio::spawn(async move {
                cache
                    .get_or_try_insert_with("k", Duration::from_secs(60), async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        let _ = release.wait_for(|r| *r).await;
                        Err::<String, _>("rate limited".to_string())
                    })
                    .await
            })
        };

        let a = spawn_one(cache.clone(), calls.clone());
        let b = spawn_one(cache.clone(), calls.clone());
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        release_tx.send_replace(true);

        assert_eq!(a.await.unwrap().unwrap_err(), "rate limited");
        assert_eq!(b.await.unwrap().unwrap_err(), "rate limited");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_leader_hands_over_to_waiter() {
        let cache = Arc::new(TestCache::new(None));

        let leader = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_try_insert_with("k", Duration::from_secs(60), async {
                        std::future::pending::<Result<String, String>>().await
                    })
                    .await
            })
        };
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_try_insert_with("k", Duration::from_secs(60), async {
                        Ok::<_, String>("from waiter".to_string())
                    })
                    .await
            })
        };
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        leader.abort();
        let cached = waiter.await.unwrap().unwrap();
        assert_eq!(cached.value, "from waiter");
        assert_eq!(cached.source, CacheSource::Fetched);
    }
}
