use fnv::FnvHasher;
use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// A 64-bit FNV-1a hash identifying a cache entry.
pub type CacheKey = u64;

/// Hashes the concatenation of the provided byte slices.
pub fn cache_key_bytes(parts: &[&[u8]]) -> CacheKey {
    let mut h = FnvHasher::default();
    for p in parts {
        h.write(p);
    }
    h.finish()
}

/// Hashes a single string.
pub fn cache_key_str(s: &str) -> CacheKey {
    cache_key_bytes(&[s.as_bytes()])
}

/// 5 min in milliseconds
const DEFAULT_EXPIRE: i64 = 5 * 60 * 1000;
/// 1 min in milliseconds
const DEFAULT_INTERVAL: i64 = 60 * 1000;

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

type ReleaseCallback<V> = Arc<dyn Fn(CacheKey, V) + Send + Sync>;

struct ExpireEntry<V> {
    value: V,
    peek: i64,
}

struct Inner<V> {
    store: Mutex<HashMap<CacheKey, ExpireEntry<V>>>,
    expire: i64,
    interval: i64,
    next: AtomicI64,
    gate: Mutex<()>,
    on_release: Mutex<Option<ReleaseCallback<V>>>,
}

/// An expiring map keyed by [`CacheKey`].
///
/// Every `get`/`set` refreshes the entry's peek time and may schedule a
/// sweep. A sweep runs at most once per `interval` and removes entries
/// whose last peek is older than `expire`, invoking the release callback
/// for each removed value. The cache does not bound its size; expiry is
/// its only pressure mechanism.
pub struct ExpireCache<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for ExpireCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Clone + Send + 'static> ExpireCache<V> {
    /// Creates a cache with the specified expire (ms) and the default
    /// 1 min interval.
    pub fn new(expire_ms: i64) -> Self {
        Self::with_interval(expire_ms, 0)
    }

    /// Creates a cache with the specified expire (ms) and interval (ms).
    /// Non-positive values fall back to the defaults (5 min, 1 min).
    pub fn with_interval(expire_ms: i64, interval_ms: i64) -> Self {
        let expire = if expire_ms <= 0 {
            DEFAULT_EXPIRE
        } else {
            expire_ms
        };
        let interval = if interval_ms <= 0 {
            DEFAULT_INTERVAL
        } else {
            interval_ms
        };
        Self {
            inner: Arc::new(Inner {
                store: Mutex::new(HashMap::new()),
                expire,
                interval,
                next: AtomicI64::new(now_millis() + interval),
                gate: Mutex::new(()),
                on_release: Mutex::new(None),
            }),
        }
    }

    /// Installs the callback invoked for each value removed by a sweep,
    /// an overwrite or an explicit `del`.
    pub fn on_release<F>(&self, cb: F)
    where
        F: Fn(CacheKey, V) + Send + Sync + 'static,
    {
        *self.inner.on_release.lock().expect("cache lock poisoned") = Some(Arc::new(cb));
    }

    /// Returns a clone of the value mapped to `key` and extends its
    /// expiration.
    pub fn get(&self, key: CacheKey) -> Option<V> {
        let now = now_millis();
        let value = {
            let mut store = self.inner.store.lock().expect("cache lock poisoned");
            store.get_mut(&key).map(|entry| {
                entry.peek = now;
                entry.value.clone()
            })
        };
        self.maybe_sweep(now);
        value
    }

    /// Stores `value` under `key`. A value already present under the same
    /// key is released.
    pub fn set(&self, key: CacheKey, value: V) {
        let now = now_millis();
        let old = {
            let mut store = self.inner.store.lock().expect("cache lock poisoned");
            store.insert(key, ExpireEntry { value, peek: now })
        };
        if let Some(entry) = old {
            self.release(key, entry.value);
        }
        self.maybe_sweep(now);
    }

    /// Removes `key` immediately, firing the release callback.
    pub fn del(&self, key: CacheKey) {
        let removed = {
            let mut store = self.inner.store.lock().expect("cache lock poisoned");
            store.remove(&key)
        };
        if let Some(entry) = removed {
            self.release(key, entry.value);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.store.lock().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Double-checked sweep gate: cheap atomic read first, mutex re-check
    /// second, so readers never contend when no sweep is due.
    fn maybe_sweep(&self, now: i64) {
        if now < self.inner.next.load(Ordering::Relaxed) {
            return;
        }
        {
            let _gate = self.inner.gate.lock().expect("cache gate poisoned");
            if now < self.inner.next.load(Ordering::Relaxed) {
                return;
            }
            self.inner
                .next
                .store(now + self.inner.interval, Ordering::Relaxed);
        }
        let cache = self.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { cache.sweep(now, true) });
            }
            Err(_) => cache.sweep(now, false),
        }
    }

    fn sweep(&self, now: i64, detach: bool) {
        let expired: Vec<(CacheKey, V)> = {
            let mut store = self.inner.store.lock().expect("cache lock poisoned");
            let keys: Vec<CacheKey> = store
                .iter()
                .filter(|(_, e)| now - e.peek > self.inner.expire)
                .map(|(k, _)| *k)
                .collect();
            keys.into_iter()
                .filter_map(|k| store.remove(&k).map(|e| (k, e.value)))
                .collect()
        };
        if !expired.is_empty() {
            debug!(count = expired.len(), "cache sweep removed entries");
        }
        for (key, value) in expired {
            if detach {
                // One detached task per evicted value so a slow callback
                // cannot stall the sweeper.
                let cb = self.callback();
                if let Some(cb) = cb {
                    tokio::spawn(async move { cb(key, value) });
                }
            } else {
                self.release(key, value);
            }
        }
    }

    fn callback(&self) -> Option<ReleaseCallback<V>> {
        self.inner
            .on_release
            .lock()
            .expect("cache lock poisoned")
            .clone()
    }

    fn release(&self, key: CacheKey, value: V) {
        if let Some(cb) = self.callback() {
            cb(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_cache_key_is_fnv1a() {
        // FNV-1a of an empty input is the offset basis.
        assert_eq!(cache_key_bytes(&[]), 0xcbf29ce484222325);
        // Concatenation, not per-slice mixing.
        assert_eq!(
            cache_key_bytes(&[b"GET", b"\0", b"/index.html"]),
            cache_key_bytes(&[b"GET\0/index.html"])
        );
        assert_ne!(cache_key_str("GET /a"), cache_key_str("GET /b"));
    }

    #[test]
    fn test_get_set_del() {
        let cache: ExpireCache<String> = ExpireCache::new(1000);
        assert!(cache.get(1).is_none());
        cache.set(1, "one".to_string());
        assert_eq!(cache.get(1).as_deref(), Some("one"));
        assert_eq!(cache.len(), 1);

        cache.set(1, "uno".to_string());
        assert_eq!(cache.get(1).as_deref(), Some("uno"));
        assert_eq!(cache.len(), 1);

        cache.del(1);
        assert!(cache.get(1).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_release_on_del_and_overwrite() {
        let released = Arc::new(AtomicUsize::new(0));
        let cache: ExpireCache<String> = ExpireCache::new(1000);
        let counter = Arc::clone(&released);
        cache.on_release(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        cache.set(7, "a".to_string());
        cache.set(7, "b".to_string());
        assert_eq!(released.load(Ordering::SeqCst), 1);
        cache.del(7);
        assert_eq!(released.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_expiry_sweep_fires_release_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let cache: ExpireCache<String> = ExpireCache::with_interval(20, 10);
        let counter = Arc::clone(&released);
        cache.on_release(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        cache.set(1, "short-lived".to_string());
        tokio::time::sleep(Duration::from_millis(60)).await;
        // An unrelated access schedules the sweep.
        let _ = cache.get(2);
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(cache.is_empty());
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_refreshes_peek() {
        let cache: ExpireCache<u32> = ExpireCache::with_interval(80, 10);
        cache.set(1, 42);
        for _ in 0..6 {
            tokio::time::sleep(Duration::from_millis(30)).await;
            assert_eq!(cache.get(1), Some(42));
        }
        // Still present well past the original expire horizon.
        assert_eq!(cache.len(), 1);
    }
}
