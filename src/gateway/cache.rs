//! Time-bounded read cache for idempotent backend calls.
//!
//! Entries expire `ttl` after insertion and are dropped lazily on read, or in
//! bulk by [`TtlCache::purge_expired`]. There is no invalidation path, so only
//! read-only calls may go through here.

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use crate::config::CacheConfig;

// -----------------------------------------------------------------------------
// ----- CacheKey --------------------------------------------------------------

/// Canonical form of `(principal, operation, args)`.
///
/// The principal is part of the key since the backend answers per principal.
/// Object keys are sorted recursively, so `{a:1,b:2}` and `{b:2,a:1}` produce
/// the same key. Array order is kept, since positional arguments are ordered.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Returns `None` when the arguments cannot be normalized (their
    /// serialization fails); callers then skip the cache for that call.
    pub fn for_call<A>(principal_id: i64, operation: &str, args: &A) -> Option<CacheKey>
    where
        A: Serialize + ?Sized,
    {
        let value = serde_json::to_value(args).ok()?;
        let operation = serde_json::to_string(operation).ok()?;

        let mut out = String::with_capacity(operation.len() + 64);
        out.push_str(&principal_id.to_string());
        out.push('|');
        out.push_str(&operation);
        out.push('|');
        write_canonical(&value, &mut out);
        Some(CacheKey(out))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// -----------------------------------------------------------------------------
// ----- TtlCache --------------------------------------------------------------

#[derive(Debug)]
pub struct TtlCache<V> {
    /// `None` when the cache is configured as a pass-through.
    entries: Option<Mutex<LruCache<CacheKey, CacheEntry<V>>>>,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

// -----------------------------------------------------------------------------
// ----- TtlCache: Static ------------------------------------------------------

impl<V: Clone> TtlCache<V> {
    pub fn new(max_entries: usize, default_ttl: Duration) -> Self {
        let entries = NonZeroUsize::new(max_entries).map(|cap| Mutex::new(LruCache::new(cap)));

        Self {
            entries,
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.max_entries, config.default_ttl)
    }
}

// -----------------------------------------------------------------------------
// ----- TtlCache: Public ------------------------------------------------------

impl<V: Clone> TtlCache<V> {
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Returns the live entry for `key`, or runs `compute` and stores its
    /// result for `ttl`. Errors from `compute` are returned and not stored.
    /// A zero `ttl` bypasses the cache entirely.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        compute: F,
    ) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let Some(entries) = self.entries.as_ref().filter(|_| !ttl.is_zero()) else {
            return compute().await;
        };

        if let Some(value) = lookup(entries, key, Instant::now()) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(value);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        // Not holding the lock here: concurrent misses on the same key may
        // both compute; the last writer wins.
        let value = compute().await?;

        entries.lock().put(
            key.clone(),
            CacheEntry {
                value: value.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(value)
    }

    pub fn get(&self, key: &CacheKey) -> Option<V> {
        lookup(self.entries.as_ref()?, key, Instant::now())
    }

    /// Drops every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let Some(entries) = &self.entries else {
            return 0;
        };

        let now = Instant::now();
        let mut entries = entries.lock();
        let expired: Vec<CacheKey> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            entries.pop(key);
        }

        if !expired.is_empty() {
            debug!(removed = expired.len(), remaining = entries.len(), "purged expired cache entries");
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, |entries| entries.lock().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let (entries, capacity) = match &self.entries {
            Some(entries) => {
                let entries = entries.lock();
                (entries.len(), entries.cap().get())
            }
            None => (0, 0),
        };

        CacheStats {
            entries,
            capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: Helpers -----------------------------------------------------

fn lookup<V: Clone>(
    entries: &Mutex<LruCache<CacheKey, CacheEntry<V>>>,
    key: &CacheKey,
    now: Instant,
) -> Option<V> {
    let mut entries = entries.lock();

    let expired = entries.peek(key)?.is_expired(now);
    if expired {
        entries.pop(key);
        return None;
    }

    entries.get(key).map(|entry| entry.value.clone())
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut fields: Vec<(&String, &Value)> = map.iter().collect();
            fields.sort_unstable_by(|a, b| a.0.cmp(b.0));

            out.push('{');
            for (i, (key, field)) in fields.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::from(key.as_str()).to_string());
                out.push(':');
                write_canonical(field, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
