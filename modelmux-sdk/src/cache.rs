//! # Response Caching
//!
//! Two logical caches share the mechanics in this module: the response cache
//! (fingerprint to completed chat response) and the summary cache used by the
//! context condenser. Each is an in-memory store with TTL expiry, LRU
//! ordering, byte-size accounting and optional gzip compression of large
//! entries.
//!
//! The response cache adds **single-flight** coalescing: for any fingerprint
//! at most one upstream call is in flight. The first caller to miss becomes
//! the leader and receives a [`FlightToken`]; concurrent callers attach to a
//! broadcast channel and share whatever outcome the leader publishes. A
//! leader that disappears without publishing releases its waiters with an
//! error instead of leaving them hanging.
//!
//! Invalidation is by exact key, key prefix (`chat:`, `summary:`, ...) or
//! global, and takes effect before the next lookup returns.

use crate::error::ProviderError;
use crate::models::ChatResponse;
use dashmap::DashMap;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use lru::LruCache;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Tuning for one cache instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    pub enabled: bool,
    /// Byte budget across all entries
    pub max_bytes: u64,
    /// Entry-count budget
    pub max_entries: usize,
    #[serde(with = "crate::common::duration_serde")]
    pub ttl: Duration,
    /// Compress entries larger than `compression_threshold`
    pub compression: bool,
    pub compression_threshold: usize,
    /// Entries larger than this are never admitted
    pub max_entry_bytes: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_bytes: 64 * 1024 * 1024,
            max_entries: 10_000,
            ttl: Duration::from_secs(300),
            compression: true,
            compression_threshold: 4 * 1024,
            max_entry_bytes: 4 * 1024 * 1024,
        }
    }
}

#[derive(Debug)]
struct StoredEntry {
    payload: Vec<u8>,
    compressed: bool,
    expires_at: Instant,
    size_bytes: usize,
    hit_count: u64,
}

/// Counters for one cache instance.
#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    invalidations: AtomicU64,
    coalesced: AtomicU64,
}

/// Point-in-time cache statistics for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub inserts: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub invalidations: u64,
    pub coalesced_waiters: u64,
}

/// TTL + LRU + byte-budget store of serialized payloads.
///
/// The LRU map is guarded by one mutex; every operation holds it only for
/// map manipulation, never across serialization or I/O.
pub struct MemoryCache {
    entries: Mutex<LruCache<String, StoredEntry>>,
    total_bytes: AtomicU64,
    settings: Mutex<CacheSettings>,
    counters: Counters,
}

impl MemoryCache {
    pub fn new(settings: CacheSettings) -> Self {
        // Budgets are enforced manually below so that a hot-reloaded
        // max_entries takes effect and every eviction updates the byte
        // accounting.
        Self {
            entries: Mutex::new(LruCache::unbounded()),
            total_bytes: AtomicU64::new(0),
            settings: Mutex::new(settings),
            counters: Counters::default(),
        }
    }

    /// Fetch and deserialize an entry, touching its LRU position.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let settings = self.settings.lock().unwrap().clone();
        if !settings.enabled {
            return None;
        }

        let payload = {
            let mut entries = self.entries.lock().unwrap();
            match entries.get_mut(key) {
                Some(entry) if entry.expires_at > Instant::now() => {
                    entry.hit_count += 1;
                    Some((entry.payload.clone(), entry.compressed))
                }
                Some(_) => {
                    if let Some(old) = entries.pop(key) {
                        self.total_bytes
                            .fetch_sub(old.size_bytes as u64, Ordering::Relaxed);
                        self.counters.expirations.fetch_add(1, Ordering::Relaxed);
                    }
                    None
                }
                None => None,
            }
        };

        match payload {
            Some((bytes, compressed)) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                let raw = if compressed {
                    decompress(&bytes).ok()?
                } else {
                    bytes
                };
                serde_json::from_slice(&raw).ok()
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Serialize and store an entry under the configured TTL.
    ///
    /// Oversized entries are rejected; budget pressure evicts least recently
    /// used entries until both the byte and entry budgets hold.
    pub fn put<T: Serialize>(&self, key: &str, value: &T) {
        self.put_with_ttl(key, value, None)
    }

    pub fn put_with_ttl<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        let settings = self.settings.lock().unwrap().clone();
        if !settings.enabled {
            return;
        }
        let Ok(raw) = serde_json::to_vec(value) else {
            return;
        };
        if raw.len() > settings.max_entry_bytes {
            tracing::debug!(key, size = raw.len(), "cache entry over size cap, not admitted");
            return;
        }

        let (payload, compressed) =
            if settings.compression && raw.len() >= settings.compression_threshold {
                match compress(&raw) {
                    Ok(packed) if packed.len() < raw.len() => (packed, true),
                    _ => (raw, false),
                }
            } else {
                (raw, false)
            };

        let entry = StoredEntry {
            size_bytes: payload.len(),
            payload,
            compressed,
            expires_at: Instant::now() + ttl.unwrap_or(settings.ttl),
            hit_count: 0,
        };

        let mut entries = self.entries.lock().unwrap();
        if let Some(old) = entries.pop(key) {
            self.total_bytes
                .fetch_sub(old.size_bytes as u64, Ordering::Relaxed);
        }
        self.total_bytes
            .fetch_add(entry.size_bytes as u64, Ordering::Relaxed);
        entries.put(key.to_string(), entry);
        self.counters.inserts.fetch_add(1, Ordering::Relaxed);

        while entries.len() > settings.max_entries
            || self.total_bytes.load(Ordering::Relaxed) > settings.max_bytes
        {
            match entries.pop_lru() {
                Some((_, evicted)) => {
                    self.total_bytes
                        .fetch_sub(evicted.size_bytes as u64, Ordering::Relaxed);
                    self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            }
        }
    }

    /// Remove one entry. Returns whether it existed.
    pub fn invalidate(&self, key: &str) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.pop(key) {
            Some(old) => {
                self.total_bytes
                    .fetch_sub(old.size_bytes as u64, Ordering::Relaxed);
                self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Remove every entry whose key starts with `prefix`. Returns the count.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let doomed: Vec<String> = entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            if let Some(old) = entries.pop(key) {
                self.total_bytes
                    .fetch_sub(old.size_bytes as u64, Ordering::Relaxed);
            }
        }
        self.counters
            .invalidations
            .fetch_add(doomed.len() as u64, Ordering::Relaxed);
        doomed.len()
    }

    pub fn clear(&self) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let count = entries.len();
        entries.clear();
        self.total_bytes.store(0, Ordering::Relaxed);
        self.counters
            .invalidations
            .fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    /// Drop expired entries. Called from the periodic sweep task.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        let doomed: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            if let Some(old) = entries.pop(key) {
                self.total_bytes
                    .fetch_sub(old.size_bytes as u64, Ordering::Relaxed);
                self.counters.expirations.fetch_add(1, Ordering::Relaxed);
            }
        }
        doomed.len()
    }

    /// Evict least recently used entries until total bytes drop to
    /// `low_water`. Wired to the process memory-pressure signal.
    pub fn sweep_to_low_water(&self, low_water: u64) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let mut evicted = 0;
        while self.total_bytes.load(Ordering::Relaxed) > low_water {
            match entries.pop_lru() {
                Some((_, old)) => {
                    self.total_bytes
                        .fetch_sub(old.size_bytes as u64, Ordering::Relaxed);
                    self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                    evicted += 1;
                }
                None => break,
            }
        }
        evicted
    }

    /// Replace tuning parameters; existing entries keep their expiry.
    pub fn update_settings(&self, settings: CacheSettings) {
        *self.settings.lock().unwrap() = settings;
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.lock().unwrap().len();
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            entries,
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            hits,
            misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            inserts: self.counters.inserts.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            coalesced_waiters: self.counters.coalesced.load(Ordering::Relaxed),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn compress(raw: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(raw)?;
    encoder.finish()
}

fn decompress(packed: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(packed);
    let mut raw = Vec::new();
    decoder.read_to_end(&mut raw)?;
    Ok(raw)
}

/// Outcome shared between a single-flight leader and its waiters.
pub type FlightOutcome = Result<ChatResponse, ProviderError>;

/// What a cache lookup resolved to.
pub enum Flight {
    /// Fresh entry served from the store
    Hit(ChatResponse),
    /// This caller must perform the upstream call and publish the result
    Leader(FlightToken),
    /// Another caller is already in flight; wait on this receiver
    Follower(broadcast::Receiver<FlightOutcome>),
}

/// Leadership over one in-flight fingerprint.
///
/// Dropping the token without publishing releases waiters with an internal
/// error so nobody waits past the leader's demise.
pub struct FlightToken {
    key: String,
    tx: broadcast::Sender<FlightOutcome>,
    inflight: Arc<DashMap<String, broadcast::Sender<FlightOutcome>>>,
    published: bool,
}

impl FlightToken {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for FlightToken {
    fn drop(&mut self) {
        if !self.published {
            self.inflight.remove(&self.key);
            let _ = self.tx.send(Err(ProviderError::Internal {
                message: "in-flight request abandoned".to_string(),
            }));
        }
    }
}

/// The response cache: a [`MemoryCache`] plus single-flight coalescing.
pub struct ResponseCache {
    store: MemoryCache,
    inflight: Arc<DashMap<String, broadcast::Sender<FlightOutcome>>>,
}

impl ResponseCache {
    pub fn new(settings: CacheSettings) -> Self {
        Self {
            store: MemoryCache::new(settings),
            inflight: Arc::new(DashMap::new()),
        }
    }

    /// Look up a fingerprint, joining or starting a flight on miss.
    ///
    /// Invalidations that happened before this call are visible: the store
    /// is consulted under its lock before any flight bookkeeping.
    pub fn lookup_or_lead(&self, key: &str) -> Flight {
        if let Some(response) = self.store.get::<ChatResponse>(key) {
            return Flight::Hit(response);
        }

        // Entry API keeps exactly one leader per key: whoever inserts the
        // sender leads, everyone else subscribes to it.
        match self.inflight.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(occupied) => {
                self.store.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                Flight::Follower(occupied.get().subscribe())
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let (tx, _) = broadcast::channel(1);
                vacant.insert(tx.clone());
                Flight::Leader(FlightToken {
                    key: key.to_string(),
                    tx,
                    inflight: Arc::clone(&self.inflight),
                    published: false,
                })
            }
        }
    }

    /// Publish the leader's outcome: store successes, then release waiters.
    ///
    /// `store` is false for outcomes that must not be cached, e.g. a
    /// response that arrived after the requester's deadline.
    pub fn publish(&self, mut token: FlightToken, outcome: FlightOutcome, store: bool) {
        if store {
            if let Ok(response) = &outcome {
                self.store.put(&token.key, response);
            }
        }
        self.inflight.remove(&token.key);
        token.published = true;
        let _ = token.tx.send(outcome);
    }

    pub fn get(&self, key: &str) -> Option<ChatResponse> {
        self.store.get(key)
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.store.invalidate(key)
    }

    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        self.store.invalidate_prefix(prefix)
    }

    pub fn clear(&self) -> usize {
        self.store.clear()
    }

    pub fn sweep_expired(&self) -> usize {
        self.store.sweep_expired()
    }

    pub fn sweep_to_low_water(&self, low_water: u64) -> usize {
        self.store.sweep_to_low_water(low_water)
    }

    pub fn update_settings(&self, settings: CacheSettings) {
        self.store.update_settings(settings)
    }

    pub fn stats(&self) -> CacheStats {
        self.store.stats()
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }
}
