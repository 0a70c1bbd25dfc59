// =============================================================================
// Resolution Cache: TTL + LRU over symbol resolutions, with a reverse
// company-name index and single-flight coalescing
// =============================================================================
//
// Key = canonical query tuple. Entries expire after five minutes and the
// least-recently-used entry is evicted beyond capacity. When a cached match
// carries a company name, a normalised-name pointer is kept so a later query
// by company name short-circuits without a remote call.
//
// Invalidation is all-or-nothing: a broker disconnect clears everything,
// because the contract universe can differ across sessions.
//
// Failures never enter the cache; only non-empty successful resolutions do.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::resolve::resolver::{ResolutionOutcome, ResolutionQuery};
use crate::types::SecType;

const RESOLUTION_TTL: Duration = Duration::from_secs(300);
const DEFAULT_CAPACITY: usize = 1000;

// ---------------------------------------------------------------------------
// Key
// ---------------------------------------------------------------------------

/// Canonical cache key derived from a resolution query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub input: String,
    pub exchange: Option<String>,
    pub currency: Option<String>,
    pub sec_type: SecType,
    pub max_results: u32,
    pub prefer_native: bool,
}

impl CacheKey {
    pub fn from_query(query: &ResolutionQuery) -> Self {
        Self {
            input: query.raw_input.trim().to_lowercase(),
            exchange: query.exchange_hint.as_ref().map(|e| e.to_uppercase()),
            currency: query.currency_hint.as_ref().map(|c| c.to_uppercase()),
            sec_type: query.sec_type,
            max_results: query.max_results,
            prefer_native: query.prefer_native_exchange,
        }
    }
}

/// Company-name normalisation for the reverse index: lowercased, trimmed,
/// internal whitespace collapsed.
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Counters exposed via the CACHE_STATS synthetic query.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hit_rate: f64,
    pub total_requests: u64,
    pub reverse_lookup_hits: u64,
    pub memory_entries: usize,
    pub avg_response_ms_hit: f64,
    pub avg_response_ms_miss: f64,
    pub api_calls_by_kind: HashMap<String, u64>,
}

#[derive(Default)]
struct StatsInner {
    total_requests: u64,
    hits: u64,
    reverse_hits: u64,
    hit_ms_total: f64,
    hit_samples: u64,
    miss_ms_total: f64,
    miss_samples: u64,
    api_calls_by_kind: HashMap<String, u64>,
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

struct Entry {
    outcome: ResolutionOutcome,
    inserted_at: Instant,
    last_access: Instant,
    hit_count: u64,
}

pub struct ResolutionCache {
    entries: Mutex<HashMap<CacheKey, Entry>>,
    reverse: Mutex<HashMap<String, CacheKey>>,
    /// Per-key flight locks: the holder performs the remote lookup while
    /// concurrent callers for the same key queue and then re-check the cache.
    flights: Mutex<HashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>>,
    stats: Mutex<StatsInner>,
    ttl: Duration,
    capacity: usize,
}

impl ResolutionCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            reverse: Mutex::new(HashMap::new()),
            flights: Mutex::new(HashMap::new()),
            stats: Mutex::new(StatsInner::default()),
            ttl: RESOLUTION_TTL,
            capacity,
        }
    }

    // -------------------------------------------------------------------------
    // Lookup / insert
    // -------------------------------------------------------------------------

    /// Fresh outcome for `key`, touching LRU order. Expired entries are
    /// removed on access.
    pub fn get(&self, key: &CacheKey) -> Option<ResolutionOutcome> {
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if entry.inserted_at.elapsed() <= self.ttl => {
                entry.last_access = Instant::now();
                entry.hit_count += 1;
                Some(entry.outcome.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Store a successful resolution and index its company names.
    pub fn insert(&self, key: CacheKey, outcome: ResolutionOutcome) {
        {
            let mut reverse = self.reverse.lock();
            for m in &outcome.matches {
                if let Some(name) = &m.name {
                    let normalized = normalize_name(name);
                    if !normalized.is_empty() {
                        reverse.insert(normalized, key.clone());
                    }
                }
            }
        }

        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.insert(
            key,
            Entry {
                outcome,
                inserted_at: now,
                last_access: now,
                hit_count: 0,
            },
        );

        // Evict least-recently-used entries beyond capacity.
        while entries.len() > self.capacity {
            let lru_key = entries
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone());
            match lru_key {
                Some(k) => {
                    entries.remove(&k);
                    debug!("resolution cache evicted LRU entry");
                }
                None => break,
            }
        }
    }

    /// Resolve a company name through the reverse index. Stale pointers are
    /// pruned as they are discovered.
    pub fn reverse_lookup(&self, name: &str) -> Option<ResolutionOutcome> {
        let normalized = normalize_name(name);
        let key = self.reverse.lock().get(&normalized).cloned()?;
        match self.get(&key) {
            Some(outcome) => {
                self.stats.lock().reverse_hits += 1;
                debug!(name = %normalized, "reverse lookup hit");
                Some(outcome)
            }
            None => {
                self.reverse.lock().remove(&normalized);
                None
            }
        }
    }

    /// Drop everything. Called on broker disconnect and CLEAR_CACHE.
    pub fn invalidate_all(&self) {
        let mut entries = self.entries.lock();
        let n = entries.len();
        entries.clear();
        self.reverse.lock().clear();
        info!(dropped = n, "resolution cache invalidated");
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    // -------------------------------------------------------------------------
    // Single-flight coalescing
    // -------------------------------------------------------------------------

    /// Flight lock for `key`. The caller that acquires it first performs the
    /// remote lookup; everyone else re-checks the cache after acquiring.
    pub fn flight_lock(&self, key: &CacheKey) -> Arc<tokio::sync::Mutex<()>> {
        self.flights
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drop the flight entry once the leader has finished. Queued followers
    /// keep their clones and drain naturally.
    pub fn release_flight(&self, key: &CacheKey) {
        self.flights.lock().remove(key);
    }

    // -------------------------------------------------------------------------
    // Stats
    // -------------------------------------------------------------------------

    pub fn record_hit(&self, elapsed_ms: f64) {
        let mut s = self.stats.lock();
        s.total_requests += 1;
        s.hits += 1;
        s.hit_ms_total += elapsed_ms;
        s.hit_samples += 1;
    }

    pub fn record_miss(&self, elapsed_ms: f64) {
        let mut s = self.stats.lock();
        s.total_requests += 1;
        s.miss_ms_total += elapsed_ms;
        s.miss_samples += 1;
    }

    pub fn record_api_call(&self, kind: &str) {
        *self
            .stats
            .lock()
            .api_calls_by_kind
            .entry(kind.to_string())
            .or_insert(0) += 1;
    }

    pub fn stats(&self) -> CacheStats {
        let s = self.stats.lock();
        CacheStats {
            hit_rate: if s.total_requests > 0 {
                s.hits as f64 / s.total_requests as f64
            } else {
                0.0
            },
            total_requests: s.total_requests,
            reverse_lookup_hits: s.reverse_hits,
            memory_entries: self.entries.lock().len(),
            avg_response_ms_hit: if s.hit_samples > 0 {
                s.hit_ms_total / s.hit_samples as f64
            } else {
                0.0
            },
            avg_response_ms_miss: if s.miss_samples > 0 {
                s.miss_ms_total / s.miss_samples as f64
            } else {
                0.0
            },
            api_calls_by_kind: s.api_calls_by_kind.clone(),
        }
    }
}

impl Default for ResolutionCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ResolutionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolutionCache")
            .field("entries", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
