// =============================================================================
// Forex Rate Cache: 5-second TTL over the broker quote stream
// =============================================================================
//
// Keyed by canonical pair (6 uppercase letters). The supported set is the
// broker's USD-quoted and USD-based pairs; cross rates are derived by the
// engine via USD, which is why no direct cross pairs appear here.
//
// When the upstream returns non-finite or non-positive quotes (common
// outside liquid hours), a deterministic per-pair mock rate with a fixed
// plausible spread is substituted and marked `MockFallback` so callers can
// tell indicative values from live ones.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Cache TTL. Forex moves fast; five seconds keeps quotes honest while
/// absorbing bursts of conversion calls.
const RATE_TTL: Duration = Duration::from_secs(5);

/// Half-spread applied around a mock mid rate.
const MOCK_HALF_SPREAD: f64 = 0.0001;

/// Pairs the gateway will quote directly.
pub const SUPPORTED_PAIRS: &[&str] = &[
    "EURUSD", "GBPUSD", "AUDUSD", "NZDUSD", "USDJPY", "USDCHF", "USDCAD", "USDSGD", "USDHKD",
    "USDSEK", "USDNOK", "USDDKK", "USDMXN", "USDPLN", "USDCNH", "USDZAR", "USDTRY", "USDILS",
];

/// Deterministic mid rates used when the upstream quote is unusable.
const MOCK_MID_RATES: &[(&str, f64)] = &[
    ("EURUSD", 1.0850),
    ("GBPUSD", 1.2650),
    ("AUDUSD", 0.6550),
    ("NZDUSD", 0.6100),
    ("USDJPY", 148.50),
    ("USDCHF", 0.8800),
    ("USDCAD", 1.3600),
    ("USDSGD", 1.3400),
    ("USDHKD", 7.8200),
    ("USDSEK", 10.4500),
    ("USDNOK", 10.5500),
    ("USDDKK", 6.8700),
    ("USDMXN", 17.1000),
    ("USDPLN", 3.9800),
    ("USDCNH", 7.2400),
    ("USDZAR", 18.6000),
    ("USDTRY", 32.4000),
    ("USDILS", 3.6800),
];

// ---------------------------------------------------------------------------
// Rate model
// ---------------------------------------------------------------------------

/// Where a rate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RateSource {
    Live,
    MockFallback,
}

/// A cached quote for one pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForexRate {
    pub pair: String,
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    pub close: f64,
    pub timestamp: DateTime<Utc>,
    pub source: RateSource,
}

pub fn is_supported_pair(pair: &str) -> bool {
    SUPPORTED_PAIRS.contains(&pair)
}

/// Deterministic fallback rate for a supported pair, or None when the pair
/// has no seed entry.
pub fn mock_rate(pair: &str) -> Option<ForexRate> {
    let mid = MOCK_MID_RATES
        .iter()
        .find(|(p, _)| *p == pair)
        .map(|(_, mid)| *mid)?;
    Some(ForexRate {
        pair: pair.to_string(),
        bid: mid * (1.0 - MOCK_HALF_SPREAD),
        ask: mid * (1.0 + MOCK_HALF_SPREAD),
        last: mid,
        close: mid,
        timestamp: Utc::now(),
        source: RateSource::MockFallback,
    })
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

struct Entry {
    rate: ForexRate,
    inserted_at: Instant,
    hit_count: u64,
}

pub struct ForexCache {
    entries: Mutex<HashMap<String, Entry>>,
    ttl: Duration,
}

impl ForexCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl: RATE_TTL,
        }
    }

    #[cfg(test)]
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Fresh rate for `pair`, or None when absent or expired. Expired
    /// entries are removed on access.
    pub fn get(&self, pair: &str) -> Option<ForexRate> {
        let mut entries = self.entries.lock();
        match entries.get_mut(pair) {
            Some(entry) if entry.inserted_at.elapsed() <= self.ttl => {
                entry.hit_count += 1;
                Some(entry.rate.clone())
            }
            Some(_) => {
                entries.remove(pair);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, rate: ForexRate) {
        self.entries.lock().insert(
            rate.pair.clone(),
            Entry {
                rate,
                inserted_at: Instant::now(),
                hit_count: 0,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for ForexCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ForexCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForexCache")
            .field("entries", &self.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn live_rate(pair: &str, bid: f64, ask: f64) -> ForexRate {
        ForexRate {
            pair: pair.to_string(),
            bid,
            ask,
            last: (bid + ask) / 2.0,
            close: bid,
            timestamp: Utc::now(),
            source: RateSource::Live,
        }
    }

    #[test]
    fn get_returns_fresh_entries_and_counts_hits() {
        let cache = ForexCache::new();
        cache.insert(live_rate("EURUSD", 1.0848, 1.0852));

        let hit = cache.get("EURUSD").unwrap();
        assert_eq!(hit.pair, "EURUSD");
        assert_eq!(hit.source, RateSource::Live);
        assert!(cache.get("EURUSD").is_some());
        assert!(cache.get("GBPUSD").is_none());
    }

    #[test]
    fn expired_entries_are_dropped_on_access() {
        let cache = ForexCache::with_ttl(Duration::from_millis(0));
        cache.insert(live_rate("EURUSD", 1.0848, 1.0852));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("EURUSD").is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn mock_rates_have_plausible_spread() {
        for (pair, _) in MOCK_MID_RATES {
            let rate = mock_rate(pair).unwrap();
            assert!(rate.bid < rate.ask, "{pair}: bid must be below ask");
            assert!(rate.bid > 0.0);
            assert_eq!(rate.source, RateSource::MockFallback);
        }
    }

    #[test]
    fn every_supported_pair_has_a_mock_seed() {
        for pair in SUPPORTED_PAIRS {
            assert!(mock_rate(pair).is_some(), "missing mock seed for {pair}");
        }
    }

    #[test]
    fn cross_pairs_are_not_directly_supported() {
        assert!(is_supported_pair("EURUSD"));
        assert!(!is_supported_pair("EURGBP"));
        assert!(!is_supported_pair("USDEUR"));
    }
}
