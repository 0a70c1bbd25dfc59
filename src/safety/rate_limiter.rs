// =============================================================================
// Rate Limiter: per-operation-class sliding windows
// =============================================================================
//
// Each operation class owns an ordered sequence of recent event timestamps
// and a `(max, window)` cap. A check prunes expired timestamps, rejects when
// the window is full (reporting how long until the oldest event expires),
// and otherwise appends the current instant.
//
// Breaches never block: the caller gets `RateLimited` immediately and may
// retry after the hint. The broker's own ~50 msg/s ceiling is respected by
// keeping the per-class caps well inside 80% of that capacity.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::error::GatewayError;
use crate::types::OpClass;

struct Window {
    events: VecDeque<Instant>,
    max: usize,
    span: Duration,
}

impl Window {
    fn new(max: usize, span: Duration) -> Self {
        Self {
            events: VecDeque::with_capacity(max),
            max,
            span,
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.events.front() {
            if now.duration_since(oldest) > self.span {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Serialisable view of one window for the state snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct RateWindowSnapshot {
    pub class: OpClass,
    pub in_window: usize,
    pub max: usize,
    pub window_seconds: f64,
}

pub struct RateLimiter {
    windows: Mutex<HashMap<OpClass, Window>>,
}

impl RateLimiter {
    /// Build the standard window set from settings.
    pub fn new(settings: &Settings) -> Self {
        let mut windows = HashMap::new();
        windows.insert(
            OpClass::OrderPlacement,
            Window::new(
                settings.max_orders_per_minute as usize,
                Duration::from_secs(60),
            ),
        );
        windows.insert(
            OpClass::QuoteRequest,
            Window::new(
                settings.max_market_data_requests_per_minute as usize,
                Duration::from_secs(60),
            ),
        );
        windows.insert(
            OpClass::FuzzySearch,
            Window::new(
                1,
                Duration::from_secs_f64(settings.ibkr_symbol_search_rate_limit_seconds),
            ),
        );
        windows.insert(
            OpClass::Historical,
            Window::new(
                settings.max_historical_requests_per_minute as usize,
                Duration::from_secs(60),
            ),
        );
        Self {
            windows: Mutex::new(windows),
        }
    }

    /// Check-and-record for `class`. `Control` is never windowed.
    pub fn check(&self, class: OpClass) -> Result<(), GatewayError> {
        self.check_at(class, Instant::now())
    }

    pub(crate) fn check_at(&self, class: OpClass, now: Instant) -> Result<(), GatewayError> {
        if class == OpClass::Control {
            return Ok(());
        }

        let mut windows = self.windows.lock();
        let window = match windows.get_mut(&class) {
            Some(w) => w,
            None => return Ok(()),
        };

        window.prune(now);

        if window.events.len() >= window.max {
            // The window frees up when its oldest event ages out.
            let retry_after = window
                .events
                .front()
                .map(|&oldest| {
                    window
                        .span
                        .saturating_sub(now.duration_since(oldest))
                        .as_secs_f64()
                })
                .unwrap_or(0.0);
            warn!(
                class = %class,
                in_window = window.events.len(),
                max = window.max,
                retry_after_secs = retry_after,
                "rate limit breached"
            );
            return Err(GatewayError::RateLimited {
                class,
                retry_after_secs: retry_after,
            });
        }

        window.events.push_back(now);
        debug!(class = %class, in_window = window.events.len(), "rate window event recorded");
        Ok(())
    }

    pub fn snapshot(&self) -> Vec<RateWindowSnapshot> {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let mut out: Vec<RateWindowSnapshot> = windows
            .iter_mut()
            .map(|(class, w)| {
                w.prune(now);
                RateWindowSnapshot {
                    class: *class,
                    in_window: w.events.len(),
                    max: w.max,
                    window_seconds: w.span.as_secs_f64(),
                }
            })
            .collect();
        out.sort_by_key(|s| s.class.to_string());
        out
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("windows", &self.snapshot())
            .finish()
    }
}
