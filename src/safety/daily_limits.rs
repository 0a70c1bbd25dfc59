// =============================================================================
// Daily Limits: per-calendar-day order and volume accounting
// =============================================================================
//
// Three counters, reset together when the UTC date rolls over:
//   - orders placed today (claimed in two phases, see below)
//   - currently active stop-loss orders
//   - cumulative notional volume in USD
//
// Rollover is detected on every call by comparing dates, so an idle process
// still rolls over correctly at its next check.
//
// Order slots use a claim/release protocol: validation only checks headroom,
// and the order manager claims the slot right before broker submission. A
// failed submission releases the slot so a rejected order is never counted.
// =============================================================================

use chrono::{NaiveDate, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::GatewayError;

/// Serialisable counter snapshot for the state endpoint and audit trail.
#[derive(Debug, Clone, Serialize)]
pub struct DailyCountersSnapshot {
    pub date_utc: String,
    pub orders_placed: u32,
    pub active_stop_losses: u32,
    pub notional_volume_usd: f64,
    pub max_daily_orders: u32,
    pub max_stop_loss_orders: u32,
}

struct Inner {
    date_utc: NaiveDate,
    orders_placed: u32,
    active_stop_losses: u32,
    notional_volume_usd: f64,
}

pub struct DailyLimits {
    state: RwLock<Inner>,
    max_daily_orders: u32,
    max_stop_loss_orders: u32,
    /// Cap on cumulative daily notional. Zero or negative disables the check.
    max_portfolio_value_at_risk: f64,
}

impl DailyLimits {
    pub fn new(
        max_daily_orders: u32,
        max_stop_loss_orders: u32,
        max_portfolio_value_at_risk: f64,
    ) -> Self {
        Self {
            state: RwLock::new(Inner {
                date_utc: Utc::now().date_naive(),
                orders_placed: 0,
                active_stop_losses: 0,
                notional_volume_usd: 0.0,
            }),
            max_daily_orders,
            max_stop_loss_orders,
            max_portfolio_value_at_risk,
        }
    }

    // -------------------------------------------------------------------------
    // Rollover
    // -------------------------------------------------------------------------

    /// Reset all counters when the UTC date has changed since the last call.
    fn maybe_rollover(&self) {
        let today = Utc::now().date_naive();
        {
            let s = self.state.read();
            if s.date_utc == today {
                return;
            }
        }
        // Date changed: take the write lock and re-check (another caller may
        // have already rolled us over).
        let mut s = self.state.write();
        if s.date_utc != today {
            info!(
                old_date = %s.date_utc,
                new_date = %today,
                "UTC date rolled: resetting daily counters"
            );
            s.date_utc = today;
            s.orders_placed = 0;
            s.active_stop_losses = 0;
            s.notional_volume_usd = 0.0;
        }
    }

    // -------------------------------------------------------------------------
    // Pre-flight checks (no mutation)
    // -------------------------------------------------------------------------

    /// Would one more order exceed the daily cap?
    pub fn check_order_headroom(&self) -> Result<(), GatewayError> {
        self.maybe_rollover();
        let s = self.state.read();
        if s.orders_placed + 1 > self.max_daily_orders {
            return Err(GatewayError::DailyLimitExceeded {
                which: "orders_placed".to_string(),
                current: s.orders_placed,
                max: self.max_daily_orders,
            });
        }
        Ok(())
    }

    /// Is there capacity for another active stop-loss?
    pub fn check_stop_loss_capacity(&self) -> Result<(), GatewayError> {
        self.maybe_rollover();
        let s = self.state.read();
        if s.active_stop_losses >= self.max_stop_loss_orders {
            return Err(GatewayError::DailyLimitExceeded {
                which: "active_stop_losses".to_string(),
                current: s.active_stop_losses,
                max: self.max_stop_loss_orders,
            });
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Two-phase order accounting
    // -------------------------------------------------------------------------

    /// Atomically claim an order slot and add `notional_usd` to the volume
    /// tracker. Called by the order manager after validation passes, right
    /// before broker submission.
    pub fn claim_order_slot(&self, notional_usd: f64) -> Result<u32, GatewayError> {
        self.maybe_rollover();
        let mut s = self.state.write();

        if s.orders_placed + 1 > self.max_daily_orders {
            return Err(GatewayError::DailyLimitExceeded {
                which: "orders_placed".to_string(),
                current: s.orders_placed,
                max: self.max_daily_orders,
            });
        }

        if self.max_portfolio_value_at_risk > 0.0
            && s.notional_volume_usd + notional_usd > self.max_portfolio_value_at_risk
        {
            return Err(GatewayError::DailyLimitExceeded {
                which: "notional_volume_usd".to_string(),
                current: s.notional_volume_usd as u32,
                max: self.max_portfolio_value_at_risk as u32,
            });
        }

        s.orders_placed += 1;
        s.notional_volume_usd += notional_usd;
        debug!(
            orders_placed = s.orders_placed,
            notional_volume_usd = s.notional_volume_usd,
            "order slot claimed"
        );
        Ok(s.orders_placed)
    }

    /// Release a previously claimed slot after a failed broker submission.
    pub fn release_order_slot(&self, notional_usd: f64) {
        let mut s = self.state.write();
        if s.orders_placed == 0 {
            warn!("release_order_slot called with zero orders placed");
            return;
        }
        s.orders_placed -= 1;
        s.notional_volume_usd = (s.notional_volume_usd - notional_usd).max(0.0);
        debug!(orders_placed = s.orders_placed, "order slot released");
    }

    // -------------------------------------------------------------------------
    // Stop-loss lifecycle
    // -------------------------------------------------------------------------

    /// The broker acknowledged a stop-loss order.
    pub fn stop_loss_opened(&self) {
        self.maybe_rollover();
        let mut s = self.state.write();
        s.active_stop_losses += 1;
        debug!(active = s.active_stop_losses, "active stop-loss count incremented");
    }

    /// A tracked stop-loss reached a terminal status.
    pub fn stop_loss_closed(&self) {
        let mut s = self.state.write();
        if s.active_stop_losses == 0 {
            warn!("stop_loss_closed called with zero active stop-losses");
            return;
        }
        s.active_stop_losses -= 1;
        debug!(active = s.active_stop_losses, "active stop-loss count decremented");
    }

    // -------------------------------------------------------------------------
    // Snapshot
    // -------------------------------------------------------------------------

    pub fn snapshot(&self) -> DailyCountersSnapshot {
        self.maybe_rollover();
        let s = self.state.read();
        DailyCountersSnapshot {
            date_utc: s.date_utc.format("%Y-%m-%d").to_string(),
            orders_placed: s.orders_placed,
            active_stop_losses: s.active_stop_losses,
            notional_volume_usd: s.notional_volume_usd,
            max_daily_orders: self.max_daily_orders,
            max_stop_loss_orders: self.max_stop_loss_orders,
        }
    }

    /// Pretend the last activity happened on `date`, so the next check rolls
    /// the counters over.
    #[cfg(test)]
    pub fn backdate_for_test(&self, date: NaiveDate) {
        self.state.write().date_utc = date;
    }
}

impl std::fmt::Debug for DailyLimits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.state.read();
        f.debug_struct("DailyLimits")
            .field("date_utc", &s.date_utc)
            .field("orders_placed", &s.orders_placed)
            .field("active_stop_losses", &s.active_stop_losses)
            .field("max_daily_orders", &self.max_daily_orders)
            .finish()
    }
}
