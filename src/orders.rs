// =============================================================================
// Order Manager: stop-loss lifecycle and order-history reads
// =============================================================================
//
// Placement runs in two phases around the safety gate:
//
//   validate -> claim daily order slot -> submit to broker
//                                         |- success: track, count active
//                                         '- failure: release the slot
//
// The claim/release protocol guarantees an order rejected by the broker (or
// a cancelled submission) is never counted against the daily cap.
//
// The active stop-loss count moves on broker acknowledgement and on terminal
// status observed during reconciliation, not on our own bookkeeping wishes.
//
// History reads pass the kill switch and daily limits untouched; they are
// still rate-limited and audited.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Deserialize;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{AuditLog, BrokerOutcome};
use crate::error::GatewayError;
use crate::forex::ForexEngine;
use crate::ibkr::contracts::{
    Contract, ExecutionFilter, ExecutionRecord, OrderRecord, OrderStatus, OrderTicket,
};
use crate::ibkr::session::BrokerSession;
use crate::safety::{DailyLimits, RateLimiter, SafetyManager};
use crate::types::{OpClass, OperationKind, OperationPayload, OrderSide, StopVariant, TimeInForce};

// ---------------------------------------------------------------------------
// Parameters and results
// ---------------------------------------------------------------------------

/// Stop-loss placement request from the tool surface.
#[derive(Debug, Clone, Deserialize)]
pub struct StopLossParams {
    pub symbol: String,
    #[serde(default)]
    pub exchange: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
    pub side: OrderSide,
    pub quantity: f64,
    pub stop_price: f64,
    #[serde(default)]
    pub limit_price: Option<f64>,
    #[serde(default)]
    pub trailing_amount: Option<f64>,
    #[serde(default)]
    pub trailing_percent: Option<f64>,
    #[serde(default)]
    pub time_in_force: TimeInForce,
}

impl StopLossParams {
    fn variant(&self) -> StopVariant {
        if self.trailing_amount.is_some() || self.trailing_percent.is_some() {
            StopVariant::Trailing {
                amount: self.trailing_amount,
                percent: self.trailing_percent,
            }
        } else if let Some(limit_price) = self.limit_price {
            StopVariant::StopLimit { limit_price }
        } else {
            StopVariant::Basic
        }
    }
}

/// Requested changes for an existing stop-loss.
#[derive(Debug, Clone, Deserialize)]
pub struct StopLossChanges {
    pub order_id: i64,
    #[serde(default)]
    pub stop_price: Option<f64>,
    #[serde(default)]
    pub limit_price: Option<f64>,
    #[serde(default)]
    pub quantity: Option<f64>,
    #[serde(default)]
    pub trailing_amount: Option<f64>,
    #[serde(default)]
    pub trailing_percent: Option<f64>,
}

/// A tracked stop-loss order.
#[derive(Debug, Clone, Serialize)]
pub struct StopLossOrder {
    pub order_id: i64,
    pub symbol: String,
    pub exchange: String,
    pub currency: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub stop_price: f64,
    pub variant: StopVariant,
    pub time_in_force: TimeInForce,
    pub status: OrderStatus,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct OrderManager {
    settings: Arc<crate::config::Settings>,
    session: Arc<BrokerSession>,
    safety: Arc<SafetyManager>,
    daily: Arc<DailyLimits>,
    rate_limiter: Arc<RateLimiter>,
    audit: Arc<AuditLog>,
    forex: Arc<ForexEngine>,
    active_stops: RwLock<HashMap<i64, StopLossOrder>>,
}

impl OrderManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Arc<crate::config::Settings>,
        session: Arc<BrokerSession>,
        safety: Arc<SafetyManager>,
        daily: Arc<DailyLimits>,
        rate_limiter: Arc<RateLimiter>,
        audit: Arc<AuditLog>,
        forex: Arc<ForexEngine>,
    ) -> Self {
        Self {
            settings,
            session,
            safety,
            daily,
            rate_limiter,
            audit,
            forex,
            active_stops: RwLock::new(HashMap::new()),
        }
    }

    /// Per-order USD value cap, checked after validation and before any
    /// broker traffic or slot claim.
    fn check_order_value(&self, notional: Option<f64>) -> Result<(), GatewayError> {
        if let Some(value) = notional {
            if value > self.settings.max_order_value_usd {
                return Err(GatewayError::InvalidParameter {
                    field: "order_value".to_string(),
                    reason: format!(
                        "estimated value {value:.2} exceeds max_order_value_usd ({})",
                        self.settings.max_order_value_usd
                    ),
                });
            }
        }
        Ok(())
    }

    pub fn active_stop_count(&self) -> usize {
        self.active_stops.read().len()
    }

    // -------------------------------------------------------------------------
    // Placement
    // -------------------------------------------------------------------------

    pub async fn place_stop_loss(
        &self,
        params: StopLossParams,
    ) -> Result<StopLossOrder, GatewayError> {
        let currency = params.currency.clone().unwrap_or_else(|| "USD".to_string());
        let notional = self
            .forex
            .estimate_usd(params.stop_price * params.quantity, &currency);

        let payload = OperationPayload::Order {
            symbol: params.symbol.clone(),
            exchange: params.exchange.clone(),
            currency: Some(currency.clone()),
            side: params.side,
            quantity: params.quantity,
            stop_price: Some(params.stop_price),
            limit_price: params.limit_price,
            trailing_amount: params.trailing_amount,
            trailing_percent: params.trailing_percent,
            estimated_value_usd: notional,
        };

        self.safety
            .validate_or_reject(OperationKind::PlaceStopLoss, &payload)?;
        self.check_order_value(notional)?;

        if !self.session.is_connected() {
            return Err(GatewayError::NotConnected);
        }

        // Qualify before claiming a slot: an unknown symbol is a parameter
        // problem, not a consumed order.
        let exchange = params.exchange.clone().unwrap_or_else(|| "SMART".to_string());
        let contract = self.qualify_or_reject(&params.symbol, &exchange, &currency).await?;

        let notional_usd = notional.unwrap_or(0.0);
        let slot = OrderSlotGuard::claim(self.daily.clone(), notional_usd)?;

        let ticket = build_ticket(&params);
        match self.session.place_order(contract.clone(), ticket).await {
            Ok(record) if record.status != OrderStatus::Rejected => {
                slot.disarm();
                self.daily.stop_loss_opened();
                let order = StopLossOrder {
                    order_id: record.order_id,
                    symbol: params.symbol.clone(),
                    exchange: contract.exchange.clone(),
                    currency,
                    side: params.side,
                    quantity: params.quantity,
                    stop_price: params.stop_price,
                    variant: params.variant(),
                    time_in_force: params.time_in_force,
                    status: record.status,
                };
                self.active_stops.write().insert(order.order_id, order.clone());
                self.audit.record_outcome(
                    OperationKind::PlaceStopLoss,
                    &payload,
                    BrokerOutcome::Ok {
                        detail: Some(format!("order_id={}", order.order_id)),
                    },
                );
                info!(
                    order_id = order.order_id,
                    symbol = %order.symbol,
                    stop_price = order.stop_price,
                    "stop-loss placed"
                );
                Ok(order)
            }
            Ok(record) => {
                // Dropping the guard releases the slot.
                let err = GatewayError::BrokerRejected {
                    reason: format!("order {} rejected by broker", record.order_id),
                };
                self.audit.record_outcome(
                    OperationKind::PlaceStopLoss,
                    &payload,
                    BrokerOutcome::Error {
                        detail: err.to_string(),
                    },
                );
                Err(err)
            }
            Err(err) => {
                // The guard releases the slot; a failed submission is never
                // counted.
                self.audit.record_outcome(
                    OperationKind::PlaceStopLoss,
                    &payload,
                    BrokerOutcome::Error {
                        detail: err.to_string(),
                    },
                );
                warn!(symbol = %params.symbol, error = %err, "stop-loss placement failed");
                Err(err)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Modification
    // -------------------------------------------------------------------------

    /// Cancel-and-replace with merged parameters. The daily order count is
    /// untouched: a modification is not a new order.
    pub async fn modify_stop_loss(
        &self,
        changes: StopLossChanges,
    ) -> Result<StopLossOrder, GatewayError> {
        let existing = self
            .active_stops
            .read()
            .get(&changes.order_id)
            .cloned()
            .ok_or_else(|| GatewayError::InvalidParameter {
                field: "order_id".to_string(),
                reason: format!("{} is not a tracked stop-loss", changes.order_id),
            })?;

        let merged = merge_changes(&existing, &changes);
        let payload = OperationPayload::Order {
            symbol: merged.symbol.clone(),
            exchange: Some(merged.exchange.clone()),
            currency: Some(merged.currency.clone()),
            side: merged.side,
            quantity: merged.quantity,
            stop_price: Some(merged.stop_price),
            limit_price: match merged.variant {
                StopVariant::StopLimit { limit_price } => Some(limit_price),
                _ => None,
            },
            trailing_amount: match merged.variant {
                StopVariant::Trailing { amount, .. } => amount,
                _ => None,
            },
            trailing_percent: match merged.variant {
                StopVariant::Trailing { percent, .. } => percent,
                _ => None,
            },
            estimated_value_usd: self
                .forex
                .estimate_usd(merged.stop_price * merged.quantity, &merged.currency),
        };

        self.safety
            .validate_or_reject(OperationKind::ModifyStopLoss, &payload)?;
        self.check_order_value(
            self.forex
                .estimate_usd(merged.stop_price * merged.quantity, &merged.currency),
        )?;

        self.session.cancel_order(existing.order_id).await?;
        self.active_stops.write().remove(&existing.order_id);

        let contract = Contract::stock(&merged.symbol, &merged.exchange, &merged.currency);
        let ticket = ticket_for(&merged);
        match self.session.place_order(contract, ticket).await {
            Ok(record) => {
                let mut order = merged;
                order.order_id = record.order_id;
                order.status = record.status;
                self.active_stops.write().insert(order.order_id, order.clone());
                self.audit.record_outcome(
                    OperationKind::ModifyStopLoss,
                    &payload,
                    BrokerOutcome::Ok {
                        detail: Some(format!(
                            "replaced order_id={} with {}",
                            existing.order_id, order.order_id
                        )),
                    },
                );
                info!(
                    old_order_id = existing.order_id,
                    new_order_id = order.order_id,
                    "stop-loss modified"
                );
                Ok(order)
            }
            Err(err) => {
                // The original was cancelled but the replacement failed: the
                // position is now unprotected. Surface loudly.
                self.daily.stop_loss_closed();
                self.audit.record_outcome(
                    OperationKind::ModifyStopLoss,
                    &payload,
                    BrokerOutcome::Error {
                        detail: format!(
                            "replacement failed after cancelling {}: {err}",
                            existing.order_id
                        ),
                    },
                );
                warn!(
                    order_id = existing.order_id,
                    error = %err,
                    "stop-loss replacement failed; original order was cancelled"
                );
                Err(GatewayError::BrokerRejected {
                    reason: format!(
                        "replacement failed after cancelling order {}: {err}",
                        existing.order_id
                    ),
                })
            }
        }
    }

    // -------------------------------------------------------------------------
    // Cancellation
    // -------------------------------------------------------------------------

    pub async fn cancel_stop_loss(&self, order_id: i64) -> Result<StopLossOrder, GatewayError> {
        let payload = OperationPayload::OrderRef { order_id };
        self.safety
            .validate_or_reject(OperationKind::CancelStopLoss, &payload)?;

        let mut order = self
            .active_stops
            .read()
            .get(&order_id)
            .cloned()
            .ok_or_else(|| GatewayError::InvalidParameter {
                field: "order_id".to_string(),
                reason: format!("{order_id} is not a tracked stop-loss"),
            })?;

        match self.session.cancel_order(order_id).await {
            Ok(()) => {
                order.status = OrderStatus::Cancelled;
                self.active_stops.write().remove(&order_id);
                self.daily.stop_loss_closed();
                self.audit.record_outcome(
                    OperationKind::CancelStopLoss,
                    &payload,
                    BrokerOutcome::Ok {
                        detail: Some(format!("order_id={order_id}")),
                    },
                );
                info!(order_id, "stop-loss cancelled");
                Ok(order)
            }
            Err(err) => {
                self.audit.record_outcome(
                    OperationKind::CancelStopLoss,
                    &payload,
                    BrokerOutcome::Error {
                        detail: err.to_string(),
                    },
                );
                Err(err)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Listing and reconciliation
    // -------------------------------------------------------------------------

    pub async fn list_stop_losses(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<StopLossOrder>, GatewayError> {
        self.safety
            .validate_or_reject(OperationKind::ListStopLosses, &OperationPayload::Empty)?;

        self.reconcile().await?;

        let stops = self.active_stops.read();
        let mut out: Vec<StopLossOrder> = stops
            .values()
            .filter(|s| {
                symbol
                    .map(|sym| s.symbol.eq_ignore_ascii_case(sym))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        out.sort_by_key(|s| s.order_id);
        Ok(out)
    }

    /// Refresh tracked stop statuses against the broker's view. Terminal
    /// orders release their active slot. Also run periodically from main.
    pub async fn reconcile(&self) -> Result<(), GatewayError> {
        let open = self.session.req_open_orders().await?;
        let completed = self.session.req_completed_orders().await.unwrap_or_default();

        let open_status: HashMap<i64, OrderStatus> =
            open.iter().map(|o| (o.order_id, o.status)).collect();
        let completed_status: HashMap<i64, OrderStatus> =
            completed.iter().map(|o| (o.order_id, o.status)).collect();

        let mut terminal = Vec::new();
        {
            let mut stops = self.active_stops.write();
            for (id, stop) in stops.iter_mut() {
                let status = open_status
                    .get(id)
                    .or_else(|| completed_status.get(id))
                    .copied()
                    // Gone from both books: treat as cancelled upstream.
                    .unwrap_or(OrderStatus::Cancelled);
                stop.status = status;
                if status.is_terminal() {
                    terminal.push(*id);
                }
            }
            for id in &terminal {
                stops.remove(id);
            }
        }

        for id in terminal {
            self.daily.stop_loss_closed();
            debug!(order_id = id, "stop-loss reached terminal status");
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Order history
    // -------------------------------------------------------------------------

    pub async fn list_open_orders(&self) -> Result<Vec<OrderRecord>, GatewayError> {
        self.safety
            .validate_or_reject(OperationKind::OrderHistoryRead, &OperationPayload::Empty)?;
        self.session.req_open_orders().await
    }

    /// Completed orders as the broker reports them. `filled` and
    /// `avg_fill_price` are frequently zero here; zeros mean "not provided"
    /// and callers wanting real fills should read executions.
    pub async fn list_completed_orders(&self) -> Result<Vec<OrderRecord>, GatewayError> {
        self.safety
            .validate_or_reject(OperationKind::OrderHistoryRead, &OperationPayload::Empty)?;
        self.session.req_completed_orders().await
    }

    pub async fn list_executions(
        &self,
        symbol: Option<String>,
        days_back: Option<u32>,
    ) -> Result<Vec<ExecutionRecord>, GatewayError> {
        self.safety
            .validate_or_reject(OperationKind::OrderHistoryRead, &OperationPayload::Empty)?;
        // Executions hit the slower historical API upstream; spend from its
        // window on top of the generic read window.
        self.rate_limiter.check(OpClass::Historical)?;
        self.session
            .req_executions(ExecutionFilter { symbol, days_back })
            .await
    }
}

impl std::fmt::Debug for OrderManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderManager")
            .field("active_stops", &self.active_stop_count())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Slot claim guard
// ---------------------------------------------------------------------------

/// Holds a claimed daily order slot. Unless disarmed by a successful broker
/// acknowledgement, dropping the guard releases the slot, including when the
/// placement future is cancelled mid-submission.
struct OrderSlotGuard {
    daily: Arc<DailyLimits>,
    notional_usd: f64,
    armed: bool,
}

impl OrderSlotGuard {
    fn claim(daily: Arc<DailyLimits>, notional_usd: f64) -> Result<Self, GatewayError> {
        daily.claim_order_slot(notional_usd)?;
        Ok(Self {
            daily,
            notional_usd,
            armed: true,
        })
    }

    /// The order was accepted; the slot stays consumed.
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for OrderSlotGuard {
    fn drop(&mut self) {
        if self.armed {
            self.daily.release_order_slot(self.notional_usd);
        }
    }
}

// ---------------------------------------------------------------------------
// Ticket construction
// ---------------------------------------------------------------------------

fn build_ticket(params: &StopLossParams) -> OrderTicket {
    match params.variant() {
        StopVariant::Basic => OrderTicket {
            client_order_id: Uuid::new_v4().to_string(),
            action: params.side,
            order_type: "STP".to_string(),
            total_quantity: params.quantity,
            aux_price: Some(params.stop_price),
            limit_price: None,
            trailing_percent: None,
            time_in_force: params.time_in_force,
        },
        StopVariant::StopLimit { limit_price } => OrderTicket {
            client_order_id: Uuid::new_v4().to_string(),
            action: params.side,
            order_type: "STP LMT".to_string(),
            total_quantity: params.quantity,
            aux_price: Some(params.stop_price),
            limit_price: Some(limit_price),
            trailing_percent: None,
            time_in_force: params.time_in_force,
        },
        StopVariant::Trailing { amount, percent } => OrderTicket {
            client_order_id: Uuid::new_v4().to_string(),
            action: params.side,
            order_type: "TRAIL".to_string(),
            total_quantity: params.quantity,
            aux_price: amount,
            limit_price: None,
            trailing_percent: percent,
            time_in_force: params.time_in_force,
        },
    }
}

fn ticket_for(order: &StopLossOrder) -> OrderTicket {
    let params = StopLossParams {
        symbol: order.symbol.clone(),
        exchange: Some(order.exchange.clone()),
        currency: Some(order.currency.clone()),
        side: order.side,
        quantity: order.quantity,
        stop_price: order.stop_price,
        limit_price: match order.variant {
            StopVariant::StopLimit { limit_price } => Some(limit_price),
            _ => None,
        },
        trailing_amount: match order.variant {
            StopVariant::Trailing { amount, .. } => amount,
            _ => None,
        },
        trailing_percent: match order.variant {
            StopVariant::Trailing { percent, .. } => percent,
            _ => None,
        },
        time_in_force: order.time_in_force,
    };
    build_ticket(&params)
}

fn merge_changes(existing: &StopLossOrder, changes: &StopLossChanges) -> StopLossOrder {
    let mut merged = existing.clone();
    if let Some(stop_price) = changes.stop_price {
        merged.stop_price = stop_price;
    }
    if let Some(quantity) = changes.quantity {
        merged.quantity = quantity;
    }
    merged.variant = match (changes.trailing_amount, changes.trailing_percent) {
        (Some(amount), None) => StopVariant::Trailing {
            amount: Some(amount),
            percent: None,
        },
        (None, Some(percent)) => StopVariant::Trailing {
            amount: None,
            percent: Some(percent),
        },
        (Some(amount), Some(percent)) => StopVariant::Trailing {
            amount: Some(amount),
            percent: Some(percent),
        },
        (None, None) => match changes.limit_price {
            Some(limit_price) => StopVariant::StopLimit { limit_price },
            None => merged.variant,
        },
    };
    merged
}

impl OrderManager {
    async fn qualify_or_reject(
        &self,
        symbol: &str,
        exchange: &str,
        currency: &str,
    ) -> Result<Contract, GatewayError> {
        let candidate = Contract::stock(symbol, exchange, currency);
        let descs = self.session.qualify_contracts(vec![candidate]).await?;
        descs
            .into_iter()
            .next()
            .map(|d| d.contract)
            .ok_or_else(|| GatewayError::InvalidParameter {
                field: "symbol".to_string(),
                reason: format!("'{symbol}' could not be qualified on {exchange}"),
            })
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::forex::cache::ForexCache;
    use crate::ibkr::testing::{mock_desc, MockBroker};
    use crate::safety::KillSwitch;

    struct Fixture {
        mock: Arc<MockBroker>,
        manager: OrderManager,
        daily: Arc<DailyLimits>,
        kill_switch: Arc<KillSwitch>,
    }

    async fn fixture_with(settings: Settings) -> Fixture {
        let settings = Arc::new(settings);
        let mock = Arc::new(MockBroker::new("DU1234567"));
        mock.add_qualified(
            "AAPL",
            "SMART",
            mock_desc("AAPL", "SMART", "USD", Some("Apple Inc"), 265598),
        );

        let session = BrokerSession::new(mock.clone(), 1, "s-orders".to_string());
        session.connect().await.unwrap();

        let audit = Arc::new(AuditLog::disabled());
        let rate_limiter = Arc::new(RateLimiter::new(&settings));
        let daily = Arc::new(DailyLimits::new(
            settings.max_daily_orders,
            settings.max_stop_loss_orders,
            settings.max_portfolio_value_at_risk,
        ));
        let kill_switch = Arc::new(KillSwitch::new(true, Some("override".to_string())));
        let safety = Arc::new(SafetyManager::new(
            settings.clone(),
            kill_switch.clone(),
            rate_limiter.clone(),
            daily.clone(),
            audit.clone(),
        ));
        safety.set_active_account(session.account());

        let forex = Arc::new(ForexEngine::new(
            session.clone(),
            Arc::new(ForexCache::new()),
            false,
        ));

        let manager = OrderManager::new(
            settings,
            session,
            safety,
            daily.clone(),
            rate_limiter,
            audit,
            forex,
        );
        Fixture {
            mock,
            manager,
            daily,
            kill_switch,
        }
    }

    fn trading_settings() -> Settings {
        let mut settings = Settings::default();
        settings.enable_trading = true;
        settings.enable_stop_loss_orders = true;
        settings
    }

    fn basic_params() -> StopLossParams {
        StopLossParams {
            symbol: "AAPL".to_string(),
            exchange: None,
            currency: None,
            side: OrderSide::Sell,
            quantity: 10.0,
            stop_price: 180.0,
            limit_price: None,
            trailing_amount: None,
            trailing_percent: None,
            time_in_force: TimeInForce::Gtc,
        }
    }

    #[tokio::test]
    async fn place_basic_stop_loss() {
        let fx = fixture_with(trading_settings()).await;

        let order = fx.manager.place_stop_loss(basic_params()).await.unwrap();
        assert_eq!(order.symbol, "AAPL");
        assert_eq!(order.status, OrderStatus::Submitted);
        assert!(matches!(order.variant, StopVariant::Basic));

        let snap = fx.daily.snapshot();
        assert_eq!(snap.orders_placed, 1);
        assert_eq!(snap.active_stop_losses, 1);
        assert_eq!(fx.manager.active_stop_count(), 1);

        let placed = fx.mock.placed.lock();
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].1.order_type, "STP");
        assert_eq!(placed[0].1.aux_price, Some(180.0));
    }

    #[tokio::test]
    async fn rejected_validation_makes_no_broker_call() {
        // Trading disabled: scenario "order blocked by master flag".
        let fx = fixture_with(Settings::default()).await;

        let err = fx.manager.place_stop_loss(basic_params()).await.unwrap_err();
        match &err {
            GatewayError::SafetyRejected { decision } => {
                assert!(decision.errors.iter().any(|e| e.contains("TradingDisabled")));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().contains("safety validation"));
        assert!(fx.mock.placed.lock().is_empty());
        assert_eq!(fx.daily.snapshot().orders_placed, 0);
    }

    #[tokio::test]
    async fn daily_order_limit_blocks_third_placement() {
        let mut settings = trading_settings();
        settings.max_daily_orders = 2;
        let fx = fixture_with(settings).await;

        fx.manager.place_stop_loss(basic_params()).await.unwrap();
        fx.manager.place_stop_loss(basic_params()).await.unwrap();

        let err = fx.manager.place_stop_loss(basic_params()).await.unwrap_err();
        match &err {
            GatewayError::SafetyRejected { decision } => {
                let msg = decision
                    .errors
                    .iter()
                    .find(|e| e.contains("DailyLimitExceeded"))
                    .expect("expected daily limit error");
                assert!(msg.contains("2/2"));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        // A UTC-day rollover resets the counter and placement succeeds again.
        let yesterday = chrono::Utc::now().date_naive() - chrono::Duration::days(1);
        fx.daily.backdate_for_test(yesterday);
        fx.manager.place_stop_loss(basic_params()).await.unwrap();
    }

    #[test]
    fn slot_guard_releases_on_drop_and_holds_when_disarmed() {
        let daily = Arc::new(DailyLimits::new(5, 5, 0.0));

        // A dropped guard (error path or cancelled future) releases the slot.
        let guard = OrderSlotGuard::claim(daily.clone(), 100.0).unwrap();
        assert_eq!(daily.snapshot().orders_placed, 1);
        drop(guard);
        assert_eq!(daily.snapshot().orders_placed, 0);

        // A disarmed guard keeps the slot consumed.
        let guard = OrderSlotGuard::claim(daily.clone(), 100.0).unwrap();
        guard.disarm();
        assert_eq!(daily.snapshot().orders_placed, 1);
    }

    #[tokio::test]
    async fn oversized_order_value_is_rejected_before_submission() {
        let fx = fixture_with(trading_settings()).await;
        let mut params = basic_params();
        params.quantity = 100.0; // 100 * 180 = 18,000 USD > 10,000 cap

        let err = fx.manager.place_stop_loss(params).await.unwrap_err();
        match err {
            GatewayError::InvalidParameter { field, .. } => assert_eq!(field, "order_value"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(fx.mock.placed.lock().is_empty());
        assert_eq!(fx.daily.snapshot().orders_placed, 0);
    }

    #[tokio::test]
    async fn broker_failure_releases_the_claimed_slot() {
        let fx = fixture_with(trading_settings()).await;
        *fx.mock.fail_place.lock() = Some(GatewayError::BrokerRejected {
            reason: "margin check failed".to_string(),
        });

        let err = fx.manager.place_stop_loss(basic_params()).await.unwrap_err();
        assert_eq!(err.kind(), "BrokerRejected");

        let snap = fx.daily.snapshot();
        assert_eq!(snap.orders_placed, 0);
        assert_eq!(snap.active_stop_losses, 0);
        assert_eq!(fx.manager.active_stop_count(), 0);
    }

    #[tokio::test]
    async fn stop_limit_ticket_carries_both_prices() {
        let fx = fixture_with(trading_settings()).await;
        let mut params = basic_params();
        params.limit_price = Some(179.0);

        let order = fx.manager.place_stop_loss(params).await.unwrap();
        assert!(matches!(
            order.variant,
            StopVariant::StopLimit { limit_price } if (limit_price - 179.0).abs() < 1e-9
        ));

        let placed = fx.mock.placed.lock();
        assert_eq!(placed[0].1.order_type, "STP LMT");
        assert_eq!(placed[0].1.aux_price, Some(180.0));
        assert_eq!(placed[0].1.limit_price, Some(179.0));
    }

    #[tokio::test]
    async fn trailing_percent_ticket() {
        let fx = fixture_with(trading_settings()).await;
        let mut params = basic_params();
        params.trailing_percent = Some(2.5);

        let order = fx.manager.place_stop_loss(params).await.unwrap();
        assert!(matches!(
            order.variant,
            StopVariant::Trailing { amount: None, percent: Some(p) } if (p - 2.5).abs() < 1e-9
        ));

        let placed = fx.mock.placed.lock();
        assert_eq!(placed[0].1.order_type, "TRAIL");
        assert_eq!(placed[0].1.trailing_percent, Some(2.5));
    }

    #[tokio::test]
    async fn cancel_releases_active_slot() {
        let fx = fixture_with(trading_settings()).await;
        let order = fx.manager.place_stop_loss(basic_params()).await.unwrap();

        let cancelled = fx.manager.cancel_stop_loss(order.order_id).await.unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert_eq!(fx.manager.active_stop_count(), 0);
        assert_eq!(fx.daily.snapshot().active_stop_losses, 0);
        assert_eq!(fx.mock.cancelled.lock().as_slice(), &[order.order_id]);
    }

    #[tokio::test]
    async fn modify_replaces_the_order() {
        let fx = fixture_with(trading_settings()).await;
        let order = fx.manager.place_stop_loss(basic_params()).await.unwrap();

        let modified = fx
            .manager
            .modify_stop_loss(StopLossChanges {
                order_id: order.order_id,
                stop_price: Some(175.0),
                limit_price: None,
                quantity: None,
                trailing_amount: None,
                trailing_percent: None,
            })
            .await
            .unwrap();

        assert_ne!(modified.order_id, order.order_id);
        assert!((modified.stop_price - 175.0).abs() < 1e-9);
        assert_eq!(fx.manager.active_stop_count(), 1);
        // Modification does not consume another daily order slot.
        assert_eq!(fx.daily.snapshot().orders_placed, 1);
        assert_eq!(fx.mock.cancelled.lock().as_slice(), &[order.order_id]);
    }

    #[tokio::test]
    async fn reconcile_releases_filled_stops() {
        let fx = fixture_with(trading_settings()).await;
        let order = fx.manager.place_stop_loss(basic_params()).await.unwrap();

        // The broker fills the stop: it leaves the open book and shows up in
        // completed orders.
        {
            let mut open = fx.mock.open_orders.lock();
            let mut record = open.pop().unwrap();
            record.status = OrderStatus::Filled;
            fx.mock.completed_orders.lock().push(record);
        }

        let stops = fx.manager.list_stop_losses(None).await.unwrap();
        assert!(stops.is_empty());
        assert_eq!(fx.daily.snapshot().active_stop_losses, 0);
        assert_eq!(fx.manager.active_stop_count(), 0);
        drop(order);
    }

    #[tokio::test]
    async fn history_reads_pass_kill_switch() {
        let fx = fixture_with(trading_settings()).await;
        fx.kill_switch.activate("halt").unwrap();

        // Trading is blocked...
        assert!(fx.manager.place_stop_loss(basic_params()).await.is_err());
        // ...but history reads still work.
        let open = fx.manager.list_open_orders().await.unwrap();
        assert!(open.is_empty());
        let completed = fx.manager.list_completed_orders().await.unwrap();
        assert!(completed.is_empty());
    }

    #[tokio::test]
    async fn executions_filter_by_symbol() {
        let fx = fixture_with(trading_settings()).await;
        fx.mock.executions.lock().extend([
            ExecutionRecord {
                exec_id: "e1".to_string(),
                order_id: 1,
                symbol: "AAPL".to_string(),
                side: OrderSide::Sell,
                shares: 10.0,
                price: 179.5,
                exchange: "SMART".to_string(),
                currency: "USD".to_string(),
                time: chrono::Utc::now(),
            },
            ExecutionRecord {
                exec_id: "e2".to_string(),
                order_id: 2,
                symbol: "MSFT".to_string(),
                side: OrderSide::Buy,
                shares: 5.0,
                price: 410.0,
                exchange: "SMART".to_string(),
                currency: "USD".to_string(),
                time: chrono::Utc::now(),
            },
        ]);

        let fills = fx
            .manager
            .list_executions(Some("AAPL".to_string()), Some(7))
            .await
            .unwrap();
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].symbol, "AAPL");
        assert!(fills[0].price > 0.0);
    }
}
