// =============================================================================
// Safety Manager: the single pre-flight gate for every operation
// =============================================================================
//
// Check chain, in order, short-circuiting at the first error while still
// accumulating warnings:
//
//   1. Kill switch         (trading-side kinds only)
//   2. Rate limit          (per operation class)
//   3. Daily limits        (order-placing kinds only)
//   4. Account verification (paper-prefix check, trading-side kinds only)
//   5. Kind-specific parameter validation
//   6. Master / per-domain enable flags
//
// The manager never increments the daily order counter itself: the order
// manager claims the slot after validation and before broker submission, so
// an order rejected by a later check is never counted.
//
// Every outcome, pass or fail, is written to the audit log.
// =============================================================================

pub mod daily_limits;
pub mod kill_switch;
pub mod rate_limiter;

pub use daily_limits::{DailyCountersSnapshot, DailyLimits};
pub use kill_switch::{KillSwitch, KillSwitchState};
pub use rate_limiter::{RateLimiter, RateWindowSnapshot};

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, warn};

use crate::audit::AuditLog;
use crate::config::Settings;
use crate::error::GatewayError;
use crate::types::{OperationKind, OperationPayload};

/// US venues that do not require the international-trading flag.
const DOMESTIC_EXCHANGES: &[&str] = &[
    "SMART", "NYSE", "NASDAQ", "AMEX", "ARCA", "BATS", "IEX", "ISLAND",
];

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// Outcome of a validation pass. Safe iff `errors` is empty. Error strings
/// are prefixed with their machine-readable kind token.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationDecision {
    pub safe: bool,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub checks_performed: Vec<String>,
}

impl ValidationDecision {
    fn new() -> Self {
        Self {
            safe: true,
            warnings: Vec::new(),
            errors: Vec::new(),
            checks_performed: Vec::new(),
        }
    }

    /// A decision that passed the named checks. Used by tests and internal
    /// short paths.
    pub fn passed(checks_performed: Vec<String>) -> Self {
        Self {
            safe: true,
            warnings: Vec::new(),
            errors: Vec::new(),
            checks_performed,
        }
    }

    fn fail(&mut self, err: &GatewayError) {
        self.errors.push(format!("{}: {}", err.kind(), err));
        self.safe = false;
    }

    fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    fn check(&mut self, name: &str) {
        self.checks_performed.push(name.to_string());
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct SafetyManager {
    settings: Arc<Settings>,
    kill_switch: Arc<KillSwitch>,
    rate_limiter: Arc<RateLimiter>,
    daily_limits: Arc<DailyLimits>,
    audit: Arc<AuditLog>,
    /// Account currently selected on the broker session. Updated by the
    /// session on connect and account switch.
    current_account: RwLock<Option<String>>,
}

impl SafetyManager {
    pub fn new(
        settings: Arc<Settings>,
        kill_switch: Arc<KillSwitch>,
        rate_limiter: Arc<RateLimiter>,
        daily_limits: Arc<DailyLimits>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            settings,
            kill_switch,
            rate_limiter,
            daily_limits,
            audit,
            current_account: RwLock::new(None),
        }
    }

    pub fn set_active_account(&self, account: Option<String>) {
        *self.current_account.write() = account;
    }

    pub fn active_account(&self) -> Option<String> {
        self.current_account.read().clone()
    }

    /// Run the full check chain and audit the outcome.
    pub fn validate(&self, kind: OperationKind, payload: &OperationPayload) -> ValidationDecision {
        let mut decision = ValidationDecision::new();

        // 1. Kill switch
        decision.check("kill_switch");
        if kind.is_trading_side() && self.kill_switch.is_active() {
            let reason = self
                .kill_switch
                .reason()
                .unwrap_or_else(|| "no reason recorded".to_string());
            decision.fail(&GatewayError::EmergencyHalt { reason });
            return self.finish(kind, payload, decision);
        }

        // 2. Rate limit
        decision.check("rate_limit");
        if let Err(err) = self.rate_limiter.check(kind.op_class()) {
            decision.fail(&err);
            return self.finish(kind, payload, decision);
        }

        // 3. Daily limits (order-placing kinds only)
        if kind.is_order_placing() {
            decision.check("daily_limits");
            if let Err(err) = self.daily_limits.check_order_headroom() {
                decision.fail(&err);
                return self.finish(kind, payload, decision);
            }
            if kind == OperationKind::PlaceStopLoss {
                if let Err(err) = self.daily_limits.check_stop_loss_capacity() {
                    decision.fail(&err);
                    return self.finish(kind, payload, decision);
                }
            }
        }

        // 4. Account verification (trading-side kinds only)
        if kind.is_trading_side() && self.settings.require_paper_account_verification {
            decision.check("account_verification");
            match self.current_account.read().as_deref() {
                Some(account) if self.settings.account_is_paper(account) => {}
                Some(account) => {
                    decision.fail(&GatewayError::LiveAccountBlocked {
                        account: account.to_string(),
                    });
                    return self.finish(kind, payload, decision);
                }
                None => {
                    // Fail closed: an unverifiable account is treated as live.
                    decision.fail(&GatewayError::LiveAccountBlocked {
                        account: "<none>".to_string(),
                    });
                    return self.finish(kind, payload, decision);
                }
            }
        }

        // 5. Kind-specific parameter validation
        decision.check("parameters");
        self.validate_payload(kind, payload, &mut decision);
        if !decision.safe {
            return self.finish(kind, payload, decision);
        }

        // 6. Master and per-domain enable flags
        decision.check("trading_enabled");
        if kind.is_trading_side() {
            if !self.settings.enable_trading {
                decision.fail(&GatewayError::TradingDisabled {
                    flag: "enable_trading".to_string(),
                });
                return self.finish(kind, payload, decision);
            }
            if matches!(
                kind,
                OperationKind::PlaceStopLoss
                    | OperationKind::ModifyStopLoss
                    | OperationKind::CancelStopLoss
            ) && !self.settings.enable_stop_loss_orders
            {
                decision.fail(&GatewayError::TradingDisabled {
                    flag: "enable_stop_loss_orders".to_string(),
                });
                return self.finish(kind, payload, decision);
            }
        }

        self.finish(kind, payload, decision)
    }

    /// `validate` that converts an unsafe decision into an error.
    pub fn validate_or_reject(
        &self,
        kind: OperationKind,
        payload: &OperationPayload,
    ) -> Result<ValidationDecision, GatewayError> {
        let decision = self.validate(kind, payload);
        if decision.safe {
            Ok(decision)
        } else {
            Err(GatewayError::SafetyRejected { decision })
        }
    }

    fn finish(
        &self,
        kind: OperationKind,
        payload: &OperationPayload,
        decision: ValidationDecision,
    ) -> ValidationDecision {
        if decision.safe {
            debug!(kind = %kind, checks = decision.checks_performed.len(), "validation passed");
        } else {
            warn!(kind = %kind, errors = ?decision.errors, "validation rejected");
        }
        self.audit.record_decision(kind, payload, &decision);
        decision
    }

    // -------------------------------------------------------------------------
    // Kind-specific parameter checks
    // -------------------------------------------------------------------------

    fn validate_payload(
        &self,
        kind: OperationKind,
        payload: &OperationPayload,
        decision: &mut ValidationDecision,
    ) {
        match payload {
            OperationPayload::Order {
                symbol,
                exchange,
                side,
                quantity,
                stop_price,
                limit_price,
                trailing_amount,
                trailing_percent,
                estimated_value_usd,
                ..
            } => {
                if !is_valid_symbol(symbol) {
                    decision.fail(&invalid("symbol", "not a recognised symbol format"));
                }
                if !quantity.is_finite() || *quantity <= 0.0 {
                    decision.fail(&invalid("quantity", "must be a positive number"));
                } else if *quantity > self.settings.max_order_size {
                    decision.fail(&invalid(
                        "quantity",
                        format!(
                            "exceeds max_order_size ({})",
                            self.settings.max_order_size
                        ),
                    ));
                }
                if let Some(stop) = stop_price {
                    if !stop.is_finite() || *stop <= 0.0 {
                        decision.fail(&invalid("stop_price", "must be a positive number"));
                    }
                }
                if let Some(limit) = limit_price {
                    if !limit.is_finite() || *limit <= 0.0 {
                        decision.fail(&invalid("limit_price", "must be a positive number"));
                    } else if let Some(stop) = stop_price {
                        // A sell stop-limit must not ask for more than the
                        // trigger; a buy stop-limit must not ask for less.
                        let ok = match side {
                            crate::types::OrderSide::Sell => limit <= stop,
                            crate::types::OrderSide::Buy => limit >= stop,
                        };
                        if !ok {
                            decision.fail(&invalid(
                                "limit_price",
                                format!(
                                    "inconsistent with stop_price for a {side} stop-limit"
                                ),
                            ));
                        }
                    }
                }
                match (trailing_amount, trailing_percent) {
                    (Some(_), Some(_)) => decision.fail(&invalid(
                        "trailing",
                        "exactly one of trailing_amount / trailing_percent may be set",
                    )),
                    (Some(a), None) if !a.is_finite() || *a <= 0.0 => {
                        decision.fail(&invalid("trailing_amount", "must be a positive number"))
                    }
                    (None, Some(p)) if !p.is_finite() || *p <= 0.0 || *p >= 100.0 => decision
                        .fail(&invalid("trailing_percent", "must be in the range (0, 100)")),
                    _ => {}
                }
                // The per-order value cap is enforced by the order manager
                // right before submission; here it only warns so the caller
                // still learns which flag would block the order.
                if let Some(value) = estimated_value_usd {
                    if *value > self.settings.max_order_value_usd {
                        decision.warn(format!(
                            "estimated value {value:.2} exceeds max_order_value_usd ({})",
                            self.settings.max_order_value_usd
                        ));
                    }
                } else if kind.is_order_placing() {
                    decision.warn("no price estimate available; order value cap not enforced");
                }
                if let Some(ex) = exchange {
                    let ex_upper = ex.to_ascii_uppercase();
                    if !DOMESTIC_EXCHANGES.contains(&ex_upper.as_str())
                        && kind.is_trading_side()
                        && !self.settings.enable_international_trading
                    {
                        decision.fail(&GatewayError::TradingDisabled {
                            flag: "enable_international_trading".to_string(),
                        });
                    }
                }
            }

            OperationPayload::Pair { pair } => {
                if !is_valid_pair(pair) {
                    decision.fail(&invalid(
                        "pair",
                        "must be exactly 6 uppercase letters, e.g. EURUSD",
                    ));
                }
            }

            OperationPayload::Conversion { amount, from, to } => {
                if !amount.is_finite() || *amount <= 0.0 {
                    decision.fail(&invalid("amount", "must be a positive number"));
                }
                if !is_valid_currency(from) {
                    decision.fail(&invalid("from_currency", "must be a 3-letter ISO code"));
                }
                if !is_valid_currency(to) {
                    decision.fail(&invalid("to_currency", "must be a 3-letter ISO code"));
                }
            }

            OperationPayload::Resolution { input, max_results } => {
                if input.trim().is_empty() {
                    decision.fail(&invalid("input", "must not be empty"));
                }
                if *max_results == 0 {
                    decision.fail(&invalid("max_results", "must be at least 1"));
                } else if *max_results > 16 {
                    decision.warn("max_results capped at 16");
                }
            }

            OperationPayload::OrderRef { order_id } => {
                if *order_id <= 0 {
                    decision.fail(&invalid("order_id", "must be a positive identifier"));
                }
            }

            OperationPayload::Account { account_id } => {
                if account_id.trim().is_empty() {
                    decision.fail(&invalid("account_id", "must not be empty"));
                } else if self.settings.require_paper_account_verification
                    && !self.settings.account_is_paper(account_id)
                {
                    // Switching to a live account is blocked outright.
                    decision.fail(&GatewayError::LiveAccountBlocked {
                        account: account_id.clone(),
                    });
                }
            }

            OperationPayload::Symbols { symbols } => {
                if symbols.is_empty() {
                    decision.fail(&invalid("symbols", "must contain at least one symbol"));
                }
                for symbol in symbols {
                    if !is_valid_symbol(symbol) {
                        decision.fail(&invalid(
                            "symbols",
                            format!("'{symbol}' is not a recognised symbol format"),
                        ));
                        break;
                    }
                }
            }

            OperationPayload::Empty => {}
        }
    }
}

impl std::fmt::Debug for SafetyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafetyManager")
            .field("active_account", &self.current_account.read())
            .finish()
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> GatewayError {
    GatewayError::InvalidParameter {
        field: field.to_string(),
        reason: reason.into(),
    }
}

/// Symbols: 1-12 chars, uppercase letters, digits, dot, dash, space.
fn is_valid_symbol(symbol: &str) -> bool {
    !symbol.is_empty()
        && symbol.len() <= 12
        && symbol
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || matches!(c, '.' | '-' | ' '))
}

/// Forex pairs: exactly 6 uppercase ASCII letters.
fn is_valid_pair(pair: &str) -> bool {
    pair.len() == 6 && pair.chars().all(|c| c.is_ascii_uppercase())
}

fn is_valid_currency(code: &str) -> bool {
    code.len() == 3 && code.chars().all(|c| c.is_ascii_uppercase())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OrderSide;

    fn manager_with(settings: Settings) -> SafetyManager {
        let settings = Arc::new(settings);
        SafetyManager::new(
            settings.clone(),
            Arc::new(KillSwitch::new(
                settings.enable_kill_switch,
                Some("override".to_string()),
            )),
            Arc::new(RateLimiter::new(&settings)),
            Arc::new(DailyLimits::new(
                settings.max_daily_orders,
                settings.max_stop_loss_orders,
                settings.max_portfolio_value_at_risk,
            )),
            Arc::new(AuditLog::disabled()),
        )
    }

    fn stop_loss_payload() -> OperationPayload {
        OperationPayload::Order {
            symbol: "AAPL".to_string(),
            exchange: Some("SMART".to_string()),
            currency: Some("USD".to_string()),
            side: OrderSide::Sell,
            quantity: 100.0,
            stop_price: Some(180.0),
            limit_price: None,
            trailing_amount: None,
            trailing_percent: None,
            estimated_value_usd: Some(5000.0),
        }
    }

    #[test]
    fn master_flag_blocks_stop_loss_placement() {
        // Scenario: trading disabled, everything else in order.
        let mut settings = Settings::default();
        settings.enable_stop_loss_orders = true;
        let mgr = manager_with(settings);
        mgr.set_active_account(Some("DU1234567".to_string()));

        let decision = mgr.validate(OperationKind::PlaceStopLoss, &stop_loss_payload());
        assert!(!decision.safe);
        assert!(decision.errors.iter().any(|e| e.contains("TradingDisabled")));
    }

    #[test]
    fn live_account_is_blocked() {
        let mut settings = Settings::default();
        settings.enable_trading = true;
        settings.enable_stop_loss_orders = true;
        settings.allowed_account_prefixes = vec!["DU".to_string()];
        let mgr = manager_with(settings);
        mgr.set_active_account(Some("U1234567".to_string()));

        let decision = mgr.validate(OperationKind::PlaceStopLoss, &stop_loss_payload());
        assert!(!decision.safe);
        assert!(decision
            .errors
            .iter()
            .any(|e| e.contains("LiveAccountBlocked")));
    }

    #[test]
    fn unknown_account_fails_closed() {
        let mut settings = Settings::default();
        settings.enable_trading = true;
        settings.enable_stop_loss_orders = true;
        let mgr = manager_with(settings);

        let decision = mgr.validate(OperationKind::PlaceStopLoss, &stop_loss_payload());
        assert!(!decision.safe);
        assert!(decision
            .errors
            .iter()
            .any(|e| e.contains("LiveAccountBlocked")));
    }

    #[test]
    fn kill_switch_blocks_trading_but_not_reads() {
        let mut settings = Settings::default();
        settings.enable_trading = true;
        settings.enable_stop_loss_orders = true;
        let mgr = manager_with(settings);
        mgr.set_active_account(Some("DU1234567".to_string()));
        mgr.kill_switch.activate("margin call").unwrap();

        let decision = mgr.validate(OperationKind::PlaceStopLoss, &stop_loss_payload());
        assert!(!decision.safe);
        let halt = decision
            .errors
            .iter()
            .find(|e| e.contains("EmergencyHalt"))
            .expect("expected EmergencyHalt error");
        assert!(halt.contains("margin call"));

        // Read-side operations still pass the kill switch.
        let read = mgr.validate(OperationKind::PortfolioRead, &OperationPayload::Empty);
        assert!(read.safe, "errors: {:?}", read.errors);
    }

    #[test]
    fn happy_path_passes_all_checks() {
        let mut settings = Settings::default();
        settings.enable_trading = true;
        settings.enable_stop_loss_orders = true;
        let mgr = manager_with(settings);
        mgr.set_active_account(Some("DU1234567".to_string()));

        let decision = mgr.validate(OperationKind::PlaceStopLoss, &stop_loss_payload());
        assert!(decision.safe, "errors: {:?}", decision.errors);
        for check in [
            "kill_switch",
            "rate_limit",
            "daily_limits",
            "account_verification",
            "parameters",
            "trading_enabled",
        ] {
            assert!(
                decision.checks_performed.iter().any(|c| c == check),
                "missing check {check}"
            );
        }
    }

    #[test]
    fn parameter_validation_rejects_bad_quantities() {
        let mut settings = Settings::default();
        settings.enable_trading = true;
        settings.enable_stop_loss_orders = true;
        let mgr = manager_with(settings);
        mgr.set_active_account(Some("DU1234567".to_string()));

        let mut payload = stop_loss_payload();
        if let OperationPayload::Order { quantity, .. } = &mut payload {
            *quantity = -5.0;
        }
        let decision = mgr.validate(OperationKind::PlaceStopLoss, &payload);
        assert!(!decision.safe);
        assert!(decision
            .errors
            .iter()
            .any(|e| e.contains("InvalidParameter") && e.contains("quantity")));
    }

    #[test]
    fn sell_stop_limit_relationship_enforced() {
        let mut settings = Settings::default();
        settings.enable_trading = true;
        settings.enable_stop_loss_orders = true;
        let mgr = manager_with(settings);
        mgr.set_active_account(Some("DU1234567".to_string()));

        let mut payload = stop_loss_payload();
        if let OperationPayload::Order { limit_price, .. } = &mut payload {
            // Sell stop at 180 with a limit above the trigger is inconsistent.
            *limit_price = Some(185.0);
        }
        let decision = mgr.validate(OperationKind::PlaceStopLoss, &payload);
        assert!(!decision.safe);
        assert!(decision
            .errors
            .iter()
            .any(|e| e.contains("limit_price")));
    }

    #[test]
    fn trailing_variant_requires_exactly_one_parameter() {
        let mut settings = Settings::default();
        settings.enable_trading = true;
        settings.enable_stop_loss_orders = true;
        let mgr = manager_with(settings);
        mgr.set_active_account(Some("DU1234567".to_string()));

        let mut payload = stop_loss_payload();
        if let OperationPayload::Order {
            trailing_amount,
            trailing_percent,
            ..
        } = &mut payload
        {
            *trailing_amount = Some(2.0);
            *trailing_percent = Some(1.0);
        }
        let decision = mgr.validate(OperationKind::PlaceStopLoss, &payload);
        assert!(!decision.safe);
    }

    #[test]
    fn forex_pair_format_enforced() {
        let mgr = manager_with(Settings::default());

        let bad = mgr.validate(
            OperationKind::ForexRate,
            &OperationPayload::Pair {
                pair: "eurusd".to_string(),
            },
        );
        assert!(!bad.safe);

        let good = mgr.validate(
            OperationKind::ForexRate,
            &OperationPayload::Pair {
                pair: "EURUSD".to_string(),
            },
        );
        assert!(good.safe, "errors: {:?}", good.errors);
    }

    #[test]
    fn validation_is_idempotent_for_read_ops() {
        let mgr = manager_with(Settings::default());
        let payload = OperationPayload::Conversion {
            amount: 500.0,
            from: "EUR".to_string(),
            to: "GBP".to_string(),
        };
        let first = mgr.validate(OperationKind::CurrencyConvert, &payload);
        let second = mgr.validate(OperationKind::CurrencyConvert, &payload);
        assert_eq!(first.safe, second.safe);
        assert_eq!(first.errors, second.errors);
        assert_eq!(first.checks_performed, second.checks_performed);
    }

    #[test]
    fn international_exchange_requires_flag() {
        let mut settings = Settings::default();
        settings.enable_trading = true;
        settings.enable_stop_loss_orders = true;
        settings.enable_international_trading = false;
        let mgr = manager_with(settings);
        mgr.set_active_account(Some("DU1234567".to_string()));

        let mut payload = stop_loss_payload();
        if let OperationPayload::Order { exchange, .. } = &mut payload {
            *exchange = Some("IBIS".to_string());
        }
        let decision = mgr.validate(OperationKind::PlaceStopLoss, &payload);
        assert!(!decision.safe);
        assert!(decision
            .errors
            .iter()
            .any(|e| e.contains("enable_international_trading")));
    }

    #[test]
    fn validate_or_reject_wraps_decision() {
        let mgr = manager_with(Settings::default());
        mgr.set_active_account(Some("DU1234567".to_string()));

        let err = mgr
            .validate_or_reject(OperationKind::PlaceStopLoss, &stop_loss_payload())
            .unwrap_err();
        match err {
            GatewayError::SafetyRejected { decision } => assert!(!decision.safe),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
