// =============================================================================
// Gateway error taxonomy
// =============================================================================
//
// Every user-facing failure maps to exactly one variant here. The tool layer
// converts a `GatewayError` into a structured failure envelope: the Display
// string becomes `error`, and `details()` carries the machine-readable kind
// plus variant-specific context.
//
// Two failures are deliberately NOT in this enum because they never surface:
// audit-write failures (stderr only) and forex NaN quotes (mock fallback).
// =============================================================================

use serde_json::json;
use thiserror::Error;

use crate::safety::ValidationDecision;
use crate::types::OpClass;

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// The broker session is down. Never retried mid-call; reconnect is
    /// operator-initiated.
    #[error("broker session is not connected")]
    NotConnected,

    #[error("trading is disabled ({flag})")]
    TradingDisabled { flag: String },

    #[error("emergency halt active: {reason}")]
    EmergencyHalt { reason: String },

    #[error("live account blocked: account '{account}' does not match an allowed paper prefix")]
    LiveAccountBlocked { account: String },

    #[error("rate limited ({class}): retry after {retry_after_secs:.1}s")]
    RateLimited {
        class: OpClass,
        retry_after_secs: f64,
    },

    #[error("daily limit exceeded ({which}): {current}/{max}")]
    DailyLimitExceeded {
        which: String,
        current: u32,
        max: u32,
    },

    #[error("invalid parameter '{field}': {reason}")]
    InvalidParameter { field: String, reason: String },

    #[error("no conversion rate available from {from} to {to}")]
    NoRateAvailable { from: String, to: String },

    #[error("broker call timed out after {seconds}s")]
    BrokerTimeout { seconds: u64 },

    #[error("broker rejected the request: {reason}")]
    BrokerRejected { reason: String },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The safety manager rejected the operation pre-flight. Carries the full
    /// decision so the tool envelope can expose errors, warnings, and the
    /// checks that ran.
    #[error("safety validation failed: {}", decision.errors.join("; "))]
    SafetyRejected { decision: ValidationDecision },

    #[error("unknown tool '{0}'")]
    UnknownTool(String),
}

impl GatewayError {
    /// Short machine-readable kind token, stable across releases.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotConnected => "NotConnected",
            Self::TradingDisabled { .. } => "TradingDisabled",
            Self::EmergencyHalt { .. } => "EmergencyHalt",
            Self::LiveAccountBlocked { .. } => "LiveAccountBlocked",
            Self::RateLimited { .. } => "RateLimited",
            Self::DailyLimitExceeded { .. } => "DailyLimitExceeded",
            Self::InvalidParameter { .. } => "InvalidParameter",
            Self::NoRateAvailable { .. } => "NoRateAvailable",
            Self::BrokerTimeout { .. } => "BrokerTimeout",
            Self::BrokerRejected { .. } => "BrokerRejected",
            Self::PermissionDenied(_) => "PermissionDenied",
            Self::SafetyRejected { .. } => "SafetyRejected",
            Self::UnknownTool(_) => "UnknownTool",
        }
    }

    /// Machine-readable context for the failure envelope's `details` field.
    pub fn details(&self) -> serde_json::Value {
        match self {
            Self::RateLimited {
                class,
                retry_after_secs,
            } => json!({
                "kind": self.kind(),
                "class": class.to_string(),
                "retry_after_seconds": retry_after_secs,
            }),
            Self::DailyLimitExceeded {
                which,
                current,
                max,
            } => json!({
                "kind": self.kind(),
                "which": which,
                "current": current,
                "max": max,
            }),
            Self::InvalidParameter { field, reason } => json!({
                "kind": self.kind(),
                "field": field,
                "reason": reason,
            }),
            Self::NoRateAvailable { from, to } => json!({
                "kind": self.kind(),
                "from": from,
                "to": to,
            }),
            Self::EmergencyHalt { reason } => json!({
                "kind": self.kind(),
                "reason": reason,
            }),
            Self::SafetyRejected { decision } => json!({
                "kind": self.kind(),
                "errors": decision.errors,
                "warnings": decision.warnings,
                "checks_performed": decision.checks_performed,
            }),
            other => json!({ "kind": other.kind() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = GatewayError::DailyLimitExceeded {
            which: "orders_placed".to_string(),
            current: 50,
            max: 50,
        };
        let msg = err.to_string();
        assert!(msg.contains("orders_placed"));
        assert!(msg.contains("50/50"));
    }

    #[test]
    fn details_carry_kind_token() {
        let err = GatewayError::NoRateAvailable {
            from: "EUR".to_string(),
            to: "TRY".to_string(),
        };
        let details = err.details();
        assert_eq!(details["kind"], "NoRateAvailable");
        assert_eq!(details["from"], "EUR");
    }

    #[test]
    fn rate_limited_details_expose_retry_hint() {
        let err = GatewayError::RateLimited {
            class: OpClass::OrderPlacement,
            retry_after_secs: 12.5,
        };
        let details = err.details();
        assert_eq!(details["class"], "order_placement");
        assert!((details["retry_after_seconds"].as_f64().unwrap() - 12.5).abs() < 1e-9);
    }
}
