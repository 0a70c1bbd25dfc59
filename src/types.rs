// =============================================================================
// Shared types used across the Meridian gateway
// =============================================================================

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Operation kinds
// ---------------------------------------------------------------------------

/// Every operation the gateway can perform. Each kind carries a distinct
/// validation profile in the safety manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    MarketData,
    ForexRate,
    CurrencyConvert,
    ResolveSymbol,
    PlaceStopLoss,
    ModifyStopLoss,
    CancelStopLoss,
    ListStopLosses,
    PlaceOrder,
    ModifyOrder,
    CancelOrder,
    AccountSwitch,
    PortfolioRead,
    OrderHistoryRead,
}

impl OperationKind {
    /// Trading-side operations are the ones the kill switch and the master
    /// `enable_trading` flag block. Read-side operations pass both.
    pub fn is_trading_side(&self) -> bool {
        matches!(
            self,
            Self::PlaceStopLoss
                | Self::ModifyStopLoss
                | Self::CancelStopLoss
                | Self::PlaceOrder
                | Self::ModifyOrder
                | Self::CancelOrder
        )
    }

    /// Operations that consume a daily order slot.
    pub fn is_order_placing(&self) -> bool {
        matches!(self, Self::PlaceStopLoss | Self::PlaceOrder)
    }

    /// Rate-limit class the operation is accounted against.
    pub fn op_class(&self) -> OpClass {
        match self {
            Self::PlaceStopLoss
            | Self::ModifyStopLoss
            | Self::CancelStopLoss
            | Self::PlaceOrder
            | Self::ModifyOrder
            | Self::CancelOrder => OpClass::OrderPlacement,
            Self::AccountSwitch => OpClass::Control,
            _ => OpClass::QuoteRequest,
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Rate-limit operation classes, each with its own sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpClass {
    OrderPlacement,
    QuoteRequest,
    FuzzySearch,
    Historical,
    /// Administrative operations (kill switch, account switch). Not windowed.
    Control,
}

impl std::fmt::Display for OpClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OrderPlacement => write!(f, "order_placement"),
            Self::QuoteRequest => write!(f, "quote_request"),
            Self::FuzzySearch => write!(f, "fuzzy_search"),
            Self::Historical => write!(f, "historical"),
            Self::Control => write!(f, "control"),
        }
    }
}

// ---------------------------------------------------------------------------
// Order primitives
// ---------------------------------------------------------------------------

/// Order side. Serialized as the broker expects it ("BUY" / "SELL").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Time-in-force accepted for stop-loss orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    Day,
    Gtc,
    Ioc,
    Fok,
}

impl Default for TimeInForce {
    fn default() -> Self {
        Self::Gtc
    }
}

impl TimeInForce {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Day => "DAY",
            Self::Gtc => "GTC",
            Self::Ioc => "IOC",
            Self::Fok => "FOK",
        }
    }
}

impl std::fmt::Display for TimeInForce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Security type, in the broker's vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecType {
    #[serde(rename = "STK")]
    Stock,
    #[serde(rename = "CASH")]
    Cash,
}

impl Default for SecType {
    fn default() -> Self {
        Self::Stock
    }
}

impl SecType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stock => "STK",
            Self::Cash => "CASH",
        }
    }
}

impl std::fmt::Display for SecType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Stop-loss order variant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StopVariant {
    /// Plain stop: triggers a market order at `stop_price`.
    Basic,
    /// Stop-limit: triggers a limit order at `limit_price`.
    StopLimit { limit_price: f64 },
    /// Trailing stop: exactly one of `amount` / `percent` is set.
    Trailing {
        amount: Option<f64>,
        percent: Option<f64>,
    },
}

// ---------------------------------------------------------------------------
// Operation payloads
// ---------------------------------------------------------------------------

/// Kind-specific payload attached to an operation for validation and audit.
/// Tagged so the audit log stays self-describing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "payload", rename_all = "snake_case")]
pub enum OperationPayload {
    Order {
        symbol: String,
        exchange: Option<String>,
        currency: Option<String>,
        side: OrderSide,
        quantity: f64,
        stop_price: Option<f64>,
        limit_price: Option<f64>,
        trailing_amount: Option<f64>,
        trailing_percent: Option<f64>,
        /// Rough USD notional, used for the per-order value cap and the daily
        /// volume tracker. None when no price estimate is available.
        estimated_value_usd: Option<f64>,
    },
    Pair {
        pair: String,
    },
    Conversion {
        amount: f64,
        from: String,
        to: String,
    },
    Resolution {
        input: String,
        max_results: u32,
    },
    OrderRef {
        order_id: i64,
    },
    Account {
        account_id: String,
    },
    Symbols {
        symbols: Vec<String>,
    },
    Empty,
}
