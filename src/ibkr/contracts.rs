// =============================================================================
// Broker data model: contracts, tickers, orders, executions
// =============================================================================
//
// These mirror the shapes the gateway bridge exchanges with the Interactive
// Brokers API. Field names follow the broker's vocabulary (conId, SMART,
// primaryExchange) so that bridge frames map onto them without translation
// tables.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{OrderSide, SecType, TimeInForce};

// ---------------------------------------------------------------------------
// Contracts
// ---------------------------------------------------------------------------

/// A (possibly unqualified) tradable contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub symbol: String,
    pub sec_type: SecType,
    pub exchange: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_exchange: Option<String>,
    pub currency: String,
    /// Broker contract id; zero until qualified.
    #[serde(default)]
    pub con_id: i64,
    /// Alternative identifier type ("CUSIP" / "ISIN") for id-based lookups.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sec_id_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sec_id: Option<String>,
}

impl Contract {
    /// A stock contract routed to `exchange` (SMART for broker routing).
    pub fn stock(symbol: &str, exchange: &str, currency: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            sec_type: SecType::Stock,
            exchange: exchange.to_string(),
            primary_exchange: None,
            currency: currency.to_string(),
            con_id: 0,
            sec_id_type: None,
            sec_id: None,
        }
    }

    /// A forex contract for a canonical 6-letter pair such as `EURUSD`.
    /// The broker models forex as base symbol + quote currency on IDEALPRO.
    pub fn forex(pair: &str) -> Self {
        let (base, quote) = pair.split_at(3);
        Self {
            symbol: base.to_string(),
            sec_type: SecType::Cash,
            exchange: "IDEALPRO".to_string(),
            primary_exchange: None,
            currency: quote.to_string(),
            con_id: 0,
            sec_id_type: None,
            sec_id: None,
        }
    }

    /// A lookup contract keyed by an alternative id (CUSIP / ISIN / conId).
    pub fn by_alt_id(id_type: &str, id: &str) -> Self {
        Self {
            symbol: String::new(),
            sec_type: SecType::Stock,
            exchange: "SMART".to_string(),
            primary_exchange: None,
            currency: "USD".to_string(),
            con_id: 0,
            sec_id_type: Some(id_type.to_string()),
            sec_id: Some(id.to_string()),
        }
    }
}

/// A qualified contract as returned by contract search, with the descriptive
/// fields the resolver scores on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractDescription {
    pub contract: Contract,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cusip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isin: Option<String>,
}

// ---------------------------------------------------------------------------
// Quotes
// ---------------------------------------------------------------------------

/// Snapshot quote for one contract. Non-finite fields mean the broker had no
/// data for that tick (common outside trading hours).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub contract: Contract,
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    pub close: f64,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

/// An order to submit. `order_type` uses the broker's codes: "STP",
/// "STP LMT", "TRAIL".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderTicket {
    pub client_order_id: String,
    pub action: OrderSide,
    pub order_type: String,
    pub total_quantity: f64,
    /// Stop / trigger price ("auxPrice" in broker terms).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aux_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trailing_percent: Option<f64>,
    pub time_in_force: TimeInForce,
}

/// Order lifecycle status as reported by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    PendingSubmit,
    PreSubmitted,
    Submitted,
    Filled,
    Cancelled,
    Expired,
    Rejected,
    Inactive,
}

impl OrderStatus {
    /// Terminal statuses release the active stop-loss slot.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Cancelled | Self::Expired | Self::Rejected
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// An order as known to the broker (open or completed).
///
/// On completed-order records the broker frequently reports `filled` and
/// `avg_fill_price` as zero; zeros mean "not provided" and the executions
/// API is the authoritative source for fills.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub perm_id: Option<i64>,
    pub contract: Contract,
    pub action: OrderSide,
    pub order_type: String,
    pub total_quantity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aux_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trailing_percent: Option<f64>,
    pub time_in_force: TimeInForce,
    pub status: OrderStatus,
    #[serde(default)]
    pub filled: f64,
    #[serde(default)]
    pub remaining: f64,
    #[serde(default)]
    pub avg_fill_price: f64,
}

// ---------------------------------------------------------------------------
// Executions
// ---------------------------------------------------------------------------

/// A single fill. Finer grained than order records and the authoritative
/// source for fill prices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub exec_id: String,
    pub order_id: i64,
    pub symbol: String,
    pub side: OrderSide,
    pub shares: f64,
    pub price: f64,
    pub exchange: String,
    pub currency: String,
    pub time: DateTime<Utc>,
}

/// Server-side filter for execution queries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days_back: Option<u32>,
}

// ---------------------------------------------------------------------------
// Account
// ---------------------------------------------------------------------------

/// One portfolio line as reported by the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioPosition {
    pub symbol: String,
    pub con_id: i64,
    pub sec_type: SecType,
    pub position: f64,
    pub market_price: f64,
    pub market_value: f64,
    pub avg_cost: f64,
    pub unrealized_pnl: f64,
    pub currency: String,
}

/// A single account summary tag/value pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountValue {
    pub tag: String,
    pub value: String,
    pub currency: String,
}
