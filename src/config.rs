// =============================================================================
// Gateway Settings: environment-backed configuration
// =============================================================================
//
// Every tunable lives here. Values are read once at startup from the process
// environment (`.env` files are honoured via dotenv in main). Each key is
// accepted both bare (`ENABLE_TRADING`) and with the `MERIDIAN_` prefix; the
// prefixed form wins when both are set.
//
// The struct is serialisable so the state snapshot can show the active
// configuration. Secrets are excluded from serialisation.
// =============================================================================

use serde::Serialize;
use tracing::{info, warn};

/// Default audit log location when `AUDIT_LOG_FILE` is unset.
fn default_audit_log_file() -> std::path::PathBuf {
    std::env::temp_dir().join("meridian_audit.jsonl")
}

/// Read an environment key, preferring the `MERIDIAN_`-prefixed form.
fn env_raw(key: &str) -> Option<String> {
    std::env::var(format!("MERIDIAN_{key}"))
        .or_else(|_| std::env::var(key))
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse a key as `T`, falling back to `default` (with a warning) when the
/// value is missing or malformed.
fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env_raw(key) {
        Some(raw) => match raw.parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                warn!(key, value = %raw, "unparseable config value, using default");
                default
            }
        },
        None => default,
    }
}

/// Parse a boolean key. Accepts true/false, 1/0, yes/no (case-insensitive).
fn env_flag(key: &str, default: bool) -> bool {
    match env_raw(key) {
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => true,
            "false" | "0" | "no" | "off" => false,
            other => {
                warn!(key, value = other, "unparseable boolean, using default");
                default
            }
        },
        None => default,
    }
}

/// Parse a comma-separated list key.
fn env_list(key: &str, default: &[&str]) -> Vec<String> {
    match env_raw(key) {
        Some(raw) => raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        None => default.iter().map(|s| s.to_string()).collect(),
    }
}

// =============================================================================
// Settings
// =============================================================================

/// Immutable gateway configuration, constructed once at startup.
#[derive(Debug, Clone, Serialize)]
pub struct Settings {
    // --- Trading enablement -------------------------------------------------
    /// Master trading-side on/off switch. Off by default: the gateway starts
    /// read-only and the operator opts into trading explicitly.
    pub enable_trading: bool,
    pub enable_forex_trading: bool,
    pub enable_international_trading: bool,
    pub enable_stop_loss_orders: bool,

    // --- Account verification -----------------------------------------------
    /// When on, trading-side operations require the active account id to
    /// start with one of `allowed_account_prefixes`.
    pub require_paper_account_verification: bool,
    pub allowed_account_prefixes: Vec<String>,

    // --- Order limits -------------------------------------------------------
    /// Maximum units per order.
    pub max_order_size: f64,
    /// Maximum USD notional per order.
    pub max_order_value_usd: f64,
    /// Orders per UTC day.
    pub max_daily_orders: u32,
    /// Concurrent active stop-loss orders.
    pub max_stop_loss_orders: u32,
    /// Optional cap on cumulative daily notional volume. Zero disables it.
    pub max_portfolio_value_at_risk: f64,

    // --- Rate limits --------------------------------------------------------
    pub max_orders_per_minute: u32,
    pub max_market_data_requests_per_minute: u32,
    /// Minimum interval between fuzzy symbol searches, imposed upstream.
    pub ibkr_symbol_search_rate_limit_seconds: f64,
    pub max_historical_requests_per_minute: u32,

    // --- Resolver -----------------------------------------------------------
    pub fallback_to_exact_on_fuzzy_fail: bool,

    // --- Forex --------------------------------------------------------------
    /// Use the bid/ask midpoint for conversions instead of the bid.
    pub forex_conversion_use_mid: bool,

    // --- Kill switch --------------------------------------------------------
    pub enable_kill_switch: bool,
    /// Operator token required to clear the kill switch. Falls back to the
    /// admin token when unset.
    #[serde(skip_serializing)]
    pub kill_switch_override_token: Option<String>,

    // --- Audit --------------------------------------------------------------
    pub audit_log_file: std::path::PathBuf,

    // --- Broker bridge ------------------------------------------------------
    /// WebSocket URL of the gateway bridge process.
    pub bridge_url: String,
    /// Client id presented to the gateway on connect.
    pub client_id: i32,

    // --- API shell ----------------------------------------------------------
    pub bind_addr: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enable_trading: false,
            enable_forex_trading: false,
            enable_international_trading: false,
            enable_stop_loss_orders: false,
            require_paper_account_verification: true,
            allowed_account_prefixes: vec!["DU".to_string(), "DUH".to_string()],
            max_order_size: 1000.0,
            max_order_value_usd: 10_000.0,
            max_daily_orders: 50,
            max_stop_loss_orders: 25,
            max_portfolio_value_at_risk: 0.0,
            max_orders_per_minute: 5,
            max_market_data_requests_per_minute: 30,
            ibkr_symbol_search_rate_limit_seconds: 1.1,
            max_historical_requests_per_minute: 10,
            fallback_to_exact_on_fuzzy_fail: true,
            forex_conversion_use_mid: false,
            enable_kill_switch: true,
            kill_switch_override_token: None,
            audit_log_file: default_audit_log_file(),
            bridge_url: "ws://127.0.0.1:4002/bridge".to_string(),
            client_id: 1,
            bind_addr: "0.0.0.0:3001".to_string(),
        }
    }
}

impl Settings {
    /// Build settings from the process environment.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let settings = Self {
            enable_trading: env_flag("ENABLE_TRADING", defaults.enable_trading),
            enable_forex_trading: env_flag("ENABLE_FOREX_TRADING", defaults.enable_forex_trading),
            enable_international_trading: env_flag(
                "ENABLE_INTERNATIONAL_TRADING",
                defaults.enable_international_trading,
            ),
            enable_stop_loss_orders: env_flag(
                "ENABLE_STOP_LOSS_ORDERS",
                defaults.enable_stop_loss_orders,
            ),
            require_paper_account_verification: env_flag(
                "REQUIRE_PAPER_ACCOUNT_VERIFICATION",
                defaults.require_paper_account_verification,
            ),
            allowed_account_prefixes: env_list("ALLOWED_ACCOUNT_PREFIXES", &["DU", "DUH"]),
            max_order_size: env_parse("MAX_ORDER_SIZE", defaults.max_order_size),
            max_order_value_usd: env_parse("MAX_ORDER_VALUE_USD", defaults.max_order_value_usd),
            max_daily_orders: env_parse("MAX_DAILY_ORDERS", defaults.max_daily_orders),
            max_stop_loss_orders: env_parse("MAX_STOP_LOSS_ORDERS", defaults.max_stop_loss_orders),
            max_portfolio_value_at_risk: env_parse(
                "MAX_PORTFOLIO_VALUE_AT_RISK",
                defaults.max_portfolio_value_at_risk,
            ),
            max_orders_per_minute: env_parse(
                "MAX_ORDERS_PER_MINUTE",
                defaults.max_orders_per_minute,
            ),
            max_market_data_requests_per_minute: env_parse(
                "MAX_MARKET_DATA_REQUESTS_PER_MINUTE",
                defaults.max_market_data_requests_per_minute,
            ),
            ibkr_symbol_search_rate_limit_seconds: env_parse(
                "IBKR_SYMBOL_SEARCH_RATE_LIMIT_SECONDS",
                defaults.ibkr_symbol_search_rate_limit_seconds,
            ),
            max_historical_requests_per_minute: env_parse(
                "MAX_HISTORICAL_REQUESTS_PER_MINUTE",
                defaults.max_historical_requests_per_minute,
            ),
            fallback_to_exact_on_fuzzy_fail: env_flag(
                "FALLBACK_TO_EXACT_ON_FUZZY_FAIL",
                defaults.fallback_to_exact_on_fuzzy_fail,
            ),
            forex_conversion_use_mid: env_flag(
                "FOREX_CONVERSION_USE_MID",
                defaults.forex_conversion_use_mid,
            ),
            enable_kill_switch: env_flag("ENABLE_KILL_SWITCH", defaults.enable_kill_switch),
            kill_switch_override_token: env_raw("KILL_SWITCH_OVERRIDE_TOKEN")
                .or_else(|| env_raw("ADMIN_TOKEN")),
            audit_log_file: env_raw("AUDIT_LOG_FILE")
                .map(std::path::PathBuf::from)
                .unwrap_or(defaults.audit_log_file),
            bridge_url: env_raw("IBKR_BRIDGE_URL").unwrap_or(defaults.bridge_url),
            client_id: env_parse("IBKR_CLIENT_ID", defaults.client_id),
            bind_addr: env_raw("BIND_ADDR").unwrap_or(defaults.bind_addr),
        };

        info!(
            enable_trading = settings.enable_trading,
            enable_stop_loss_orders = settings.enable_stop_loss_orders,
            require_paper_account_verification = settings.require_paper_account_verification,
            max_daily_orders = settings.max_daily_orders,
            bridge_url = %settings.bridge_url,
            "settings loaded from environment"
        );

        settings
    }

    /// True when the configured prefix list matches `account`.
    pub fn account_is_paper(&self, account: &str) -> bool {
        self.allowed_account_prefixes
            .iter()
            .any(|p| account.starts_with(p.as_str()))
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::default();
        assert!(!s.enable_trading);
        assert!(!s.enable_stop_loss_orders);
        assert!(s.require_paper_account_verification);
        assert_eq!(s.allowed_account_prefixes, vec!["DU", "DUH"]);
        assert_eq!(s.max_daily_orders, 50);
        assert_eq!(s.max_stop_loss_orders, 25);
        assert_eq!(s.max_orders_per_minute, 5);
        assert_eq!(s.max_market_data_requests_per_minute, 30);
        assert!((s.ibkr_symbol_search_rate_limit_seconds - 1.1).abs() < 1e-9);
        assert!(s.fallback_to_exact_on_fuzzy_fail);
        assert!(s.enable_kill_switch);
    }

    #[test]
    fn paper_account_prefix_match() {
        let s = Settings::default();
        assert!(s.account_is_paper("DU1234567"));
        assert!(s.account_is_paper("DUH765432"));
        assert!(!s.account_is_paper("U1234567"));
        // Known startswith hazard: a live account that happens to begin with
        // an allowed prefix would pass. Documented in DESIGN.md.
        assert!(s.account_is_paper("DUX999"));
    }

    #[test]
    fn settings_serialise_without_secrets() {
        let mut s = Settings::default();
        s.kill_switch_override_token = Some("super-secret".to_string());
        let json = serde_json::to_string(&s).unwrap();
        assert!(!json.contains("super-secret"));
        assert!(json.contains("max_daily_orders"));
    }
}
