// =============================================================================
// Tool Dispatch: structured success/failure envelopes over every component
// =============================================================================
//
// The outer protocol shell delivers `{tool_name, parameters}`; this module
// routes to the right component and always answers with an envelope whose
// top level carries a boolean `success`:
//
//   { "success": true,  "data": ..., "metadata": ... }
//   { "success": false, "error": "...", "details": { "kind": ... } }
//
// An unresolved symbol is a SUCCESS with an empty match list, not an error;
// shells that want to treat it as a failure apply their own policy.
// =============================================================================

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::app_state::AppState;
use crate::error::GatewayError;
use crate::ibkr::contracts::Contract;
use crate::orders::{StopLossChanges, StopLossParams};
use crate::resolve::{ResolutionQuery, ResolverReply};
use crate::types::{OperationKind, OperationPayload};

/// One tool invocation from the shell.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolCallRequest {
    pub tool_name: String,
    #[serde(default)]
    pub parameters: Value,
}

/// The response envelope. `success` is always present at the top level.
#[derive(Debug, Clone, Serialize)]
pub struct ToolResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl ToolResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            details: None,
            metadata: None,
        }
    }

    pub fn ok_with_metadata(data: Value, metadata: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            details: None,
            metadata: Some(metadata),
        }
    }

    pub fn failure(err: &GatewayError) -> Self {
        let error = match err {
            // The shell greps for this phrase; keep it stable.
            GatewayError::SafetyRejected { decision } => {
                format!("Safety validation failed: {}", decision.errors.join("; "))
            }
            other => other.to_string(),
        };
        Self {
            success: false,
            data: None,
            error: Some(error),
            details: Some(err.details()),
            metadata: None,
        }
    }
}

/// Tool registry: `(name, one-line description)` for the listing endpoint.
pub const TOOLS: &[(&str, &str)] = &[
    ("get_connection_status", "Broker session state, account, uptime"),
    ("reconnect_broker", "Operator-initiated broker reconnect"),
    ("get_portfolio", "Open positions with market values and unrealized PnL"),
    ("get_account_summary", "Account tags: net liquidation, cash, buying power"),
    ("switch_account", "Select another (paper) account on the session"),
    ("get_market_data", "Snapshot quotes for resolved symbols"),
    ("get_forex_rates", "Current rates for supported currency pairs"),
    ("convert_currency", "Convert an amount between currencies"),
    ("resolve_symbol", "Resolve symbols, ids, or company names to contracts"),
    ("place_stop_loss", "Place a basic, stop-limit, or trailing stop order"),
    ("modify_stop_loss", "Adjust an active stop-loss order"),
    ("cancel_stop_loss", "Cancel an active stop-loss order"),
    ("list_stop_losses", "Active stop-loss orders, reconciled with the broker"),
    ("get_open_orders", "All open orders on the account"),
    ("get_completed_orders", "Completed orders (fills via get_executions)"),
    ("get_executions", "Execution records, the authoritative fill source"),
    ("activate_kill_switch", "Halt all trading-side operations"),
    ("deactivate_kill_switch", "Clear the kill switch with the override token"),
    ("get_kill_switch_status", "Current kill switch state"),
    ("get_safety_status", "Kill switch, daily counters, and rate windows"),
];

// ---------------------------------------------------------------------------
// Parameter shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SymbolsParams {
    symbols: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PairsParams {
    pairs: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ConvertParams {
    amount: f64,
    #[serde(alias = "from")]
    from_currency: String,
    #[serde(alias = "to")]
    to_currency: String,
}

#[derive(Debug, Deserialize)]
struct OrderIdParams {
    order_id: i64,
}

#[derive(Debug, Deserialize)]
struct ListStopsParams {
    #[serde(default)]
    symbol: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExecutionsParams {
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    days_back: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct AccountParams {
    account_id: String,
}

#[derive(Debug, Deserialize)]
struct ReasonParams {
    reason: String,
}

#[derive(Debug, Deserialize)]
struct OverrideParams {
    override_token: String,
}

fn parse<T: DeserializeOwned>(parameters: Value) -> Result<T, GatewayError> {
    serde_json::from_value(parameters).map_err(|e| GatewayError::InvalidParameter {
        field: "parameters".to_string(),
        reason: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Route one tool call and wrap the result.
pub async fn dispatch(state: &AppState, tool_name: &str, parameters: Value) -> ToolResponse {
    debug!(tool = tool_name, "tool call received");
    match dispatch_inner(state, tool_name, parameters).await {
        Ok(response) => response,
        Err(err) => ToolResponse::failure(&err),
    }
}

async fn dispatch_inner(
    state: &AppState,
    tool_name: &str,
    parameters: Value,
) -> Result<ToolResponse, GatewayError> {
    match tool_name {
        // ── Connection ──────────────────────────────────────────────
        "get_connection_status" => {
            Ok(ToolResponse::ok(json!(state.portfolio.connection_status())))
        }
        "reconnect_broker" => {
            let account = state.connect_broker().await?;
            Ok(ToolResponse::ok(json!({
                "connected": true,
                "account": account,
            })))
        }

        // ── Portfolio ───────────────────────────────────────────────
        "get_portfolio" => {
            let snapshot = state.portfolio.get_portfolio().await?;
            Ok(ToolResponse::ok(json!(snapshot)))
        }
        "get_account_summary" => {
            let summary = state.portfolio.get_account_summary().await?;
            Ok(ToolResponse::ok(json!({ "values": summary })))
        }
        "switch_account" => {
            let params: AccountParams = parse(parameters)?;
            let status = state.portfolio.switch_account(&params.account_id).await?;
            Ok(ToolResponse::ok(json!(status)))
        }

        // ── Market data ─────────────────────────────────────────────
        "get_market_data" => {
            let params: SymbolsParams = parse(parameters)?;
            market_data(state, params.symbols).await
        }

        // ── Forex ───────────────────────────────────────────────────
        "get_forex_rates" => {
            let params: PairsParams = parse(parameters)?;
            for pair in &params.pairs {
                let payload = OperationPayload::Pair { pair: pair.clone() };
                state
                    .safety
                    .validate_or_reject(OperationKind::ForexRate, &payload)?;
            }
            let rates = state.forex.get_rates(&params.pairs).await?;
            Ok(ToolResponse::ok(json!({ "rates": rates })))
        }
        "convert_currency" => {
            let params: ConvertParams = parse(parameters)?;
            let payload = OperationPayload::Conversion {
                amount: params.amount,
                from: params.from_currency.clone(),
                to: params.to_currency.clone(),
            };
            state
                .safety
                .validate_or_reject(OperationKind::CurrencyConvert, &payload)?;
            let result = state
                .forex
                .convert(params.amount, &params.from_currency, &params.to_currency)
                .await?;
            Ok(ToolResponse::ok(json!(result)))
        }

        // ── Symbol resolution ───────────────────────────────────────
        "resolve_symbol" => {
            let query: ResolutionQuery = parse(parameters)?;
            let payload = OperationPayload::Resolution {
                input: query.raw_input.clone(),
                max_results: query.max_results,
            };
            state
                .safety
                .validate_or_reject(OperationKind::ResolveSymbol, &payload)?;
            match state.resolver.resolve(query).await? {
                ResolverReply::Outcome(outcome) => {
                    let count = outcome.matches.len();
                    Ok(ToolResponse::ok_with_metadata(
                        json!(outcome),
                        json!({ "match_count": count }),
                    ))
                }
                ResolverReply::Stats(stats) => {
                    Ok(ToolResponse::ok(json!({ "cache_stats": stats })))
                }
                ResolverReply::Cleared => Ok(ToolResponse::ok(json!({ "cache_cleared": true }))),
            }
        }

        // ── Stop-loss lifecycle ─────────────────────────────────────
        "place_stop_loss" => {
            let params: StopLossParams = parse(parameters)?;
            let order = state.orders.place_stop_loss(params).await?;
            Ok(ToolResponse::ok(json!(order)))
        }
        "modify_stop_loss" => {
            let changes: StopLossChanges = parse(parameters)?;
            let order = state.orders.modify_stop_loss(changes).await?;
            Ok(ToolResponse::ok(json!(order)))
        }
        "cancel_stop_loss" => {
            let params: OrderIdParams = parse(parameters)?;
            let order = state.orders.cancel_stop_loss(params.order_id).await?;
            Ok(ToolResponse::ok(json!(order)))
        }
        "list_stop_losses" => {
            let params: ListStopsParams = parse(parameters)?;
            let stops = state.orders.list_stop_losses(params.symbol.as_deref()).await?;
            Ok(ToolResponse::ok(json!({ "stop_losses": stops })))
        }

        // ── Order history ───────────────────────────────────────────
        "get_open_orders" => {
            let orders = state.orders.list_open_orders().await?;
            Ok(ToolResponse::ok(json!({ "orders": orders })))
        }
        "get_completed_orders" => {
            let orders = state.orders.list_completed_orders().await?;
            Ok(ToolResponse::ok_with_metadata(
                json!({ "orders": orders }),
                json!({
                    "note": "zero filled/avg_fill_price means not provided; see get_executions"
                }),
            ))
        }
        "get_executions" => {
            let params: ExecutionsParams = parse(parameters)?;
            let executions = state
                .orders
                .list_executions(params.symbol, params.days_back)
                .await?;
            Ok(ToolResponse::ok(json!({ "executions": executions })))
        }

        // ── Kill switch ─────────────────────────────────────────────
        "activate_kill_switch" => {
            let params: ReasonParams = parse(parameters)?;
            let ks_state = state.kill_switch.activate(&params.reason)?;
            Ok(ToolResponse::ok(json!(ks_state)))
        }
        "deactivate_kill_switch" => {
            let params: OverrideParams = parse(parameters)?;
            let ks_state = state.kill_switch.deactivate(&params.override_token)?;
            Ok(ToolResponse::ok(json!(ks_state)))
        }
        "get_kill_switch_status" => Ok(ToolResponse::ok(json!(state.kill_switch.state()))),

        // ── Safety overview ─────────────────────────────────────────
        "get_safety_status" => {
            let snapshot = state.build_snapshot();
            Ok(ToolResponse::ok(json!(snapshot.safety)))
        }

        other => Err(GatewayError::UnknownTool(other.to_string())),
    }
}

/// Resolve each symbol, then snapshot quotes for the resolved contracts.
async fn market_data(
    state: &AppState,
    symbols: Vec<String>,
) -> Result<ToolResponse, GatewayError> {
    let payload = OperationPayload::Symbols {
        symbols: symbols.iter().map(|s| s.trim().to_uppercase()).collect(),
    };
    state
        .safety
        .validate_or_reject(OperationKind::MarketData, &payload)?;

    let mut contracts = Vec::new();
    let mut unresolved = Vec::new();
    for symbol in &symbols {
        let query = ResolutionQuery::for_input(&symbol.trim().to_uppercase());
        match state.resolver.resolve(query).await? {
            ResolverReply::Outcome(outcome) => match outcome.matches.first() {
                Some(best) => {
                    let mut contract =
                        Contract::stock(&best.symbol, &best.exchange, &best.currency);
                    contract.con_id = best.contract_id;
                    contract.primary_exchange = best.primary_exchange.clone();
                    contracts.push(contract);
                }
                None => unresolved.push(symbol.clone()),
            },
            _ => unresolved.push(symbol.clone()),
        }
    }

    let tickers = if contracts.is_empty() {
        Vec::new()
    } else {
        state.session.req_tickers(contracts).await?
    };

    Ok(ToolResponse::ok_with_metadata(
        json!({ "tickers": tickers }),
        json!({ "unresolved": unresolved }),
    ))
}
