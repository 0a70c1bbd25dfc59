// =============================================================================
// Gateway Bridge Transport: WebSocket JSON frames with correlation ids
// =============================================================================
//
// Speaks to the local bridge process that fronts the Interactive Brokers
// Gateway socket. Every request carries a monotonically increasing id; the
// bridge echoes the id on its response frame:
//
//   -> {"id": 7, "method": "qualify_contracts", "params": {...}}
//   <- {"id": 7, "ok": true, "result": [...]}
//   <- {"id": 7, "ok": false, "error": "No security definition found"}
//
// A single reader task routes responses to pending oneshot channels. When
// the socket drops, every pending call fails and a disconnect event is
// broadcast so the session (and its caches) can react.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::GatewayError;
use crate::ibkr::contracts::{
    AccountValue, Contract, ContractDescription, ExecutionFilter, ExecutionRecord, OrderRecord,
    OrderTicket, PortfolioPosition, Ticker,
};
use crate::ibkr::session::{BrokerApi, BrokerHello, DisconnectEvent};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type Pending = Arc<parking_lot::Mutex<HashMap<u64, oneshot::Sender<Result<Value, String>>>>>;

pub struct WsBridge {
    url: String,
    sink: tokio::sync::Mutex<Option<WsSink>>,
    pending: Pending,
    next_id: AtomicU64,
    connected: Arc<AtomicBool>,
    disconnects: broadcast::Sender<DisconnectEvent>,
}

impl WsBridge {
    pub fn new(url: impl Into<String>) -> Self {
        let (disconnects, _) = broadcast::channel(8);
        Self {
            url: url.into(),
            sink: tokio::sync::Mutex::new(None),
            pending: Arc::new(parking_lot::Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            connected: Arc::new(AtomicBool::new(false)),
            disconnects,
        }
    }

    /// Establish the WebSocket and spawn the frame reader.
    async fn open_socket(&self) -> Result<(), GatewayError> {
        let (ws, _) = connect_async(self.url.as_str()).await.map_err(|e| {
            warn!(url = %self.url, error = %e, "bridge connection failed");
            GatewayError::NotConnected
        })?;
        let (sink, mut stream) = ws.split();
        *self.sink.lock().await = Some(sink);
        self.connected.store(true, Ordering::SeqCst);
        info!(url = %self.url, "bridge socket established");

        let pending = self.pending.clone();
        let connected = self.connected.clone();
        let disconnects = self.disconnects.clone();
        tokio::spawn(async move {
            let mut reason = "socket closed by peer".to_string();
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => route_frame(&pending, &text),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        reason = e.to_string();
                        break;
                    }
                }
            }
            connected.store(false, Ordering::SeqCst);
            fail_pending(&pending, &reason);
            let _ = disconnects.send(DisconnectEvent { reason });
        });

        Ok(())
    }

    /// Issue one request frame and await its correlated response.
    async fn call(&self, method: &str, params: Value) -> Result<Value, GatewayError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(GatewayError::NotConnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let frame = json!({ "id": id, "method": method, "params": params }).to_string();
        debug!(id, method, "bridge request");

        {
            let mut guard = self.sink.lock().await;
            let sink = match guard.as_mut() {
                Some(s) => s,
                None => {
                    self.pending.lock().remove(&id);
                    return Err(GatewayError::NotConnected);
                }
            };
            if let Err(e) = sink.send(Message::Text(frame)).await {
                warn!(id, method, error = %e, "bridge send failed");
                self.pending.lock().remove(&id);
                return Err(GatewayError::NotConnected);
            }
        }

        match rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(reason)) => Err(GatewayError::BrokerRejected { reason }),
            Err(_) => Err(GatewayError::NotConnected),
        }
    }

    async fn call_as<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, GatewayError> {
        let result = self.call(method, params).await?;
        serde_json::from_value(result).map_err(|e| GatewayError::BrokerRejected {
            reason: format!("malformed bridge response for {method}: {e}"),
        })
    }
}

/// Route one inbound frame to its pending caller.
fn route_frame(pending: &Pending, text: &str) {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "unparseable bridge frame");
            return;
        }
    };

    let Some(id) = value.get("id").and_then(|v| v.as_u64()) else {
        // Unsolicited push frame; nothing subscribes to these yet.
        debug!(frame = %value, "ignoring unsolicited bridge frame");
        return;
    };

    let Some(tx) = pending.lock().remove(&id) else {
        debug!(id, "bridge response for unknown request id");
        return;
    };

    let ok = value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false);
    let outcome = if ok {
        Ok(value.get("result").cloned().unwrap_or(Value::Null))
    } else {
        Err(value
            .get("error")
            .and_then(|v| v.as_str())
            .unwrap_or("unspecified bridge error")
            .to_string())
    };
    let _ = tx.send(outcome);
}

/// Fail every in-flight call when the socket drops.
fn fail_pending(pending: &Pending, reason: &str) {
    let mut map = pending.lock();
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(format!("connection lost: {reason}")));
    }
}

#[async_trait]
impl BrokerApi for WsBridge {
    async fn connect(&self, client_id: i32) -> Result<BrokerHello, GatewayError> {
        self.open_socket().await?;
        self.call_as("connect", json!({ "client_id": client_id }))
            .await
    }

    async fn disconnect(&self) {
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.send(Message::Close(None)).await;
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn subscribe_disconnects(&self) -> broadcast::Receiver<DisconnectEvent> {
        self.disconnects.subscribe()
    }

    async fn qualify_contracts(
        &self,
        contracts: Vec<Contract>,
    ) -> Result<Vec<ContractDescription>, GatewayError> {
        self.call_as("qualify_contracts", json!({ "contracts": contracts }))
            .await
    }

    async fn req_tickers(&self, contracts: Vec<Contract>) -> Result<Vec<Ticker>, GatewayError> {
        self.call_as("req_tickers", json!({ "contracts": contracts }))
            .await
    }

    async fn req_matching_symbols(
        &self,
        query: &str,
    ) -> Result<Vec<ContractDescription>, GatewayError> {
        self.call_as("req_matching_symbols", json!({ "query": query }))
            .await
    }

    async fn place_order(
        &self,
        contract: Contract,
        order: OrderTicket,
    ) -> Result<OrderRecord, GatewayError> {
        self.call_as(
            "place_order",
            json!({ "contract": contract, "order": order }),
        )
        .await
    }

    async fn cancel_order(&self, order_id: i64) -> Result<(), GatewayError> {
        self.call("cancel_order", json!({ "order_id": order_id }))
            .await?;
        Ok(())
    }

    async fn req_open_orders(&self) -> Result<Vec<OrderRecord>, GatewayError> {
        self.call_as("req_open_orders", json!({})).await
    }

    async fn req_completed_orders(&self) -> Result<Vec<OrderRecord>, GatewayError> {
        self.call_as("req_completed_orders", json!({})).await
    }

    async fn req_executions(
        &self,
        filter: ExecutionFilter,
    ) -> Result<Vec<ExecutionRecord>, GatewayError> {
        self.call_as("req_executions", json!({ "filter": filter }))
            .await
    }

    async fn req_portfolio(&self) -> Result<Vec<PortfolioPosition>, GatewayError> {
        self.call_as("req_portfolio", json!({})).await
    }

    async fn req_account_summary(
        &self,
        tags: Vec<String>,
    ) -> Result<Vec<AccountValue>, GatewayError> {
        self.call_as("req_account_summary", json!({ "tags": tags }))
            .await
    }

    async fn switch_account(&self, account_id: &str) -> Result<(), GatewayError> {
        self.call("switch_account", json!({ "account_id": account_id }))
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for WsBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsBridge")
            .field("url", &self.url)
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .finish()
    }
}
