// =============================================================================
// Broker Session: the single connection to the gateway
// =============================================================================
//
// `BrokerApi` is the opaque wire contract; `BrokerSession` owns the one
// instance of it and layers on everything the rest of the gateway relies on:
//
//   - connection-state tracking (`is_connected` checked before every call)
//   - per-call timeouts surfacing `BrokerTimeout`
//   - request serialisation: the broker correlates request/response on a
//     single logical stream, so calls are funnelled through one async mutex
//   - a disconnect event feed that downstream caches subscribe to
//
// Reconnects are operator-initiated. A user-facing call on a dead session
// fails fast with `NotConnected` and never reconnects mid-call.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::error::GatewayError;
use crate::ibkr::contracts::{
    AccountValue, Contract, ContractDescription, ExecutionFilter, ExecutionRecord, OrderRecord,
    OrderTicket, PortfolioPosition, Ticker,
};

/// Timeout for symbol resolution and other read calls.
const READ_TIMEOUT_SECS: u64 = 10;
/// Timeout for order placement and cancellation.
const ORDER_TIMEOUT_SECS: u64 = 30;

// ---------------------------------------------------------------------------
// Wire contract
// ---------------------------------------------------------------------------

/// Handshake data returned by the gateway on connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerHello {
    pub account_id: String,
    #[serde(default)]
    pub server_version: i32,
}

/// Emitted by a transport when its connection drops.
#[derive(Debug, Clone)]
pub struct DisconnectEvent {
    pub reason: String,
}

/// The opaque broker contract. One implementation speaks to the real gateway
/// bridge; tests substitute a scriptable mock.
#[async_trait]
pub trait BrokerApi: Send + Sync {
    async fn connect(&self, client_id: i32) -> Result<BrokerHello, GatewayError>;
    async fn disconnect(&self);
    fn is_connected(&self) -> bool;
    fn subscribe_disconnects(&self) -> broadcast::Receiver<DisconnectEvent>;

    async fn qualify_contracts(
        &self,
        contracts: Vec<Contract>,
    ) -> Result<Vec<ContractDescription>, GatewayError>;
    async fn req_tickers(&self, contracts: Vec<Contract>) -> Result<Vec<Ticker>, GatewayError>;
    async fn req_matching_symbols(
        &self,
        query: &str,
    ) -> Result<Vec<ContractDescription>, GatewayError>;

    async fn place_order(
        &self,
        contract: Contract,
        order: OrderTicket,
    ) -> Result<OrderRecord, GatewayError>;
    async fn cancel_order(&self, order_id: i64) -> Result<(), GatewayError>;
    async fn req_open_orders(&self) -> Result<Vec<OrderRecord>, GatewayError>;
    async fn req_completed_orders(&self) -> Result<Vec<OrderRecord>, GatewayError>;
    async fn req_executions(
        &self,
        filter: ExecutionFilter,
    ) -> Result<Vec<ExecutionRecord>, GatewayError>;

    async fn req_portfolio(&self) -> Result<Vec<PortfolioPosition>, GatewayError>;
    async fn req_account_summary(
        &self,
        tags: Vec<String>,
    ) -> Result<Vec<AccountValue>, GatewayError>;
    async fn switch_account(&self, account_id: &str) -> Result<(), GatewayError>;
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Session-level event, rebroadcast from the transport.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Disconnected { reason: String },
}

/// Serialisable session status for the state snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub connected: bool,
    pub account: Option<String>,
    pub uptime_seconds: Option<u64>,
    pub session_id: String,
    pub client_id: i32,
}

pub struct BrokerSession {
    api: Arc<dyn BrokerApi>,
    session_id: String,
    client_id: i32,
    connected: AtomicBool,
    account: RwLock<Option<String>>,
    connected_at: RwLock<Option<Instant>>,
    /// Serialises all broker calls: the wire protocol is single-threaded
    /// with respect to request/response correlation.
    call_gate: tokio::sync::Mutex<()>,
    events_tx: broadcast::Sender<SessionEvent>,
}

impl BrokerSession {
    pub fn new(api: Arc<dyn BrokerApi>, client_id: i32, session_id: String) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            api,
            session_id,
            client_id,
            connected: AtomicBool::new(false),
            account: RwLock::new(None),
            connected_at: RwLock::new(None),
            call_gate: tokio::sync::Mutex::new(()),
            events_tx,
        })
    }

    /// Subscribe to session events (currently disconnect notifications).
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    /// Forward transport disconnects into session state and events. Spawned
    /// once at startup.
    pub fn spawn_event_pump(self: &Arc<Self>) {
        let session = self.clone();
        let mut rx = self.api.subscribe_disconnects();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                warn!(reason = %event.reason, "broker transport disconnected");
                session.connected.store(false, Ordering::SeqCst);
                *session.connected_at.write() = None;
                let _ = session.events_tx.send(SessionEvent::Disconnected {
                    reason: event.reason,
                });
            }
        });
    }

    // -------------------------------------------------------------------------
    // Connection lifecycle
    // -------------------------------------------------------------------------

    /// Connect and return the active account id.
    pub async fn connect(&self) -> Result<String, GatewayError> {
        let _gate = self.call_gate.lock().await;
        let hello = tokio::time::timeout(
            Duration::from_secs(READ_TIMEOUT_SECS),
            self.api.connect(self.client_id),
        )
        .await
        .map_err(|_| GatewayError::BrokerTimeout {
            seconds: READ_TIMEOUT_SECS,
        })??;

        self.connected.store(true, Ordering::SeqCst);
        *self.account.write() = Some(hello.account_id.clone());
        *self.connected_at.write() = Some(Instant::now());
        info!(
            account = %hello.account_id,
            server_version = hello.server_version,
            client_id = self.client_id,
            "broker session connected"
        );
        Ok(hello.account_id)
    }

    pub async fn disconnect(&self) {
        let _gate = self.call_gate.lock().await;
        self.api.disconnect().await;
        self.connected.store(false, Ordering::SeqCst);
        *self.connected_at.write() = None;
        let _ = self.events_tx.send(SessionEvent::Disconnected {
            reason: "operator disconnect".to_string(),
        });
        info!("broker session disconnected");
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.api.is_connected()
    }

    pub fn account(&self) -> Option<String> {
        self.account.read().clone()
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            connected: self.is_connected(),
            account: self.account(),
            uptime_seconds: self.connected_at.read().map(|t| t.elapsed().as_secs()),
            session_id: self.session_id.clone(),
            client_id: self.client_id,
        }
    }

    fn ensure_connected(&self) -> Result<(), GatewayError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(GatewayError::NotConnected)
        }
    }

    /// Run one broker call under the gate with a deadline.
    async fn call<T, F>(&self, timeout_secs: u64, fut: F) -> Result<T, GatewayError>
    where
        F: std::future::Future<Output = Result<T, GatewayError>>,
    {
        self.ensure_connected()?;
        let _gate = self.call_gate.lock().await;
        match tokio::time::timeout(Duration::from_secs(timeout_secs), fut).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::BrokerTimeout {
                seconds: timeout_secs,
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Broker operations
    // -------------------------------------------------------------------------

    pub async fn qualify_contracts(
        &self,
        contracts: Vec<Contract>,
    ) -> Result<Vec<ContractDescription>, GatewayError> {
        self.call(READ_TIMEOUT_SECS, self.api.qualify_contracts(contracts))
            .await
    }

    pub async fn req_tickers(&self, contracts: Vec<Contract>) -> Result<Vec<Ticker>, GatewayError> {
        self.call(READ_TIMEOUT_SECS, self.api.req_tickers(contracts))
            .await
    }

    pub async fn req_matching_symbols(
        &self,
        query: &str,
    ) -> Result<Vec<ContractDescription>, GatewayError> {
        self.call(READ_TIMEOUT_SECS, self.api.req_matching_symbols(query))
            .await
    }

    pub async fn place_order(
        &self,
        contract: Contract,
        order: OrderTicket,
    ) -> Result<OrderRecord, GatewayError> {
        self.call(ORDER_TIMEOUT_SECS, self.api.place_order(contract, order))
            .await
    }

    pub async fn cancel_order(&self, order_id: i64) -> Result<(), GatewayError> {
        self.call(ORDER_TIMEOUT_SECS, self.api.cancel_order(order_id))
            .await
    }

    pub async fn req_open_orders(&self) -> Result<Vec<OrderRecord>, GatewayError> {
        self.call(READ_TIMEOUT_SECS, self.api.req_open_orders()).await
    }

    pub async fn req_completed_orders(&self) -> Result<Vec<OrderRecord>, GatewayError> {
        self.call(READ_TIMEOUT_SECS, self.api.req_completed_orders())
            .await
    }

    pub async fn req_executions(
        &self,
        filter: ExecutionFilter,
    ) -> Result<Vec<ExecutionRecord>, GatewayError> {
        self.call(READ_TIMEOUT_SECS, self.api.req_executions(filter))
            .await
    }

    pub async fn req_portfolio(&self) -> Result<Vec<PortfolioPosition>, GatewayError> {
        self.call(READ_TIMEOUT_SECS, self.api.req_portfolio()).await
    }

    pub async fn req_account_summary(
        &self,
        tags: Vec<String>,
    ) -> Result<Vec<AccountValue>, GatewayError> {
        self.call(READ_TIMEOUT_SECS, self.api.req_account_summary(tags))
            .await
    }

    pub async fn switch_account(&self, account_id: &str) -> Result<(), GatewayError> {
        self.call(READ_TIMEOUT_SECS, self.api.switch_account(account_id))
            .await?;
        *self.account.write() = Some(account_id.to_string());
        info!(account = %account_id, "active account switched");
        Ok(())
    }
}

impl std::fmt::Debug for BrokerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerSession")
            .field("session_id", &self.session_id)
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .field("account", &self.account.read())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::ibkr::testing::MockBroker;

    #[tokio::test]
    async fn calls_fail_fast_when_disconnected() {
        let mock = Arc::new(MockBroker::new("DU1234567"));
        let session = BrokerSession::new(mock, 7, "s-test".to_string());

        let err = session.req_open_orders().await.unwrap_err();
        assert_eq!(err.kind(), "NotConnected");
    }

    #[tokio::test]
    async fn connect_tracks_account_and_uptime() {
        let mock = Arc::new(MockBroker::new("DU1234567"));
        let session = BrokerSession::new(mock, 7, "s-test".to_string());

        let account = session.connect().await.unwrap();
        assert_eq!(account, "DU1234567");
        assert!(session.is_connected());

        let status = session.status();
        assert!(status.connected);
        assert_eq!(status.account.as_deref(), Some("DU1234567"));
        assert!(status.uptime_seconds.is_some());
    }

    #[tokio::test]
    async fn transport_disconnect_marks_session_down() {
        let mock = Arc::new(MockBroker::new("DU1234567"));
        let session = BrokerSession::new(mock.clone(), 7, "s-test".to_string());
        session.spawn_event_pump();
        session.connect().await.unwrap();

        let mut events = session.subscribe();
        mock.fire_disconnect("socket reset");

        let event = events.recv().await.unwrap();
        match event {
            SessionEvent::Disconnected { reason } => assert_eq!(reason, "socket reset"),
        }
        assert!(!session.is_connected());

        let err = session.req_open_orders().await.unwrap_err();
        assert_eq!(err.kind(), "NotConnected");
    }

    #[tokio::test]
    async fn switch_account_updates_session_state() {
        let mock = Arc::new(MockBroker::new("DU1234567"));
        let session = BrokerSession::new(mock, 7, "s-test".to_string());
        session.connect().await.unwrap();

        session.switch_account("DU7654321").await.unwrap();
        assert_eq!(session.account().as_deref(), Some("DU7654321"));
    }
}
