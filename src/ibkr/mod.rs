// =============================================================================
// Interactive Brokers integration
// =============================================================================
//
//   contracts  broker-side data model (contracts, orders, executions)
//   session    connection ownership, timeouts, call serialisation, events
//   bridge     WebSocket transport to the local gateway bridge process
// =============================================================================

pub mod bridge;
pub mod contracts;
pub mod session;

// -----------------------------------------------------------------------------
// Scriptable mock transport shared by unit tests across the crate
// -----------------------------------------------------------------------------
#[cfg(test)]
pub mod testing {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::{Mutex, RwLock};
    use tokio::sync::broadcast;

    use crate::error::GatewayError;
    use crate::ibkr::contracts::{
        AccountValue, Contract, ContractDescription, ExecutionFilter, ExecutionRecord,
        OrderRecord, OrderStatus, OrderTicket, PortfolioPosition, Ticker,
    };
    use crate::ibkr::session::{BrokerApi, BrokerHello, DisconnectEvent};
    use crate::types::SecType;

    /// Build a qualified description for test scripting.
    pub fn mock_desc(
        symbol: &str,
        exchange: &str,
        currency: &str,
        company: Option<&str>,
        con_id: i64,
    ) -> ContractDescription {
        let mut contract = Contract::stock(symbol, exchange, currency);
        contract.con_id = con_id;
        contract.primary_exchange = Some(exchange.to_string());
        ContractDescription {
            contract,
            company_name: company.map(|s| s.to_string()),
            country: None,
            cusip: None,
            isin: None,
        }
    }

    /// In-memory `BrokerApi` with scriptable responses and call counters.
    pub struct MockBroker {
        account: RwLock<String>,
        connected: AtomicBool,
        disconnects: broadcast::Sender<DisconnectEvent>,

        /// Qualification results keyed by `"SYMBOL|EXCHANGE"`.
        pub qualify_responses: Mutex<HashMap<String, Vec<ContractDescription>>>,
        /// Qualification results keyed by alternative id (CUSIP/ISIN/conId).
        pub alt_id_responses: Mutex<HashMap<String, Vec<ContractDescription>>>,
        /// Fuzzy search results keyed by query string.
        pub matching_responses: Mutex<HashMap<String, Vec<ContractDescription>>>,
        /// Quotes keyed by pair (forex) or symbol: (bid, ask, last, close).
        pub quotes: Mutex<HashMap<String, (f64, f64, f64, f64)>>,

        pub fail_matching: AtomicBool,
        pub fail_place: Mutex<Option<GatewayError>>,
        pub place_status: Mutex<OrderStatus>,

        pub placed: Mutex<Vec<(Contract, OrderTicket)>>,
        pub cancelled: Mutex<Vec<i64>>,
        pub open_orders: Mutex<Vec<OrderRecord>>,
        pub completed_orders: Mutex<Vec<OrderRecord>>,
        pub executions: Mutex<Vec<ExecutionRecord>>,
        pub portfolio: Mutex<Vec<PortfolioPosition>>,

        pub qualify_calls: AtomicU32,
        pub matching_calls: AtomicU32,
        pub ticker_calls: AtomicU32,

        next_order_id: AtomicI64,
    }

    impl MockBroker {
        pub fn new(account: &str) -> Self {
            let (disconnects, _) = broadcast::channel(8);
            Self {
                account: RwLock::new(account.to_string()),
                connected: AtomicBool::new(false),
                disconnects,
                qualify_responses: Mutex::new(HashMap::new()),
                alt_id_responses: Mutex::new(HashMap::new()),
                matching_responses: Mutex::new(HashMap::new()),
                quotes: Mutex::new(HashMap::new()),
                fail_matching: AtomicBool::new(false),
                fail_place: Mutex::new(None),
                place_status: Mutex::new(OrderStatus::Submitted),
                placed: Mutex::new(Vec::new()),
                cancelled: Mutex::new(Vec::new()),
                open_orders: Mutex::new(Vec::new()),
                completed_orders: Mutex::new(Vec::new()),
                executions: Mutex::new(Vec::new()),
                portfolio: Mutex::new(Vec::new()),
                qualify_calls: AtomicU32::new(0),
                matching_calls: AtomicU32::new(0),
                ticker_calls: AtomicU32::new(0),
                next_order_id: AtomicI64::new(1000),
            }
        }

        pub fn add_qualified(&self, symbol: &str, exchange: &str, desc: ContractDescription) {
            self.qualify_responses
                .lock()
                .entry(format!("{symbol}|{exchange}"))
                .or_default()
                .push(desc);
        }

        pub fn add_alt_id(&self, id: &str, desc: ContractDescription) {
            self.alt_id_responses
                .lock()
                .entry(id.to_string())
                .or_default()
                .push(desc);
        }

        pub fn add_matching(&self, query: &str, descs: Vec<ContractDescription>) {
            self.matching_responses
                .lock()
                .insert(query.to_string(), descs);
        }

        pub fn set_quote(&self, key: &str, bid: f64, ask: f64, last: f64, close: f64) {
            self.quotes
                .lock()
                .insert(key.to_string(), (bid, ask, last, close));
        }

        pub fn fire_disconnect(&self, reason: &str) {
            self.connected.store(false, Ordering::SeqCst);
            let _ = self.disconnects.send(DisconnectEvent {
                reason: reason.to_string(),
            });
        }

        fn quote_key(contract: &Contract) -> String {
            match contract.sec_type {
                SecType::Cash => format!("{}{}", contract.symbol, contract.currency),
                SecType::Stock => contract.symbol.clone(),
            }
        }
    }

    #[async_trait]
    impl BrokerApi for MockBroker {
        async fn connect(&self, _client_id: i32) -> Result<BrokerHello, GatewayError> {
            self.connected.store(true, Ordering::SeqCst);
            Ok(BrokerHello {
                account_id: self.account.read().clone(),
                server_version: 176,
            })
        }

        async fn disconnect(&self) {
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
            self.qualify_calls.fetch_add(1, Ordering::SeqCst);
            let mut out = Vec::new();
            for contract in &contracts {
                if let Some(id) = &contract.sec_id {
                    if let Some(descs) = self.alt_id_responses.lock().get(id) {
                        out.extend(descs.clone());
                    }
                } else {
                    let key = format!("{}|{}", contract.symbol, contract.exchange);
                    if let Some(descs) = self.qualify_responses.lock().get(&key) {
                        out.extend(descs.clone());
                    }
                }
            }
            Ok(out)
        }

        async fn req_tickers(
            &self,
            contracts: Vec<Contract>,
        ) -> Result<Vec<Ticker>, GatewayError> {
            self.ticker_calls.fetch_add(1, Ordering::SeqCst);
            let quotes = self.quotes.lock();
            Ok(contracts
                .into_iter()
                .map(|contract| {
                    let (bid, ask, last, close) = quotes
                        .get(&Self::quote_key(&contract))
                        .copied()
                        .unwrap_or((f64::NAN, f64::NAN, f64::NAN, f64::NAN));
                    Ticker {
                        contract,
                        bid,
                        ask,
                        last,
                        close,
                        timestamp: Utc::now(),
                    }
                })
                .collect())
        }

        async fn req_matching_symbols(
            &self,
            query: &str,
        ) -> Result<Vec<ContractDescription>, GatewayError> {
            self.matching_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_matching.load(Ordering::SeqCst) {
                return Err(GatewayError::BrokerRejected {
                    reason: "matching symbols unavailable".to_string(),
                });
            }
            Ok(self
                .matching_responses
                .lock()
                .get(query)
                .cloned()
                .unwrap_or_default())
        }

        async fn place_order(
            &self,
            contract: Contract,
            order: OrderTicket,
        ) -> Result<OrderRecord, GatewayError> {
            if let Some(err) = self.fail_place.lock().take() {
                return Err(err);
            }
            let order_id = self.next_order_id.fetch_add(1, Ordering::SeqCst);
            let record = OrderRecord {
                order_id,
                perm_id: Some(order_id * 31),
                contract: contract.clone(),
                action: order.action,
                order_type: order.order_type.clone(),
                total_quantity: order.total_quantity,
                aux_price: order.aux_price,
                limit_price: order.limit_price,
                trailing_percent: order.trailing_percent,
                time_in_force: order.time_in_force,
                status: *self.place_status.lock(),
                filled: 0.0,
                remaining: order.total_quantity,
                avg_fill_price: 0.0,
            };
            self.placed.lock().push((contract, order));
            self.open_orders.lock().push(record.clone());
            Ok(record)
        }

        async fn cancel_order(&self, order_id: i64) -> Result<(), GatewayError> {
            self.cancelled.lock().push(order_id);
            let mut orders = self.open_orders.lock();
            match orders.iter_mut().find(|o| o.order_id == order_id) {
                Some(order) => {
                    order.status = OrderStatus::Cancelled;
                    Ok(())
                }
                None => Err(GatewayError::BrokerRejected {
                    reason: format!("unknown order id {order_id}"),
                }),
            }
        }

        async fn req_open_orders(&self) -> Result<Vec<OrderRecord>, GatewayError> {
            Ok(self
                .open_orders
                .lock()
                .iter()
                .filter(|o| !o.status.is_terminal())
                .cloned()
                .collect())
        }

        async fn req_completed_orders(&self) -> Result<Vec<OrderRecord>, GatewayError> {
            Ok(self.completed_orders.lock().clone())
        }

        async fn req_executions(
            &self,
            filter: ExecutionFilter,
        ) -> Result<Vec<ExecutionRecord>, GatewayError> {
            Ok(self
                .executions
                .lock()
                .iter()
                .filter(|e| {
                    filter
                        .symbol
                        .as_ref()
                        .map(|s| e.symbol.eq_ignore_ascii_case(s))
                        .unwrap_or(true)
                })
                .cloned()
                .collect())
        }

        async fn req_portfolio(&self) -> Result<Vec<PortfolioPosition>, GatewayError> {
            Ok(self.portfolio.lock().clone())
        }

        async fn req_account_summary(
            &self,
            tags: Vec<String>,
        ) -> Result<Vec<AccountValue>, GatewayError> {
            Ok(tags
                .into_iter()
                .map(|tag| AccountValue {
                    tag,
                    value: "100000.00".to_string(),
                    currency: "USD".to_string(),
                })
                .collect())
        }

        async fn switch_account(&self, account_id: &str) -> Result<(), GatewayError> {
            *self.account.write() = account_id.to_string();
            Ok(())
        }
    }
}
