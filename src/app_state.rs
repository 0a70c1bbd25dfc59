// =============================================================================
// Central Application State: the Meridian gateway context object
// =============================================================================
//
// One context owns every subsystem and is passed explicitly wherever work
// happens. No process-wide singletons: tests build as many isolated contexts
// as they like.
//
// Thread safety:
//   - subsystems manage their own interior mutability (parking_lot locks,
//     atomics) and are shared via Arc
//   - the broker session serialises its own calls; nothing here adds locks
//     around it
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::AuditLog;
use crate::config::Settings;
use crate::error::GatewayError;
use crate::forex::{ForexCache, ForexEngine};
use crate::ibkr::session::{BrokerApi, BrokerSession, SessionEvent, SessionStatus};
use crate::orders::OrderManager;
use crate::portfolio::PortfolioService;
use crate::resolve::{CacheStats, ResolutionCache, SymbolResolver};
use crate::safety::{
    DailyCountersSnapshot, DailyLimits, KillSwitch, KillSwitchState, RateLimiter,
    RateWindowSnapshot, SafetyManager,
};

/// How often tracked stop-loss orders are reconciled against the broker.
const RECONCILE_INTERVAL_SECS: u64 = 60;

pub struct AppState {
    pub settings: Arc<Settings>,

    // ── Broker ──────────────────────────────────────────────────────────
    pub session: Arc<BrokerSession>,

    // ── Safety framework ────────────────────────────────────────────────
    pub kill_switch: Arc<KillSwitch>,
    pub daily_limits: Arc<DailyLimits>,
    pub rate_limiter: Arc<RateLimiter>,
    pub audit: Arc<AuditLog>,
    pub safety: Arc<SafetyManager>,

    // ── Forex ───────────────────────────────────────────────────────────
    pub forex_cache: Arc<ForexCache>,
    pub forex: Arc<ForexEngine>,

    // ── Symbol resolution ───────────────────────────────────────────────
    pub resolution_cache: Arc<ResolutionCache>,
    pub resolver: Arc<SymbolResolver>,

    // ── Orders & portfolio ──────────────────────────────────────────────
    pub orders: Arc<OrderManager>,
    pub portfolio: Arc<PortfolioService>,

    pub start_time: Instant,
}

impl AppState {
    /// Wire every subsystem from settings and a broker transport.
    pub fn new(settings: Settings, broker_api: Arc<dyn BrokerApi>) -> Arc<Self> {
        let settings = Arc::new(settings);
        let session_id = Uuid::new_v4().to_string();

        let session = BrokerSession::new(broker_api, settings.client_id, session_id.clone());

        let audit = Arc::new(AuditLog::open(&settings.audit_log_file, session_id));
        let kill_switch = Arc::new(KillSwitch::new(
            settings.enable_kill_switch,
            settings.kill_switch_override_token.clone(),
        ));
        let daily_limits = Arc::new(DailyLimits::new(
            settings.max_daily_orders,
            settings.max_stop_loss_orders,
            settings.max_portfolio_value_at_risk,
        ));
        let rate_limiter = Arc::new(RateLimiter::new(&settings));
        let safety = Arc::new(SafetyManager::new(
            settings.clone(),
            kill_switch.clone(),
            rate_limiter.clone(),
            daily_limits.clone(),
            audit.clone(),
        ));

        let forex_cache = Arc::new(ForexCache::new());
        let forex = Arc::new(ForexEngine::new(
            session.clone(),
            forex_cache.clone(),
            settings.forex_conversion_use_mid,
        ));

        let resolution_cache = Arc::new(ResolutionCache::new());
        let resolver = Arc::new(SymbolResolver::new(
            session.clone(),
            resolution_cache.clone(),
            rate_limiter.clone(),
            settings.fallback_to_exact_on_fuzzy_fail,
        ));

        let orders = Arc::new(OrderManager::new(
            settings.clone(),
            session.clone(),
            safety.clone(),
            daily_limits.clone(),
            rate_limiter.clone(),
            audit.clone(),
            forex.clone(),
        ));
        let portfolio = Arc::new(PortfolioService::new(session.clone(), safety.clone()));

        Arc::new(Self {
            settings,
            session,
            kill_switch,
            daily_limits,
            rate_limiter,
            audit,
            safety,
            forex_cache,
            forex,
            resolution_cache,
            resolver,
            orders,
            portfolio,
            start_time: Instant::now(),
        })
    }

    /// Connect (or reconnect) the broker session and propagate the active
    /// account to the safety manager.
    pub async fn connect_broker(&self) -> Result<String, GatewayError> {
        let account = self.session.connect().await?;
        self.safety.set_active_account(Some(account.clone()));
        Ok(account)
    }

    /// Spawn the long-lived background tasks: the session event pump, the
    /// disconnect-driven cache invalidation, and the stop-loss reconciler.
    pub fn spawn_background_tasks(self: &Arc<Self>) {
        self.session.spawn_event_pump();

        // Resolution cache invalidation on disconnect: a new session may see
        // a different contract universe.
        let state = self.clone();
        let mut events = self.session.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    SessionEvent::Disconnected { reason } => {
                        warn!(reason = %reason, "session down; invalidating resolution cache");
                        state.resolution_cache.invalidate_all();
                    }
                }
            }
        });

        // Periodic stop-loss reconciliation keeps the active counter honest
        // even when nobody calls list_stop_losses.
        let state = self.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(RECONCILE_INTERVAL_SECS));
            interval.tick().await; // first tick fires immediately
            loop {
                interval.tick().await;
                if !state.session.is_connected() {
                    continue;
                }
                if let Err(e) = state.orders.reconcile().await {
                    warn!(error = %e, "stop-loss reconciliation failed");
                }
            }
        });

        info!("background tasks started");
    }

    // -------------------------------------------------------------------------
    // Snapshot
    // -------------------------------------------------------------------------

    /// Serialisable snapshot for `GET /api/v1/state`.
    pub fn build_snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            server_time: Utc::now().timestamp_millis(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            session: self.session.status(),
            safety: SafetySnapshot {
                kill_switch: self.kill_switch.state(),
                daily_limits: self.daily_limits.snapshot(),
                rate_windows: self.rate_limiter.snapshot(),
                trading_enabled: self.settings.enable_trading,
                stop_loss_orders_enabled: self.settings.enable_stop_loss_orders,
                paper_verification_enabled: self.settings.require_paper_account_verification,
                active_account: self.safety.active_account(),
            },
            resolver_stats: self.resolver.cache_stats(),
            forex_cache_entries: self.forex_cache.len(),
            active_stop_losses: self.orders.active_stop_count(),
            settings: (*self.settings).clone(),
        }
    }
}

/// Safety-framework portion of the state snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SafetySnapshot {
    pub kill_switch: KillSwitchState,
    pub daily_limits: DailyCountersSnapshot,
    pub rate_windows: Vec<RateWindowSnapshot>,
    pub trading_enabled: bool,
    pub stop_loss_orders_enabled: bool,
    pub paper_verification_enabled: bool,
    pub active_account: Option<String>,
}

/// Full gateway state snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub server_time: i64,
    pub uptime_seconds: u64,
    pub session: SessionStatus,
    pub safety: SafetySnapshot,
    pub resolver_stats: CacheStats,
    pub forex_cache_entries: usize,
    pub active_stop_losses: usize,
    pub settings: Settings,
}
