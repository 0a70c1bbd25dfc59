// =============================================================================
// Portfolio Service: account reads and account switching
// =============================================================================
//
// Thin over the broker session. Reads are rate-limited and audited like any
// other operation but are never blocked by the kill switch or daily limits.
// =============================================================================

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::error::GatewayError;
use crate::ibkr::contracts::{AccountValue, PortfolioPosition};
use crate::ibkr::session::{BrokerSession, SessionStatus};
use crate::safety::SafetyManager;
use crate::types::{OperationKind, OperationPayload};

/// Account summary tags requested from the broker.
const SUMMARY_TAGS: &[&str] = &[
    "NetLiquidation",
    "TotalCashValue",
    "BuyingPower",
    "AvailableFunds",
    "GrossPositionValue",
];

/// Portfolio snapshot returned by the portfolio tool.
#[derive(Debug, Clone, Serialize)]
pub struct PortfolioSnapshot {
    pub account: Option<String>,
    pub positions: Vec<PortfolioPosition>,
    pub total_market_value: f64,
    pub total_unrealized_pnl: f64,
}

pub struct PortfolioService {
    session: Arc<BrokerSession>,
    safety: Arc<SafetyManager>,
}

impl PortfolioService {
    pub fn new(session: Arc<BrokerSession>, safety: Arc<SafetyManager>) -> Self {
        Self { session, safety }
    }

    pub async fn get_portfolio(&self) -> Result<PortfolioSnapshot, GatewayError> {
        self.safety
            .validate_or_reject(OperationKind::PortfolioRead, &OperationPayload::Empty)?;

        let positions = self.session.req_portfolio().await?;
        let total_market_value = positions.iter().map(|p| p.market_value).sum();
        let total_unrealized_pnl = positions.iter().map(|p| p.unrealized_pnl).sum();

        Ok(PortfolioSnapshot {
            account: self.session.account(),
            positions,
            total_market_value,
            total_unrealized_pnl,
        })
    }

    pub async fn get_account_summary(&self) -> Result<Vec<AccountValue>, GatewayError> {
        self.safety
            .validate_or_reject(OperationKind::PortfolioRead, &OperationPayload::Empty)?;

        let tags = SUMMARY_TAGS.iter().map(|t| t.to_string()).collect();
        self.session.req_account_summary(tags).await
    }

    /// Switch the active account. The paper-prefix policy applies to the
    /// target account before the broker is asked to switch.
    pub async fn switch_account(&self, account_id: &str) -> Result<SessionStatus, GatewayError> {
        let payload = OperationPayload::Account {
            account_id: account_id.to_string(),
        };
        self.safety
            .validate_or_reject(OperationKind::AccountSwitch, &payload)?;

        self.session.switch_account(account_id).await?;
        self.safety.set_active_account(Some(account_id.to_string()));
        info!(account = %account_id, "account switch completed");
        Ok(self.session.status())
    }

    pub fn connection_status(&self) -> SessionStatus {
        self.session.status()
    }
}

impl std::fmt::Debug for PortfolioService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortfolioService").finish()
    }
}
