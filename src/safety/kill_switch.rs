// =============================================================================
// Kill Switch: operator trip-wire blocking all trading-side operations
// =============================================================================
//
// Armed by the operator with a reason; cleared only with the configured
// override token. `is_active` is read-mostly and cheap. The activation
// reason travels into every subsequent rejection so the caller always sees
// why trading is halted.
// =============================================================================

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::api::auth::constant_time_eq;
use crate::error::GatewayError;

/// Serialisable kill-switch state.
#[derive(Debug, Clone, Serialize)]
pub struct KillSwitchState {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activated_at: Option<DateTime<Utc>>,
}

pub struct KillSwitch {
    /// When the subsystem is disarmed via config, activation is refused and
    /// `is_active` always reports false.
    enabled: bool,
    override_token: Option<String>,
    state: RwLock<KillSwitchState>,
}

impl KillSwitch {
    pub fn new(enabled: bool, override_token: Option<String>) -> Self {
        Self {
            enabled,
            override_token,
            state: RwLock::new(KillSwitchState {
                active: false,
                reason: None,
                activated_at: None,
            }),
        }
    }

    /// Trip the switch. Idempotent: re-activating updates the reason.
    pub fn activate(&self, reason: &str) -> Result<KillSwitchState, GatewayError> {
        if !self.enabled {
            warn!("kill switch activation requested but the subsystem is disabled");
            return Err(GatewayError::PermissionDenied(
                "kill switch subsystem is disabled (enable_kill_switch)".to_string(),
            ));
        }

        let mut s = self.state.write();
        s.active = true;
        s.reason = Some(reason.to_string());
        s.activated_at = Some(Utc::now());
        warn!(reason, "KILL SWITCH ACTIVATED: all trading-side operations blocked");
        Ok(s.clone())
    }

    /// Clear the switch. Requires the operator override token.
    pub fn deactivate(&self, override_token: &str) -> Result<KillSwitchState, GatewayError> {
        let expected = self.override_token.as_deref().unwrap_or("");
        if expected.is_empty()
            || !constant_time_eq(override_token.as_bytes(), expected.as_bytes())
        {
            warn!("kill switch deactivation rejected: bad override token");
            return Err(GatewayError::PermissionDenied(
                "invalid kill switch override token".to_string(),
            ));
        }

        let mut s = self.state.write();
        s.active = false;
        s.reason = None;
        s.activated_at = None;
        info!("kill switch deactivated by operator override");
        Ok(s.clone())
    }

    pub fn is_active(&self) -> bool {
        self.enabled && self.state.read().active
    }

    /// Reason recorded at activation, if any.
    pub fn reason(&self) -> Option<String> {
        self.state.read().reason.clone()
    }

    pub fn state(&self) -> KillSwitchState {
        self.state.read().clone()
    }
}

impl std::fmt::Debug for KillSwitch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KillSwitch")
            .field("enabled", &self.enabled)
            .field("active", &self.state.read().active)
            .field("override_token", &"<redacted>")
            .finish()
    }
}
