// =============================================================================
// Audit Log: append-only JSON event stream
// =============================================================================
//
// One JSON record per line. Every validation outcome and every broker-call
// attempt lands here. Writes are serialised through a single mutex-guarded
// file handle and flushed per record; losing the very last record on a crash
// is acceptable.
//
// A write failure is reported on stderr and otherwise swallowed: the audit
// log must never fail a trading operation.
//
// SECURITY: payloads are sanitised before writing. Credential-shaped values
// are replaced by a sha256 fingerprint, account identifiers keep only their
// first two characters.
// =============================================================================

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::safety::ValidationDecision;
use crate::types::{OperationKind, OperationPayload};

// ---------------------------------------------------------------------------
// Event model
// ---------------------------------------------------------------------------

/// Result of a broker call that followed a validation, recorded separately
/// from the decision itself.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BrokerOutcome {
    Ok { detail: Option<String> },
    Error { detail: String },
}

/// A single self-contained audit record.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub timestamp_utc: String,
    pub session_id: String,
    pub kind: OperationKind,
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<ValidationDecision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<BrokerOutcome>,
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Single-writer append-only audit log.
pub struct AuditLog {
    session_id: String,
    path: PathBuf,
    file: Mutex<Option<std::fs::File>>,
}

impl AuditLog {
    /// Open (or create) the audit log at `path`.
    ///
    /// An unopenable file degrades to a disabled log with a stderr notice
    /// rather than failing startup.
    pub fn open(path: impl AsRef<Path>, session_id: String) -> Self {
        let path = path.as_ref().to_path_buf();

        let file = match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
        {
            Ok(f) => {
                info!(path = %path.display(), "audit log opened");
                Some(f)
            }
            Err(e) => {
                eprintln!(
                    "audit log unavailable at {}: {e} (events will be dropped)",
                    path.display()
                );
                None
            }
        };

        Self {
            session_id,
            path,
            file: Mutex::new(file),
        }
    }

    /// A log that drops everything. Used by unit tests of other components.
    #[cfg(test)]
    pub fn disabled() -> Self {
        Self {
            session_id: "test-session".to_string(),
            path: PathBuf::from("/dev/null"),
            file: Mutex::new(None),
        }
    }

    /// Record a validation decision for an operation.
    pub fn record_decision(
        &self,
        kind: OperationKind,
        payload: &OperationPayload,
        decision: &ValidationDecision,
    ) {
        self.append(AuditEvent {
            timestamp_utc: Utc::now().to_rfc3339(),
            session_id: self.session_id.clone(),
            kind,
            payload: sanitize(payload_json(payload)),
            decision: Some(decision.clone()),
            outcome: None,
        });
    }

    /// Record the outcome of a broker call that followed a passed validation.
    pub fn record_outcome(
        &self,
        kind: OperationKind,
        payload: &OperationPayload,
        outcome: BrokerOutcome,
    ) {
        self.append(AuditEvent {
            timestamp_utc: Utc::now().to_rfc3339(),
            session_id: self.session_id.clone(),
            kind,
            payload: sanitize(payload_json(payload)),
            decision: None,
            outcome: Some(outcome),
        });
    }

    fn append(&self, event: AuditEvent) {
        let line = match serde_json::to_string(&event) {
            Ok(l) => l,
            Err(e) => {
                eprintln!("audit event serialisation failed: {e}");
                return;
            }
        };

        let mut guard = self.file.lock();
        if let Some(file) = guard.as_mut() {
            if let Err(e) = writeln!(file, "{line}").and_then(|_| file.flush()) {
                eprintln!("audit write failed: {e}");
            }
        }
    }
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("path", &self.path)
            .field("session_id", &self.session_id)
            .finish()
    }
}

fn payload_json(payload: &OperationPayload) -> Value {
    serde_json::to_value(payload).unwrap_or_else(|e| {
        warn!(error = %e, "payload serialisation failed, auditing placeholder");
        Value::String("<unserialisable payload>".to_string())
    })
}

// ---------------------------------------------------------------------------
// Sanitisation
// ---------------------------------------------------------------------------

/// Keys whose string values are credential-shaped and must be fingerprinted.
const SECRET_KEY_MARKERS: &[&str] = &["key", "secret", "token", "password", "credential"];
/// Keys holding account identifiers, truncated to their first two characters.
const ACCOUNT_KEY_MARKERS: &[&str] = &["account", "account_id"];

/// Recursively sanitise a JSON payload for the audit log.
pub fn sanitize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, val) in map {
                let lower = key.to_ascii_lowercase();
                let sanitized = if let Value::String(s) = &val {
                    if SECRET_KEY_MARKERS.iter().any(|m| lower.contains(m)) {
                        Value::String(fingerprint(s))
                    } else if ACCOUNT_KEY_MARKERS.iter().any(|m| lower == *m) {
                        Value::String(truncate_account(s))
                    } else {
                        val
                    }
                } else {
                    sanitize(val)
                };
                out.insert(key, sanitized);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize).collect()),
        other => other,
    }
}

/// Replace a secret with `sha256:<first 8 hex>` so equal secrets remain
/// correlatable across entries without ever being recoverable.
fn fingerprint(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    format!("sha256:{}", &hex::encode(digest)[..8])
}

/// Keep the first two characters of an account id.
fn truncate_account(account: &str) -> String {
    let prefix: String = account.chars().take(2).collect();
    format!("{prefix}***")
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sanitize_fingerprints_secrets() {
        let value = json!({
            "api_key": "abc123",
            "override_token": "letmein",
            "symbol": "AAPL",
        });
        let clean = sanitize(value);
        assert!(clean["api_key"].as_str().unwrap().starts_with("sha256:"));
        assert!(clean["override_token"]
            .as_str()
            .unwrap()
            .starts_with("sha256:"));
        assert_eq!(clean["symbol"], "AAPL");
    }

    #[test]
    fn sanitize_truncates_accounts() {
        let clean = sanitize(json!({ "account_id": "DU1234567" }));
        assert_eq!(clean["account_id"], "DU***");
        let clean = sanitize(json!({ "account": "U99" }));
        assert_eq!(clean["account"], "U9***");
    }

    #[test]
    fn sanitize_recurses_into_nested_structures() {
        let value = json!({
            "orders": [{ "secret": "s1" }, { "secret": "s2" }],
            "inner": { "password": "hunter2" },
        });
        let clean = sanitize(value);
        assert!(clean["orders"][0]["secret"]
            .as_str()
            .unwrap()
            .starts_with("sha256:"));
        assert!(clean["inner"]["password"]
            .as_str()
            .unwrap()
            .starts_with("sha256:"));
    }

    #[test]
    fn fingerprint_is_stable_and_short() {
        let a = fingerprint("same");
        let b = fingerprint("same");
        assert_eq!(a, b);
        assert_eq!(a.len(), "sha256:".len() + 8);
    }

    #[test]
    fn events_append_as_json_lines() {
        let path = std::env::temp_dir().join(format!("meridian_audit_test_{}.jsonl", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let log = AuditLog::open(&path, "s-1".to_string());

        let decision = ValidationDecision::passed(vec!["kill_switch".to_string()]);
        log.record_decision(
            OperationKind::PlaceStopLoss,
            &OperationPayload::Empty,
            &decision,
        );
        log.record_outcome(
            OperationKind::PlaceStopLoss,
            &OperationPayload::Empty,
            BrokerOutcome::Ok { detail: None },
        );

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["kind"], "PlaceStopLoss");
        assert_eq!(first["decision"]["safe"], true);
        let second: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["outcome"]["status"], "ok");
        let _ = std::fs::remove_file(&path);
    }
}
