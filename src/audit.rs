//! Security audit log.
//!
//! Writes structured JSON entries, one per line, to an append-only sink.
//! Certificate and key material is never written; identities appear only as
//! SPIFFE IDs.

use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::authz::AuthorizationDecision;
use crate::error::ErrorCode;
use crate::identity::WorkloadIdentity;
use crate::types::SpiffeId;

/// Audit event type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// The policy service denied a call, or no rule matched.
    AuthorizationDenied,
    /// A denial was overridden because authorization runs in log-only mode.
    LogOnlyAllow,
    /// A peer presented an identity other than the expected one.
    PeerVerificationFailed,
    /// An inbound request was rejected before reaching its handler.
    InboundRejected,
    /// A new workload identity became current.
    IdentityRotated,
    /// The workload identity expired without a refresh.
    IdentityExpired,
}

#[derive(Debug, Serialize)]
struct AuditEntry {
    timestamp: String,
    request_id: String,
    event_type: AuditEventType,
    details: serde_json::Value,
}

/// Audit logger writing structured JSON to an append-only sink.
pub struct AuditLogger {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl AuditLogger {
    /// Create an audit logger that appends to the given file path.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be opened for appending.
    pub fn new(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(Self {
            writer: Mutex::new(Box::new(file)),
        })
    }

    /// Create an audit logger from an arbitrary writer.
    pub fn from_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// An audit logger that discards everything.
    pub fn disabled() -> Self {
        Self::from_writer(Box::new(std::io::sink()))
    }

    /// Log a denied authorization check.
    ///
    /// # Errors
    ///
    /// Returns an error when the entry cannot be written.
    pub fn log_authorization_denied(
        &self,
        request_id: Option<Uuid>,
        caller: &SpiffeId,
        resource: &SpiffeId,
        action: &str,
        decision: &AuthorizationDecision,
    ) -> anyhow::Result<()> {
        self.write_entry(
            AuditEventType::AuthorizationDenied,
            request_id,
            serde_json::json!({
                "caller": caller,
                "resource": resource,
                "action": action,
                "outcome": decision.outcome,
                "reason": decision.reason,
                "policy_id": decision.policy_id,
            }),
        )
    }

    /// Log a denial that log-only mode turned into an allow.
    ///
    /// # Errors
    ///
    /// Returns an error when the entry cannot be written.
    pub fn log_log_only_allow(
        &self,
        caller: &SpiffeId,
        resource: &SpiffeId,
        action: &str,
        reason: &str,
    ) -> anyhow::Result<()> {
        self.write_entry(
            AuditEventType::LogOnlyAllow,
            None,
            serde_json::json!({
                "caller": caller,
                "resource": resource,
                "action": action,
                "overridden_reason": reason,
            }),
        )
    }

    /// Log a peer identity mismatch.
    ///
    /// # Errors
    ///
    /// Returns an error when the entry cannot be written.
    pub fn log_peer_verification_failed(
        &self,
        expected: &SpiffeId,
        presented: Option<&SpiffeId>,
        detail: &str,
    ) -> anyhow::Result<()> {
        self.write_entry(
            AuditEventType::PeerVerificationFailed,
            None,
            serde_json::json!({
                "expected": expected,
                "presented": presented,
                "detail": detail,
            }),
        )
    }

    /// Log an inbound request rejected before dispatch.
    ///
    /// # Errors
    ///
    /// Returns an error when the entry cannot be written.
    pub fn log_inbound_rejected(
        &self,
        request_id: Option<Uuid>,
        peer: &SpiffeId,
        action: Option<&str>,
        code: ErrorCode,
        reason: &str,
    ) -> anyhow::Result<()> {
        self.write_entry(
            AuditEventType::InboundRejected,
            request_id,
            serde_json::json!({
                "peer": peer,
                "action": action,
                "code": code,
                "reason": reason,
            }),
        )
    }

    /// Log an identity rotation.
    ///
    /// # Errors
    ///
    /// Returns an error when the entry cannot be written.
    pub fn log_identity_rotated(&self, identity: &WorkloadIdentity) -> anyhow::Result<()> {
        self.write_entry(
            AuditEventType::IdentityRotated,
            None,
            serde_json::json!({
                "spiffe_id": identity.spiffe_id(),
                "not_before": identity.not_before(),
                "not_after": identity.not_after(),
            }),
        )
    }

    /// Log an identity that expired without refresh.
    ///
    /// # Errors
    ///
    /// Returns an error when the entry cannot be written.
    pub fn log_identity_expired(
        &self,
        spiffe_id: &SpiffeId,
        expired_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        self.write_entry(
            AuditEventType::IdentityExpired,
            None,
            serde_json::json!({
                "spiffe_id": spiffe_id,
                "expired_at": expired_at,
            }),
        )
    }

    /// Write a single JSON line to the audit log.
    fn write_entry(
        &self,
        event_type: AuditEventType,
        request_id: Option<Uuid>,
        details: serde_json::Value,
    ) -> anyhow::Result<()> {
        let entry = AuditEntry {
            timestamp: Utc::now().to_rfc3339(),
            request_id: request_id.map(|id| id.to_string()).unwrap_or_default(),
            event_type,
            details,
        };
        let line = serde_json::to_string(&entry)?;
        let mut writer = self
            .writer
            .lock()
            .map_err(|e| anyhow::anyhow!("audit lock poisoned: {e}"))?;
        writeln!(writer, "{line}")?;
        writer.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLogger").finish_non_exhaustive()
    }
}
