//! Hook for the audit trail. Observers see committed changes only.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::WithdrawalRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    WithdrawalRequested,
    WithdrawalApproved,
    WithdrawalRejected,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub action: AuditAction,
    pub actor: Uuid,
    pub before: Option<WithdrawalRequest>,
    pub after: WithdrawalRequest,
    pub at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        action: AuditAction,
        actor: Uuid,
        before: Option<WithdrawalRequest>,
        after: WithdrawalRequest,
    ) -> Self {
        Self {
            action,
            actor,
            before,
            after,
            at: Utc::now(),
        }
    }
}

pub trait AuditObserver: Send + Sync {
    fn observe(&self, event: &AuditEvent);
}

/// Writes each event as a JSON `info` record on the `saldo::audit` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAudit;

impl AuditObserver for TracingAudit {
    fn observe(&self, event: &AuditEvent) {
        match serde_json::to_string(event) {
            Ok(json) => info!(target: "saldo::audit", action = ?event.action, "{json}"),
            Err(e) => info!(target: "saldo::audit", action = ?event.action, error = %e, "unserializable audit event"),
        }
    }
}
