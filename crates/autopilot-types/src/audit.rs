use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::new_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    Decision,
    Approval,
    Outreach,
    Error,
    ConfigChange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Append-only audit trail entry. Never updated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: String,
    pub tenant_id: String,
    pub event_type: AuditEventType,
    pub severity: AuditSeverity,
    /// Agent id or user id that caused the event.
    pub actor: String,
    pub resource_kind: String,
    pub resource_id: String,
    pub action: String,
    #[serde(default)]
    pub details: Value,
    pub trace_id: String,
    pub created_at: DateTime<Utc>,
}

impl AuditRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tenant_id: impl Into<String>,
        event_type: AuditEventType,
        severity: AuditSeverity,
        actor: impl Into<String>,
        resource_kind: impl Into<String>,
        resource_id: impl Into<String>,
        action: impl Into<String>,
        details: Value,
        trace_id: impl Into<String>,
    ) -> Self {
        Self {
            id: new_id(),
            tenant_id: tenant_id.into(),
            event_type,
            severity,
            actor: actor.into(),
            resource_kind: resource_kind.into(),
            resource_id: resource_id.into(),
            action: action.into(),
            details,
            trace_id: trace_id.into(),
            created_at: Utc::now(),
        }
    }
}
