use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Domain events published to the external pub-sub topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    DecisionCreated,
    DecisionResolved,
    GapDetected,
    GapFilled,
    GapExpired,
    OutreachSent,
    OutreachDelivered,
    OutreachRead,
    OutreachResponded,
    OutreachFailed,
    OutreachExpired,
    ApprovalRequested,
    ApprovalApproved,
    ApprovalRejected,
    ApprovalExpired,
    CircuitBreakerTripped,
    Backpressure,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::DecisionCreated => "DECISION_CREATED",
            EventType::DecisionResolved => "DECISION_RESOLVED",
            EventType::GapDetected => "GAP_DETECTED",
            EventType::GapFilled => "GAP_FILLED",
            EventType::GapExpired => "GAP_EXPIRED",
            EventType::OutreachSent => "OUTREACH_SENT",
            EventType::OutreachDelivered => "OUTREACH_DELIVERED",
            EventType::OutreachRead => "OUTREACH_READ",
            EventType::OutreachResponded => "OUTREACH_RESPONDED",
            EventType::OutreachFailed => "OUTREACH_FAILED",
            EventType::OutreachExpired => "OUTREACH_EXPIRED",
            EventType::ApprovalRequested => "APPROVAL_REQUESTED",
            EventType::ApprovalApproved => "APPROVAL_APPROVED",
            EventType::ApprovalRejected => "APPROVAL_REJECTED",
            EventType::ApprovalExpired => "APPROVAL_EXPIRED",
            EventType::CircuitBreakerTripped => "CIRCUIT_BREAKER_TRIPPED",
            EventType::Backpressure => "BACKPRESSURE",
        }
    }
}

/// Wire shape published to the topic; `event_type` and `tenant_id` are also
/// attached as message attributes for subscriber-side filtering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event_type: EventType,
    pub tenant_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: Value,
}

impl DomainEvent {
    pub fn new(event_type: EventType, tenant_id: impl Into<String>, data: Value) -> Self {
        Self {
            event_type,
            tenant_id: tenant_id.into(),
            timestamp: Utc::now(),
            data,
        }
    }

    pub fn attributes(&self) -> [(&'static str, String); 2] {
        [
            ("event_type", self.event_type.as_str().to_string()),
            ("tenant_id", self.tenant_id.clone()),
        ]
    }
}
