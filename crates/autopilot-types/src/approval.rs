use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::new_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
    Cancelled,
}

impl ApprovalStatus {
    pub fn is_terminal(self) -> bool {
        self != ApprovalStatus::Pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalPriority {
    Low,
    Medium,
    High,
    Urgent,
}

impl ApprovalPriority {
    /// Default expiry window per priority.
    pub fn expiry_minutes(self) -> i64 {
        match self {
            ApprovalPriority::Low => 30,
            ApprovalPriority::Medium => 15,
            ApprovalPriority::High => 5,
            ApprovalPriority::Urgent => 2,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApprovalResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responded_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responded_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct NotificationsSent {
    pub whatsapp: bool,
    pub push: bool,
    pub email: bool,
}

/// A pending human sign-off for a supervised autonomous action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub id: String,
    pub tenant_id: String,
    pub decision_id: String,
    pub agent_name: String,
    pub action_type: String,
    pub action_summary: String,
    #[serde(default)]
    pub action_details: Value,
    pub priority: ApprovalPriority,
    pub status: ApprovalStatus,
    pub notifications_sent: NotificationsSent,
    pub response: ApprovalResponse,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Approval {
    pub const SUMMARY_MIN: usize = 10;
    pub const SUMMARY_MAX: usize = 500;

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tenant_id: impl Into<String>,
        decision_id: impl Into<String>,
        agent_name: impl Into<String>,
        action_type: impl Into<String>,
        action_summary: impl Into<String>,
        action_details: Value,
        priority: ApprovalPriority,
        expires_in_minutes: Option<i64>,
    ) -> Self {
        let now = Utc::now();
        let expiry = expires_in_minutes.unwrap_or_else(|| priority.expiry_minutes());
        Self {
            id: new_id(),
            tenant_id: tenant_id.into(),
            decision_id: decision_id.into(),
            agent_name: agent_name.into(),
            action_type: action_type.into(),
            action_summary: action_summary.into(),
            action_details,
            priority,
            status: ApprovalStatus::Pending,
            notifications_sent: NotificationsSent::default(),
            response: ApprovalResponse::default(),
            created_at: now,
            updated_at: now,
            expires_at: now + Duration::minutes(expiry),
        }
    }

    pub fn is_expiry_due(&self, now: DateTime<Utc>) -> bool {
        self.status == ApprovalStatus::Pending && now > self.expires_at
    }
}
