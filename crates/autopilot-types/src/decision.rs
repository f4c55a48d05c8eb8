use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{new_id, ApprovalStatus, Money};

/// Kinds of autonomous choices the platform records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    GapFill,
    NoShowPrevention,
    WaitlistPromotion,
    DiscountOffer,
    DynamicPricing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutonomyLevel {
    FullAuto,
    Supervised,
    ManualOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Pending,
    Success,
    Failed,
    Expired,
    Rejected,
}

impl OutcomeStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, OutcomeStatus::Pending)
    }
}

/// What triggered the decision and which records it touches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecisionContext {
    pub trigger_id: String,
    pub trigger_kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staff_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RevenueImpact {
    pub potential: Money,
    pub actual: Money,
}

/// Approval status mirrored onto the decision document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApprovalRef {
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ApprovalStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub status: OutcomeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub booking_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Default for Outcome {
    fn default() -> Self {
        Self {
            status: OutcomeStatus::Pending,
            result: None,
            booking_id: None,
            completed_at: None,
        }
    }
}

/// One record per autonomous choice, with revenue attribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub tenant_id: String,
    pub agent_name: String,
    pub kind: DecisionKind,
    pub autonomy_level: AutonomyLevel,
    pub context: DecisionContext,
    pub action_summary: String,
    #[serde(default)]
    pub action_details: Value,
    pub revenue: RevenueImpact,
    pub approval: ApprovalRef,
    pub outcome: Outcome,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Decision {
    /// A decision not moved to a terminal outcome expires after this long.
    pub const EXPIRY_MINUTES: i64 = 15;

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tenant_id: impl Into<String>,
        agent_name: impl Into<String>,
        kind: DecisionKind,
        autonomy_level: AutonomyLevel,
        context: DecisionContext,
        action_summary: impl Into<String>,
        action_details: Value,
        potential_revenue: Money,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            tenant_id: tenant_id.into(),
            agent_name: agent_name.into(),
            kind,
            autonomy_level,
            context,
            action_summary: action_summary.into(),
            action_details,
            revenue: RevenueImpact {
                potential: potential_revenue,
                actual: Money::ZERO,
            },
            approval: ApprovalRef {
                required: autonomy_level == AutonomyLevel::Supervised,
                ..ApprovalRef::default()
            },
            outcome: Outcome::default(),
            created_at: now,
            updated_at: now,
            expires_at: now + Duration::minutes(Self::EXPIRY_MINUTES),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.outcome.status == OutcomeStatus::Pending && now > self.expires_at
    }

    /// Resolve the outcome. A successful resolution must carry a booking id
    /// and a non-negative actual revenue.
    pub fn resolve(
        &mut self,
        status: OutcomeStatus,
        result: Option<String>,
        booking_id: Option<String>,
        actual_revenue: Money,
    ) {
        debug_assert!(
            status != OutcomeStatus::Success
                || (booking_id.is_some() && actual_revenue.minor() >= 0)
        );
        let now = Utc::now();
        self.outcome = Outcome {
            status,
            result,
            booking_id,
            completed_at: Some(now),
        };
        if status == OutcomeStatus::Success {
            self.revenue.actual = actual_revenue;
        }
        self.updated_at = now;
    }
}
