use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{new_id, Money};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomerSegment {
    Vip,
    HighValue,
    Regular,
    AtRisk,
    New,
    Dormant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LifetimeValue {
    pub total: Money,
    pub projected: Money,
    pub avg_visit_value: Money,
    pub visit_frequency_monthly: f64,
    pub estimated_lifespan_months: u32,
    pub membership_bonus: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChurnRisk {
    /// 0–100, higher is worse.
    pub score: u32,
    pub level: RiskLevel,
    #[serde(default)]
    pub factors: Vec<String>,
}

impl Default for ChurnRisk {
    fn default() -> Self {
        Self {
            score: 0,
            level: RiskLevel::Low,
            factors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Engagement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_visit_at: Option<DateTime<Utc>>,
    pub visits_90d: u32,
    pub responded_outreach_90d: u32,
}

/// Precomputed per-(tenant, customer) score projection. Created on first
/// booking; recomputed after visits, payments, and a daily sweep — the
/// recomputation itself lives outside this system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerScore {
    pub id: String,
    pub tenant_id: String,
    pub customer_id: String,
    pub customer_name: String,
    pub phone: String,
    pub ltv: LifetimeValue,
    pub engagement: Engagement,
    pub churn_risk: ChurnRisk,
    pub segment: CustomerSegment,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CustomerScore {
    pub fn new(
        tenant_id: impl Into<String>,
        customer_id: impl Into<String>,
        customer_name: impl Into<String>,
        phone: impl Into<String>,
        segment: CustomerSegment,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            tenant_id: tenant_id.into(),
            customer_id: customer_id.into(),
            customer_name: customer_name.into(),
            phone: phone.into(),
            ltv: LifetimeValue::default(),
            engagement: Engagement::default(),
            churn_risk: ChurnRisk::default(),
            segment,
            created_at: now,
            updated_at: now,
        }
    }
}
