mod agent_state;
mod approval;
mod audit;
mod config;
mod customer;
mod decision;
mod error;
mod event;
mod gap;
mod money;
mod outreach;

pub use agent_state::{
    tenant_today, AgentConfig, AgentCounters, AgentHealth, AgentState, AgentStatus, BreakerState,
    CircuitBreaker, RateWindow, TypeCounter,
};
pub use approval::{Approval, ApprovalPriority, ApprovalResponse, ApprovalStatus, NotificationsSent};
pub use audit::{AuditEventType, AuditRecord, AuditSeverity};
pub use config::EngineConfig;
pub use customer::{ChurnRisk, CustomerScore, Engagement, LifetimeValue, CustomerSegment, RiskLevel};
pub use decision::{
    ApprovalRef, AutonomyLevel, Decision, DecisionContext, DecisionKind, Outcome, OutcomeStatus,
    RevenueImpact,
};
pub use error::AgentError;
pub use event::{DomainEvent, EventType};
pub use gap::{FilledBy, Gap, GapPriority, GapStatus};
pub use money::Money;
pub use outreach::{
    Delivery, Outreach, OutreachChannel, OutreachResponse, OutreachStatus, OutreachType,
    ReplyAction,
};

/// Generate an opaque document id.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
