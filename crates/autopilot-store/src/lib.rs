//! Record stores fronting the external document store.
//!
//! Every entity is tenant-scoped: the tenant id is a mandatory argument on
//! every query and the first component of every key. There are no
//! cross-record transactions; consistency comes from record-scoped
//! conditional updates (a mutate closure applied under the record lock) plus
//! the monotone state machines layered on top.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use autopilot_types::{
    AgentState, Approval, AuditRecord, CustomerScore, Decision, Gap, Outreach, OutreachStatus,
    RiskLevel,
};

mod memory;

pub use memory::MemoryStore;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Record-scoped conditional update. The closure runs while the record is
/// exclusively held; returning an error aborts the update without writing.
pub type Mutation<T> = Box<dyn FnOnce(&mut T) -> StoreResult<()> + Send>;

#[async_trait]
pub trait DecisionStore: Send + Sync {
    async fn put_decision(&self, decision: Decision) -> StoreResult<Decision>;
    async fn get_decision(&self, tenant_id: &str, id: &str) -> StoreResult<Option<Decision>>;
    /// The decision owned by a trigger (e.g. a gap), if any.
    async fn find_decision_by_trigger(
        &self,
        tenant_id: &str,
        trigger_id: &str,
    ) -> StoreResult<Option<Decision>>;
    async fn update_decision(
        &self,
        tenant_id: &str,
        id: &str,
        mutate: Mutation<Decision>,
    ) -> StoreResult<Decision>;
    async fn list_expired_decisions(
        &self,
        tenant_id: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Decision>>;
}

#[async_trait]
pub trait AgentStateStore: Send + Sync {
    async fn get_agent_state(
        &self,
        tenant_id: &str,
        agent_name: &str,
    ) -> StoreResult<Option<AgentState>>;
    async fn get_or_create_agent_state(
        &self,
        tenant_id: &str,
        agent_name: &str,
    ) -> StoreResult<AgentState>;
    /// Linearization point for counter bumps and breaker transitions: the
    /// closure observes and mutates the record atomically.
    async fn update_agent_state(
        &self,
        tenant_id: &str,
        agent_name: &str,
        mutate: Mutation<AgentState>,
    ) -> StoreResult<AgentState>;
}

#[async_trait]
pub trait ApprovalStore: Send + Sync {
    async fn put_approval(&self, approval: Approval) -> StoreResult<Approval>;
    async fn get_approval(&self, tenant_id: &str, id: &str) -> StoreResult<Option<Approval>>;
    async fn find_approval_by_decision(
        &self,
        tenant_id: &str,
        decision_id: &str,
    ) -> StoreResult<Option<Approval>>;
    async fn update_approval(
        &self,
        tenant_id: &str,
        id: &str,
        mutate: Mutation<Approval>,
    ) -> StoreResult<Approval>;
    /// Pending approvals whose expiry has passed.
    async fn list_expiry_due_approvals(
        &self,
        tenant_id: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Approval>>;
    async fn list_approvals_created_since(
        &self,
        tenant_id: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Approval>>;
}

#[async_trait]
pub trait OutreachStore: Send + Sync {
    async fn put_outreach(&self, outreach: Outreach) -> StoreResult<Outreach>;
    async fn get_outreach(&self, tenant_id: &str, id: &str) -> StoreResult<Option<Outreach>>;
    async fn update_outreach(
        &self,
        tenant_id: &str,
        id: &str,
        mutate: Mutation<Outreach>,
    ) -> StoreResult<Outreach>;
    /// O(1) reverse lookup used by provider status callbacks. Provider
    /// message ids are globally unique, so this is not tenant-scoped.
    async fn find_outreach_by_provider_message_id(
        &self,
        provider_message_id: &str,
    ) -> StoreResult<Option<Outreach>>;
    /// Most recent outreach to a phone number across tenants — the inbound
    /// webhook carries no tenant context, only the sender's number.
    async fn find_recent_outreach_by_phone(
        &self,
        phone: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Option<Outreach>>;
    /// Most recent outreach to a phone number within one tenant (cooldown).
    async fn find_recent_outreach_by_phone_for_tenant(
        &self,
        tenant_id: &str,
        phone: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Option<Outreach>>;
    async fn list_outreach_by_trigger(
        &self,
        tenant_id: &str,
        trigger_id: &str,
    ) -> StoreResult<Vec<Outreach>>;
    async fn count_outreach_created_since(
        &self,
        tenant_id: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<usize>;
    async fn list_expiry_due_outreach(
        &self,
        tenant_id: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Outreach>>;
    async fn list_outreach_by_status(
        &self,
        tenant_id: &str,
        status: OutreachStatus,
        limit: usize,
    ) -> StoreResult<Vec<Outreach>>;
    async fn list_outreach_created_since(
        &self,
        tenant_id: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Outreach>>;
}

#[async_trait]
pub trait GapStore: Send + Sync {
    async fn put_gap(&self, gap: Gap) -> StoreResult<Gap>;
    async fn get_gap(&self, tenant_id: &str, id: &str) -> StoreResult<Option<Gap>>;
    async fn update_gap(
        &self,
        tenant_id: &str,
        id: &str,
        mutate: Mutation<Gap>,
    ) -> StoreResult<Gap>;
    async fn list_open_gaps(
        &self,
        tenant_id: &str,
        date: NaiveDate,
        min_duration_minutes: u32,
    ) -> StoreResult<Vec<Gap>>;
    /// Open gaps whose date is already in the past (expiry sweep input).
    async fn list_stale_open_gaps(
        &self,
        tenant_id: &str,
        before: NaiveDate,
        limit: usize,
    ) -> StoreResult<Vec<Gap>>;
}

#[async_trait]
pub trait CustomerScoreStore: Send + Sync {
    async fn put_customer_score(&self, score: CustomerScore) -> StoreResult<CustomerScore>;
    async fn get_customer_score(
        &self,
        tenant_id: &str,
        customer_id: &str,
    ) -> StoreResult<Option<CustomerScore>>;
    /// Customers whose churn level is at or above `min_level`, worst first.
    async fn list_at_risk_customers(
        &self,
        tenant_id: &str,
        min_level: RiskLevel,
        limit: usize,
    ) -> StoreResult<Vec<CustomerScore>>;
    async fn list_customers_by_segment(
        &self,
        tenant_id: &str,
        segment: autopilot_types::CustomerSegment,
        limit: usize,
    ) -> StoreResult<Vec<CustomerScore>>;
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append_audit(&self, record: AuditRecord) -> StoreResult<()>;
    async fn list_recent_audit(
        &self,
        tenant_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<AuditRecord>>;
}

/// Tenants known to the store, for fan-out sweeps that were invoked without
/// a tenant. Returns ids only, never records.
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn tenant_ids(&self) -> StoreResult<Vec<String>>;
}

/// The full record layer, as one object-safe bound.
pub trait Store:
    DecisionStore
    + AgentStateStore
    + ApprovalStore
    + OutreachStore
    + GapStore
    + CustomerScoreStore
    + AuditStore
    + TenantDirectory
{
}

impl<T> Store for T where
    T: DecisionStore
        + AgentStateStore
        + ApprovalStore
        + OutreachStore
        + GapStore
        + CustomerScoreStore
        + AuditStore
        + TenantDirectory
{
}
