//! In-memory store used by the engine in single-node mode and by tests.
//!
//! Each entity lives in a `RwLock<HashMap<(tenant, key), T>>`; holding the
//! map's write lock across a mutate closure is the record-scoped conditional
//! update the external document store provides via CAS.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::RwLock;

use autopilot_types::{
    AgentState, Approval, AuditRecord, CustomerScore, CustomerSegment, Decision, Gap, GapStatus,
    Outreach, OutreachStatus, RiskLevel,
};

use crate::{
    AgentStateStore, ApprovalStore, AuditStore, CustomerScoreStore, DecisionStore, GapStore,
    Mutation, OutreachStore, StoreError, StoreResult, TenantDirectory,
};

type Key = (String, String);

#[derive(Default)]
pub struct MemoryStore {
    decisions: RwLock<HashMap<Key, Decision>>,
    agent_states: RwLock<HashMap<Key, AgentState>>,
    approvals: RwLock<HashMap<Key, Approval>>,
    outreach: RwLock<HashMap<Key, Outreach>>,
    outreach_by_message: RwLock<HashMap<String, Key>>,
    gaps: RwLock<HashMap<Key, Gap>>,
    scores: RwLock<HashMap<Key, CustomerScore>>,
    audit: RwLock<Vec<AuditRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn key(tenant_id: &str, id: &str) -> Key {
    (tenant_id.to_string(), id.to_string())
}

#[async_trait]
impl DecisionStore for MemoryStore {
    async fn put_decision(&self, decision: Decision) -> StoreResult<Decision> {
        let mut guard = self.decisions.write().await;
        guard.insert(key(&decision.tenant_id, &decision.id), decision.clone());
        Ok(decision)
    }

    async fn get_decision(&self, tenant_id: &str, id: &str) -> StoreResult<Option<Decision>> {
        Ok(self.decisions.read().await.get(&key(tenant_id, id)).cloned())
    }

    async fn find_decision_by_trigger(
        &self,
        tenant_id: &str,
        trigger_id: &str,
    ) -> StoreResult<Option<Decision>> {
        let guard = self.decisions.read().await;
        let mut found: Option<&Decision> = None;
        for decision in guard.values() {
            if decision.tenant_id == tenant_id && decision.context.trigger_id == trigger_id {
                let newer = found.map_or(true, |prev| decision.created_at > prev.created_at);
                if newer {
                    found = Some(decision);
                }
            }
        }
        Ok(found.cloned())
    }

    async fn update_decision(
        &self,
        tenant_id: &str,
        id: &str,
        mutate: Mutation<Decision>,
    ) -> StoreResult<Decision> {
        let mut guard = self.decisions.write().await;
        let decision = guard
            .get_mut(&key(tenant_id, id))
            .ok_or_else(|| StoreError::NotFound(format!("decision {id}")))?;
        mutate(decision)?;
        decision.updated_at = Utc::now();
        Ok(decision.clone())
    }

    async fn list_expired_decisions(
        &self,
        tenant_id: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Decision>> {
        let guard = self.decisions.read().await;
        let mut out: Vec<Decision> = guard
            .values()
            .filter(|d| d.tenant_id == tenant_id && d.is_expired(now))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        out.truncate(limit);
        Ok(out)
    }
}

#[async_trait]
impl AgentStateStore for MemoryStore {
    async fn get_agent_state(
        &self,
        tenant_id: &str,
        agent_name: &str,
    ) -> StoreResult<Option<AgentState>> {
        Ok(self
            .agent_states
            .read()
            .await
            .get(&key(tenant_id, agent_name))
            .cloned())
    }

    async fn get_or_create_agent_state(
        &self,
        tenant_id: &str,
        agent_name: &str,
    ) -> StoreResult<AgentState> {
        let mut guard = self.agent_states.write().await;
        let state = guard
            .entry(key(tenant_id, agent_name))
            .or_insert_with(|| AgentState::new(tenant_id, agent_name));
        Ok(state.clone())
    }

    async fn update_agent_state(
        &self,
        tenant_id: &str,
        agent_name: &str,
        mutate: Mutation<AgentState>,
    ) -> StoreResult<AgentState> {
        let mut guard = self.agent_states.write().await;
        let state = guard
            .entry(key(tenant_id, agent_name))
            .or_insert_with(|| AgentState::new(tenant_id, agent_name));
        mutate(state)?;
        state.updated_at = Utc::now();
        Ok(state.clone())
    }
}

#[async_trait]
impl ApprovalStore for MemoryStore {
    async fn put_approval(&self, approval: Approval) -> StoreResult<Approval> {
        let mut guard = self.approvals.write().await;
        guard.insert(key(&approval.tenant_id, &approval.id), approval.clone());
        Ok(approval)
    }

    async fn get_approval(&self, tenant_id: &str, id: &str) -> StoreResult<Option<Approval>> {
        Ok(self.approvals.read().await.get(&key(tenant_id, id)).cloned())
    }

    async fn find_approval_by_decision(
        &self,
        tenant_id: &str,
        decision_id: &str,
    ) -> StoreResult<Option<Approval>> {
        let guard = self.approvals.read().await;
        Ok(guard
            .values()
            .find(|a| a.tenant_id == tenant_id && a.decision_id == decision_id)
            .cloned())
    }

    async fn update_approval(
        &self,
        tenant_id: &str,
        id: &str,
        mutate: Mutation<Approval>,
    ) -> StoreResult<Approval> {
        let mut guard = self.approvals.write().await;
        let approval = guard
            .get_mut(&key(tenant_id, id))
            .ok_or_else(|| StoreError::NotFound(format!("approval {id}")))?;
        mutate(approval)?;
        approval.updated_at = Utc::now();
        Ok(approval.clone())
    }

    async fn list_expiry_due_approvals(
        &self,
        tenant_id: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Approval>> {
        let guard = self.approvals.read().await;
        let mut out: Vec<Approval> = guard
            .values()
            .filter(|a| a.tenant_id == tenant_id && a.is_expiry_due(now))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        out.truncate(limit);
        Ok(out)
    }

    async fn list_approvals_created_since(
        &self,
        tenant_id: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Approval>> {
        let guard = self.approvals.read().await;
        let mut out: Vec<Approval> = guard
            .values()
            .filter(|a| a.tenant_id == tenant_id && a.created_at >= since)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        out.truncate(limit);
        Ok(out)
    }
}

#[async_trait]
impl OutreachStore for MemoryStore {
    async fn put_outreach(&self, outreach: Outreach) -> StoreResult<Outreach> {
        let mut guard = self.outreach.write().await;
        guard.insert(key(&outreach.tenant_id, &outreach.id), outreach.clone());
        Ok(outreach)
    }

    async fn get_outreach(&self, tenant_id: &str, id: &str) -> StoreResult<Option<Outreach>> {
        Ok(self.outreach.read().await.get(&key(tenant_id, id)).cloned())
    }

    async fn update_outreach(
        &self,
        tenant_id: &str,
        id: &str,
        mutate: Mutation<Outreach>,
    ) -> StoreResult<Outreach> {
        let mut guard = self.outreach.write().await;
        let record = guard
            .get_mut(&key(tenant_id, id))
            .ok_or_else(|| StoreError::NotFound(format!("outreach {id}")))?;
        mutate(record)?;
        record.updated_at = Utc::now();
        let updated = record.clone();
        drop(guard);

        if let Some(message_id) = updated.delivery.provider_message_id.clone() {
            self.outreach_by_message
                .write()
                .await
                .insert(message_id, key(tenant_id, id));
        }
        Ok(updated)
    }

    async fn find_outreach_by_provider_message_id(
        &self,
        provider_message_id: &str,
    ) -> StoreResult<Option<Outreach>> {
        let index = self.outreach_by_message.read().await;
        let Some(record_key) = index.get(provider_message_id) else {
            return Ok(None);
        };
        Ok(self.outreach.read().await.get(record_key).cloned())
    }

    async fn find_recent_outreach_by_phone(
        &self,
        phone: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Option<Outreach>> {
        let guard = self.outreach.read().await;
        let mut found: Option<&Outreach> = None;
        for record in guard.values() {
            if record.customer_phone == phone && record.created_at >= since {
                let newer = found.map_or(true, |prev| record.created_at > prev.created_at);
                if newer {
                    found = Some(record);
                }
            }
        }
        Ok(found.cloned())
    }

    async fn find_recent_outreach_by_phone_for_tenant(
        &self,
        tenant_id: &str,
        phone: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Option<Outreach>> {
        let guard = self.outreach.read().await;
        let mut found: Option<&Outreach> = None;
        for record in guard.values() {
            if record.tenant_id == tenant_id
                && record.customer_phone == phone
                && record.created_at >= since
            {
                let newer = found.map_or(true, |prev| record.created_at > prev.created_at);
                if newer {
                    found = Some(record);
                }
            }
        }
        Ok(found.cloned())
    }

    async fn list_outreach_by_trigger(
        &self,
        tenant_id: &str,
        trigger_id: &str,
    ) -> StoreResult<Vec<Outreach>> {
        let guard = self.outreach.read().await;
        let mut out: Vec<Outreach> = guard
            .values()
            .filter(|o| o.tenant_id == tenant_id && o.trigger_id.as_deref() == Some(trigger_id))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn count_outreach_created_since(
        &self,
        tenant_id: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<usize> {
        let guard = self.outreach.read().await;
        Ok(guard
            .values()
            .filter(|o| o.tenant_id == tenant_id && o.created_at >= since)
            .count())
    }

    async fn list_expiry_due_outreach(
        &self,
        tenant_id: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Outreach>> {
        let guard = self.outreach.read().await;
        let mut out: Vec<Outreach> = guard
            .values()
            .filter(|o| o.tenant_id == tenant_id && o.is_expiry_due(now))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        out.truncate(limit);
        Ok(out)
    }

    async fn list_outreach_by_status(
        &self,
        tenant_id: &str,
        status: OutreachStatus,
        limit: usize,
    ) -> StoreResult<Vec<Outreach>> {
        let guard = self.outreach.read().await;
        let mut out: Vec<Outreach> = guard
            .values()
            .filter(|o| o.tenant_id == tenant_id && o.status == status)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        out.truncate(limit);
        Ok(out)
    }

    async fn list_outreach_created_since(
        &self,
        tenant_id: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Outreach>> {
        let guard = self.outreach.read().await;
        let mut out: Vec<Outreach> = guard
            .values()
            .filter(|o| o.tenant_id == tenant_id && o.created_at >= since)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        out.truncate(limit);
        Ok(out)
    }
}

#[async_trait]
impl GapStore for MemoryStore {
    async fn put_gap(&self, gap: Gap) -> StoreResult<Gap> {
        let mut guard = self.gaps.write().await;
        guard.insert(key(&gap.tenant_id, &gap.id), gap.clone());
        Ok(gap)
    }

    async fn get_gap(&self, tenant_id: &str, id: &str) -> StoreResult<Option<Gap>> {
        Ok(self.gaps.read().await.get(&key(tenant_id, id)).cloned())
    }

    async fn update_gap(
        &self,
        tenant_id: &str,
        id: &str,
        mutate: Mutation<Gap>,
    ) -> StoreResult<Gap> {
        let mut guard = self.gaps.write().await;
        let gap = guard
            .get_mut(&key(tenant_id, id))
            .ok_or_else(|| StoreError::NotFound(format!("gap {id}")))?;
        mutate(gap)?;
        gap.updated_at = Utc::now();
        Ok(gap.clone())
    }

    async fn list_open_gaps(
        &self,
        tenant_id: &str,
        date: NaiveDate,
        min_duration_minutes: u32,
    ) -> StoreResult<Vec<Gap>> {
        let guard = self.gaps.read().await;
        let mut out: Vec<Gap> = guard
            .values()
            .filter(|g| {
                g.tenant_id == tenant_id
                    && g.status == GapStatus::Open
                    && g.date == date
                    && g.duration_minutes >= min_duration_minutes
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| a.start_time.cmp(&b.start_time).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn list_stale_open_gaps(
        &self,
        tenant_id: &str,
        before: NaiveDate,
        limit: usize,
    ) -> StoreResult<Vec<Gap>> {
        let guard = self.gaps.read().await;
        let mut out: Vec<Gap> = guard
            .values()
            .filter(|g| g.tenant_id == tenant_id && g.status == GapStatus::Open && g.date < before)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.date.cmp(&b.date).then(a.id.cmp(&b.id)));
        out.truncate(limit);
        Ok(out)
    }
}

#[async_trait]
impl CustomerScoreStore for MemoryStore {
    async fn put_customer_score(&self, score: CustomerScore) -> StoreResult<CustomerScore> {
        let mut guard = self.scores.write().await;
        guard.insert(key(&score.tenant_id, &score.customer_id), score.clone());
        Ok(score)
    }

    async fn get_customer_score(
        &self,
        tenant_id: &str,
        customer_id: &str,
    ) -> StoreResult<Option<CustomerScore>> {
        Ok(self
            .scores
            .read()
            .await
            .get(&key(tenant_id, customer_id))
            .cloned())
    }

    async fn list_at_risk_customers(
        &self,
        tenant_id: &str,
        min_level: RiskLevel,
        limit: usize,
    ) -> StoreResult<Vec<CustomerScore>> {
        let guard = self.scores.read().await;
        let mut out: Vec<CustomerScore> = guard
            .values()
            .filter(|s| s.tenant_id == tenant_id && s.churn_risk.level >= min_level)
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            b.churn_risk
                .score
                .cmp(&a.churn_risk.score)
                .then(a.customer_id.cmp(&b.customer_id))
        });
        out.truncate(limit);
        Ok(out)
    }

    async fn list_customers_by_segment(
        &self,
        tenant_id: &str,
        segment: CustomerSegment,
        limit: usize,
    ) -> StoreResult<Vec<CustomerScore>> {
        let guard = self.scores.read().await;
        let mut out: Vec<CustomerScore> = guard
            .values()
            .filter(|s| s.tenant_id == tenant_id && s.segment == segment)
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            b.ltv
                .total
                .cmp(&a.ltv.total)
                .then(a.customer_id.cmp(&b.customer_id))
        });
        out.truncate(limit);
        Ok(out)
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn append_audit(&self, record: AuditRecord) -> StoreResult<()> {
        self.audit.write().await.push(record);
        Ok(())
    }

    async fn list_recent_audit(
        &self,
        tenant_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<AuditRecord>> {
        let guard = self.audit.read().await;
        let mut out: Vec<AuditRecord> = guard
            .iter()
            .filter(|r| r.tenant_id == tenant_id)
            .cloned()
            .collect();
        out.reverse();
        out.truncate(limit);
        Ok(out)
    }
}

#[async_trait]
impl TenantDirectory for MemoryStore {
    async fn tenant_ids(&self) -> StoreResult<Vec<String>> {
        let mut tenants: Vec<String> = Vec::new();
        for (tenant, _) in self.decisions.read().await.keys() {
            tenants.push(tenant.clone());
        }
        for (tenant, _) in self.agent_states.read().await.keys() {
            tenants.push(tenant.clone());
        }
        for (tenant, _) in self.approvals.read().await.keys() {
            tenants.push(tenant.clone());
        }
        for (tenant, _) in self.outreach.read().await.keys() {
            tenants.push(tenant.clone());
        }
        for (tenant, _) in self.gaps.read().await.keys() {
            tenants.push(tenant.clone());
        }
        tenants.sort();
        tenants.dedup();
        Ok(tenants)
    }
}
