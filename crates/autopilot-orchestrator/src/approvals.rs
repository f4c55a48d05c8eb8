//! Approval lifecycle: `pending → (approved | rejected | expired |
//! cancelled)`, exactly once.
//!
//! Every transition mirrors the status onto the owning decision in the same
//! logical step (write-both; the stores reconcile by id, never by pointer).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::{json, Value};

use autopilot_observability::ControlPlaneEvent;
use autopilot_store::{ApprovalStore, AuditStore, DecisionStore, Store, StoreError};
use autopilot_types::{
    AgentError, Approval, ApprovalPriority, ApprovalResponse, ApprovalStatus, AuditEventType,
    AuditRecord, AuditSeverity, DomainEvent, EventType, OutcomeStatus,
};

use crate::events::EventPublisher;

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ApprovalStats {
    pub total: usize,
    pub by_status: HashMap<String, usize>,
    pub by_priority: HashMap<String, usize>,
    pub approval_rate: f64,
    pub avg_response_time_s: f64,
}

pub struct ApprovalService {
    store: Arc<dyn Store>,
    publisher: Arc<dyn EventPublisher>,
    expiry_overrides: HashMap<String, i64>,
}

impl ApprovalService {
    pub fn new(
        store: Arc<dyn Store>,
        publisher: Arc<dyn EventPublisher>,
        expiry_overrides: HashMap<String, i64>,
    ) -> Self {
        Self {
            store,
            publisher,
            expiry_overrides,
        }
    }

    fn expiry_minutes(&self, priority: ApprovalPriority) -> i64 {
        let name = match priority {
            ApprovalPriority::Low => "low",
            ApprovalPriority::Medium => "medium",
            ApprovalPriority::High => "high",
            ApprovalPriority::Urgent => "urgent",
        };
        self.expiry_overrides
            .get(name)
            .copied()
            .unwrap_or_else(|| priority.expiry_minutes())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        &self,
        tenant_id: &str,
        decision_id: &str,
        agent_name: &str,
        action_type: &str,
        action_summary: &str,
        action_details: Value,
        priority: ApprovalPriority,
    ) -> Result<Approval, AgentError> {
        let summary_len = action_summary.chars().count();
        if !(Approval::SUMMARY_MIN..=Approval::SUMMARY_MAX).contains(&summary_len) {
            return Err(AgentError::Validation(format!(
                "action summary must be {}-{} characters, got {summary_len}",
                Approval::SUMMARY_MIN,
                Approval::SUMMARY_MAX
            )));
        }

        let approval = Approval::new(
            tenant_id,
            decision_id,
            agent_name,
            action_type,
            action_summary,
            action_details,
            priority,
            Some(self.expiry_minutes(priority)),
        );
        let approval = self
            .store
            .put_approval(approval)
            .await
            .map_err(internal)?;

        self.mirror_to_decision(tenant_id, decision_id, ApprovalStatus::Pending, None)
            .await?;

        let priority_label = format!("priority={priority:?}");
        ControlPlaneEvent::new("approvals", "requested", tenant_id)
            .agent(agent_name)
            .record("approval", &approval.id)
            .trigger(decision_id)
            .detail(&priority_label)
            .emit();
        self.audit(&approval, "requested").await;
        self.publisher
            .publish(DomainEvent::new(
                EventType::ApprovalRequested,
                tenant_id,
                json!({
                    "approval_id": approval.id,
                    "decision_id": decision_id,
                    "agent_name": agent_name,
                    "expires_at": approval.expires_at,
                }),
            ))
            .await;
        Ok(approval)
    }

    /// Record that an approval notification went out on a channel.
    pub async fn mark_notification_sent(
        &self,
        tenant_id: &str,
        approval_id: &str,
        channel: &str,
    ) -> Result<Approval, AgentError> {
        let channel = channel.to_string();
        self.store
            .update_approval(
                tenant_id,
                approval_id,
                Box::new(move |approval| {
                    match channel.as_str() {
                        "whatsapp" => approval.notifications_sent.whatsapp = true,
                        "push" => approval.notifications_sent.push = true,
                        "email" => approval.notifications_sent.email = true,
                        other => {
                            return Err(StoreError::Conflict(format!(
                                "unknown notification channel `{other}`"
                            )))
                        }
                    }
                    Ok(())
                }),
            )
            .await
            .map_err(|err| match err {
                StoreError::NotFound(detail) => AgentError::NotFound(detail),
                StoreError::Conflict(detail) => AgentError::Validation(detail),
            })
    }

    /// Aggregate approval activity over a trailing window.
    pub async fn stats(&self, tenant_id: &str, days: i64) -> Result<ApprovalStats, AgentError> {
        let since = Utc::now() - Duration::days(days);
        let approvals = self
            .store
            .list_approvals_created_since(tenant_id, since, 500)
            .await
            .map_err(internal)?;

        let mut stats = ApprovalStats {
            total: approvals.len(),
            ..ApprovalStats::default()
        };
        let mut approved = 0usize;
        let mut decided = 0usize;
        let mut response_times = Vec::new();

        for approval in &approvals {
            let status = enum_label(approval.status);
            *stats.by_status.entry(status).or_default() += 1;
            *stats.by_priority.entry(enum_label(approval.priority)).or_default() += 1;

            match approval.status {
                ApprovalStatus::Approved => {
                    approved += 1;
                    decided += 1;
                }
                ApprovalStatus::Rejected => decided += 1,
                _ => {}
            }
            if let Some(at) = approval.response.responded_at {
                response_times.push((at - approval.created_at).num_seconds() as f64);
            }
        }

        if decided > 0 {
            stats.approval_rate = approved as f64 / decided as f64;
        }
        if !response_times.is_empty() {
            stats.avg_response_time_s =
                response_times.iter().sum::<f64>() / response_times.len() as f64;
        }
        Ok(stats)
    }

    pub async fn approve(
        &self,
        tenant_id: &str,
        approval_id: &str,
        responded_by: &str,
        notes: Option<String>,
    ) -> Result<Approval, AgentError> {
        let approval = self
            .transition(
                tenant_id,
                approval_id,
                ApprovalStatus::Approved,
                Some(responded_by.to_string()),
                notes,
            )
            .await?;
        self.mirror_to_decision(
            tenant_id,
            &approval.decision_id,
            ApprovalStatus::Approved,
            Some(responded_by.to_string()),
        )
        .await?;
        self.publish_transition(&approval, EventType::ApprovalApproved)
            .await;
        Ok(approval)
    }

    pub async fn reject(
        &self,
        tenant_id: &str,
        approval_id: &str,
        responded_by: &str,
        reason: String,
    ) -> Result<Approval, AgentError> {
        let approval = self
            .transition(
                tenant_id,
                approval_id,
                ApprovalStatus::Rejected,
                Some(responded_by.to_string()),
                Some(reason),
            )
            .await?;
        self.mirror_to_decision(
            tenant_id,
            &approval.decision_id,
            ApprovalStatus::Rejected,
            Some(responded_by.to_string()),
        )
        .await?;
        // A rejected supervised action is over; resolve the decision.
        self.resolve_decision(tenant_id, &approval.decision_id, OutcomeStatus::Rejected)
            .await?;
        self.publish_transition(&approval, EventType::ApprovalRejected)
            .await;
        Ok(approval)
    }

    pub async fn cancel(&self, tenant_id: &str, approval_id: &str) -> Result<Approval, AgentError> {
        let approval = self
            .transition(tenant_id, approval_id, ApprovalStatus::Cancelled, None, None)
            .await?;
        self.mirror_to_decision(
            tenant_id,
            &approval.decision_id,
            ApprovalStatus::Cancelled,
            None,
        )
        .await?;
        Ok(approval)
    }

    /// Move pending approvals past their expiry to `expired`, mirroring the
    /// decision outcome. Returns how many records were transitioned.
    pub async fn sweep_expired(&self, tenant_id: &str) -> Result<usize, AgentError> {
        let due = self
            .store
            .list_expiry_due_approvals(tenant_id, Utc::now(), 50)
            .await
            .map_err(internal)?;
        let mut swept = 0;
        for approval in due {
            // Another sweeper may have raced us; a conflict just means the
            // record already left pending.
            let result = self
                .transition(
                    tenant_id,
                    &approval.id,
                    ApprovalStatus::Expired,
                    None,
                    Some("No response received within time limit".to_string()),
                )
                .await;
            let approval = match result {
                Ok(approval) => approval,
                Err(AgentError::StateConflict(_)) => continue,
                Err(err) => return Err(err),
            };
            self.mirror_to_decision(
                tenant_id,
                &approval.decision_id,
                ApprovalStatus::Expired,
                None,
            )
            .await?;
            self.resolve_decision(tenant_id, &approval.decision_id, OutcomeStatus::Expired)
                .await?;
            self.publish_transition(&approval, EventType::ApprovalExpired)
                .await;
            swept += 1;
        }
        Ok(swept)
    }

    /// The single exit from `pending`. Any other starting status is a
    /// `StateConflict`; approving past the expiry deadline is too.
    async fn transition(
        &self,
        tenant_id: &str,
        approval_id: &str,
        to: ApprovalStatus,
        responded_by: Option<String>,
        notes: Option<String>,
    ) -> Result<Approval, AgentError> {
        let result = self
            .store
            .update_approval(
                tenant_id,
                approval_id,
                Box::new(move |approval| {
                    if approval.status != ApprovalStatus::Pending {
                        return Err(StoreError::Conflict(format!(
                            "approval already {:?}",
                            approval.status
                        )));
                    }
                    let now = Utc::now();
                    if to != ApprovalStatus::Expired && now > approval.expires_at {
                        return Err(StoreError::Conflict("approval expired".to_string()));
                    }
                    approval.status = to;
                    approval.response = ApprovalResponse {
                        action: Some(
                            match to {
                                ApprovalStatus::Approved => "approved",
                                ApprovalStatus::Rejected => "rejected",
                                ApprovalStatus::Expired => "expired",
                                ApprovalStatus::Cancelled => "cancelled",
                                ApprovalStatus::Pending => "pending",
                            }
                            .to_string(),
                        ),
                        responded_by,
                        responded_at: Some(now),
                        notes,
                    };
                    Ok(())
                }),
            )
            .await;

        match result {
            Ok(approval) => Ok(approval),
            Err(StoreError::Conflict(detail)) => Err(AgentError::StateConflict(detail)),
            Err(StoreError::NotFound(detail)) => Err(AgentError::NotFound(detail)),
        }
    }

    async fn mirror_to_decision(
        &self,
        tenant_id: &str,
        decision_id: &str,
        status: ApprovalStatus,
        approver: Option<String>,
    ) -> Result<(), AgentError> {
        let result = self
            .store
            .update_decision(
                tenant_id,
                decision_id,
                Box::new(move |decision| {
                    decision.approval.status = Some(status);
                    if status != ApprovalStatus::Pending {
                        decision.approval.decided_at = Some(Utc::now());
                        decision.approval.approver = approver;
                    }
                    Ok(())
                }),
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            // Decision already gone; the mirror is best-effort by design.
            Err(StoreError::NotFound(_)) => Ok(()),
            Err(err) => Err(internal(err)),
        }
    }

    async fn resolve_decision(
        &self,
        tenant_id: &str,
        decision_id: &str,
        status: OutcomeStatus,
    ) -> Result<(), AgentError> {
        let result = self
            .store
            .update_decision(
                tenant_id,
                decision_id,
                Box::new(move |decision| {
                    if decision.outcome.status == OutcomeStatus::Pending {
                        decision.resolve(status, None, None, autopilot_types::Money::ZERO);
                    }
                    Ok(())
                }),
            )
            .await;
        match result {
            Ok(_) | Err(StoreError::NotFound(_)) => Ok(()),
            Err(err) => Err(internal(err)),
        }
    }

    async fn publish_transition(&self, approval: &Approval, event_type: EventType) {
        let action = approval.response.action.as_deref().unwrap_or("updated");
        ControlPlaneEvent::new("approvals", action, &approval.tenant_id)
            .agent(&approval.agent_name)
            .record("approval", &approval.id)
            .trigger(&approval.decision_id)
            .emit();
        self.audit(approval, action).await;
        self.publisher
            .publish(DomainEvent::new(
                event_type,
                approval.tenant_id.clone(),
                json!({
                    "approval_id": approval.id,
                    "decision_id": approval.decision_id,
                    "agent_name": approval.agent_name,
                    "responded_by": approval.response.responded_by,
                }),
            ))
            .await;
    }

    /// Append-only trail; a failed write never blocks the transition.
    async fn audit(&self, approval: &Approval, action: &str) {
        let actor = approval
            .response
            .responded_by
            .clone()
            .unwrap_or_else(|| approval.agent_name.clone());
        let record = AuditRecord::new(
            approval.tenant_id.clone(),
            AuditEventType::Approval,
            AuditSeverity::Info,
            actor,
            "approval",
            approval.id.clone(),
            action,
            json!({"decision_id": approval.decision_id, "priority": approval.priority}),
            approval.decision_id.clone(),
        );
        if let Err(err) = self.store.append_audit(record).await {
            tracing::warn!(error = %err, "audit_append_failed");
        }
    }
}

fn internal(err: StoreError) -> AgentError {
    AgentError::Internal(err.to_string())
}

fn enum_label<T: serde::Serialize>(value: T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BroadcastPublisher;
    use autopilot_store::MemoryStore;
    use autopilot_types::{
        AutonomyLevel, Decision, DecisionContext, DecisionKind, Money,
    };
    use chrono::Duration;

    const TENANT: &str = "t-1";

    async fn setup() -> (Arc<MemoryStore>, ApprovalService, Decision) {
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(BroadcastPublisher::new());
        let service = ApprovalService::new(store.clone(), publisher, HashMap::new());
        let decision = store
            .put_decision(Decision::new(
                TENANT,
                "gap_fill_agent",
                DecisionKind::GapFill,
                AutonomyLevel::Supervised,
                DecisionContext {
                    trigger_id: "gap-1".into(),
                    trigger_kind: "schedule_gap".into(),
                    ..DecisionContext::default()
                },
                "outreach_initiated",
                Value::Null,
                Money::from_major(800),
            ))
            .await
            .unwrap();
        (store, service, decision)
    }

    async fn create(service: &ApprovalService, decision: &Decision) -> Approval {
        service
            .create(
                TENANT,
                &decision.id,
                "gap_fill_agent",
                "gap_fill_outreach",
                "Send a slot offer to a vip customer",
                Value::Null,
                ApprovalPriority::Medium,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn approve_mirrors_onto_the_decision() {
        let (store, service, decision) = setup().await;
        let approval = create(&service, &decision).await;

        let approved = service
            .approve(TENANT, &approval.id, "owner-1", Some("go".into()))
            .await
            .unwrap();
        assert_eq!(approved.status, ApprovalStatus::Approved);
        assert_eq!(approved.response.responded_by.as_deref(), Some("owner-1"));

        let decision = store.get_decision(TENANT, &decision.id).await.unwrap().unwrap();
        assert_eq!(decision.approval.status, Some(ApprovalStatus::Approved));
        assert_eq!(decision.approval.approver.as_deref(), Some("owner-1"));
    }

    #[tokio::test]
    async fn second_transition_is_a_state_conflict() {
        let (_store, service, decision) = setup().await;
        let approval = create(&service, &decision).await;
        service
            .approve(TENANT, &approval.id, "owner-1", None)
            .await
            .unwrap();
        let err = service
            .reject(TENANT, &approval.id, "owner-2", "late".into())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::StateConflict(_)));
    }

    #[tokio::test]
    async fn summary_length_is_validated() {
        let (_store, service, decision) = setup().await;
        let err = service
            .create(
                TENANT,
                &decision.id,
                "gap_fill_agent",
                "gap_fill_outreach",
                "short",
                Value::Null,
                ApprovalPriority::Low,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Validation(_)));
    }

    #[tokio::test]
    async fn sweeper_expires_pending_approvals_and_decision() {
        let (store, service, decision) = setup().await;
        let approval = create(&service, &decision).await;

        // Nothing due yet.
        assert_eq!(service.sweep_expired(TENANT).await.unwrap(), 0);

        store
            .update_approval(
                TENANT,
                &approval.id,
                Box::new(|a| {
                    a.expires_at = Utc::now() - Duration::minutes(1);
                    Ok(())
                }),
            )
            .await
            .unwrap();

        assert_eq!(service.sweep_expired(TENANT).await.unwrap(), 1);
        let approval = store.get_approval(TENANT, &approval.id).await.unwrap().unwrap();
        assert_eq!(approval.status, ApprovalStatus::Expired);

        let decision = store.get_decision(TENANT, &decision.id).await.unwrap().unwrap();
        assert_eq!(decision.outcome.status, OutcomeStatus::Expired);

        // Approving after expiry is a conflict.
        let err = service
            .approve(TENANT, &approval.id, "owner-1", None)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::StateConflict(_)));
    }

    #[tokio::test]
    async fn pending_past_deadline_cannot_be_approved() {
        let (store, service, decision) = setup().await;
        let approval = create(&service, &decision).await;
        store
            .update_approval(
                TENANT,
                &approval.id,
                Box::new(|a| {
                    a.expires_at = Utc::now() - Duration::minutes(1);
                    Ok(())
                }),
            )
            .await
            .unwrap();

        let err = service
            .approve(TENANT, &approval.id, "owner-1", None)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::StateConflict(_)));
    }

    #[tokio::test]
    async fn notification_flags_are_per_channel() {
        let (store, service, decision) = setup().await;
        let approval = create(&service, &decision).await;
        service
            .mark_notification_sent(TENANT, &approval.id, "whatsapp")
            .await
            .unwrap();
        let approval = store.get_approval(TENANT, &approval.id).await.unwrap().unwrap();
        assert!(approval.notifications_sent.whatsapp);
        assert!(!approval.notifications_sent.push);

        let err = service
            .mark_notification_sent(TENANT, &approval.id, "fax")
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Validation(_)));
    }

    #[tokio::test]
    async fn stats_report_approval_rate() {
        let (store, service, decision) = setup().await;
        let first = create(&service, &decision).await;
        service.approve(TENANT, &first.id, "owner-1", None).await.unwrap();

        let second_decision = store
            .put_decision(Decision::new(
                TENANT,
                "gap_fill_agent",
                DecisionKind::GapFill,
                AutonomyLevel::Supervised,
                DecisionContext::default(),
                "outreach_initiated",
                Value::Null,
                Money::ZERO,
            ))
            .await
            .unwrap();
        let second = create(&service, &second_decision).await;
        service
            .reject(TENANT, &second.id, "owner-1", "not now".into())
            .await
            .unwrap();

        let stats = service.stats(TENANT, 7).await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.approval_rate, 0.5);
        assert_eq!(stats.by_status["approved"], 1);
        assert_eq!(stats.by_status["rejected"], 1);
        assert!(stats.avg_response_time_s >= 0.0);
    }

    #[tokio::test]
    async fn transitions_leave_an_audit_trail() {
        let (store, service, decision) = setup().await;
        let approval = create(&service, &decision).await;
        service.approve(TENANT, &approval.id, "owner-1", None).await.unwrap();

        let trail = store.list_recent_audit(TENANT, 10).await.unwrap();
        assert!(trail.len() >= 2, "create and approve are both audited");
        assert!(trail.iter().all(|r| r.tenant_id == TENANT));
        assert!(trail.iter().any(|r| r.action == "approved"));
    }

    #[tokio::test]
    async fn rejection_resolves_the_decision() {
        let (store, service, decision) = setup().await;
        let approval = create(&service, &decision).await;
        service
            .reject(TENANT, &approval.id, "owner-1", "not now".into())
            .await
            .unwrap();
        let decision = store.get_decision(TENANT, &decision.id).await.unwrap().unwrap();
        assert_eq!(decision.outcome.status, OutcomeStatus::Rejected);
    }
}
