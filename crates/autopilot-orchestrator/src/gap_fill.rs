//! Gap-fill orchestration: detect open schedule gaps, pick and score
//! customer candidates, record the decision, dispatch outreach, and
//! attribute the booking outcome back to the decision.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::warn;

use autopilot_cache::{exact_key, ResponseCache};
use autopilot_observability::ControlPlaneEvent;
use autopilot_gateway::{ChatRequest, GatewayError, LlmGateway};
use autopilot_guardrail::Guardrail;
use autopilot_runtime::{AgentRuntime, LimitWindow};
use autopilot_store::{
    AuditStore, CustomerScoreStore, DecisionStore, GapStore, OutreachStore, Store, StoreError,
};
use autopilot_types::{
    tenant_today, AgentError, ApprovalPriority, AuditEventType, AuditRecord, AuditSeverity,
    AutonomyLevel, CustomerScore, CustomerSegment, Decision, DecisionContext, DecisionKind,
    DomainEvent, EventType, Gap, GapPriority, GapStatus, Money, OutcomeStatus, Outreach,
    OutreachChannel, OutreachStatus, OutreachType, RiskLevel,
};

use crate::approvals::ApprovalService;
use crate::events::EventPublisher;
use crate::outreach::{CreateOutreach, OutreachError, OutreachService};
use crate::scheduler::{QueueError, TaskScheduler};

pub const GAP_FILL_AGENT: &str = "gap_fill_agent";

const CANDIDATE_LIMIT: usize = 5;
const BACKPRESSURE_MAX_ATTEMPTS: u32 = 4;

#[derive(Debug, Clone)]
pub struct BookingRef {
    pub booking_id: String,
    /// Actual booking amount; overrides the decision's recorded potential
    /// when present.
    pub amount: Option<Money>,
}

/// External booking service. The control plane never owns booking state —
/// it requests creation and reconciles.
#[async_trait]
pub trait BookingService: Send + Sync {
    async fn create_booking(
        &self,
        tenant_id: &str,
        gap: &Gap,
        customer_id: &str,
    ) -> Result<BookingRef, String>;
}

#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub customer: CustomerScore,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GapFillReport {
    pub decision_id: String,
    pub gap_id: String,
    pub customer_id: String,
    pub score: f64,
    pub requires_approval: bool,
    pub outreach_id: Option<String>,
}

/// Priority score for filling a gap with a given customer; higher is
/// better, capped at 100. Deterministic for the same inputs.
pub fn fill_priority(gap: &Gap, customer: &CustomerScore) -> f64 {
    let mut score = 0.0;

    score += match gap.duration_minutes {
        d if d >= 120 => 30.0,
        d if d >= 60 => 20.0,
        d if d >= 30 => 10.0,
        _ => 0.0,
    };
    score += (gap.potential_revenue.major() as f64 / 100.0).min(20.0);

    score += match customer.segment {
        CustomerSegment::Vip => 25.0,
        CustomerSegment::HighValue => 20.0,
        CustomerSegment::AtRisk => 15.0,
        CustomerSegment::Regular => 10.0,
        CustomerSegment::New => 5.0,
        CustomerSegment::Dormant => 5.0,
    };
    score += (customer.churn_risk.score as f64 / 10.0).min(15.0);
    score += (customer.ltv.total.major() as f64 / 5000.0).min(10.0);

    score.min(100.0)
}

pub struct GapFillOrchestrator {
    store: Arc<dyn Store>,
    runtime: Arc<AgentRuntime>,
    outreach: Arc<OutreachService>,
    approvals: Arc<ApprovalService>,
    scheduler: Arc<TaskScheduler>,
    gateway: Arc<dyn LlmGateway>,
    cache: Arc<ResponseCache>,
    guardrail: Arc<Guardrail>,
    bookings: Arc<dyn BookingService>,
    publisher: Arc<dyn EventPublisher>,
    default_model: String,
    temperature: f32,
    utc_offset_minutes: i32,
}

impl GapFillOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        runtime: Arc<AgentRuntime>,
        outreach: Arc<OutreachService>,
        approvals: Arc<ApprovalService>,
        scheduler: Arc<TaskScheduler>,
        gateway: Arc<dyn LlmGateway>,
        cache: Arc<ResponseCache>,
        guardrail: Arc<Guardrail>,
        bookings: Arc<dyn BookingService>,
        publisher: Arc<dyn EventPublisher>,
        default_model: String,
        temperature: f32,
    ) -> Self {
        Self {
            store,
            runtime,
            outreach,
            approvals,
            scheduler,
            gateway,
            cache,
            guardrail,
            bookings,
            publisher,
            default_model,
            temperature,
            utc_offset_minutes: 330,
        }
    }

    /// Phase 1 — open gaps for the day, 30 minutes or longer.
    pub async fn detect_gaps(
        &self,
        tenant_id: &str,
        date: Option<NaiveDate>,
    ) -> Result<Vec<Gap>, AgentError> {
        let date =
            date.unwrap_or_else(|| tenant_today(self.utc_offset_minutes, Utc::now()));
        self.store
            .list_open_gaps(tenant_id, date, 30)
            .await
            .map_err(internal)
    }

    /// Phase 2 — candidates, deduplicated and in priority order: churn-risk
    /// customers first (retention focus), then VIPs. Fetch failures degrade
    /// silently to an empty slice — a soft skip, never a breaker error.
    pub async fn fill_candidates(&self, tenant_id: &str, gap: &Gap) -> Vec<CustomerScore> {
        let half = CANDIDATE_LIMIT / 2;
        let mut candidates: Vec<CustomerScore> = Vec::new();

        match self
            .store
            .list_at_risk_customers(tenant_id, RiskLevel::Medium, half)
            .await
        {
            Ok(at_risk) => candidates.extend(at_risk),
            Err(err) => warn!(tenant_id, error = %err, "at_risk_fetch_failed"),
        }
        match self
            .store
            .list_customers_by_segment(tenant_id, CustomerSegment::Vip, half)
            .await
        {
            Ok(vip) => candidates.extend(vip),
            Err(err) => warn!(tenant_id, error = %err, "vip_fetch_failed"),
        }

        let mut seen = std::collections::HashSet::new();
        candidates.retain(|c| seen.insert(c.customer_id.clone()));

        // Eligibility: outreach preconditions hold and no live outreach
        // already targets this gap.
        let live: std::collections::HashSet<String> = self
            .store
            .list_outreach_by_trigger(tenant_id, &gap.id)
            .await
            .map(|records| {
                records
                    .into_iter()
                    .filter(|o| {
                        matches!(
                            o.status,
                            OutreachStatus::Pending
                                | OutreachStatus::Sent
                                | OutreachStatus::Delivered
                        )
                    })
                    .map(|o| o.customer_id)
                    .collect()
            })
            .unwrap_or_default();

        let mut eligible = Vec::new();
        for candidate in candidates {
            if live.contains(&candidate.customer_id) {
                continue;
            }
            match self.outreach.can_send(tenant_id, &candidate.phone).await {
                Ok(Ok(())) => eligible.push(candidate),
                Ok(Err(_)) => {}
                Err(err) => warn!(tenant_id, error = %err, "eligibility_check_failed"),
            }
            if eligible.len() >= CANDIDATE_LIMIT {
                break;
            }
        }
        eligible
    }

    /// Phase 3 — score and order candidates. Ties break on LTV, then most
    /// recent visit, then stable id order.
    pub fn rank_candidates(&self, gap: &Gap, candidates: Vec<CustomerScore>) -> Vec<ScoredCandidate> {
        let mut scored: Vec<ScoredCandidate> = candidates
            .into_iter()
            .map(|customer| ScoredCandidate {
                score: fill_priority(gap, &customer),
                customer,
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.customer.ltv.total.cmp(&a.customer.ltv.total))
                .then(
                    b.customer
                        .engagement
                        .last_visit_at
                        .cmp(&a.customer.engagement.last_visit_at),
                )
                .then(a.customer.customer_id.cmp(&b.customer.customer_id))
        });
        scored
    }

    /// Phase 4 — verify the agent may act, record the decision, and either
    /// dispatch outreach (full auto) or park it behind an approval.
    pub async fn execute(
        &self,
        tenant_id: &str,
        gap_id: &str,
        autonomy_level: AutonomyLevel,
    ) -> Result<Option<GapFillReport>, AgentError> {
        let gap = self
            .store
            .get_gap(tenant_id, gap_id)
            .await
            .map_err(internal)?
            .ok_or_else(|| AgentError::NotFound(format!("gap {gap_id}")))?;
        if gap.status != GapStatus::Open {
            return Err(AgentError::StateConflict(format!(
                "gap already {:?}",
                gap.status
            )));
        }

        let candidates = self.fill_candidates(tenant_id, &gap).await;
        if candidates.is_empty() {
            ControlPlaneEvent::new("gap_fill", "no_candidates", tenant_id)
                .agent(GAP_FILL_AGENT)
                .trigger(gap_id)
                .emit();
            return Ok(None);
        }
        let ranked = self.rank_candidates(&gap, candidates);
        let top = &ranked[0];

        // Rate limit before admission so a shed request never claims the
        // half-open probe.
        let rate = self
            .runtime
            .check_rate_limit(tenant_id, GAP_FILL_AGENT, LimitWindow::Hourly)
            .await
            .map_err(internal)?;
        if !rate.allowed {
            return Err(AgentError::RateLimited {
                retry_after_s: Some(
                    (rate.reset_at - Utc::now()).num_seconds().max(0) as u64,
                ),
            });
        }
        self.runtime.begin_execution(tenant_id, GAP_FILL_AGENT).await?;

        let decision = Decision::new(
            tenant_id,
            GAP_FILL_AGENT,
            DecisionKind::GapFill,
            autonomy_level,
            DecisionContext {
                trigger_id: gap.id.clone(),
                trigger_kind: "schedule_gap".to_string(),
                customer_id: Some(top.customer.customer_id.clone()),
                staff_id: Some(gap.staff_id.clone()),
                service_id: gap.fittable_service_ids.first().cloned(),
                slot: None,
            },
            "outreach_initiated",
            json!({
                "gap_duration_minutes": gap.duration_minutes,
                "potential_revenue": gap.potential_revenue,
                "customer_segment": top.customer.segment,
                "priority_score": top.score,
            }),
            gap.potential_revenue,
        );
        let decision = self.store.put_decision(decision).await.map_err(internal)?;
        self.audit_decision(&decision, "created").await;

        self.store
            .update_gap(
                tenant_id,
                &gap.id,
                Box::new(|gap| {
                    gap.fill_attempts += 1;
                    gap.last_attempt_at = Some(Utc::now());
                    Ok(())
                }),
            )
            .await
            .map_err(internal)?;

        self.runtime
            .record_action(tenant_id, GAP_FILL_AGENT, "gap_fill_outreach", true, None)
            .await
            .map_err(internal)?;

        self.publisher
            .publish(DomainEvent::new(
                EventType::DecisionCreated,
                tenant_id,
                json!({
                    "decision_id": decision.id,
                    "agent_name": GAP_FILL_AGENT,
                    "decision_kind": "gap_fill",
                    "gap_id": gap.id,
                    "customer_id": top.customer.customer_id,
                    "priority_score": top.score,
                }),
            ))
            .await;

        let mut outreach_id = None;
        if autonomy_level == AutonomyLevel::Supervised {
            self.approvals
                .create(
                    tenant_id,
                    &decision.id,
                    GAP_FILL_AGENT,
                    "gap_fill_outreach",
                    &format!(
                        "Offer {}'s open {}-minute slot to {}",
                        gap.staff_name, gap.duration_minutes, top.customer.customer_name
                    ),
                    decision.action_details.clone(),
                    approval_priority_for(gap.priority),
                )
                .await?;
        } else {
            let record = self
                .dispatch_outreach(tenant_id, &decision, &gap, &top.customer)
                .await?;
            outreach_id = Some(record.id);
        }

        let score = format!("score={}", top.score);
        ControlPlaneEvent::new("gap_fill", "initiated", tenant_id)
            .agent(GAP_FILL_AGENT)
            .record("decision", &decision.id)
            .trigger(&gap.id)
            .detail(&score)
            .emit();

        Ok(Some(GapFillReport {
            decision_id: decision.id,
            gap_id: gap.id,
            customer_id: top.customer.customer_id.clone(),
            score: top.score,
            requires_approval: autonomy_level == AutonomyLevel::Supervised,
            outreach_id,
        }))
    }

    /// Outreach for a supervised decision, once its approval lands.
    pub async fn proceed_after_approval(
        &self,
        tenant_id: &str,
        decision_id: &str,
    ) -> Result<Outreach, AgentError> {
        let decision = self
            .store
            .get_decision(tenant_id, decision_id)
            .await
            .map_err(internal)?
            .ok_or_else(|| AgentError::NotFound(format!("decision {decision_id}")))?;
        let gap_id = decision.context.trigger_id.clone();
        let gap = self
            .store
            .get_gap(tenant_id, &gap_id)
            .await
            .map_err(internal)?
            .ok_or_else(|| AgentError::NotFound(format!("gap {gap_id}")))?;
        let customer_id = decision
            .context
            .customer_id
            .clone()
            .ok_or_else(|| AgentError::Internal("decision has no customer".into()))?;
        let customer = self
            .store
            .get_customer_score(tenant_id, &customer_id)
            .await
            .map_err(internal)?
            .ok_or_else(|| AgentError::NotFound(format!("customer {customer_id}")))?;
        self.dispatch_outreach(tenant_id, &decision, &gap, &customer)
            .await
    }

    /// Compose the message (LLM through the cache) and create + schedule the
    /// outreach. Composition failures are breaker errors; precondition
    /// denials are not.
    async fn dispatch_outreach(
        &self,
        tenant_id: &str,
        decision: &Decision,
        gap: &Gap,
        customer: &CustomerScore,
    ) -> Result<Outreach, AgentError> {
        let message = match self.compose_message(tenant_id, gap, customer).await {
            Ok(message) => message,
            Err(err) => {
                self.runtime
                    .record_failure(tenant_id, GAP_FILL_AGENT, &err.to_string())
                    .await
                    .map_err(internal)?;
                self.runtime
                    .record_action(tenant_id, GAP_FILL_AGENT, "gap_fill_compose", false, None)
                    .await
                    .map_err(internal)?;
                return Err(err);
            }
        };

        let record = self
            .outreach
            .create(
                tenant_id,
                Some(decision),
                CreateOutreach {
                    customer_id: customer.customer_id.clone(),
                    customer_name: customer.customer_name.clone(),
                    customer_phone: customer.phone.clone(),
                    outreach_type: OutreachType::GapFill,
                    channel: OutreachChannel::Whatsapp,
                    message,
                    trigger_id: Some(gap.id.clone()),
                    trigger_kind: Some("schedule_gap".to_string()),
                    offer_details: json!({
                        "staff_name": gap.staff_name,
                        "start_time": gap.start_time,
                        "duration_minutes": gap.duration_minutes,
                    }),
                    expires_in_minutes: Outreach::DEFAULT_EXPIRY_MINUTES,
                },
            )
            .await
            .map_err(outreach_to_agent_error)?;

        self.schedule_send_with_backpressure(tenant_id, &record.id, record.channel.as_str())
            .await?;
        Ok(record)
    }

    async fn compose_message(
        &self,
        tenant_id: &str,
        gap: &Gap,
        customer: &CustomerScore,
    ) -> Result<String, AgentError> {
        let system = format!(
            "You write short, friendly WhatsApp messages for a salon. \
Offer the customer the open slot and ask for a YES/NO reply. \
Keep it under 50 words.{}",
            self.guardrail.system_prompt_suffix()
        );
        let prompt = format!(
            "Customer: {}. Staff: {}. Slot: {} for {} minutes on {}. \
Compose the offer message.",
            customer.customer_name, gap.staff_name, gap.start_time, gap.duration_minutes, gap.date
        );

        let key = exact_key(
            &prompt,
            Some(&system),
            &self.default_model,
            self.temperature,
            tenant_id,
        );
        let gateway = self.gateway.clone();
        let model = self.default_model.clone();
        let outcome = self
            .cache
            .get_or_compute(&key, || async move {
                let request = ChatRequest {
                    prompt,
                    system: Some(system),
                    model: Some(model),
                    ..ChatRequest::default()
                };
                gateway
                    .chat(request)
                    .await
                    .map(|response| response.content)
                    .map_err(|err| match err {
                        GatewayError::ProviderRateLimited => "provider_rate_limited".to_string(),
                        other => other.to_string(),
                    })
            })
            .await;

        match outcome {
            Ok(cached) => Ok(cached.value),
            Err(err) if err == "provider_rate_limited" => Err(AgentError::ProviderRateLimited),
            Err(err) => Err(AgentError::ProviderUnavailable(err)),
        }
    }

    /// Enqueue the send task. Queue saturation defers with exponential
    /// backoff (5, 10, 20 s capped at 60 s) and emits a backpressure event
    /// per deferral.
    async fn schedule_send_with_backpressure(
        &self,
        tenant_id: &str,
        outreach_id: &str,
        channel: &str,
    ) -> Result<(), AgentError> {
        for attempt in 0..BACKPRESSURE_MAX_ATTEMPTS {
            match self
                .scheduler
                .schedule_outreach_send(tenant_id, outreach_id, channel, None)
                .await
            {
                Ok(_) => return Ok(()),
                Err(QueueError::Saturated) => {
                    let delay_s = (5u64 << attempt).min(60);
                    self.publisher
                        .publish(DomainEvent::new(
                            EventType::Backpressure,
                            tenant_id,
                            json!({
                                "outreach_id": outreach_id,
                                "attempt": attempt + 1,
                                "delay_s": delay_s,
                            }),
                        ))
                        .await;
                    tokio::time::sleep(std::time::Duration::from_secs(delay_s)).await;
                }
                Err(QueueError::Other(detail)) => {
                    return Err(AgentError::Internal(detail));
                }
            }
        }
        Err(AgentError::Internal("task queue saturated".into()))
    }

    /// Accepted reply on an outreach tied to a gap: create the booking,
    /// backfill it, and attribute the fill.
    pub async fn attribute_acceptance(
        &self,
        outreach: &Outreach,
    ) -> Result<Option<BookingRef>, AgentError> {
        let Some(gap_id) = outreach.trigger_id.clone() else {
            return Ok(None);
        };
        let tenant_id = outreach.tenant_id.clone();
        let gap = self
            .store
            .get_gap(&tenant_id, &gap_id)
            .await
            .map_err(internal)?
            .ok_or_else(|| AgentError::NotFound(format!("gap {gap_id}")))?;

        let booking = self
            .bookings
            .create_booking(&tenant_id, &gap, &outreach.customer_id)
            .await
            .map_err(AgentError::ProviderUnavailable)?;

        self.outreach
            .attach_booking(&tenant_id, &outreach.id, &booking.booking_id)
            .await
            .map_err(outreach_to_agent_error)?;

        self.process_gap_filled(&tenant_id, &gap_id, &booking, &outreach.customer_id)
            .await?;
        Ok(Some(booking))
    }

    /// Attribution: gap filled, decision succeeded, revenue recorded.
    pub async fn process_gap_filled(
        &self,
        tenant_id: &str,
        gap_id: &str,
        booking: &BookingRef,
        customer_id: &str,
    ) -> Result<(), AgentError> {
        let booking_id = booking.booking_id.clone();
        let customer = customer_id.to_string();
        self.store
            .update_gap(
                tenant_id,
                gap_id,
                Box::new(move |gap| {
                    if gap.status != GapStatus::Open {
                        return Err(StoreError::Conflict(format!(
                            "gap already {:?}",
                            gap.status
                        )));
                    }
                    gap.mark_filled(booking_id, customer);
                    Ok(())
                }),
            )
            .await
            .map_err(|err| match err {
                StoreError::Conflict(detail) => AgentError::StateConflict(detail),
                other => internal(other),
            })?;

        let decision = self
            .store
            .find_decision_by_trigger(tenant_id, gap_id)
            .await
            .map_err(internal)?;
        let mut revenue = Money::ZERO;
        if let Some(decision) = &decision {
            let actual = booking.amount.unwrap_or(decision.revenue.potential);
            revenue = actual;
            let booking_id = booking.booking_id.clone();
            self.store
                .update_decision(
                    tenant_id,
                    &decision.id,
                    Box::new(move |decision| {
                        decision.resolve(
                            OutcomeStatus::Success,
                            Some("gap filled".to_string()),
                            Some(booking_id),
                            actual,
                        );
                        Ok(())
                    }),
                )
                .await
                .map_err(internal)?;
            self.publisher
                .publish(DomainEvent::new(
                    EventType::DecisionResolved,
                    tenant_id,
                    json!({
                        "decision_id": decision.id,
                        "outcome": "success",
                        "booking_id": booking.booking_id,
                        "revenue": actual,
                    }),
                ))
                .await;
        }

        self.runtime
            .record_action(
                tenant_id,
                GAP_FILL_AGENT,
                "gap_fill_success",
                true,
                Some(revenue),
            )
            .await
            .map_err(internal)?;

        self.publisher
            .publish(DomainEvent::new(
                EventType::GapFilled,
                tenant_id,
                json!({
                    "gap_id": gap_id,
                    "booking_id": booking.booking_id,
                    "customer_id": customer_id,
                    "revenue": revenue,
                }),
            ))
            .await;
        let attributed = format!("revenue={revenue}");
        ControlPlaneEvent::new("gap_fill", "gap_filled", tenant_id)
            .agent(GAP_FILL_AGENT)
            .record("booking", &booking.booking_id)
            .trigger(gap_id)
            .detail(&attributed)
            .emit();
        Ok(())
    }

    /// The gap is gone (day passed or filled elsewhere): expire in-flight
    /// outreach and the decision.
    pub async fn expire_gap(&self, tenant_id: &str, gap_id: &str) -> Result<(), AgentError> {
        self.store
            .update_gap(
                tenant_id,
                gap_id,
                Box::new(|gap| {
                    if gap.status == GapStatus::Open {
                        gap.status = GapStatus::Expired;
                    }
                    Ok(())
                }),
            )
            .await
            .map_err(internal)?;

        self.outreach
            .expire_for_trigger(tenant_id, gap_id)
            .await
            .map_err(outreach_to_agent_error)?;

        if let Some(decision) = self
            .store
            .find_decision_by_trigger(tenant_id, gap_id)
            .await
            .map_err(internal)?
        {
            self.store
                .update_decision(
                    tenant_id,
                    &decision.id,
                    Box::new(|decision| {
                        if decision.outcome.status == OutcomeStatus::Pending {
                            decision.resolve(OutcomeStatus::Expired, None, None, Money::ZERO);
                        }
                        Ok(())
                    }),
                )
                .await
                .map_err(internal)?;
        }

        self.publisher
            .publish(DomainEvent::new(
                EventType::GapExpired,
                tenant_id,
                json!({"gap_id": gap_id}),
            ))
            .await;
        Ok(())
    }

    /// Sweep open gaps whose day has passed, then resolve any decision left
    /// pending past its own deadline.
    pub async fn sweep_expired_gaps(&self, tenant_id: &str) -> Result<usize, AgentError> {
        let today = tenant_today(self.utc_offset_minutes, Utc::now());
        let stale = self
            .store
            .list_stale_open_gaps(tenant_id, today, 100)
            .await
            .map_err(internal)?;
        let mut count = stale.len();
        for gap in stale {
            self.expire_gap(tenant_id, &gap.id).await?;
        }
        count += self.sweep_expired_decisions(tenant_id).await?;
        Ok(count)
    }

    /// Decisions expire fifteen minutes after creation unless something
    /// moved them to a terminal outcome first.
    pub async fn sweep_expired_decisions(&self, tenant_id: &str) -> Result<usize, AgentError> {
        let due = self
            .store
            .list_expired_decisions(tenant_id, Utc::now(), 100)
            .await
            .map_err(internal)?;
        let mut swept = 0;
        for decision in due {
            let updated = self
                .store
                .update_decision(
                    tenant_id,
                    &decision.id,
                    Box::new(|decision| {
                        if decision.outcome.status == OutcomeStatus::Pending {
                            decision.resolve(OutcomeStatus::Expired, None, None, Money::ZERO);
                        }
                        Ok(())
                    }),
                )
                .await
                .map_err(internal)?;
            if updated.outcome.status == OutcomeStatus::Expired {
                swept += 1;
                self.publisher
                    .publish(DomainEvent::new(
                        EventType::DecisionResolved,
                        tenant_id,
                        json!({"decision_id": updated.id, "outcome": "expired"}),
                    ))
                    .await;
            }
        }
        Ok(swept)
    }

    /// Append-only trail; a failed write never blocks the flow.
    async fn audit_decision(&self, decision: &Decision, action: &str) {
        let record = AuditRecord::new(
            decision.tenant_id.clone(),
            AuditEventType::Decision,
            AuditSeverity::Info,
            decision.agent_name.clone(),
            "decision",
            decision.id.clone(),
            action,
            json!({
                "trigger_id": decision.context.trigger_id,
                "kind": decision.kind,
                "autonomy_level": decision.autonomy_level,
            }),
            decision.context.trigger_id.clone(),
        );
        if let Err(err) = self.store.append_audit(record).await {
            warn!(error = %err, "audit_append_failed");
        }
    }
}

fn approval_priority_for(priority: GapPriority) -> ApprovalPriority {
    match priority {
        GapPriority::Critical => ApprovalPriority::Urgent,
        GapPriority::High => ApprovalPriority::High,
        GapPriority::Medium => ApprovalPriority::Medium,
        GapPriority::Low => ApprovalPriority::Low,
    }
}

fn internal(err: StoreError) -> AgentError {
    AgentError::Internal(err.to_string())
}

fn outreach_to_agent_error(err: OutreachError) -> AgentError {
    match err {
        OutreachError::Denied(denied) => AgentError::StateConflict(denied.reason().to_string()),
        OutreachError::NotFound(detail) => AgentError::NotFound(detail),
        OutreachError::Store(detail) => AgentError::Internal(detail),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BroadcastPublisher;
    use crate::outreach::ProviderStatus;
    use crate::scheduler::{MemoryTaskQueue, TaskScheduler};
    use autopilot_gateway::{ChatResponse, ChunkStream, TokenUsage};
    use autopilot_store::{AgentStateStore, ApprovalStore, MemoryStore};
    use autopilot_types::{ChurnRisk, LifetimeValue, ReplyAction};
    use chrono::{Duration, NaiveDate, NaiveTime};
    use std::collections::HashMap;
    use tokio_util::sync::CancellationToken;

    const TENANT: &str = "t-1";

    struct CannedGateway {
        calls: std::sync::atomic::AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl LlmGateway for CannedGateway {
        async fn chat(&self, _request: ChatRequest) -> Result<ChatResponse, GatewayError> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if self.fail {
                return Err(GatewayError::ProviderUnavailable("500".into()));
            }
            Ok(ChatResponse {
                id: "gen-1".into(),
                model: "m-test".into(),
                content: "Hi Priya! Anjali has a 2pm slot open today. Reply YES to book.".into(),
                usage: TokenUsage::default(),
            })
        }

        async fn stream(
            &self,
            _request: ChatRequest,
            _cancel: CancellationToken,
        ) -> Result<ChunkStream, GatewayError> {
            unimplemented!("not used in tests")
        }
    }

    struct StubBookings;

    #[async_trait]
    impl BookingService for StubBookings {
        async fn create_booking(
            &self,
            _tenant_id: &str,
            gap: &Gap,
            _customer_id: &str,
        ) -> Result<BookingRef, String> {
            Ok(BookingRef {
                booking_id: "b123".into(),
                amount: Some(gap.potential_revenue),
            })
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        queue: Arc<MemoryTaskQueue>,
        runtime: Arc<AgentRuntime>,
        outreach: Arc<OutreachService>,
        orchestrator: GapFillOrchestrator,
        events: tokio::sync::broadcast::Receiver<DomainEvent>,
    }

    fn harness_with_gateway(fail_llm: bool) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(BroadcastPublisher::new());
        let events = publisher.subscribe();
        let runtime = Arc::new(AgentRuntime::new(store.clone(), 5, 10));
        let outreach = Arc::new(OutreachService::new(
            store.clone(),
            publisher.clone(),
            60,
            200,
            330,
        ));
        let approvals = Arc::new(ApprovalService::new(
            store.clone(),
            publisher.clone(),
            HashMap::new(),
        ));
        let queue = Arc::new(MemoryTaskQueue::new());
        let scheduler = Arc::new(TaskScheduler::new(
            queue.clone(),
            runtime.clone(),
            store.clone(),
        ));
        let gateway = Arc::new(CannedGateway {
            calls: std::sync::atomic::AtomicUsize::new(0),
            fail: fail_llm,
        });
        let orchestrator = GapFillOrchestrator::new(
            store.clone(),
            runtime.clone(),
            outreach.clone(),
            approvals,
            scheduler,
            gateway,
            Arc::new(ResponseCache::new(3600, 100)),
            Arc::new(Guardrail::new()),
            Arc::new(StubBookings),
            publisher,
            "m-test".to_string(),
            0.7,
        );
        Harness {
            store,
            queue,
            runtime,
            outreach,
            orchestrator,
            events,
        }
    }

    fn harness() -> Harness {
        harness_with_gateway(false)
    }

    async fn seed_gap(store: &Arc<MemoryStore>) -> Gap {
        let gap = Gap::new(
            TENANT,
            "s-1",
            "Anjali",
            tenant_today(330, Utc::now()),
            NaiveTime::from_hms_opt(14, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(15, 30, 0).unwrap(),
            Money::from_major(800),
            vec!["svc-1".into()],
        );
        store.put_gap(gap.clone()).await.unwrap();
        gap
    }

    async fn seed_vip(store: &Arc<MemoryStore>, customer_id: &str, phone: &str) -> CustomerScore {
        let mut score = CustomerScore::new(TENANT, customer_id, "Priya", phone, CustomerSegment::Vip);
        score.ltv = LifetimeValue {
            total: Money::from_major(40_000),
            ..LifetimeValue::default()
        };
        store.put_customer_score(score.clone()).await.unwrap();
        score
    }

    fn vip_for_scoring(ltv_major: i64, churn: u32) -> CustomerScore {
        let mut score = CustomerScore::new(TENANT, "c-1", "Priya", "+919", CustomerSegment::Vip);
        score.ltv.total = Money::from_major(ltv_major);
        score.churn_risk = ChurnRisk {
            score: churn,
            level: RiskLevel::Low,
            factors: Vec::new(),
        };
        score
    }

    #[test]
    fn scoring_matches_the_table() {
        let gap = Gap::new(
            TENANT,
            "s-1",
            "Anjali",
            NaiveDate::from_ymd_opt(2026, 3, 14).unwrap(),
            NaiveTime::from_hms_opt(14, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(15, 30, 0).unwrap(),
            Money::from_major(800),
            vec![],
        );
        // 20 (90 min) + 8 (revenue) + 25 (vip) + 0 (churn) + 8 (ltv 40k)
        let score = fill_priority(&gap, &vip_for_scoring(40_000, 0));
        assert_eq!(score, 61.0);
    }

    #[test]
    fn scoring_caps_each_factor_and_the_total() {
        let gap = Gap::new(
            TENANT,
            "s-1",
            "Anjali",
            NaiveDate::from_ymd_opt(2026, 3, 14).unwrap(),
            NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
            Money::from_major(1_000_000),
            vec![],
        );
        // 30 + 20 (capped) + 25 + 15 (capped) + 10 (capped) = 100
        let score = fill_priority(&gap, &vip_for_scoring(10_000_000, 990));
        assert_eq!(score, 100.0);
    }

    #[test]
    fn ranking_breaks_ties_deterministically() {
        let h = harness();
        let gap = Gap::new(
            TENANT,
            "s-1",
            "Anjali",
            NaiveDate::from_ymd_opt(2026, 3, 14).unwrap(),
            NaiveTime::from_hms_opt(14, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(15, 0, 0).unwrap(),
            Money::ZERO,
            vec![],
        );
        let mut a = CustomerScore::new(TENANT, "c-b", "B", "+1", CustomerSegment::Regular);
        let mut b = CustomerScore::new(TENANT, "c-a", "A", "+2", CustomerSegment::Regular);
        a.ltv.total = Money::from_major(100);
        b.ltv.total = Money::from_major(100);

        let ranked = h.orchestrator.rank_candidates(&gap, vec![a, b]);
        assert_eq!(ranked[0].customer.customer_id, "c-a", "id order breaks the tie");

        let mut c = CustomerScore::new(TENANT, "c-z", "Z", "+3", CustomerSegment::Regular);
        c.ltv.total = Money::from_major(200);
        let d = CustomerScore::new(TENANT, "c-a", "A", "+4", CustomerSegment::Regular);
        let ranked = h.orchestrator.rank_candidates(&gap, vec![d, c]);
        assert_eq!(ranked[0].customer.customer_id, "c-z", "higher ltv wins the tie");
    }

    #[tokio::test]
    async fn full_auto_execute_creates_decision_outreach_and_send_task() {
        let h = harness();
        let gap = seed_gap(&h.store).await;
        seed_vip(&h.store, "c-1", "+919000000001").await;

        let report = h
            .orchestrator
            .execute(TENANT, &gap.id, AutonomyLevel::FullAuto)
            .await
            .unwrap()
            .expect("report");
        assert!(!report.requires_approval);
        assert_eq!(report.score, 61.0);
        let outreach_id = report.outreach_id.expect("outreach created");

        let record = h
            .store
            .get_outreach(TENANT, &outreach_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, OutreachStatus::Pending);
        assert_eq!(record.trigger_id.as_deref(), Some(gap.id.as_str()));

        let tasks = h.queue.drain().await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].name, format!("notify-{outreach_id}"));

        let updated_gap = h.store.get_gap(TENANT, &gap.id).await.unwrap().unwrap();
        assert_eq!(updated_gap.fill_attempts, 1);
    }

    #[tokio::test]
    async fn supervised_execute_creates_approval_not_outreach() {
        let h = harness();
        let gap = seed_gap(&h.store).await;
        seed_vip(&h.store, "c-1", "+919000000001").await;

        let report = h
            .orchestrator
            .execute(TENANT, &gap.id, AutonomyLevel::Supervised)
            .await
            .unwrap()
            .expect("report");
        assert!(report.requires_approval);
        assert!(report.outreach_id.is_none());

        let approval = h
            .store
            .find_approval_by_decision(TENANT, &report.decision_id)
            .await
            .unwrap()
            .expect("approval created");
        // 90-minute gap is high priority → 5-minute approval window.
        assert!(approval.expires_at - approval.created_at <= Duration::minutes(5));
        assert!(h.queue.is_empty().await, "no send task before approval");
    }

    #[tokio::test]
    async fn no_candidates_is_a_soft_skip() {
        let h = harness();
        let gap = seed_gap(&h.store).await;

        let report = h
            .orchestrator
            .execute(TENANT, &gap.id, AutonomyLevel::FullAuto)
            .await
            .unwrap();
        assert!(report.is_none());

        // Soft skip: no breaker error, no action recorded.
        let state = h.store.get_agent_state(TENANT, GAP_FILL_AGENT).await.unwrap();
        assert!(state.is_none());
    }

    #[tokio::test]
    async fn llm_failure_is_a_breaker_error() {
        let h = harness_with_gateway(true);
        let gap = seed_gap(&h.store).await;
        seed_vip(&h.store, "c-1", "+919000000001").await;

        let err = h
            .orchestrator
            .execute(TENANT, &gap.id, AutonomyLevel::FullAuto)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ProviderUnavailable(_)));

        let state = h
            .store
            .get_agent_state(TENANT, GAP_FILL_AGENT)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.circuit_breaker.error_count, 1);
    }

    #[tokio::test]
    async fn happy_path_attribution_settles_everything() {
        let mut h = harness();
        let gap = seed_gap(&h.store).await;
        seed_vip(&h.store, "c-1", "+919000000001").await;

        let report = h
            .orchestrator
            .execute(TENANT, &gap.id, AutonomyLevel::FullAuto)
            .await
            .unwrap()
            .unwrap();
        let outreach_id = report.outreach_id.clone().unwrap();

        // Provider accepts the send, then delivery + read callbacks arrive.
        h.outreach
            .mark_sent(TENANT, &outreach_id, "SM900")
            .await
            .unwrap();
        h.outreach
            .apply_provider_status("SM900", ProviderStatus::Delivered, None)
            .await
            .unwrap();
        h.outreach
            .apply_provider_status("SM900", ProviderStatus::Read, None)
            .await
            .unwrap();

        // Customer replies YES.
        let responded = h
            .outreach
            .record_reply(TENANT, &outreach_id, ReplyAction::Accept, None)
            .await
            .unwrap();
        let booking = h
            .orchestrator
            .attribute_acceptance(&responded)
            .await
            .unwrap()
            .expect("booking created");
        assert_eq!(booking.booking_id, "b123");

        let gap = h.store.get_gap(TENANT, &gap.id).await.unwrap().unwrap();
        assert_eq!(gap.status, GapStatus::Filled);
        assert_eq!(gap.filled_by.as_ref().unwrap().booking_id, "b123");

        let decision = h
            .store
            .get_decision(TENANT, &report.decision_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(decision.outcome.status, OutcomeStatus::Success);
        assert_eq!(decision.outcome.booking_id.as_deref(), Some("b123"));
        assert_eq!(decision.revenue.actual, Money::from_major(800));

        let state = h
            .store
            .get_agent_state(TENANT, GAP_FILL_AGENT)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.counters.actions_taken, 2);
        assert_eq!(state.counters.actions_successful, 2);
        assert_eq!(state.counters.revenue_generated, Money::from_major(800));

        let outreach = h
            .store
            .get_outreach(TENANT, &outreach_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outreach.response.booking_id.as_deref(), Some("b123"));

        let mut saw_gap_filled = false;
        while let Ok(event) = h.events.try_recv() {
            if event.event_type == EventType::GapFilled {
                saw_gap_filled = true;
            }
        }
        assert!(saw_gap_filled);
    }

    #[tokio::test]
    async fn expiring_a_gap_expires_outreach_and_decision() {
        let h = harness();
        let gap = seed_gap(&h.store).await;
        seed_vip(&h.store, "c-1", "+919000000001").await;

        let report = h
            .orchestrator
            .execute(TENANT, &gap.id, AutonomyLevel::FullAuto)
            .await
            .unwrap()
            .unwrap();
        let outreach_id = report.outreach_id.unwrap();

        h.orchestrator.expire_gap(TENANT, &gap.id).await.unwrap();

        let gap = h.store.get_gap(TENANT, &gap.id).await.unwrap().unwrap();
        assert_eq!(gap.status, GapStatus::Expired);
        let outreach = h
            .store
            .get_outreach(TENANT, &outreach_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outreach.status, OutreachStatus::Expired);
        let decision = h
            .store
            .get_decision(TENANT, &report.decision_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(decision.outcome.status, OutcomeStatus::Expired);
    }

    #[tokio::test]
    async fn second_execute_for_same_gap_skips_live_candidate() {
        let h = harness();
        let gap = seed_gap(&h.store).await;
        seed_vip(&h.store, "c-1", "+919000000001").await;

        h.orchestrator
            .execute(TENANT, &gap.id, AutonomyLevel::FullAuto)
            .await
            .unwrap()
            .unwrap();
        // Same customer now has a live (pending) outreach for this gap and
        // is also inside the cooldown window, so no candidates remain.
        let second = h
            .orchestrator
            .execute(TENANT, &gap.id, AutonomyLevel::FullAuto)
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn queue_saturation_defers_with_backpressure_events() {
        let h = harness();
        let gap = seed_gap(&h.store).await;
        seed_vip(&h.store, "c-1", "+919000000001").await;
        h.queue.set_saturated(true);

        let queue = h.queue.clone();
        let handle = tokio::spawn(async move {
            // Free the queue while the orchestrator is backing off.
            tokio::time::sleep(std::time::Duration::from_secs(12)).await;
            queue.set_saturated(false);
        });

        let mut events = h.events;
        let report = h
            .orchestrator
            .execute(TENANT, &gap.id, AutonomyLevel::FullAuto)
            .await
            .unwrap()
            .unwrap();
        handle.await.unwrap();
        assert!(report.outreach_id.is_some());

        let mut backpressure = 0;
        while let Ok(event) = events.try_recv() {
            if event.event_type == EventType::Backpressure {
                backpressure += 1;
            }
        }
        assert!(backpressure >= 1, "deferrals emit backpressure events");
        assert_eq!(h.queue.len().await, 1);
    }

    #[tokio::test]
    async fn circuit_open_blocks_execution_before_any_work() {
        let h = harness();
        let gap = seed_gap(&h.store).await;
        seed_vip(&h.store, "c-1", "+919000000001").await;
        for _ in 0..5 {
            h.runtime
                .record_failure(TENANT, GAP_FILL_AGENT, "boom")
                .await
                .unwrap();
        }

        let err = h
            .orchestrator
            .execute(TENANT, &gap.id, AutonomyLevel::FullAuto)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::CircuitOpen { .. }));
    }
}
