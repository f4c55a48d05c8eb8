//! Outreach lifecycle.
//!
//! Creation is gated by three preconditions (resolved approval, per-customer
//! cooldown, per-tenant daily budget); a failed precondition returns a typed
//! reason and creates no record. After creation the document moves through
//! the monotone delivery graph driven by provider webhooks; duplicate or
//! out-of-order callbacks are ignored with a log, so the terminal state is
//! independent of delivery order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, FixedOffset, Utc};
use serde_json::json;
use tracing::warn;

use autopilot_observability::ControlPlaneEvent;
use autopilot_store::{AuditStore, OutreachStore, Store, StoreError};
use autopilot_types::{
    AuditEventType, AuditRecord, AuditSeverity, Decision, DomainEvent, EventType, Outreach,
    OutreachChannel, OutreachResponse, OutreachStatus, OutreachType, ReplyAction,
};

use crate::events::EventPublisher;

/// Provider-side message status, as delivered on the status webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderStatus {
    Queued,
    Sent,
    Delivered,
    Read,
    Failed,
    Undelivered,
}

impl ProviderStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "queued" => Some(Self::Queued),
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "read" => Some(Self::Read),
            "failed" => Some(Self::Failed),
            "undelivered" => Some(Self::Undelivered),
            _ => None,
        }
    }

    /// The record-side status this callback maps to. `queued` confirms the
    /// record's existing `pending` state and drives nothing.
    fn target(self) -> Option<OutreachStatus> {
        match self {
            Self::Queued => None,
            Self::Sent => Some(OutreachStatus::Sent),
            Self::Delivered => Some(OutreachStatus::Delivered),
            Self::Read => Some(OutreachStatus::Read),
            Self::Failed | Self::Undelivered => Some(OutreachStatus::Failed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutreachDenied {
    CooldownActive { until: DateTime<Utc> },
    DailyLimitExceeded { current: usize, limit: u32 },
    ApprovalNotGranted,
}

impl OutreachDenied {
    pub fn reason(&self) -> &'static str {
        match self {
            OutreachDenied::CooldownActive { .. } => "cooldown_active",
            OutreachDenied::DailyLimitExceeded { .. } => "daily_limit_exceeded",
            OutreachDenied::ApprovalNotGranted => "approval_not_granted",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum OutreachError {
    #[error("outreach denied: {}", .0.reason())]
    Denied(OutreachDenied),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("store error: {0}")]
    Store(String),
}

impl From<StoreError> for OutreachError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(detail) => OutreachError::NotFound(detail),
            StoreError::Conflict(detail) => OutreachError::Store(detail),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateOutreach {
    pub customer_id: String,
    pub customer_name: String,
    pub customer_phone: String,
    pub outreach_type: OutreachType,
    pub channel: OutreachChannel,
    pub message: String,
    pub trigger_id: Option<String>,
    pub trigger_kind: Option<String>,
    pub offer_details: serde_json::Value,
    pub expires_in_minutes: i64,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct OutreachStats {
    pub total: usize,
    pub by_status: HashMap<String, usize>,
    pub by_channel: HashMap<String, usize>,
    pub by_type: HashMap<String, usize>,
    pub response_rate: f64,
    pub conversion_rate: f64,
    pub avg_response_time_s: f64,
}

pub struct OutreachService {
    store: Arc<dyn Store>,
    publisher: Arc<dyn EventPublisher>,
    cooldown: Duration,
    daily_cap: u32,
    utc_offset_minutes: i32,
}

impl OutreachService {
    pub fn new(
        store: Arc<dyn Store>,
        publisher: Arc<dyn EventPublisher>,
        cooldown_minutes: i64,
        daily_cap: u32,
        utc_offset_minutes: i32,
    ) -> Self {
        Self {
            store,
            publisher,
            cooldown: Duration::minutes(cooldown_minutes),
            daily_cap,
            utc_offset_minutes,
        }
    }

    fn local_day_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let offset = FixedOffset::east_opt(self.utc_offset_minutes * 60)
            .unwrap_or_else(|| FixedOffset::east_opt(0).unwrap());
        let local_midnight = now
            .with_timezone(&offset)
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .unwrap_or_default();
        DateTime::from_naive_utc_and_offset(
            local_midnight - Duration::minutes(self.utc_offset_minutes as i64),
            Utc,
        )
    }

    /// Cooldown and daily-budget gate. The approval gate lives in `create`
    /// because it needs the owning decision.
    pub async fn can_send(
        &self,
        tenant_id: &str,
        customer_phone: &str,
    ) -> Result<Result<(), OutreachDenied>, OutreachError> {
        let now = Utc::now();
        let since = now - self.cooldown;
        if let Some(recent) = self
            .store
            .find_recent_outreach_by_phone_for_tenant(tenant_id, customer_phone, since)
            .await?
        {
            return Ok(Err(OutreachDenied::CooldownActive {
                until: recent.created_at + self.cooldown,
            }));
        }

        let today_count = self
            .store
            .count_outreach_created_since(tenant_id, self.local_day_start(now))
            .await?;
        if today_count >= self.daily_cap as usize {
            return Ok(Err(OutreachDenied::DailyLimitExceeded {
                current: today_count,
                limit: self.daily_cap,
            }));
        }
        Ok(Ok(()))
    }

    /// Create an outreach record, or return the failed precondition. No
    /// record is written on denial.
    pub async fn create(
        &self,
        tenant_id: &str,
        decision: Option<&Decision>,
        params: CreateOutreach,
    ) -> Result<Outreach, OutreachError> {
        if let Some(decision) = decision {
            if decision.approval.required
                && decision.approval.status != Some(autopilot_types::ApprovalStatus::Approved)
            {
                return Err(OutreachError::Denied(OutreachDenied::ApprovalNotGranted));
            }
        }
        if let Err(denied) = self.can_send(tenant_id, &params.customer_phone).await? {
            return Err(OutreachError::Denied(denied));
        }

        let outreach = Outreach::new(
            tenant_id,
            params.customer_id,
            params.customer_name,
            params.customer_phone,
            params.outreach_type,
            params.channel,
            params.message,
            params.trigger_id,
            params.trigger_kind,
            params.offer_details,
            params.expires_in_minutes,
        );
        let outreach = self.store.put_outreach(outreach).await?;
        ControlPlaneEvent::new("outreach", "created", tenant_id)
            .record("outreach", &outreach.id)
            .trigger(outreach.trigger_id.as_deref().unwrap_or(""))
            .status(outreach.channel.as_str())
            .emit();
        self.audit(&outreach, "created").await;
        Ok(outreach)
    }

    /// Provider accepted the send: `pending → sent` with the provider
    /// message id that keys all later callbacks.
    pub async fn mark_sent(
        &self,
        tenant_id: &str,
        outreach_id: &str,
        provider_message_id: &str,
    ) -> Result<Outreach, OutreachError> {
        let message_id = provider_message_id.to_string();
        let updated = self
            .store
            .update_outreach(
                tenant_id,
                outreach_id,
                Box::new(move |record| {
                    if !record.status.accepts(OutreachStatus::Sent) {
                        return Err(StoreError::Conflict(format!(
                            "outreach already {:?}",
                            record.status
                        )));
                    }
                    let now = Utc::now();
                    record.status = OutreachStatus::Sent;
                    record.delivery.provider_message_id = Some(message_id);
                    record.delivery.sent_at = Some(now);
                    record.attempts += 1;
                    record.last_attempt_at = Some(now);
                    Ok(())
                }),
            )
            .await?;
        self.publish(&updated, EventType::OutreachSent, None).await;
        Ok(updated)
    }

    /// Record the provider's failure verdict for a send attempt. Definitive
    /// failures move the record to `failed`; transient errors only annotate
    /// the delivery sub-record.
    pub async fn mark_send_failed(
        &self,
        tenant_id: &str,
        outreach_id: &str,
        error: &str,
        definitive: bool,
    ) -> Result<Outreach, OutreachError> {
        let error = error.to_string();
        let updated = self
            .store
            .update_outreach(
                tenant_id,
                outreach_id,
                Box::new(move |record| {
                    record.delivery.last_error = Some(error);
                    record.last_attempt_at = Some(Utc::now());
                    record.attempts += 1;
                    if definitive && record.status.accepts(OutreachStatus::Failed) {
                        record.status = OutreachStatus::Failed;
                    }
                    Ok(())
                }),
            )
            .await?;
        if updated.status == OutreachStatus::Failed {
            self.publish(&updated, EventType::OutreachFailed, None).await;
        }
        Ok(updated)
    }

    /// Apply a provider status callback. Idempotent: re-delivered or
    /// out-of-order events fail the forward check and are dropped with a
    /// log. Returns the record and whether the event advanced it.
    pub async fn apply_provider_status(
        &self,
        provider_message_id: &str,
        status: ProviderStatus,
        error: Option<String>,
    ) -> Result<Option<(Outreach, bool)>, OutreachError> {
        let Some(existing) = self
            .store
            .find_outreach_by_provider_message_id(provider_message_id)
            .await?
        else {
            return Ok(None);
        };
        let Some(target) = status.target() else {
            return Ok(Some((existing, false)));
        };

        let applied_flag = Arc::new(AtomicBool::new(false));
        let flag = applied_flag.clone();
        let updated = self
            .store
            .update_outreach(
                &existing.tenant_id,
                &existing.id,
                Box::new(move |record| {
                    if !record.status.accepts(target) {
                        return Ok(());
                    }
                    let now = Utc::now();
                    record.status = target;
                    match target {
                        OutreachStatus::Delivered => record.delivery.delivered_at = Some(now),
                        OutreachStatus::Read => record.delivery.read_at = Some(now),
                        OutreachStatus::Failed => record.delivery.last_error = error,
                        OutreachStatus::Sent => record.delivery.sent_at = Some(now),
                        _ => {}
                    }
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .await?;

        let applied = applied_flag.load(Ordering::SeqCst);
        if applied {
            let event_type = match target {
                OutreachStatus::Sent => EventType::OutreachSent,
                OutreachStatus::Delivered => EventType::OutreachDelivered,
                OutreachStatus::Read => EventType::OutreachRead,
                OutreachStatus::Failed => EventType::OutreachFailed,
                _ => EventType::OutreachSent,
            };
            self.publish(&updated, event_type, None).await;
        } else {
            let dropped = format!("current={:?} incoming={target:?}", updated.status);
            ControlPlaneEvent::new("outreach", "event_ignored", &updated.tenant_id)
                .record("outreach", &updated.id)
                .detail(&dropped)
                .emit();
        }
        Ok(Some((updated, applied)))
    }

    /// Customer reply: transition to `responded` with the classified action.
    pub async fn record_reply(
        &self,
        tenant_id: &str,
        outreach_id: &str,
        action: ReplyAction,
        booking_id: Option<String>,
    ) -> Result<Outreach, OutreachError> {
        let label = action.as_label();
        let booking = booking_id.clone();
        let updated = self
            .store
            .update_outreach(
                tenant_id,
                outreach_id,
                Box::new(move |record| {
                    if !record.status.accepts(OutreachStatus::Responded) {
                        return Err(StoreError::Conflict(format!(
                            "outreach already {:?}",
                            record.status
                        )));
                    }
                    record.status = OutreachStatus::Responded;
                    record.response = OutreachResponse {
                        received: true,
                        action: Some(label),
                        responded_at: Some(Utc::now()),
                        booking_id: booking,
                    };
                    Ok(())
                }),
            )
            .await?;
        self.audit(&updated, &format!("responded_{}", action.as_label()))
            .await;
        self.publish(&updated, EventType::OutreachResponded, Some(action))
            .await;
        Ok(updated)
    }

    /// Backfill the booking id once the booking service confirms creation.
    pub async fn attach_booking(
        &self,
        tenant_id: &str,
        outreach_id: &str,
        booking_id: &str,
    ) -> Result<Outreach, OutreachError> {
        let booking = booking_id.to_string();
        Ok(self
            .store
            .update_outreach(
                tenant_id,
                outreach_id,
                Box::new(move |record| {
                    record.response.booking_id = Some(booking);
                    Ok(())
                }),
            )
            .await?)
    }

    /// Move overdue non-terminal records to `expired`.
    pub async fn sweep_expired(&self, tenant_id: &str) -> Result<usize, OutreachError> {
        let due = self
            .store
            .list_expiry_due_outreach(tenant_id, Utc::now(), 100)
            .await?;
        let mut swept = 0;
        for record in due {
            if self.expire_record(tenant_id, &record.id).await? {
                swept += 1;
            }
        }
        if swept > 0 {
            let count = format!("count={swept}");
            ControlPlaneEvent::new("outreach", "expired_sweep", tenant_id)
                .detail(&count)
                .emit();
        }
        Ok(swept)
    }

    /// Expire every live outreach for a trigger (the gap was filled through
    /// another channel, or expired itself).
    pub async fn expire_for_trigger(
        &self,
        tenant_id: &str,
        trigger_id: &str,
    ) -> Result<usize, OutreachError> {
        let records = self
            .store
            .list_outreach_by_trigger(tenant_id, trigger_id)
            .await?;
        let mut expired = 0;
        for record in records {
            if !record.status.is_terminal() && self.expire_record(tenant_id, &record.id).await? {
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn expire_record(
        &self,
        tenant_id: &str,
        outreach_id: &str,
    ) -> Result<bool, OutreachError> {
        let applied_flag = Arc::new(AtomicBool::new(false));
        let flag = applied_flag.clone();
        let updated = self
            .store
            .update_outreach(
                tenant_id,
                outreach_id,
                Box::new(move |record| {
                    if record.status.accepts(OutreachStatus::Expired) {
                        record.status = OutreachStatus::Expired;
                        flag.store(true, Ordering::SeqCst);
                    }
                    Ok(())
                }),
            )
            .await?;
        let applied = applied_flag.load(Ordering::SeqCst);
        if applied {
            self.publish(&updated, EventType::OutreachExpired, None).await;
        }
        Ok(applied)
    }

    /// Aggregate outreach activity over a trailing window.
    pub async fn stats(&self, tenant_id: &str, days: i64) -> Result<OutreachStats, OutreachError> {
        let since = Utc::now() - Duration::days(days);
        let records = self
            .store
            .list_outreach_created_since(tenant_id, since, 500)
            .await?;

        let mut stats = OutreachStats {
            total: records.len(),
            ..OutreachStats::default()
        };
        let mut responded = 0usize;
        let mut converted = 0usize;
        let mut response_times = Vec::new();

        for record in &records {
            let status = serde_json::to_value(record.status)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            *stats.by_status.entry(status).or_default() += 1;
            *stats
                .by_channel
                .entry(record.channel.as_str().to_string())
                .or_default() += 1;
            let type_name = serde_json::to_value(record.outreach_type)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            *stats.by_type.entry(type_name).or_default() += 1;

            if record.response.received {
                responded += 1;
                if record.response.booking_id.is_some() {
                    converted += 1;
                }
                if let (Some(sent), Some(at)) =
                    (record.delivery.sent_at, record.response.responded_at)
                {
                    response_times.push((at - sent).num_seconds() as f64);
                }
            }
        }

        if stats.total > 0 {
            stats.response_rate = responded as f64 / stats.total as f64;
            stats.conversion_rate = converted as f64 / stats.total as f64;
        }
        if !response_times.is_empty() {
            stats.avg_response_time_s =
                response_times.iter().sum::<f64>() / response_times.len() as f64;
        }
        Ok(stats)
    }

    /// Append-only trail; a failed write never blocks the transition.
    async fn audit(&self, record: &Outreach, action: &str) {
        let audit = AuditRecord::new(
            record.tenant_id.clone(),
            AuditEventType::Outreach,
            AuditSeverity::Info,
            "outreach_service",
            "outreach",
            record.id.clone(),
            action,
            json!({
                "customer_id": record.customer_id,
                "channel": record.channel.as_str(),
                "trigger_id": record.trigger_id,
            }),
            record.trigger_id.clone().unwrap_or_else(|| record.id.clone()),
        );
        if let Err(err) = self.store.append_audit(audit).await {
            warn!(error = %err, "audit_append_failed");
        }
    }

    async fn publish(&self, record: &Outreach, event_type: EventType, action: Option<ReplyAction>) {
        if matches!(event_type, EventType::OutreachFailed) {
            ControlPlaneEvent::new("outreach", "failed", &record.tenant_id)
                .record("outreach", &record.id)
                .trigger(record.trigger_id.as_deref().unwrap_or(""))
                .detail(record.delivery.last_error.as_deref().unwrap_or(""))
                .emit_warn();
        }
        self.publisher
            .publish(DomainEvent::new(
                event_type,
                record.tenant_id.clone(),
                json!({
                    "outreach_id": record.id,
                    "customer_id": record.customer_id,
                    "channel": record.channel.as_str(),
                    "trigger_id": record.trigger_id,
                    "response_action": action.map(|a| a.as_label()),
                }),
            ))
            .await;
    }
}
