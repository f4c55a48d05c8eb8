//! Routes, handlers, and the transport error mapping.
//!
//! Webhook handlers always answer `200 OK` within the synchronous budget and
//! swallow downstream errors after logging, preserving the provider's retry
//! semantics. Internal task handlers answer 2xx on expected business
//! failures and 5xx only on systemic ones, so the queue retries the right
//! things.

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{Form, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use autopilot_observability::redact_text;
use autopilot_orchestrator::{CleanupKind, ProviderStatus, SendError, GAP_FILL_AGENT};
use autopilot_pipeline::{PipelineContext, PipelineRequest, PipelineResult};
use autopilot_store::{OutreachStore, TenantDirectory};
use autopilot_types::{OutreachStatus, OutreachType, ReplyAction};

use crate::AppState;

const WEBHOOK_SYNC_BUDGET: Duration = Duration::from_secs(5);

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/agents/{name}/invoke", post(invoke_agent))
        .route("/webhooks/provider/status", post(provider_status))
        .route("/webhooks/provider/incoming", post(provider_incoming))
        .route("/internal/tasks/execute", post(execute_task))
        .route("/internal/tasks/send-notification", post(send_notification))
        .route("/internal/tasks/cleanup", post(cleanup_task))
        .route("/approvals/{id}/approve", post(approve))
        .route("/approvals/{id}/reject", post(reject))
        .route("/tenants/{tenant_id}/stats/outreach", get(outreach_stats))
        .route("/tenants/{tenant_id}/stats/approvals", get(approval_stats))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "autopilot_server_listening");
    axum::serve(listener, router).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Health

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "features": state.feature_availability(),
        "timestamp": Utc::now(),
    }))
}

// ---------------------------------------------------------------------------
// Agent invoke

#[derive(Debug, Deserialize)]
struct InvokeContext {
    tenant_id: String,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    language: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InvokeBody {
    context: InvokeContext,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct InvokeResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    suggestions: Option<Vec<String>>,
    confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    model_used: Option<String>,
    timestamp: chrono::DateTime<Utc>,
}

impl InvokeResponse {
    fn from_result(result: PipelineResult) -> Self {
        Self {
            success: result.success,
            data: result.data,
            message: result.message,
            cached: result.cached,
            suggestions: None,
            confidence: result.confidence,
            model_used: result.model_used,
            timestamp: Utc::now(),
        }
    }
}

fn status_for_kind(kind: Option<&str>) -> StatusCode {
    match kind {
        // A rejected query is a helpful message, not a transport error.
        Some("guardrail_rejected") => StatusCode::OK,
        Some("validation_error") => StatusCode::BAD_REQUEST,
        Some("unauthorized") => StatusCode::FORBIDDEN,
        Some("rate_limited") => StatusCode::TOO_MANY_REQUESTS,
        Some("not_found") => StatusCode::NOT_FOUND,
        Some("state_conflict") => StatusCode::CONFLICT,
        Some("provider_unavailable") | Some("provider_rate_limited") | Some("circuit_open") => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn invoke_agent(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<InvokeBody>,
) -> Response {
    if body.context.tenant_id.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"success": false, "message": "tenant_id is required"})),
        )
            .into_response();
    }
    let prompt = body
        .params
        .get("prompt")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    let request = PipelineRequest {
        prompt,
        params: body.params,
    };
    let mut ctx = PipelineContext::new(body.context.tenant_id, name);
    ctx.user_id = body.context.user_id;
    ctx.session_id = body.context.session_id;
    if let Some(channel) = body.context.channel {
        ctx.channel = channel;
    }
    if let Some(language) = body.context.language {
        ctx.language = language;
    }

    let result = state.pipeline.process(&request, &mut ctx).await;
    let status = if result.success {
        StatusCode::OK
    } else {
        status_for_kind(result.error_kind())
    };
    (status, Json(InvokeResponse::from_result(result))).into_response()
}

// ---------------------------------------------------------------------------
// Provider webhooks

#[derive(Debug, Deserialize)]
struct StatusCallback {
    #[serde(rename = "MessageSid")]
    message_sid: String,
    #[serde(rename = "MessageStatus")]
    message_status: String,
    #[serde(rename = "ErrorCode", default)]
    error_code: Option<String>,
    #[serde(rename = "ErrorMessage", default)]
    error_message: Option<String>,
}

async fn provider_status(
    State(state): State<AppState>,
    Form(callback): Form<StatusCallback>,
) -> Response {
    info!(
        message_sid = %callback.message_sid,
        status = %callback.message_status,
        "provider_status_callback"
    );

    let Some(status) = ProviderStatus::parse(&callback.message_status) else {
        warn!(status = %callback.message_status, "unknown_provider_status");
        return webhook_ok();
    };
    let error = callback.error_message.or(callback.error_code);

    let work = state
        .outreach
        .apply_provider_status(&callback.message_sid, status, error);
    match tokio::time::timeout(WEBHOOK_SYNC_BUDGET, work).await {
        Ok(Ok(None)) => {
            warn!(message_sid = %callback.message_sid, "outreach_not_found_for_message");
        }
        Ok(Ok(Some(_))) => {}
        Ok(Err(err)) => {
            error!(message_sid = %callback.message_sid, error = %err, "status_update_failed");
        }
        Err(_) => {
            error!(message_sid = %callback.message_sid, "status_update_timed_out");
        }
    }
    webhook_ok()
}

#[derive(Debug, Deserialize)]
struct IncomingMessage {
    #[serde(rename = "MessageSid", default)]
    message_sid: Option<String>,
    #[serde(rename = "From", default)]
    from: Option<String>,
    #[serde(rename = "Body", default)]
    body: Option<String>,
}

/// Classify a customer reply. Token-equality match over the accept/decline
/// vocabularies; a lone digit 1–5 selects an option; anything else is handed
/// to the conversational flow.
pub fn parse_reply(body: &str) -> Option<ReplyAction> {
    const ACCEPT: &[&str] = &[
        "yes", "y", "confirm", "book", "sure", "ok", "okay", "haan", "ha", "ji",
    ];
    const DECLINE: &[&str] = &["no", "n", "cancel", "decline", "nahi", "na", "nope"];

    let normalized = body.trim().to_lowercase();
    if normalized.is_empty() {
        return None;
    }
    if normalized.len() == 1 {
        if let Some(digit @ '1'..='5') = normalized.chars().next() {
            return Some(ReplyAction::Select(digit as u8 - b'0'));
        }
    }
    let tokens: Vec<&str> = normalized.split_whitespace().collect();
    if tokens.iter().any(|t| ACCEPT.contains(t)) {
        return Some(ReplyAction::Accept);
    }
    if tokens.iter().any(|t| DECLINE.contains(t)) {
        return Some(ReplyAction::Decline);
    }
    None
}

async fn provider_incoming(
    State(state): State<AppState>,
    Form(message): Form<IncomingMessage>,
) -> Response {
    let phone = message
        .from
        .as_deref()
        .unwrap_or_default()
        .trim_start_matches("whatsapp:")
        .to_string();
    let body = message.body.unwrap_or_default();
    info!(
        message_sid = message.message_sid.as_deref().unwrap_or(""),
        from = %phone,
        body = %redact_text(&body),
        "provider_incoming_message"
    );
    if phone.is_empty() {
        return webhook_ok();
    }

    let work = handle_incoming(state, phone, body);
    if tokio::time::timeout(WEBHOOK_SYNC_BUDGET, work).await.is_err() {
        error!("incoming_message_timed_out");
    }
    webhook_ok()
}

async fn handle_incoming(state: AppState, phone: String, body: String) {
    // The inbound webhook carries no tenant context; the phone number finds
    // the most recent outreach across tenants within 24 hours.
    let since = Utc::now() - chrono::Duration::hours(24);
    let recent = match state.store.find_recent_outreach_by_phone(&phone, since).await {
        Ok(Some(outreach)) => outreach,
        Ok(None) => {
            info!(from = %phone, "no_recent_outreach_for_incoming");
            return;
        }
        Err(err) => {
            error!(error = %err, "incoming_lookup_failed");
            return;
        }
    };

    let Some(action) = parse_reply(&body) else {
        // Conversational reply; a chat agent picks it up elsewhere.
        return;
    };

    let responded = match state
        .outreach
        .record_reply(&recent.tenant_id, &recent.id, action, None)
        .await
    {
        Ok(responded) => responded,
        Err(err) => {
            warn!(outreach_id = %recent.id, error = %err, "reply_not_recorded");
            return;
        }
    };

    if action == ReplyAction::Accept
        && responded.trigger_kind.as_deref() == Some("schedule_gap")
    {
        // Booking creation and attribution are heavier than the webhook
        // budget allows; run them off the synchronous path.
        let orchestrator = state.orchestrator.clone();
        tokio::spawn(async move {
            if let Err(err) = orchestrator.attribute_acceptance(&responded).await {
                error!(outreach_id = %responded.id, error = %err, "attribution_failed");
            }
        });
    }
}

fn webhook_ok() -> Response {
    (StatusCode::OK, "OK").into_response()
}

// ---------------------------------------------------------------------------
// Internal task handlers

fn check_queue_auth(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = state.config.queue_auth_token.as_deref() else {
        return Ok(());
    };
    let presented = headers
        .get("x-autopilot-queue-token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if presented == expected {
        Ok(())
    } else {
        Err((
            StatusCode::FORBIDDEN,
            Json(json!({"success": false, "message": "invalid queue token"})),
        )
            .into_response())
    }
}

#[derive(Debug, Deserialize)]
struct ExecuteTask {
    tenant_id: String,
    agent_name: String,
    action: String,
    #[serde(default)]
    data: Value,
}

async fn execute_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(task): Json<ExecuteTask>,
) -> Response {
    if let Err(denied) = check_queue_auth(&state, &headers) {
        return denied;
    }

    // The payload is part of the prompt so distinct tasks never share a
    // cache identity.
    let prompt = if task.data.is_null() {
        task.action.clone()
    } else {
        format!("{} {}", task.action, task.data)
    };
    let request = PipelineRequest {
        prompt,
        params: json!({"action": task.action, "data": task.data}),
    };
    let mut ctx = PipelineContext::new(task.tenant_id, task.agent_name);
    ctx.channel = "internal".to_string();

    let result = state.pipeline.process(&request, &mut ctx).await;
    if result.success {
        return (StatusCode::OK, Json(json!({"success": true, "data": result.data})))
            .into_response();
    }

    // Expected business failures return 2xx so the queue does not retry;
    // systemic failures return 5xx so it does.
    let kind = result.error_kind().unwrap_or("internal").to_string();
    let systemic = matches!(
        kind.as_str(),
        "internal" | "provider_unavailable" | "deadline_exceeded" | "cancelled"
    );
    let status = if systemic {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    };
    (
        status,
        Json(json!({"success": false, "reason": kind, "message": result.message})),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct SendTask {
    tenant_id: String,
    outreach_id: String,
    #[serde(default)]
    #[allow(dead_code)]
    channel: Option<String>,
}

fn agent_for_outreach(outreach_type: OutreachType) -> &'static str {
    match outreach_type {
        OutreachType::GapFill => GAP_FILL_AGENT,
        OutreachType::NoShowPrevention => "no_show_prevention_agent",
        OutreachType::WaitlistPromotion => "waitlist_agent",
        OutreachType::DiscountOffer | OutreachType::Retention | OutreachType::Rebooking => {
            "retention_agent"
        }
    }
}

async fn send_notification(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(task): Json<SendTask>,
) -> Response {
    if let Err(denied) = check_queue_auth(&state, &headers) {
        return denied;
    }

    let record = match state.store.get_outreach(&task.tenant_id, &task.outreach_id).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            return (
                StatusCode::OK,
                Json(json!({"success": false, "reason": "not_found"})),
            )
                .into_response();
        }
        Err(err) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"success": false, "message": err.to_string()})),
            )
                .into_response();
        }
    };

    // Queue re-delivery of an already-dispatched task.
    if record.status != OutreachStatus::Pending {
        return (
            StatusCode::OK,
            Json(json!({"success": true, "reason": "already_sent"})),
        )
            .into_response();
    }

    match state
        .messenger
        .send(record.channel, &record.customer_phone, &record.message)
        .await
    {
        Ok(ack) => {
            match state
                .outreach
                .mark_sent(&task.tenant_id, &record.id, &ack.provider_message_id)
                .await
            {
                Ok(_) => (StatusCode::OK, Json(json!({"success": true}))).into_response(),
                Err(err) => {
                    error!(outreach_id = %record.id, error = %err, "mark_sent_failed");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Json(json!({"success": false, "message": err.to_string()})),
                    )
                        .into_response()
                }
            }
        }
        Err(SendError::Definitive(detail)) => {
            // The provider gave a final verdict: fail the outreach and count
            // a breaker error against the owning agent.
            let _ = state
                .outreach
                .mark_send_failed(&task.tenant_id, &record.id, &detail, true)
                .await;
            let _ = state
                .runtime
                .record_failure(
                    &task.tenant_id,
                    agent_for_outreach(record.outreach_type),
                    &detail,
                )
                .await;
            (
                StatusCode::OK,
                Json(json!({"success": false, "reason": "send_failed"})),
            )
                .into_response()
        }
        Err(SendError::Transient(detail)) => {
            let _ = state
                .outreach
                .mark_send_failed(&task.tenant_id, &record.id, &detail, false)
                .await;
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"success": false, "message": detail})),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct CleanupTask {
    task_type: String,
    #[serde(default)]
    data: Value,
}

async fn cleanup_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(task): Json<CleanupTask>,
) -> Response {
    if let Err(denied) = check_queue_auth(&state, &headers) {
        return denied;
    }
    let Some(kind) = CleanupKind::parse(&task.task_type) else {
        return (
            StatusCode::OK,
            Json(json!({"success": false, "reason": "unknown_task_type"})),
        )
            .into_response();
    };

    let tenants = match task.data.get("tenant_id").and_then(|v| v.as_str()) {
        Some(tenant) => vec![tenant.to_string()],
        None => match state.store.tenant_ids().await {
            Ok(tenants) => tenants,
            Err(err) => {
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"success": false, "message": err.to_string()})),
                )
                    .into_response();
            }
        },
    };

    let mut swept = 0usize;
    for tenant in &tenants {
        let result = match kind {
            CleanupKind::ExpiredApprovals => state.approvals.sweep_expired(tenant).await,
            CleanupKind::ExpiredOutreach => state
                .outreach
                .sweep_expired(tenant)
                .await
                .map_err(|err| autopilot_types::AgentError::Internal(err.to_string())),
            CleanupKind::ExpiredGaps => state.orchestrator.sweep_expired_gaps(tenant).await,
        };
        match result {
            Ok(count) => swept += count,
            Err(err) => {
                error!(tenant, error = %err, task_type = %task.task_type, "cleanup_failed");
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"success": false, "message": err.to_string()})),
                )
                    .into_response();
            }
        }
    }
    (
        StatusCode::OK,
        Json(json!({"success": true, "swept": swept, "tenants": tenants.len()})),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Stats

#[derive(Debug, Deserialize)]
struct StatsQuery {
    #[serde(default = "default_stats_days")]
    days: i64,
}

fn default_stats_days() -> i64 {
    7
}

async fn outreach_stats(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    axum::extract::Query(query): axum::extract::Query<StatsQuery>,
) -> Response {
    match state.outreach.stats(&tenant_id, query.days).await {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"success": false, "message": err.to_string()})),
        )
            .into_response(),
    }
}

async fn approval_stats(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    axum::extract::Query(query): axum::extract::Query<StatsQuery>,
) -> Response {
    match state.approvals.stats(&tenant_id, query.days).await {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(err) => agent_error_response(&err),
    }
}

// ---------------------------------------------------------------------------
// Approvals

#[derive(Debug, Deserialize)]
struct ApprovalAction {
    tenant_id: String,
    responded_by: String,
    #[serde(default)]
    notes: Option<String>,
}

async fn approve(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ApprovalAction>,
) -> Response {
    let approval = match state
        .approvals
        .approve(&body.tenant_id, &id, &body.responded_by, body.notes)
        .await
    {
        Ok(approval) => approval,
        Err(err) => return agent_error_response(&err),
    };

    // Approval granted: the supervised action may now proceed to outreach.
    let outreach_id = match state
        .orchestrator
        .proceed_after_approval(&body.tenant_id, &approval.decision_id)
        .await
    {
        Ok(record) => Some(record.id),
        Err(err) => {
            warn!(
                approval_id = %approval.id,
                error = %err,
                "post_approval_dispatch_failed"
            );
            None
        }
    };

    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "approval_id": approval.id,
            "decision_id": approval.decision_id,
            "outreach_id": outreach_id,
        })),
    )
        .into_response()
}

async fn reject(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ApprovalAction>,
) -> Response {
    match state
        .approvals
        .reject(
            &body.tenant_id,
            &id,
            &body.responded_by,
            body.notes.unwrap_or_else(|| "rejected".to_string()),
        )
        .await
    {
        Ok(approval) => (
            StatusCode::OK,
            Json(json!({"success": true, "approval_id": approval.id})),
        )
            .into_response(),
        Err(err) => agent_error_response(&err),
    }
}

fn agent_error_response(err: &autopilot_types::AgentError) -> Response {
    let status = status_for_kind(Some(err.kind()));
    (
        status,
        Json(json!({"success": false, "reason": err.kind(), "message": err.to_string()})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn affirmative_replies_accept() {
        for body in ["yes", "YES", "  y ", "confirm", "book", "sure", "ok", "okay", "haan", "ha", "ji", "haan ji"] {
            assert_eq!(parse_reply(body), Some(ReplyAction::Accept), "body `{body}`");
        }
    }

    #[test]
    fn negative_replies_decline() {
        for body in ["no", "n", "cancel", "decline", "nahi", "na", "nope"] {
            assert_eq!(parse_reply(body), Some(ReplyAction::Decline), "body `{body}`");
        }
    }

    #[test]
    fn digits_select_options() {
        assert_eq!(parse_reply("1"), Some(ReplyAction::Select(1)));
        assert_eq!(parse_reply(" 3 "), Some(ReplyAction::Select(3)));
        assert_eq!(parse_reply("5"), Some(ReplyAction::Select(5)));
        assert_eq!(parse_reply("6"), None);
        assert_eq!(parse_reply("0"), None);
    }

    #[test]
    fn conversational_replies_are_unclassified() {
        assert_eq!(parse_reply("maybe later this week"), None);
        assert_eq!(parse_reply("what time exactly?"), None);
        assert_eq!(parse_reply(""), None);
    }

    #[test]
    fn accept_wins_over_decline_like_the_provider_flow() {
        // "yes but no" is ambiguous; the accept vocabulary is checked first.
        assert_eq!(parse_reply("yes but no"), Some(ReplyAction::Accept));
    }

    #[test]
    fn status_mapping_matches_the_taxonomy() {
        assert_eq!(status_for_kind(Some("guardrail_rejected")), StatusCode::OK);
        assert_eq!(status_for_kind(Some("rate_limited")), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(status_for_kind(Some("circuit_open")), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_for_kind(Some("state_conflict")), StatusCode::CONFLICT);
        assert_eq!(status_for_kind(Some("internal")), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
