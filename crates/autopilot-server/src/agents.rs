//! Agents registered with the pipeline at startup.
//!
//! The concierge answers customer queries directly through the gateway; the
//! gap-fill agent adapts scheduler tick payloads onto the orchestrator.
//! Other behaviours plug in the same way.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use autopilot_gateway::{ChatRequest, GatewayError, LlmGateway};
use autopilot_guardrail::Guardrail;
use autopilot_orchestrator::{GapFillOrchestrator, GAP_FILL_AGENT};
use autopilot_pipeline::{Agent, PipelineContext, PipelineRequest};
use autopilot_types::{AgentError, AutonomyLevel};

pub struct ConciergeAgent {
    gateway: Arc<dyn LlmGateway>,
    guardrail: Arc<Guardrail>,
}

impl ConciergeAgent {
    pub fn new(gateway: Arc<dyn LlmGateway>, guardrail: Arc<Guardrail>) -> Self {
        Self { gateway, guardrail }
    }
}

#[async_trait]
impl Agent for ConciergeAgent {
    fn name(&self) -> &'static str {
        "concierge"
    }

    fn description(&self) -> &'static str {
        "Answers customer queries about services, bookings, and offers"
    }

    fn system_prompt(&self) -> String {
        format!(
            "You are a helpful salon assistant. Answer briefly and concretely.{}",
            self.guardrail.system_prompt_suffix()
        )
    }

    async fn handle(
        &self,
        request: &PipelineRequest,
        ctx: &PipelineContext,
    ) -> Result<Value, AgentError> {
        let chat = ChatRequest {
            prompt: request.prompt.clone(),
            system: Some(self.system_prompt()),
            model: ctx.model.clone(),
            ..ChatRequest::default()
        };
        let response = self.gateway.chat(chat).await.map_err(map_gateway_error)?;
        Ok(json!({
            "reply": response.content,
            "tokens_used": response.usage.total_tokens,
        }))
    }
}

pub struct GapFillAgent {
    orchestrator: Arc<GapFillOrchestrator>,
}

impl GapFillAgent {
    pub fn new(orchestrator: Arc<GapFillOrchestrator>) -> Self {
        Self { orchestrator }
    }

    fn autonomy_from(params: &Value) -> AutonomyLevel {
        match params
            .get("data")
            .and_then(|d| d.get("autonomy_level"))
            .and_then(|v| v.as_str())
        {
            Some("full_auto") => AutonomyLevel::FullAuto,
            Some("manual_only") => AutonomyLevel::ManualOnly,
            _ => AutonomyLevel::Supervised,
        }
    }
}

#[async_trait]
impl Agent for GapFillAgent {
    fn name(&self) -> &'static str {
        GAP_FILL_AGENT
    }

    fn description(&self) -> &'static str {
        "Fills open schedule gaps with scored customer outreach"
    }

    fn system_prompt(&self) -> String {
        "You coordinate schedule gap filling.".to_string()
    }

    async fn handle(
        &self,
        request: &PipelineRequest,
        ctx: &PipelineContext,
    ) -> Result<Value, AgentError> {
        let action = request
            .params
            .get("action")
            .and_then(|v| v.as_str())
            .unwrap_or(request.prompt.as_str());
        let autonomy = Self::autonomy_from(&request.params);

        match action {
            "fill_gap" => {
                let gap_id = request
                    .params
                    .get("data")
                    .and_then(|d| d.get("gap_id"))
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| AgentError::Validation("missing gap_id".into()))?;
                let report = self
                    .orchestrator
                    .execute(&ctx.tenant_id, gap_id, autonomy)
                    .await?;
                Ok(json!({"action": "fill_gap", "report": report}))
            }
            "periodic_check" => {
                let gaps = self.orchestrator.detect_gaps(&ctx.tenant_id, None).await?;
                let mut reports = Vec::new();
                for gap in gaps {
                    match self.orchestrator.execute(&ctx.tenant_id, &gap.id, autonomy).await {
                        Ok(Some(report)) => reports.push(serde_json::to_value(report).unwrap_or(Value::Null)),
                        Ok(None) => {}
                        // One gap hitting the breaker or rate limit ends the
                        // tick; remaining gaps wait for the next interval.
                        Err(err) => return Err(err),
                    }
                }
                Ok(json!({"action": "periodic_check", "reports": reports}))
            }
            other => Err(AgentError::Validation(format!(
                "unknown gap_fill action `{other}`"
            ))),
        }
    }
}

fn map_gateway_error(err: GatewayError) -> AgentError {
    match err {
        GatewayError::ProviderRateLimited => AgentError::ProviderRateLimited,
        GatewayError::InvalidModel(model) => {
            AgentError::Validation(format!("unknown model `{model}`"))
        }
        GatewayError::ContentTooLong => {
            AgentError::Validation("prompt exceeds the model context window".into())
        }
        GatewayError::ProviderUnavailable(detail) => AgentError::ProviderUnavailable(detail),
    }
}
