//! Agent registry and the terminal execute stage.
//!
//! Agents are values implementing a common capability set, registered by
//! name at startup. Resolving an unknown name is a typed error, not a
//! runtime lookup failure.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::error;

use autopilot_types::AgentError;

use crate::{PipelineContext, PipelineRequest, PipelineResult, Terminal};

#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    /// Base system prompt; the guardrail suffix is appended by callers that
    /// talk to the LLM.
    fn system_prompt(&self) -> String;
    async fn handle(
        &self,
        request: &PipelineRequest,
        ctx: &PipelineContext,
    ) -> Result<Value, AgentError>;
}

/// Process-wide name → agent map. Populated once at startup; immutable
/// afterwards.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, agent: Arc<dyn Agent>) {
        self.agents.insert(agent.name().to_string(), agent);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Agent>, AgentError> {
        self.agents
            .get(name)
            .cloned()
            .ok_or_else(|| AgentError::NotFound(format!("agent `{name}`")))
    }

    pub fn list(&self) -> Vec<(&str, &str)> {
        let mut out: Vec<(&str, &str)> = self
            .agents
            .values()
            .map(|a| (a.name(), a.description()))
            .collect();
        out.sort_by_key(|(name, _)| *name);
        out
    }
}

/// Terminal pipeline stage: resolve the agent and run it. Agent errors stop
/// here and become structured results.
pub struct AgentExecutor {
    registry: AgentRegistry,
}

impl AgentExecutor {
    pub fn new(registry: AgentRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Terminal for AgentExecutor {
    async fn execute(
        &self,
        request: &PipelineRequest,
        ctx: &mut PipelineContext,
    ) -> PipelineResult {
        let agent = match self.registry.get(&ctx.agent_name) {
            Ok(agent) => agent,
            Err(err) => return PipelineResult::from_error(&err),
        };

        match agent.handle(request, ctx).await {
            Ok(data) => {
                let mut result = PipelineResult::ok(data);
                result.model_used = ctx.model.clone();
                result
            }
            Err(err) => {
                error!(
                    request_id = %ctx.request_id,
                    agent = %ctx.agent_name,
                    error = %err,
                    "agent_execution_failed"
                );
                PipelineResult::from_error(&err)
            }
        }
    }
}
