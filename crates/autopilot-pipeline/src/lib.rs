//! The decision pipeline: a named, ordered composition of middleware around
//! the final agent-execute step.
//!
//! Order is fixed at startup:
//! `logging → rate-limit → guardrail → cache → model-router → agent-execute`.
//! The pipeline is the error boundary — agent and middleware failures become
//! structured `success = false` results and never propagate as panics or
//! errors. It is single-pass per request and holds no cross-request locks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::error;

use autopilot_types::AgentError;

mod limiter;
mod middlewares;
mod registry;

pub use limiter::{Clock, ManualClock, MonotonicClock, RateLimitMiddleware};
pub use middlewares::{CacheMiddleware, GuardrailMiddleware, LoggingMiddleware, ModelRouterMiddleware, ModelTiers};
pub use registry::{Agent, AgentExecutor, AgentRegistry};

/// The request payload handed to an agent.
#[derive(Debug, Clone, Default)]
pub struct PipelineRequest {
    pub prompt: String,
    pub params: Value,
}

impl PipelineRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            params: Value::Null,
        }
    }
}

/// Per-request context threaded through the chain. The logging stage assigns
/// the request id; the model router fills `model`.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub request_id: String,
    pub tenant_id: String,
    pub agent_name: String,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub channel: String,
    pub language: String,
    pub model: Option<String>,
    pub metadata: HashMap<String, Value>,
    pub cancel: CancellationToken,
}

impl PipelineContext {
    pub fn new(tenant_id: impl Into<String>, agent_name: impl Into<String>) -> Self {
        Self {
            request_id: String::new(),
            tenant_id: tenant_id.into(),
            agent_name: agent_name.into(),
            user_id: None,
            session_id: None,
            channel: "web".to_string(),
            language: "en".to_string(),
            model: None,
            metadata: HashMap::new(),
            cancel: CancellationToken::new(),
        }
    }
}

/// Middleware/agent outcome. `skip_remaining` short-circuits downstream
/// stages (cache hits, guardrail rejections, rate-limit sheds).
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub success: bool,
    pub data: Option<Value>,
    pub message: Option<String>,
    pub cached: bool,
    pub skip_remaining: bool,
    pub confidence: f32,
    pub model_used: Option<String>,
    pub metadata: HashMap<String, Value>,
}

impl PipelineResult {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            cached: false,
            skip_remaining: false,
            confidence: 1.0,
            model_used: None,
            metadata: HashMap::new(),
        }
    }

    pub fn failure(kind: &str, message: impl Into<String>) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert("error_kind".to_string(), Value::String(kind.to_string()));
        Self {
            success: false,
            data: None,
            message: Some(message.into()),
            cached: false,
            skip_remaining: true,
            confidence: 0.0,
            model_used: None,
            metadata,
        }
    }

    pub fn from_error(err: &AgentError) -> Self {
        Self::failure(err.kind(), err.to_string())
    }

    pub fn cancelled() -> Self {
        Self::failure("cancelled", "cancelled")
    }

    pub fn error_kind(&self) -> Option<&str> {
        self.metadata.get("error_kind").and_then(|v| v.as_str())
    }
}

#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;
    async fn handle(
        &self,
        request: &PipelineRequest,
        ctx: &mut PipelineContext,
        next: Next<'_>,
    ) -> PipelineResult;
}

/// The terminal stage behind every middleware.
#[async_trait]
pub trait Terminal: Send + Sync {
    async fn execute(&self, request: &PipelineRequest, ctx: &mut PipelineContext)
        -> PipelineResult;
}

/// Remainder of the chain. Consumed by `run`; a middleware that never calls
/// it short-circuits the pipeline.
pub struct Next<'a> {
    remaining: &'a [Arc<dyn Middleware>],
    terminal: &'a dyn Terminal,
}

impl<'a> Next<'a> {
    pub async fn run(
        self,
        request: &PipelineRequest,
        ctx: &mut PipelineContext,
    ) -> PipelineResult {
        if ctx.cancel.is_cancelled() {
            return PipelineResult::cancelled();
        }
        match self.remaining.split_first() {
            Some((head, tail)) => {
                head.handle(
                    request,
                    ctx,
                    Next {
                        remaining: tail,
                        terminal: self.terminal,
                    },
                )
                .await
            }
            None => self.terminal.execute(request, ctx).await,
        }
    }
}

/// The composed pipeline. Built once at startup; stages are immutable after.
pub struct Pipeline {
    middlewares: Vec<Arc<dyn Middleware>>,
    terminal: Arc<dyn Terminal>,
    deadline: Duration,
}

impl Pipeline {
    pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);

    pub fn new(middlewares: Vec<Arc<dyn Middleware>>, terminal: Arc<dyn Terminal>) -> Self {
        Self {
            middlewares,
            terminal,
            deadline: Self::DEFAULT_DEADLINE,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// The production composition, in the order fixed at startup.
    pub fn standard(
        guardrail: Arc<autopilot_guardrail::Guardrail>,
        cache: Arc<autopilot_cache::ResponseCache>,
        semantic: Option<Arc<dyn autopilot_cache::SemanticIndex>>,
        registry: AgentRegistry,
        tiers: ModelTiers,
        config: &autopilot_types::EngineConfig,
    ) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock);
        let middlewares: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(LoggingMiddleware),
            Arc::new(RateLimitMiddleware::new(
                config.rate_limit_rpm,
                config.rate_limit_rph,
                clock.clone(),
            )),
            Arc::new(GuardrailMiddleware::new(guardrail)),
            Arc::new(CacheMiddleware::new(
                cache,
                semantic,
                config.default_model.clone(),
                config.temperature,
            )),
            Arc::new(ModelRouterMiddleware::new(tiers, clock)),
        ];
        Self::new(middlewares, Arc::new(AgentExecutor::new(registry)))
    }

    /// Run one request through the chain. Never returns an error: timeouts,
    /// cancellations, and stage failures all surface as structured results.
    pub async fn process(
        &self,
        request: &PipelineRequest,
        ctx: &mut PipelineContext,
    ) -> PipelineResult {
        let next = Next {
            remaining: &self.middlewares,
            terminal: self.terminal.as_ref(),
        };
        match tokio::time::timeout(self.deadline, next.run(request, ctx)).await {
            Ok(result) => result,
            Err(_) => {
                error!(
                    request_id = %ctx.request_id,
                    tenant_id = %ctx.tenant_id,
                    agent = %ctx.agent_name,
                    "pipeline_deadline_exceeded"
                );
                PipelineResult::failure("deadline_exceeded", "pipeline deadline exceeded")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTerminal;

    #[async_trait]
    impl Terminal for EchoTerminal {
        async fn execute(
            &self,
            request: &PipelineRequest,
            _ctx: &mut PipelineContext,
        ) -> PipelineResult {
            PipelineResult::ok(Value::String(request.prompt.clone()))
        }
    }

    struct ShortCircuit;

    #[async_trait]
    impl Middleware for ShortCircuit {
        fn name(&self) -> &'static str {
            "short_circuit"
        }

        async fn handle(
            &self,
            _request: &PipelineRequest,
            _ctx: &mut PipelineContext,
            _next: Next<'_>,
        ) -> PipelineResult {
            PipelineResult::failure("test", "stopped here")
        }
    }

    #[tokio::test]
    async fn empty_chain_reaches_terminal() {
        let pipeline = Pipeline::new(Vec::new(), Arc::new(EchoTerminal));
        let request = PipelineRequest::new("hello");
        let mut ctx = PipelineContext::new("t-1", "gap_fill_agent");
        let result = pipeline.process(&request, &mut ctx).await;
        assert!(result.success);
        assert_eq!(result.data, Some(Value::String("hello".into())));
    }

    #[tokio::test]
    async fn short_circuit_skips_terminal() {
        let pipeline = Pipeline::new(vec![Arc::new(ShortCircuit)], Arc::new(EchoTerminal));
        let request = PipelineRequest::new("hello");
        let mut ctx = PipelineContext::new("t-1", "gap_fill_agent");
        let result = pipeline.process(&request, &mut ctx).await;
        assert!(!result.success);
        assert_eq!(result.error_kind(), Some("test"));
    }

    #[tokio::test]
    async fn cancelled_context_stops_the_chain() {
        let pipeline = Pipeline::new(Vec::new(), Arc::new(EchoTerminal));
        let request = PipelineRequest::new("hello");
        let mut ctx = PipelineContext::new("t-1", "gap_fill_agent");
        ctx.cancel.cancel();
        let result = pipeline.process(&request, &mut ctx).await;
        assert!(!result.success);
        assert_eq!(result.message.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn deadline_produces_structured_failure() {
        struct Slow;

        #[async_trait]
        impl Terminal for Slow {
            async fn execute(
                &self,
                _request: &PipelineRequest,
                _ctx: &mut PipelineContext,
            ) -> PipelineResult {
                tokio::time::sleep(Duration::from_millis(200)).await;
                PipelineResult::ok(Value::Null)
            }
        }

        let pipeline = Pipeline::new(Vec::new(), Arc::new(Slow))
            .with_deadline(Duration::from_millis(20));
        let request = PipelineRequest::new("hello");
        let mut ctx = PipelineContext::new("t-1", "gap_fill_agent");
        let result = pipeline.process(&request, &mut ctx).await;
        assert!(!result.success);
        assert_eq!(result.error_kind(), Some("deadline_exceeded"));
    }
}
