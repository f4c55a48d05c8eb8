//! The fixed middleware stages: logging, guardrail, cache, model router.
//! (Rate limiting lives in `limiter`.)

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};

use autopilot_cache::{exact_key, ResponseCache, SemanticIndex};
use autopilot_guardrail::Guardrail;
use autopilot_observability::ControlPlaneEvent;

use crate::{Clock, Middleware, Next, PipelineContext, PipelineRequest, PipelineResult};

/// Assigns the request id and brackets the pass with structured events.
pub struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn handle(
        &self,
        request: &PipelineRequest,
        ctx: &mut PipelineContext,
        next: Next<'_>,
    ) -> PipelineResult {
        if ctx.request_id.is_empty() {
            ctx.request_id = uuid::Uuid::new_v4().to_string();
        }
        let started = Instant::now();
        ControlPlaneEvent::new("pipeline", "request_start", &ctx.tenant_id)
            .agent(&ctx.agent_name)
            .request(&ctx.request_id)
            .detail(&ctx.channel)
            .emit();

        let result = next.run(request, ctx).await;

        let end = ControlPlaneEvent::new("pipeline", "request_end", &ctx.tenant_id)
            .agent(&ctx.agent_name)
            .request(&ctx.request_id)
            .status(if result.success { "ok" } else { "failed" })
            .cached(result.cached)
            .elapsed_ms(started.elapsed().as_millis() as u64);
        match result.error_kind() {
            Some(kind) => end.detail(kind).emit_warn(),
            None => end.emit(),
        }
        result
    }
}

/// Rejects off-domain requests with a localized body before any LLM work.
pub struct GuardrailMiddleware {
    guardrail: Arc<Guardrail>,
}

impl GuardrailMiddleware {
    pub fn new(guardrail: Arc<Guardrail>) -> Self {
        Self { guardrail }
    }
}

#[async_trait]
impl Middleware for GuardrailMiddleware {
    fn name(&self) -> &'static str {
        "guardrail"
    }

    async fn handle(
        &self,
        request: &PipelineRequest,
        ctx: &mut PipelineContext,
        next: Next<'_>,
    ) -> PipelineResult {
        let validation = self.guardrail.validate(&request.prompt);
        if validation.is_accept() {
            return next.run(request, ctx).await;
        }

        let mut result = PipelineResult::failure(
            "guardrail_rejected",
            self.guardrail.rejection_for_query(&request.prompt),
        );
        result
            .metadata
            .insert("reason".to_string(), Value::String(validation.reason));
        result
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedPayload {
    data: Option<Value>,
    model_used: Option<String>,
    confidence: f32,
}

#[derive(Debug, Serialize, Deserialize)]
struct FailurePayload {
    kind: String,
    message: String,
}

/// Exact-then-semantic read-through cache around the rest of the chain.
/// Misses compute downstream under single-flight, so N concurrent misses on
/// one key reach the provider once.
pub struct CacheMiddleware {
    exact: Arc<ResponseCache>,
    semantic: Option<Arc<dyn SemanticIndex>>,
    default_model: String,
    temperature: f32,
}

impl CacheMiddleware {
    pub fn new(
        exact: Arc<ResponseCache>,
        semantic: Option<Arc<dyn SemanticIndex>>,
        default_model: impl Into<String>,
        temperature: f32,
    ) -> Self {
        Self {
            exact,
            semantic,
            default_model: default_model.into(),
            temperature,
        }
    }

    fn replayed(payload: CachedPayload, semantic: bool) -> PipelineResult {
        let mut result = PipelineResult {
            success: true,
            data: payload.data,
            message: None,
            cached: true,
            skip_remaining: true,
            confidence: payload.confidence,
            model_used: payload.model_used,
            metadata: HashMap::new(),
        };
        result
            .metadata
            .insert("replayed".to_string(), Value::Bool(true));
        if semantic {
            result
                .metadata
                .insert("semantic_hit".to_string(), Value::Bool(true));
        }
        result
    }
}

#[async_trait]
impl Middleware for CacheMiddleware {
    fn name(&self) -> &'static str {
        "cache"
    }

    async fn handle(
        &self,
        request: &PipelineRequest,
        ctx: &mut PipelineContext,
        next: Next<'_>,
    ) -> PipelineResult {
        let model = ctx.model.clone().unwrap_or_else(|| self.default_model.clone());
        let tenant_id = ctx.tenant_id.clone();
        let key = exact_key(&request.prompt, None, &model, self.temperature, &tenant_id);

        // Semantic layer: consulted only when the exact layer misses.
        if self.exact.get(&key).await.is_none() {
            if let Some(index) = &self.semantic {
                match index.lookup(&request.prompt, &model, &tenant_id).await {
                    Ok(Some(raw)) => {
                        if let Ok(payload) = serde_json::from_str::<CachedPayload>(&raw) {
                            info!(request_id = %ctx.request_id, "semantic_cache_hit");
                            return Self::replayed(payload, true);
                        }
                    }
                    Ok(None) => {}
                    Err(err) => warn!(error = %err, "semantic_lookup_failed"),
                }
            }
        }

        let outcome = self
            .exact
            .get_or_compute(&key, || async move {
                let result = next.run(request, ctx).await;
                if result.success {
                    let payload = CachedPayload {
                        data: result.data,
                        model_used: result.model_used,
                        confidence: result.confidence,
                    };
                    serde_json::to_string(&payload).map_err(|err| {
                        serde_json::to_string(&FailurePayload {
                            kind: "internal".to_string(),
                            message: err.to_string(),
                        })
                        .unwrap_or_default()
                    })
                } else {
                    Err(serde_json::to_string(&FailurePayload {
                        kind: result.error_kind().unwrap_or("internal").to_string(),
                        message: result.message.unwrap_or_default(),
                    })
                    .unwrap_or_default())
                }
            })
            .await;

        match outcome {
            Ok(cache_outcome) => {
                let Ok(payload) = serde_json::from_str::<CachedPayload>(&cache_outcome.value)
                else {
                    return PipelineResult::failure("internal", "corrupt cache payload");
                };

                if !cache_outcome.cached {
                    if let Some(index) = &self.semantic {
                        if let Err(err) = index
                            .store(&request.prompt, &model, &tenant_id, &cache_outcome.value)
                            .await
                        {
                            warn!(error = %err, "semantic_store_failed");
                        }
                    }
                    return PipelineResult {
                        success: true,
                        data: payload.data,
                        message: None,
                        cached: false,
                        skip_remaining: false,
                        confidence: payload.confidence,
                        model_used: payload.model_used,
                        metadata: HashMap::new(),
                    };
                }
                Self::replayed(payload, false)
            }
            Err(raw) => match serde_json::from_str::<FailurePayload>(&raw) {
                Ok(failure) => PipelineResult::failure(&failure.kind, failure.message),
                Err(_) => PipelineResult::failure("internal", raw),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelTiers {
    pub fast: String,
    pub standard: String,
    pub advanced: String,
}

/// Picks a model tier from request size, tenant plan, and recent failures.
/// Repeated provider failures in the last five minutes degrade the tenant to
/// the fast tier until the window clears.
pub struct ModelRouterMiddleware {
    tiers: ModelTiers,
    clock: Arc<dyn Clock>,
    failures: Mutex<HashMap<String, VecDeque<Instant>>>,
}

const FAILURE_WINDOW: Duration = Duration::from_secs(300);
const FAILURE_DEGRADE_THRESHOLD: usize = 3;

impl ModelRouterMiddleware {
    pub fn new(tiers: ModelTiers, clock: Arc<dyn Clock>) -> Self {
        Self {
            tiers,
            clock,
            failures: Mutex::new(HashMap::new()),
        }
    }

    async fn recent_failures(&self, tenant_id: &str) -> usize {
        let now = self.clock.now();
        let mut guard = self.failures.lock().await;
        let Some(window) = guard.get_mut(tenant_id) else {
            return 0;
        };
        while let Some(front) = window.front() {
            if now.duration_since(*front) >= FAILURE_WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }
        window.len()
    }

    async fn record_failure(&self, tenant_id: &str) {
        let now = self.clock.now();
        self.failures
            .lock()
            .await
            .entry(tenant_id.to_string())
            .or_default()
            .push_back(now);
    }

    fn select(&self, request: &PipelineRequest, ctx: &PipelineContext, degraded: bool) -> String {
        if degraded {
            return self.tiers.fast.clone();
        }
        let plan = ctx
            .metadata
            .get("plan")
            .and_then(|v| v.as_str())
            .unwrap_or("standard");
        if plan == "premium" || request.prompt.len() > 2000 {
            return self.tiers.advanced.clone();
        }
        if request.prompt.len() < 200 {
            return self.tiers.fast.clone();
        }
        self.tiers.standard.clone()
    }
}

#[async_trait]
impl Middleware for ModelRouterMiddleware {
    fn name(&self) -> &'static str {
        "model_router"
    }

    async fn handle(
        &self,
        request: &PipelineRequest,
        ctx: &mut PipelineContext,
        next: Next<'_>,
    ) -> PipelineResult {
        if ctx.model.is_none() {
            let degraded =
                self.recent_failures(&ctx.tenant_id).await >= FAILURE_DEGRADE_THRESHOLD;
            let model = self.select(request, ctx, degraded);
            info!(request_id = %ctx.request_id, model = %model, degraded, "model_routed");
            ctx.model = Some(model);
        }

        let result = next.run(request, ctx).await;

        if !result.success
            && matches!(
                result.error_kind(),
                Some("provider_unavailable") | Some("provider_rate_limited")
            )
        {
            self.record_failure(&ctx.tenant_id).await;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ManualClock, Pipeline, Terminal};
    use autopilot_types::AgentError;

    struct CountingTerminal {
        calls: std::sync::atomic::AtomicUsize,
        fail_with: Option<AgentError>,
    }

    impl CountingTerminal {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                calls: std::sync::atomic::AtomicUsize::new(0),
                fail_with: None,
            })
        }

        fn failing(err: AgentError) -> Arc<Self> {
            Arc::new(Self {
                calls: std::sync::atomic::AtomicUsize::new(0),
                fail_with: Some(err),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Terminal for CountingTerminal {
        async fn execute(
            &self,
            request: &PipelineRequest,
            ctx: &mut PipelineContext,
        ) -> PipelineResult {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if let Some(err) = &self.fail_with {
                return PipelineResult::from_error(err);
            }
            let mut result =
                PipelineResult::ok(Value::String(format!("answer: {}", request.prompt)));
            result.model_used = ctx.model.clone();
            result
        }
    }

    fn ctx() -> PipelineContext {
        PipelineContext::new("t-1", "concierge")
    }

    #[tokio::test]
    async fn guardrail_rejection_short_circuits_without_llm_call() {
        let terminal = CountingTerminal::ok();
        let guardrail = Arc::new(Guardrail::new());
        let pipeline = Pipeline::new(
            vec![
                Arc::new(LoggingMiddleware),
                Arc::new(GuardrailMiddleware::new(guardrail.clone())),
            ],
            terminal.clone(),
        );

        let request = PipelineRequest::new("who won the ipl match");
        let mut context = ctx();
        let result = pipeline.process(&request, &mut context).await;

        assert!(!result.success);
        assert!(!result.cached);
        assert_eq!(result.error_kind(), Some("guardrail_rejected"));
        assert_eq!(
            result.message.as_deref(),
            Some(guardrail.rejection_response("en").as_str())
        );
        assert_eq!(terminal.calls(), 0, "no downstream call on rejection");
    }

    #[tokio::test]
    async fn cache_replays_second_identical_request() {
        let terminal = CountingTerminal::ok();
        let cache = Arc::new(ResponseCache::new(3600, 100));
        let pipeline = Pipeline::new(
            vec![Arc::new(CacheMiddleware::new(
                cache,
                None,
                "m-standard",
                0.7,
            ))],
            terminal.clone(),
        );

        let request = PipelineRequest::new("recommend a treatment for dry hair");
        let mut first_ctx = ctx();
        let first = pipeline.process(&request, &mut first_ctx).await;
        assert!(first.success);
        assert!(!first.cached);

        let mut second_ctx = ctx();
        let second = pipeline.process(&request, &mut second_ctx).await;
        assert!(second.success);
        assert!(second.cached);
        assert_eq!(first.data, second.data);
        assert_eq!(terminal.calls(), 1);
    }

    #[tokio::test]
    async fn cache_keys_are_tenant_scoped() {
        let terminal = CountingTerminal::ok();
        let cache = Arc::new(ResponseCache::new(3600, 100));
        let pipeline = Pipeline::new(
            vec![Arc::new(CacheMiddleware::new(
                cache,
                None,
                "m-standard",
                0.7,
            ))],
            terminal.clone(),
        );

        let request = PipelineRequest::new("recommend a treatment for dry hair");
        let mut ctx_a = PipelineContext::new("t-1", "concierge");
        let mut ctx_b = PipelineContext::new("t-2", "concierge");
        pipeline.process(&request, &mut ctx_a).await;
        pipeline.process(&request, &mut ctx_b).await;
        assert_eq!(terminal.calls(), 2, "tenants never share cache entries");
    }

    #[tokio::test]
    async fn downstream_failures_are_not_cached() {
        let terminal = CountingTerminal::failing(AgentError::ProviderUnavailable("503".into()));
        let cache = Arc::new(ResponseCache::new(3600, 100));
        let pipeline = Pipeline::new(
            vec![Arc::new(CacheMiddleware::new(
                cache,
                None,
                "m-standard",
                0.7,
            ))],
            terminal.clone(),
        );

        let request = PipelineRequest::new("recommend a treatment for dry hair");
        let mut first_ctx = ctx();
        let first = pipeline.process(&request, &mut first_ctx).await;
        assert!(!first.success);
        assert_eq!(first.error_kind(), Some("provider_unavailable"));

        let mut second_ctx = ctx();
        pipeline.process(&request, &mut second_ctx).await;
        assert_eq!(terminal.calls(), 2, "failures recompute");
    }

    #[tokio::test]
    async fn router_sets_model_by_prompt_size() {
        let clock = Arc::new(ManualClock::new());
        let terminal = CountingTerminal::ok();
        let tiers = ModelTiers {
            fast: "m-fast".into(),
            standard: "m-standard".into(),
            advanced: "m-advanced".into(),
        };
        let pipeline = Pipeline::new(
            vec![Arc::new(ModelRouterMiddleware::new(tiers, clock))],
            terminal,
        );

        let mut short_ctx = ctx();
        let short = pipeline
            .process(&PipelineRequest::new("hi there"), &mut short_ctx)
            .await;
        assert_eq!(short.model_used.as_deref(), Some("m-fast"));

        let mut medium_ctx = ctx();
        let medium = pipeline
            .process(&PipelineRequest::new("x".repeat(500)), &mut medium_ctx)
            .await;
        assert_eq!(medium.model_used.as_deref(), Some("m-standard"));

        let mut long_ctx = ctx();
        let long = pipeline
            .process(&PipelineRequest::new("x".repeat(3000)), &mut long_ctx)
            .await;
        assert_eq!(long.model_used.as_deref(), Some("m-advanced"));
    }

    #[tokio::test]
    async fn router_degrades_after_recent_failures() {
        let clock = Arc::new(ManualClock::new());
        let tiers = ModelTiers {
            fast: "m-fast".into(),
            standard: "m-standard".into(),
            advanced: "m-advanced".into(),
        };
        let router = Arc::new(ModelRouterMiddleware::new(tiers, clock.clone()));

        let failing = CountingTerminal::failing(AgentError::ProviderUnavailable("503".into()));
        let pipeline = Pipeline::new(vec![router.clone()], failing);
        for _ in 0..3 {
            let mut c = ctx();
            pipeline
                .process(&PipelineRequest::new("x".repeat(500)), &mut c)
                .await;
        }

        let ok = CountingTerminal::ok();
        let pipeline = Pipeline::new(vec![router], ok);
        let mut c = ctx();
        let result = pipeline
            .process(&PipelineRequest::new("x".repeat(500)), &mut c)
            .await;
        assert_eq!(result.model_used.as_deref(), Some("m-fast"));
    }

    #[tokio::test]
    async fn pinned_model_bypasses_routing() {
        let clock = Arc::new(ManualClock::new());
        let terminal = CountingTerminal::ok();
        let tiers = ModelTiers {
            fast: "m-fast".into(),
            standard: "m-standard".into(),
            advanced: "m-advanced".into(),
        };
        let pipeline = Pipeline::new(
            vec![Arc::new(ModelRouterMiddleware::new(tiers, clock))],
            terminal,
        );

        let mut context = ctx();
        context.model = Some("m-pinned".into());
        let result = pipeline
            .process(&PipelineRequest::new("x".repeat(500)), &mut context)
            .await;
        assert_eq!(result.model_used.as_deref(), Some("m-pinned"));
    }
}
