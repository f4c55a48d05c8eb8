//! HTTP surface and composition root for the control plane.
//!
//! `AppState` wires interface-typed dependencies (gateway, messenger,
//! booking client, task queue) into every component explicitly, so tests
//! substitute any seam without global lookup.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use autopilot_cache::{HashEmbedder, MemorySemanticIndex, ResponseCache, SemanticIndex};
use autopilot_gateway::{LlmGateway, OpenRouterGateway};
use autopilot_guardrail::Guardrail;
use autopilot_orchestrator::{
    ApprovalService, BookingService, BroadcastPublisher, GapFillOrchestrator, HttpMessenger,
    MemoryTaskQueue, MessageProvider, OutreachService, TaskQueue, TaskScheduler,
};
use autopilot_pipeline::{AgentRegistry, ModelTiers, Pipeline};
use autopilot_runtime::AgentRuntime;
use autopilot_store::{MemoryStore, Store};
use autopilot_types::EngineConfig;

mod agents;
mod bookings;
mod http;

pub use agents::{ConciergeAgent, GapFillAgent};
pub use bookings::HttpBookingClient;
pub use http::{build_router, parse_reply, serve};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<EngineConfig>,
    pub store: Arc<dyn Store>,
    pub pipeline: Arc<Pipeline>,
    pub runtime: Arc<AgentRuntime>,
    pub approvals: Arc<ApprovalService>,
    pub outreach: Arc<OutreachService>,
    pub orchestrator: Arc<GapFillOrchestrator>,
    pub scheduler: Arc<TaskScheduler>,
    pub messenger: Arc<dyn MessageProvider>,
    pub publisher: Arc<BroadcastPublisher>,
}

impl AppState {
    /// Wire the full component graph from injected external seams.
    pub fn new(
        config: EngineConfig,
        gateway: Arc<dyn LlmGateway>,
        messenger: Arc<dyn MessageProvider>,
        bookings: Arc<dyn BookingService>,
        queue: Arc<dyn TaskQueue>,
    ) -> Self {
        let config = Arc::new(config);
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let guardrail = Arc::new(Guardrail::new());
        let cache = Arc::new(ResponseCache::new(config.cache_exact_ttl_s, 10_000));
        let semantic: Arc<dyn SemanticIndex> = Arc::new(MemorySemanticIndex::new(
            HashEmbedder,
            config.cache_semantic_threshold,
            config.cache_semantic_ttl_s,
        ));
        let publisher = Arc::new(BroadcastPublisher::new());

        let runtime = Arc::new(AgentRuntime::new(
            store.clone(),
            config.circuit_breaker_threshold,
            config.circuit_breaker_window_minutes,
        ));
        let approvals = Arc::new(ApprovalService::new(
            store.clone(),
            publisher.clone(),
            config.approval_expiry_by_priority.clone(),
        ));
        let outreach = Arc::new(OutreachService::new(
            store.clone(),
            publisher.clone(),
            config.outreach_cooldown_minutes,
            config.outreach_daily_cap,
            330,
        ));
        let scheduler = Arc::new(TaskScheduler::new(queue, runtime.clone(), store.clone()));
        let orchestrator = Arc::new(GapFillOrchestrator::new(
            store.clone(),
            runtime.clone(),
            outreach.clone(),
            approvals.clone(),
            scheduler.clone(),
            gateway.clone(),
            cache.clone(),
            guardrail.clone(),
            bookings,
            publisher.clone(),
            config.default_model.clone(),
            config.temperature,
        ));

        let mut registry = AgentRegistry::new();
        registry.register(Arc::new(ConciergeAgent::new(
            gateway.clone(),
            guardrail.clone(),
        )));
        registry.register(Arc::new(GapFillAgent::new(orchestrator.clone())));

        let tiers = ModelTiers {
            fast: config.fallback_model.clone(),
            standard: config.default_model.clone(),
            advanced: config.default_model.clone(),
        };
        let pipeline = Arc::new(Pipeline::standard(
            guardrail,
            cache,
            Some(semantic),
            registry,
            tiers,
            &config,
        ));

        Self {
            config,
            store,
            pipeline,
            runtime,
            approvals,
            outreach,
            orchestrator,
            scheduler,
            messenger,
            publisher,
        }
    }

    /// Production wiring from configuration alone.
    pub fn from_config(config: EngineConfig) -> Self {
        let gateway: Arc<dyn LlmGateway> = Arc::new(OpenRouterGateway::new(&config));
        let messenger: Arc<dyn MessageProvider> = Arc::new(HttpMessenger::new(
            config.messaging_base_url.clone(),
            config.messaging_auth_token.clone(),
            config.messaging_from_number.clone(),
        ));
        let bookings: Arc<dyn BookingService> =
            Arc::new(HttpBookingClient::new(config.booking_base_url.clone()));
        let queue: Arc<dyn TaskQueue> = Arc::new(MemoryTaskQueue::new());
        Self::new(config, gateway, messenger, bookings, queue)
    }

    /// Feature availability surfaced by `/health`. A missing secret marks
    /// the feature unavailable without failing startup.
    pub fn feature_availability(&self) -> HashMap<&'static str, bool> {
        let mut features = HashMap::new();
        features.insert("llm", self.config.llm_available());
        features.insert("messaging", self.config.messaging_available());
        features
    }
}

/// Bind and serve until the process is stopped.
pub async fn run(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    serve(addr, state).await
}
