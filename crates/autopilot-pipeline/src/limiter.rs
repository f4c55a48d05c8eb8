//! Token-bucket rate limiting per (tenant, agent).
//!
//! Sliding minute and hour windows over a monotonic clock. A shed request is
//! a typed rejection, never buffered, and never counted against the agent's
//! circuit breaker.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::warn;

use crate::{Middleware, Next, PipelineContext, PipelineRequest, PipelineResult};

/// Injectable monotonic clock so window math is testable without sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Test clock advanced by hand.
pub struct ManualClock {
    now: std::sync::Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: std::sync::Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, delta: Duration) {
        let mut guard = self.now.lock().expect("clock lock");
        *guard += delta;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().expect("clock lock")
    }
}

#[derive(Default)]
struct Windows {
    minute: VecDeque<Instant>,
    hour: VecDeque<Instant>,
}

pub struct RateLimitMiddleware {
    rpm: u32,
    rph: u32,
    clock: Arc<dyn Clock>,
    windows: Mutex<HashMap<(String, String), Windows>>,
}

impl RateLimitMiddleware {
    pub fn new(rpm: u32, rph: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            rpm,
            rph,
            clock,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Admit or shed. On admit the request is recorded in both windows.
    async fn try_admit(&self, tenant_id: &str, agent_name: &str) -> Result<(), u64> {
        let now = self.clock.now();
        let mut guard = self.windows.lock().await;
        let windows = guard
            .entry((tenant_id.to_string(), agent_name.to_string()))
            .or_default();

        prune(&mut windows.minute, now, Duration::from_secs(60));
        prune(&mut windows.hour, now, Duration::from_secs(3600));

        if windows.minute.len() >= self.rpm as usize {
            let retry_after = windows
                .minute
                .front()
                .map(|oldest| 60u64.saturating_sub(now.duration_since(*oldest).as_secs()))
                .unwrap_or(60);
            return Err(retry_after);
        }
        if windows.hour.len() >= self.rph as usize {
            let retry_after = windows
                .hour
                .front()
                .map(|oldest| 3600u64.saturating_sub(now.duration_since(*oldest).as_secs()))
                .unwrap_or(3600);
            return Err(retry_after);
        }

        windows.minute.push_back(now);
        windows.hour.push_back(now);
        Ok(())
    }
}

fn prune(window: &mut VecDeque<Instant>, now: Instant, span: Duration) {
    while let Some(front) = window.front() {
        if now.duration_since(*front) >= span {
            window.pop_front();
        } else {
            break;
        }
    }
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn handle(
        &self,
        request: &PipelineRequest,
        ctx: &mut PipelineContext,
        next: Next<'_>,
    ) -> PipelineResult {
        match self.try_admit(&ctx.tenant_id, &ctx.agent_name).await {
            Ok(()) => next.run(request, ctx).await,
            Err(retry_after_s) => {
                warn!(
                    tenant_id = %ctx.tenant_id,
                    agent = %ctx.agent_name,
                    retry_after_s,
                    "rate_limited"
                );
                let mut result = PipelineResult::failure("rate_limited", "rate_limited");
                result.metadata.insert(
                    "retry_after_s".to_string(),
                    serde_json::Value::from(retry_after_s),
                );
                result
            }
        }
    }
}
