//! Deferred work, wrapped around an external task queue.
//!
//! Task names are deterministic functions of their key inputs so duplicate
//! enqueues collapse at the queue layer. Agent runs are skipped when the
//! agent is paused, its breaker is open, or its minimum interval has not
//! elapsed.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{info, warn};

use autopilot_runtime::AgentRuntime;
use autopilot_store::AgentStateStore;
use autopilot_types::AgentStatus;

pub const QUEUE_AUTONOMOUS: &str = "autonomous-agents";
pub const QUEUE_NOTIFICATIONS: &str = "notifications";
pub const QUEUE_CLEANUP: &str = "cleanup";

#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    /// The queue reports saturation; callers defer with backoff.
    #[error("task queue saturated")]
    Saturated,
    #[error("queue error: {0}")]
    Other(String),
}

#[derive(Debug, Clone)]
pub struct QueueTask {
    pub queue: String,
    pub name: String,
    pub handler_path: String,
    pub payload: Value,
    pub schedule_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Returns the task name. Enqueuing a name that already exists is a
    /// no-op returning the existing name.
    async fn enqueue(&self, task: QueueTask) -> Result<String, QueueError>;
}

/// In-process queue used by tests and single-node deployments. Dedupes by
/// task name like the external queue does.
#[derive(Default)]
pub struct MemoryTaskQueue {
    tasks: Mutex<Vec<QueueTask>>,
    saturated: std::sync::atomic::AtomicBool,
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_saturated(&self, saturated: bool) {
        self.saturated
            .store(saturated, std::sync::atomic::Ordering::SeqCst);
    }

    pub async fn drain(&self) -> Vec<QueueTask> {
        std::mem::take(&mut *self.tasks.lock().await)
    }

    pub async fn len(&self) -> usize {
        self.tasks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.lock().await.is_empty()
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn enqueue(&self, task: QueueTask) -> Result<String, QueueError> {
        if self.saturated.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(QueueError::Saturated);
        }
        let mut guard = self.tasks.lock().await;
        if let Some(existing) = guard.iter().find(|t| t.name == task.name) {
            return Ok(existing.name.clone());
        }
        let name = task.name.clone();
        guard.push(task);
        Ok(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupKind {
    ExpiredApprovals,
    ExpiredOutreach,
    ExpiredGaps,
}

impl CleanupKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CleanupKind::ExpiredApprovals => "expired_approvals",
            CleanupKind::ExpiredOutreach => "expired_outreach",
            CleanupKind::ExpiredGaps => "expired_gaps",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "expired_approvals" => Some(Self::ExpiredApprovals),
            "expired_outreach" => Some(Self::ExpiredOutreach),
            "expired_gaps" => Some(Self::ExpiredGaps),
            _ => None,
        }
    }
}

pub struct TaskScheduler {
    queue: Arc<dyn TaskQueue>,
    runtime: Arc<AgentRuntime>,
    store: Arc<dyn AgentStateStore>,
    min_intervals: HashMap<&'static str, Duration>,
}

impl TaskScheduler {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        runtime: Arc<AgentRuntime>,
        store: Arc<dyn AgentStateStore>,
    ) -> Self {
        let mut min_intervals = HashMap::new();
        min_intervals.insert("gap_fill_agent", Duration::minutes(5));
        min_intervals.insert("waitlist_agent", Duration::minutes(5));
        min_intervals.insert("no_show_prevention_agent", Duration::minutes(10));
        min_intervals.insert("retention_agent", Duration::minutes(60));
        Self {
            queue,
            runtime,
            store,
            min_intervals,
        }
    }

    pub async fn enqueue(
        &self,
        queue: &str,
        name: String,
        handler_path: &str,
        payload: Value,
        schedule_at: Option<DateTime<Utc>>,
    ) -> Result<String, QueueError> {
        self.queue
            .enqueue(QueueTask {
                queue: queue.to_string(),
                name,
                handler_path: handler_path.to_string(),
                payload,
                schedule_at,
            })
            .await
    }

    /// Schedule an agent run. Returns `Ok(None)` when the run is skipped —
    /// paused agent, open breaker, or minimum interval not yet elapsed.
    pub async fn schedule_agent_run(
        &self,
        tenant_id: &str,
        agent_name: &str,
        action: &str,
        data: Value,
        delay: Option<Duration>,
    ) -> Result<Option<String>, QueueError> {
        if let Ok(Some(state)) = self.store.get_agent_state(tenant_id, agent_name).await {
            if state.status == AgentStatus::Paused {
                info!(tenant_id, agent = agent_name, "agent_skipped_paused");
                return Ok(None);
            }
            match self.runtime.can_operate(tenant_id, agent_name).await {
                Ok(check) if !check.allowed => {
                    warn!(
                        tenant_id,
                        agent = agent_name,
                        reason = check.reason.as_deref().unwrap_or(""),
                        "agent_skipped_circuit_breaker"
                    );
                    return Ok(None);
                }
                Err(err) => return Err(QueueError::Other(err.to_string())),
                _ => {}
            }
            if let (Some(interval), Some(last)) = (
                self.min_intervals.get(agent_name),
                state.last_execution,
            ) {
                if Utc::now() < last + *interval {
                    info!(tenant_id, agent = agent_name, "agent_skipped_min_interval");
                    return Ok(None);
                }
            }
        }

        let data_key = data
            .get("gap_id")
            .or_else(|| data.get("booking_id"))
            .or_else(|| data.get("waitlist_id"))
            .or_else(|| data.get("customer_id"))
            .and_then(|v| v.as_str())
            .map(|v| format!("-{v}"))
            .unwrap_or_default();
        let name = format!("{agent_name}-{tenant_id}-{action}{data_key}");
        let schedule_at = delay.map(|d| Utc::now() + d);

        let task_name = self
            .enqueue(
                QUEUE_AUTONOMOUS,
                name,
                "/internal/tasks/execute",
                json!({
                    "tenant_id": tenant_id,
                    "agent_name": agent_name,
                    "action": action,
                    "data": data,
                }),
                schedule_at,
            )
            .await?;
        Ok(Some(task_name))
    }

    /// Enqueue a periodic tick for every known agent. Per-agent skip rules
    /// (pause, breaker, minimum interval) apply as usual.
    pub async fn schedule_periodic_agents(
        &self,
        tenant_id: &str,
    ) -> Result<Vec<String>, QueueError> {
        let mut scheduled = Vec::new();
        let agents: Vec<&'static str> = self.min_intervals.keys().copied().collect();
        for agent_name in agents {
            if let Some(task) = self
                .schedule_agent_run(tenant_id, agent_name, "periodic_check", json!({}), None)
                .await?
            {
                scheduled.push(task);
            }
        }
        scheduled.sort();
        Ok(scheduled)
    }

    pub async fn schedule_outreach_send(
        &self,
        tenant_id: &str,
        outreach_id: &str,
        channel: &str,
        delay: Option<Duration>,
    ) -> Result<String, QueueError> {
        self.enqueue(
            QUEUE_NOTIFICATIONS,
            format!("notify-{outreach_id}"),
            "/internal/tasks/send-notification",
            json!({
                "tenant_id": tenant_id,
                "outreach_id": outreach_id,
                "channel": channel,
            }),
            delay.map(|d| Utc::now() + d),
        )
        .await
    }

    pub async fn schedule_cleanup(
        &self,
        kind: CleanupKind,
        tenant_id: Option<&str>,
    ) -> Result<String, QueueError> {
        let scope = tenant_id.unwrap_or("all");
        self.enqueue(
            QUEUE_CLEANUP,
            format!("cleanup-{}-{scope}", kind.as_str()),
            "/internal/tasks/cleanup",
            json!({
                "task_type": kind.as_str(),
                "data": tenant_id.map(|t| json!({"tenant_id": t})).unwrap_or(json!({})),
            }),
            None,
        )
        .await
    }
}
