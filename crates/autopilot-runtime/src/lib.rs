//! Per-(tenant, agent) runtime: pause flags, circuit breakers, action
//! counters, and hourly/daily action limits.
//!
//! Every mutation goes through the store's record-scoped conditional update,
//! so a counter bump and a status read are linearizable within the record.
//! The breaker trips open after `threshold` consecutive failures inside the
//! measurement window; after the cooldown it admits exactly one probe whose
//! outcome decides recovery.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use autopilot_observability::ControlPlaneEvent;
use autopilot_store::{AgentStateStore, StoreError, StoreResult};
use autopilot_types::{
    AgentError, AgentState, AgentStatus, BreakerState, CircuitBreaker, Money, RateWindow,
    tenant_today,
};

/// Which action budget to consult.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitWindow {
    Hourly,
    Daily,
}

#[derive(Debug, Clone)]
pub struct RateCheck {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct OperateCheck {
    pub allowed: bool,
    pub reason: Option<String>,
    pub cooldown_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct FailureOutcome {
    pub breaker: CircuitBreaker,
    /// True when this failure transitioned the breaker to open.
    pub tripped: bool,
}

pub struct AgentRuntime {
    store: Arc<dyn AgentStateStore>,
    threshold: u32,
    window: Duration,
}

impl AgentRuntime {
    pub fn new(store: Arc<dyn AgentStateStore>, threshold: u32, window_minutes: i64) -> Self {
        Self {
            store,
            threshold,
            window: Duration::minutes(window_minutes),
        }
    }

    /// Read-only gate: consults the pause flag and breaker state without
    /// consuming the half-open probe. Schedulers use this to skip runs.
    pub async fn can_operate(&self, tenant_id: &str, agent_name: &str) -> StoreResult<OperateCheck> {
        let Some(state) = self.store.get_agent_state(tenant_id, agent_name).await? else {
            return Ok(OperateCheck {
                allowed: true,
                reason: None,
                cooldown_until: None,
            });
        };
        Ok(evaluate_gate(&state, Utc::now()))
    }

    /// Mutating gate: admits the request, performing the open → half-open
    /// transition when the cooldown has passed and claiming the single probe
    /// slot. Denials return `CircuitOpen`.
    pub async fn begin_execution(
        &self,
        tenant_id: &str,
        agent_name: &str,
    ) -> Result<(), AgentError> {
        let agent = agent_name.to_string();
        let result = self
            .store
            .update_agent_state(
                tenant_id,
                agent_name,
                Box::new(move |state| {
                    state.reset_daily_if_stale(Utc::now());
                    let now = Utc::now();
                    let gate = evaluate_gate(state, now);
                    if !gate.allowed {
                        return Err(StoreError::Conflict(
                            gate.reason.unwrap_or_else(|| "not operable".to_string()),
                        ));
                    }
                    match state.circuit_breaker.state {
                        BreakerState::Open => {
                            // evaluate_gate only allows open past cooldown.
                            state.circuit_breaker.state = BreakerState::HalfOpen;
                            state.circuit_breaker.probe_in_flight = true;
                        }
                        BreakerState::HalfOpen => {
                            state.circuit_breaker.probe_in_flight = true;
                        }
                        BreakerState::Closed => {}
                    }
                    Ok(())
                }),
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(StoreError::Conflict(reason)) => {
                let state = self
                    .store
                    .get_agent_state(tenant_id, agent_name)
                    .await
                    .ok()
                    .flatten();
                ControlPlaneEvent::new("runtime", "agent_not_operable", tenant_id)
                    .agent(&agent)
                    .detail(&reason)
                    .emit_warn();
                Err(AgentError::CircuitOpen {
                    agent,
                    cooldown_until: state.and_then(|s| s.circuit_breaker.cooldown_until),
                })
            }
            Err(err) => Err(AgentError::Internal(err.to_string())),
        }
    }

    /// Check the hourly or daily action budget without consuming it.
    pub async fn check_rate_limit(
        &self,
        tenant_id: &str,
        agent_name: &str,
        window: LimitWindow,
    ) -> StoreResult<RateCheck> {
        let state = self
            .store
            .update_agent_state(
                tenant_id,
                agent_name,
                Box::new(|state| {
                    state.reset_daily_if_stale(Utc::now());
                    // Roll the hourly window on read so the count is current.
                    state.hourly_window.current_count(Utc::now());
                    Ok(())
                }),
            )
            .await?;
        let now = Utc::now();
        Ok(match window {
            LimitWindow::Hourly => {
                let limit = state.config.max_hourly_actions;
                let used = state.hourly_window.count;
                RateCheck {
                    allowed: used < limit,
                    remaining: limit.saturating_sub(used),
                    reset_at: RateWindow::start_of_hour(now) + Duration::hours(1),
                }
            }
            LimitWindow::Daily => {
                let limit = state.config.max_daily_actions;
                let used = state.counters.actions_taken;
                let local_today = tenant_today(state.config.utc_offset_minutes, now);
                let next_midnight_local = local_today
                    .succ_opt()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|naive| {
                        DateTime::from_naive_utc_and_offset(
                            naive - Duration::minutes(state.config.utc_offset_minutes as i64),
                            Utc,
                        )
                    })
                    .unwrap_or(now);
                RateCheck {
                    allowed: used < limit,
                    remaining: limit.saturating_sub(used),
                    reset_at: next_midnight_local,
                }
            }
        })
    }

    /// Atomically record an action: counters, per-type breakdown, hourly
    /// window, health, and probe resolution on success. A failed action
    /// updates health metrics only — breaker errors go through
    /// `record_failure`.
    pub async fn record_action(
        &self,
        tenant_id: &str,
        agent_name: &str,
        action_type: &str,
        success: bool,
        revenue: Option<Money>,
    ) -> StoreResult<AgentState> {
        let action_type = action_type.to_string();
        self.store
            .update_agent_state(
                tenant_id,
                agent_name,
                Box::new(move |state| {
                    let now = Utc::now();
                    state.reset_daily_if_stale(now);

                    state.counters.actions_taken += 1;
                    if success {
                        state.counters.actions_successful += 1;
                        if let Some(revenue) = revenue {
                            state.counters.revenue_generated =
                                state.counters.revenue_generated.saturating_add(revenue);
                        }
                    } else {
                        state.counters.actions_failed += 1;
                    }
                    let per_type = state.counters.by_type.entry(action_type).or_default();
                    per_type.taken += 1;
                    if success {
                        per_type.successful += 1;
                    }

                    state.hourly_window.current_count(now);
                    state.hourly_window.count += 1;

                    state.last_execution = Some(now);
                    state.health.last_heartbeat = Some(now);
                    state.health.success_rate_24h = if success {
                        state.health.success_rate_24h * 0.95 + 0.05
                    } else {
                        state.health.success_rate_24h * 0.95
                    };
                    if success {
                        state.health.consecutive_failures = 0;
                        resolve_success(state);
                    } else {
                        state.health.consecutive_failures += 1;
                    }
                    Ok(())
                }),
            )
            .await
    }

    /// Record a breaker error. Consecutive errors outside the measurement
    /// window restart the count; reaching the threshold (or failing the
    /// half-open probe) trips the breaker open with a doubled, capped
    /// cooldown.
    pub async fn record_failure(
        &self,
        tenant_id: &str,
        agent_name: &str,
        error: &str,
    ) -> StoreResult<FailureOutcome> {
        let error = error.to_string();
        let threshold = self.threshold;
        let window = self.window;
        let tripped_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = tripped_flag.clone();
        let state = self
            .store
            .update_agent_state(
                tenant_id,
                agent_name,
                Box::new(move |state| {
                    let now = Utc::now();
                    state.reset_daily_if_stale(now);

                    let breaker = &mut state.circuit_breaker;
                    let stale = breaker
                        .last_error_at
                        .map(|at| now - at >= window)
                        .unwrap_or(false);
                    if stale {
                        breaker.error_count = 0;
                    }
                    breaker.error_count += 1;
                    breaker.last_error = Some(error.clone());
                    breaker.last_error_at = Some(now);
                    state.health.consecutive_failures += 1;

                    let probe_failed =
                        breaker.state == BreakerState::HalfOpen && breaker.probe_in_flight;
                    let threshold_hit =
                        breaker.state == BreakerState::Closed && breaker.error_count >= threshold;

                    if probe_failed || threshold_hit {
                        breaker.trip_count += 1;
                        let cooldown =
                            CircuitBreaker::cooldown_minutes(breaker.trip_count);
                        breaker.state = BreakerState::Open;
                        breaker.probe_in_flight = false;
                        breaker.cooldown_until = Some(now + Duration::minutes(cooldown));
                        state.status = AgentStatus::CircuitBreaker;
                        flag.store(true, std::sync::atomic::Ordering::SeqCst);
                    }
                    Ok(())
                }),
            )
            .await?;

        let tripped = tripped_flag.load(std::sync::atomic::Ordering::SeqCst);
        if tripped {
            let cooldown = state
                .circuit_breaker
                .cooldown_until
                .map(|until| until.to_rfc3339())
                .unwrap_or_default();
            ControlPlaneEvent::new("runtime", "circuit_breaker_tripped", tenant_id)
                .agent(agent_name)
                .status("open")
                .detail(&cooldown)
                .emit_warn();
        }
        Ok(FailureOutcome {
            breaker: state.circuit_breaker.clone(),
            tripped,
        })
    }

    /// Idempotent daily counter reset; also invoked by the scheduled cleanup
    /// task.
    pub async fn reset_daily(&self, tenant_id: &str, agent_name: &str) -> StoreResult<bool> {
        let state = self
            .store
            .update_agent_state(
                tenant_id,
                agent_name,
                Box::new(|state| {
                    state.reset_daily_if_stale(Utc::now());
                    Ok(())
                }),
            )
            .await?;
        Ok(state.counters.actions_taken == 0)
    }

    pub async fn set_paused(
        &self,
        tenant_id: &str,
        agent_name: &str,
        paused: bool,
        reason: Option<String>,
    ) -> StoreResult<AgentState> {
        self.store
            .update_agent_state(
                tenant_id,
                agent_name,
                Box::new(move |state| {
                    state.status = if paused {
                        AgentStatus::Paused
                    } else {
                        AgentStatus::Active
                    };
                    state.status_reason = reason;
                    Ok(())
                }),
            )
            .await
    }
}

fn evaluate_gate(state: &AgentState, now: DateTime<Utc>) -> OperateCheck {
    if state.status == AgentStatus::Paused {
        return OperateCheck {
            allowed: false,
            reason: Some("agent paused".to_string()),
            cooldown_until: None,
        };
    }
    let breaker = &state.circuit_breaker;
    match breaker.state {
        BreakerState::Closed => OperateCheck {
            allowed: true,
            reason: None,
            cooldown_until: None,
        },
        BreakerState::Open => {
            let cooled = breaker.cooldown_until.map(|until| now >= until).unwrap_or(true);
            OperateCheck {
                allowed: cooled,
                reason: (!cooled).then(|| "circuit breaker open".to_string()),
                cooldown_until: breaker.cooldown_until,
            }
        }
        BreakerState::HalfOpen => OperateCheck {
            allowed: !breaker.probe_in_flight,
            reason: breaker
                .probe_in_flight
                .then(|| "probe in flight".to_string()),
            cooldown_until: breaker.cooldown_until,
        },
    }
}

/// A successful action closes a half-open breaker and clears consecutive
/// errors on a closed one.
fn resolve_success(state: &mut AgentState) {
    match state.circuit_breaker.state {
        BreakerState::HalfOpen => {
            ControlPlaneEvent::new("runtime", "circuit_breaker_recovered", &state.tenant_id)
                .agent(&state.agent_name)
                .status("closed")
                .emit();
            let breaker = &mut state.circuit_breaker;
            breaker.state = BreakerState::Closed;
            breaker.error_count = 0;
            breaker.probe_in_flight = false;
            breaker.cooldown_until = None;
            breaker.trip_count = 0;
            state.status = AgentStatus::Active;
        }
        BreakerState::Closed => {
            state.circuit_breaker.error_count = 0;
        }
        BreakerState::Open => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autopilot_store::MemoryStore;

    const TENANT: &str = "t-1";
    const AGENT: &str = "gap_fill_agent";

    fn runtime(store: Arc<MemoryStore>) -> AgentRuntime {
        AgentRuntime::new(store, 5, 10)
    }

    async fn force_cooldown_elapsed(store: &MemoryStore) {
        store
            .update_agent_state(
                TENANT,
                AGENT,
                Box::new(|state| {
                    state.circuit_breaker.cooldown_until =
                        Some(Utc::now() - Duration::seconds(1));
                    Ok(())
                }),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn five_failures_trip_the_breaker() {
        let store = Arc::new(MemoryStore::new());
        let runtime = runtime(store.clone());

        for i in 0..4 {
            let outcome = runtime
                .record_failure(TENANT, AGENT, "provider 500")
                .await
                .unwrap();
            assert!(!outcome.tripped, "failure {i} must not trip");
            assert_eq!(outcome.breaker.state, BreakerState::Closed);
        }

        let outcome = runtime
            .record_failure(TENANT, AGENT, "provider 500")
            .await
            .unwrap();
        assert!(outcome.tripped);
        assert_eq!(outcome.breaker.state, BreakerState::Open);
        assert!(outcome.breaker.cooldown_until.is_some());

        // Sixth call is short-circuited before any provider work.
        let err = runtime.begin_execution(TENANT, AGENT).await.unwrap_err();
        assert!(matches!(err, AgentError::CircuitOpen { .. }));
    }

    #[tokio::test]
    async fn cooldown_admits_exactly_one_probe() {
        let store = Arc::new(MemoryStore::new());
        let runtime = runtime(store.clone());
        for _ in 0..5 {
            runtime.record_failure(TENANT, AGENT, "boom").await.unwrap();
        }
        force_cooldown_elapsed(&store).await;

        // First caller claims the probe; the second is denied.
        runtime.begin_execution(TENANT, AGENT).await.unwrap();
        let err = runtime.begin_execution(TENANT, AGENT).await.unwrap_err();
        assert!(matches!(err, AgentError::CircuitOpen { .. }));
    }

    #[tokio::test]
    async fn probe_success_closes_the_breaker() {
        let store = Arc::new(MemoryStore::new());
        let runtime = runtime(store.clone());
        for _ in 0..5 {
            runtime.record_failure(TENANT, AGENT, "boom").await.unwrap();
        }
        force_cooldown_elapsed(&store).await;
        runtime.begin_execution(TENANT, AGENT).await.unwrap();

        let state = runtime
            .record_action(TENANT, AGENT, "gap_fill_outreach", true, None)
            .await
            .unwrap();
        assert_eq!(state.circuit_breaker.state, BreakerState::Closed);
        assert_eq!(state.circuit_breaker.error_count, 0);
        assert_eq!(state.status, AgentStatus::Active);

        runtime.begin_execution(TENANT, AGENT).await.unwrap();
    }

    #[tokio::test]
    async fn probe_failure_reopens_with_longer_cooldown() {
        let store = Arc::new(MemoryStore::new());
        let runtime = runtime(store.clone());
        for _ in 0..5 {
            runtime.record_failure(TENANT, AGENT, "boom").await.unwrap();
        }
        let first_trips = store
            .get_agent_state(TENANT, AGENT)
            .await
            .unwrap()
            .unwrap()
            .circuit_breaker
            .trip_count;
        force_cooldown_elapsed(&store).await;
        runtime.begin_execution(TENANT, AGENT).await.unwrap();

        let outcome = runtime
            .record_failure(TENANT, AGENT, "probe failed")
            .await
            .unwrap();
        assert!(outcome.tripped);
        assert_eq!(outcome.breaker.state, BreakerState::Open);
        assert_eq!(outcome.breaker.trip_count, first_trips + 1);
    }

    #[tokio::test]
    async fn stale_errors_restart_the_count() {
        let store = Arc::new(MemoryStore::new());
        let runtime = runtime(store.clone());
        for _ in 0..4 {
            runtime.record_failure(TENANT, AGENT, "boom").await.unwrap();
        }
        // Age the last error past the 10-minute window.
        store
            .update_agent_state(
                TENANT,
                AGENT,
                Box::new(|state| {
                    state.circuit_breaker.last_error_at =
                        Some(Utc::now() - Duration::minutes(11));
                    Ok(())
                }),
            )
            .await
            .unwrap();

        let outcome = runtime.record_failure(TENANT, AGENT, "boom").await.unwrap();
        assert!(!outcome.tripped);
        assert_eq!(outcome.breaker.error_count, 1);
    }

    #[tokio::test]
    async fn successful_action_bumps_counters_and_revenue() {
        let store = Arc::new(MemoryStore::new());
        let runtime = runtime(store.clone());
        let state = runtime
            .record_action(
                TENANT,
                AGENT,
                "gap_fill_success",
                true,
                Some(Money::from_major(800)),
            )
            .await
            .unwrap();
        assert_eq!(state.counters.actions_taken, 1);
        assert_eq!(state.counters.actions_successful, 1);
        assert_eq!(state.counters.revenue_generated, Money::from_major(800));
        assert_eq!(state.counters.by_type["gap_fill_success"].successful, 1);
    }

    #[tokio::test]
    async fn failed_action_does_not_touch_the_breaker() {
        let store = Arc::new(MemoryStore::new());
        let runtime = runtime(store.clone());
        let state = runtime
            .record_action(TENANT, AGENT, "gap_fill_outreach", false, None)
            .await
            .unwrap();
        assert_eq!(state.counters.actions_failed, 1);
        assert_eq!(state.circuit_breaker.error_count, 0);
        assert_eq!(state.circuit_breaker.state, BreakerState::Closed);
        assert_eq!(state.health.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn hourly_budget_counts_down_and_blocks() {
        let store = Arc::new(MemoryStore::new());
        let runtime = runtime(store.clone());
        store
            .update_agent_state(
                TENANT,
                AGENT,
                Box::new(|state| {
                    state.config.max_hourly_actions = 2;
                    Ok(())
                }),
            )
            .await
            .unwrap();

        let check = runtime
            .check_rate_limit(TENANT, AGENT, LimitWindow::Hourly)
            .await
            .unwrap();
        assert!(check.allowed);
        assert_eq!(check.remaining, 2);

        for _ in 0..2 {
            runtime
                .record_action(TENANT, AGENT, "gap_fill_outreach", true, None)
                .await
                .unwrap();
        }
        let check = runtime
            .check_rate_limit(TENANT, AGENT, LimitWindow::Hourly)
            .await
            .unwrap();
        assert!(!check.allowed);
        assert_eq!(check.remaining, 0);
    }

    #[tokio::test]
    async fn paused_agent_is_denied() {
        let store = Arc::new(MemoryStore::new());
        let runtime = runtime(store.clone());
        runtime
            .set_paused(TENANT, AGENT, true, Some("maintenance".into()))
            .await
            .unwrap();
        let check = runtime.can_operate(TENANT, AGENT).await.unwrap();
        assert!(!check.allowed);
        assert_eq!(check.reason.as_deref(), Some("agent paused"));
        assert!(runtime.begin_execution(TENANT, AGENT).await.is_err());
    }
}
