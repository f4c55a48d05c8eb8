use std::collections::HashMap;

use chrono::{DateTime, FixedOffset, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{new_id, Money};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Paused,
    Error,
    CircuitBreaker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-agent circuit breaker.
///
/// `trip_count` drives the cooldown doubling on repeated half-open failures;
/// `probe_in_flight` guarantees at most one probe is admitted per half-open
/// window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreaker {
    pub state: BreakerState,
    pub error_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub probe_in_flight: bool,
    #[serde(default)]
    pub trip_count: u32,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            error_count: 0,
            last_error: None,
            last_error_at: None,
            cooldown_until: None,
            probe_in_flight: false,
            trip_count: 0,
        }
    }
}

impl CircuitBreaker {
    /// Cooldown for the n-th trip: min(2^n, 30) minutes.
    pub fn cooldown_minutes(trip_count: u32) -> i64 {
        let exp = 2i64.saturating_pow(trip_count.min(5));
        exp.min(30)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub max_hourly_actions: u32,
    pub max_daily_actions: u32,
    pub cooldown_minutes: u32,
    /// Tenant-local offset for the counters date stamp. Salons on the
    /// platform are Indian businesses, hence IST by default.
    pub utc_offset_minutes: i32,
    #[serde(default)]
    pub custom: Value,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_hourly_actions: 10,
            max_daily_actions: 100,
            cooldown_minutes: 60,
            utc_offset_minutes: 330,
            custom: Value::Null,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TypeCounter {
    pub taken: u32,
    pub successful: u32,
}

/// Daily action counters, stamped with the tenant-local date they cover.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCounters {
    pub date: NaiveDate,
    pub actions_taken: u32,
    pub actions_successful: u32,
    pub actions_failed: u32,
    pub revenue_generated: Money,
    #[serde(default)]
    pub by_type: HashMap<String, TypeCounter>,
}

impl AgentCounters {
    pub fn fresh(date: NaiveDate) -> Self {
        Self {
            date,
            actions_taken: 0,
            actions_successful: 0,
            actions_failed: 0,
            revenue_generated: Money::ZERO,
            by_type: HashMap::new(),
        }
    }
}

/// Calendar-window action count (hourly limits).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateWindow {
    pub window_start: DateTime<Utc>,
    pub count: u32,
}

impl RateWindow {
    pub fn start_of_hour(now: DateTime<Utc>) -> DateTime<Utc> {
        now.date_naive()
            .and_hms_opt(now.time().hour(), 0, 0)
            .map(|naive| DateTime::from_naive_utc_and_offset(naive, Utc))
            .unwrap_or(now)
    }

    pub fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            window_start: Self::start_of_hour(now),
            count: 0,
        }
    }

    /// Count within the current hour; rolls the window on read.
    pub fn current_count(&mut self, now: DateTime<Utc>) -> u32 {
        let start = Self::start_of_hour(now);
        if self.window_start != start {
            self.window_start = start;
            self.count = 0;
        }
        self.count
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentHealth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub success_rate_24h: f64,
    pub avg_latency_ms: f64,
}

/// One record per (tenant, agent). Counter bumps and status reads are
/// linearized by the store's record-scoped update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub id: String,
    pub tenant_id: String,
    pub agent_name: String,
    pub status: AgentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_execution: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_scheduled: Option<DateTime<Utc>>,
    pub circuit_breaker: CircuitBreaker,
    pub config: AgentConfig,
    pub counters: AgentCounters,
    pub hourly_window: RateWindow,
    pub health: AgentHealth,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentState {
    pub fn new(tenant_id: impl Into<String>, agent_name: impl Into<String>) -> Self {
        let now = Utc::now();
        let config = AgentConfig::default();
        let today = tenant_today(config.utc_offset_minutes, now);
        Self {
            id: new_id(),
            tenant_id: tenant_id.into(),
            agent_name: agent_name.into(),
            status: AgentStatus::Active,
            status_reason: None,
            last_execution: None,
            next_scheduled: None,
            circuit_breaker: CircuitBreaker::default(),
            config,
            counters: AgentCounters::fresh(today),
            hourly_window: RateWindow::fresh(now),
            health: AgentHealth {
                success_rate_24h: 1.0,
                ..AgentHealth::default()
            },
            created_at: now,
            updated_at: now,
        }
    }

    /// Roll the counters forward if the stored date stamp has drifted from
    /// today (tenant-local). Idempotent.
    pub fn reset_daily_if_stale(&mut self, now: DateTime<Utc>) -> bool {
        let today = tenant_today(self.config.utc_offset_minutes, now);
        if self.counters.date != today {
            self.counters = AgentCounters::fresh(today);
            true
        } else {
            false
        }
    }
}

/// Today's date in the tenant's local timezone.
pub fn tenant_today(utc_offset_minutes: i32, now: DateTime<Utc>) -> NaiveDate {
    let offset = FixedOffset::east_opt(utc_offset_minutes * 60)
        .unwrap_or_else(|| FixedOffset::east_opt(0).unwrap());
    now.with_timezone(&offset).date_naive()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn cooldown_doubles_and_caps_at_thirty() {
        assert_eq!(CircuitBreaker::cooldown_minutes(1), 2);
        assert_eq!(CircuitBreaker::cooldown_minutes(2), 4);
        assert_eq!(CircuitBreaker::cooldown_minutes(4), 16);
        assert_eq!(CircuitBreaker::cooldown_minutes(5), 30);
        assert_eq!(CircuitBreaker::cooldown_minutes(12), 30);
    }

    #[test]
    fn daily_reset_is_idempotent() {
        let mut state = AgentState::new("t-1", "gap_fill_agent");
        state.counters.actions_taken = 7;
        state.counters.date = state.counters.date - Duration::days(1);
        assert!(state.reset_daily_if_stale(Utc::now()));
        assert_eq!(state.counters.actions_taken, 0);
        assert!(!state.reset_daily_if_stale(Utc::now()));
    }

    #[test]
    fn tenant_today_respects_offset() {
        // 20:00 UTC on Jan 1 is already Jan 2 in IST (+05:30).
        let now = DateTime::parse_from_rfc3339("2026-01-01T20:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let ist = tenant_today(330, now);
        let utc = tenant_today(0, now);
        assert_eq!(ist, NaiveDate::from_ymd_opt(2026, 1, 2).unwrap());
        assert_eq!(utc, NaiveDate::from_ymd_opt(2026, 1, 1).unwrap());
    }
}
