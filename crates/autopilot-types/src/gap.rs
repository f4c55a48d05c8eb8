use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{new_id, Money};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapStatus {
    Open,
    Filled,
    Expired,
    Ignored,
}

impl GapStatus {
    pub fn is_terminal(self) -> bool {
        self != GapStatus::Open
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapPriority {
    Low,
    Medium,
    High,
    Critical,
}

impl GapPriority {
    pub fn from_duration(minutes: u32) -> Self {
        match minutes {
            0..=29 => GapPriority::Low,
            30..=59 => GapPriority::Medium,
            60..=119 => GapPriority::High,
            _ => GapPriority::Critical,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilledBy {
    pub booking_id: String,
    pub customer_id: String,
    pub filled_at: DateTime<Utc>,
}

/// An unscheduled interval in a staff member's day.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gap {
    pub id: String,
    pub tenant_id: String,
    pub staff_id: String,
    pub staff_name: String,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub duration_minutes: u32,
    pub priority: GapPriority,
    pub status: GapStatus,
    pub potential_revenue: Money,
    #[serde(default)]
    pub fittable_service_ids: Vec<String>,
    pub fill_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filled_by: Option<FilledBy>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Gap {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tenant_id: impl Into<String>,
        staff_id: impl Into<String>,
        staff_name: impl Into<String>,
        date: NaiveDate,
        start_time: NaiveTime,
        end_time: NaiveTime,
        potential_revenue: Money,
        fittable_service_ids: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        let duration_minutes = (end_time - start_time).num_minutes().max(0) as u32;
        Self {
            id: new_id(),
            tenant_id: tenant_id.into(),
            staff_id: staff_id.into(),
            staff_name: staff_name.into(),
            date,
            start_time,
            end_time,
            duration_minutes,
            priority: GapPriority::from_duration(duration_minutes),
            status: GapStatus::Open,
            potential_revenue,
            fittable_service_ids,
            fill_attempts: 0,
            last_attempt_at: None,
            filled_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn mark_filled(&mut self, booking_id: impl Into<String>, customer_id: impl Into<String>) {
        let now = Utc::now();
        self.status = GapStatus::Filled;
        self.filled_by = Some(FilledBy {
            booking_id: booking_id.into(),
            customer_id: customer_id.into(),
            filled_at: now,
        });
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gap(start: (u32, u32), end: (u32, u32)) -> Gap {
        Gap::new(
            "t-1",
            "s-1",
            "Priya",
            NaiveDate::from_ymd_opt(2026, 3, 14).unwrap(),
            NaiveTime::from_hms_opt(start.0, start.1, 0).unwrap(),
            NaiveTime::from_hms_opt(end.0, end.1, 0).unwrap(),
            Money::from_major(800),
            vec!["svc-1".into()],
        )
    }

    #[test]
    fn duration_is_derived_from_bounds() {
        let g = gap((14, 0), (15, 30));
        assert_eq!(g.duration_minutes, 90);
        assert_eq!(g.priority, GapPriority::High);
    }

    #[test]
    fn priority_buckets_match_duration() {
        assert_eq!(GapPriority::from_duration(20), GapPriority::Low);
        assert_eq!(GapPriority::from_duration(30), GapPriority::Medium);
        assert_eq!(GapPriority::from_duration(59), GapPriority::Medium);
        assert_eq!(GapPriority::from_duration(60), GapPriority::High);
        assert_eq!(GapPriority::from_duration(119), GapPriority::High);
        assert_eq!(GapPriority::from_duration(120), GapPriority::Critical);
    }

    #[test]
    fn filled_gap_records_the_booking() {
        let mut g = gap((14, 0), (15, 0));
        g.mark_filled("b123", "c-9");
        assert_eq!(g.status, GapStatus::Filled);
        let filled = g.filled_by.expect("filled_by set");
        assert_eq!(filled.booking_id, "b123");
        assert_eq!(filled.customer_id, "c-9");
    }
}
