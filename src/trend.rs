use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{BehaviorRecord, RecordKind, RecordStatus};
use crate::scoring::days_before;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Up,
    Down,
    Stable,
}

impl TrendDirection {
    pub fn arrow(self) -> &'static str {
        match self {
            TrendDirection::Up => "up",
            TrendDirection::Down => "down",
            TrendDirection::Stable => "stable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trend {
    pub direction: TrendDirection,
    pub percentage: u64,
    /// Set when the prior period was zero and the percentage is the 100% convention.
    pub baseline_missing: bool,
}

fn normalize(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

pub fn compute_trend(current: f64, prior: f64) -> Trend {
    let current = normalize(current);
    let prior = normalize(prior);

    if current == prior {
        return Trend {
            direction: TrendDirection::Stable,
            percentage: 0,
            baseline_missing: false,
        };
    }

    let direction = if current > prior {
        TrendDirection::Up
    } else {
        TrendDirection::Down
    };

    if prior == 0.0 {
        return Trend {
            direction,
            percentage: 100,
            baseline_missing: true,
        };
    }

    let percentage = ((current - prior).abs() / prior.abs() * 100.0).round();
    Trend {
        direction,
        percentage: percentage as u64,
        baseline_missing: false,
    }
}

/// Records of `kind` in the half-open window `[start, end)`, skipping dismissed ones.
pub fn period_count(
    records: &[BehaviorRecord],
    kind: RecordKind,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> f64 {
    records
        .iter()
        .filter(|record| record.kind == kind && record.status != RecordStatus::Dismissed)
        .filter(|record| record.occurred_at >= start && record.occurred_at < end)
        .count() as f64
}

/// Compares the last `period_days` of `kind` against the `period_days` before that.
pub fn period_trend(
    records: &[BehaviorRecord],
    kind: RecordKind,
    now: DateTime<Utc>,
    period_days: i64,
) -> Trend {
    let period_days = period_days.max(1);
    let end = now.checked_add_signed(Duration::seconds(1)).unwrap_or(now);
    let start = days_before(end, period_days);
    let current = period_count(records, kind, start, end);
    let prior = period_count(records, kind, days_before(start, period_days), start);
    compute_trend(current, prior)
}

pub fn incident_trend(records: &[BehaviorRecord], now: DateTime<Utc>, period_days: i64) -> Trend {
    period_trend(records, RecordKind::Incident, now, period_days)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeeklyBucket {
    pub week_start: NaiveDate,
    pub incident_count: usize,
    pub merit_count: usize,
    pub avg_severity: f64,
    pub student_count: usize,
}

/// Groups records by ISO week (Monday start), oldest first.
pub fn weekly_buckets(records: &[BehaviorRecord], since: DateTime<Utc>) -> Vec<WeeklyBucket> {
    struct Acc {
        incidents: usize,
        merits: usize,
        severity_total: i64,
        students: HashSet<uuid::Uuid>,
    }

    let mut weeks: BTreeMap<NaiveDate, Acc> = BTreeMap::new();
    for record in records
        .iter()
        .filter(|record| record.occurred_at >= since && record.status != RecordStatus::Dismissed)
    {
        let day = record.occurred_at.date_naive();
        let week_start = day - Duration::days(day.weekday().num_days_from_monday() as i64);
        let acc = weeks.entry(week_start).or_insert_with(|| Acc {
            incidents: 0,
            merits: 0,
            severity_total: 0,
            students: HashSet::new(),
        });
        match record.kind {
            RecordKind::Incident => {
                acc.incidents += 1;
                acc.severity_total += record.severity.unwrap_or(1).clamp(1, 5) as i64;
            }
            RecordKind::Merit => acc.merits += 1,
        }
        acc.students.insert(record.student_id);
    }

    weeks
        .into_iter()
        .map(|(week_start, acc)| WeeklyBucket {
            week_start,
            incident_count: acc.incidents,
            merit_count: acc.merits,
            avg_severity: if acc.incidents == 0 {
                0.0
            } else {
                acc.severity_total as f64 / acc.incidents as f64
            },
            student_count: acc.students.len(),
        })
        .collect()
}
