use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::classify::{classify, RiskTier};
use crate::config::ScoringConfig;
use crate::models::{BehaviorRecord, RecordStatus, RiskAssessment, Student};

pub const DISPLAY_MAX: f64 = 10.0;

pub fn recency_weight(days_ago: i64) -> f64 {
    match days_ago {
        i64::MIN..=7 => 1.0,
        8..=30 => 0.7,
        31..=60 => 0.4,
        _ => 0.2,
    }
}

/// `at` moved back by `days`, saturating at the earliest representable instant.
pub fn days_before(at: DateTime<Utc>, days: i64) -> DateTime<Utc> {
    Duration::try_days(days)
        .and_then(|span| at.checked_sub_signed(span))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub fn cutoff(as_of: DateTime<Utc>, days: i64) -> DateTime<Utc> {
    days_before(as_of, days.max(1))
}

fn counts(record: &BehaviorRecord, as_of: DateTime<Utc>) -> bool {
    record.status != RecordStatus::Dismissed && record.occurred_at <= as_of
}

/// An incident that contributes to the score at `as_of`.
pub fn counted_incident(record: &BehaviorRecord, as_of: DateTime<Utc>) -> bool {
    record.is_incident() && counts(record, as_of)
}

fn severity(record: &BehaviorRecord) -> f64 {
    record.severity.unwrap_or(1).clamp(1, 5) as f64
}

fn merit_points(record: &BehaviorRecord) -> f64 {
    let points = record
        .points
        .or_else(|| record.merit_tier.map(|tier| tier.points()))
        .unwrap_or(0.0);
    if points.is_finite() {
        points.max(0.0)
    } else {
        0.0
    }
}

/// Incidents counted at `as_of`, in chronological order with ties broken by id.
fn ordered_incidents(records: &[BehaviorRecord], as_of: DateTime<Utc>) -> Vec<&BehaviorRecord> {
    let mut incidents: Vec<&BehaviorRecord> = records
        .iter()
        .filter(|record| counted_incident(record, as_of))
        .collect();
    incidents.sort_by(|a, b| a.occurred_at.cmp(&b.occurred_at).then(a.id.cmp(&b.id)));
    incidents
}

/// Incidents in the trailing window `(as_of - days, as_of]`.
pub fn incidents_within(records: &[BehaviorRecord], as_of: DateTime<Utc>, days: i64) -> usize {
    let start = days_before(as_of, days.max(0));
    records
        .iter()
        .filter(|record| counted_incident(record, as_of))
        .filter(|record| record.occurred_at > start)
        .count()
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ScoreBreakdown {
    pub incident_total: f64,
    pub merit_total: f64,
    pub burst: bool,
    pub score: f64,
}

pub fn score_breakdown(
    records: &[BehaviorRecord],
    as_of: DateTime<Utc>,
    config: &ScoringConfig,
) -> ScoreBreakdown {
    let mut occurrences: HashMap<String, u32> = HashMap::new();
    let mut incident_total = 0.0;

    for record in ordered_incidents(records, as_of) {
        let seen = occurrences.entry(record.offense_key()).or_insert(0);
        let exponent = (*seen).min(config.max_repeat_exponent);
        *seen += 1;

        let days_ago = (as_of - record.occurred_at).num_days();
        let repeat = config.repeat_factor.max(1.0).powi(exponent as i32);
        incident_total +=
            severity(record) * config.severity_weight.max(0.0) * recency_weight(days_ago) * repeat;
    }

    let burst = incidents_within(records, as_of, config.burst_window_days)
        >= config.burst_threshold.max(1);
    if burst {
        incident_total *= config.burst_multiplier.max(1.0);
    }

    let merit_total: f64 = records
        .iter()
        .filter(|record| record.is_merit() && counts(record, as_of))
        .map(|record| {
            let days_ago = (as_of - record.occurred_at).num_days();
            merit_points(record) * config.merit_weight.max(0.0) * recency_weight(days_ago)
        })
        .sum();

    let score = (incident_total - merit_total).max(0.0);
    ScoreBreakdown {
        incident_total,
        merit_total,
        burst,
        score: if score.is_finite() { score } else { 0.0 },
    }
}

pub fn compute_heat_score_with(
    records: &[BehaviorRecord],
    as_of: DateTime<Utc>,
    config: &ScoringConfig,
) -> f64 {
    score_breakdown(records, as_of, config).score
}

pub fn compute_heat_score(records: &[BehaviorRecord], as_of: DateTime<Utc>) -> f64 {
    compute_heat_score_with(records, as_of, &ScoringConfig::default())
}

pub fn display_score(score: f64) -> f64 {
    if score.is_nan() {
        return 0.0;
    }
    score.clamp(0.0, DISPLAY_MAX)
}

pub fn needs_counseling(student: &Student, score: f64) -> bool {
    student.counseling_manual || classify(score) >= RiskTier::Warning
}

/// Ordinal for a new incident of `misdemeanor_id`: prior matching incidents plus one.
pub fn offense_ordinal(history: &[BehaviorRecord], student_id: Uuid, misdemeanor_id: Uuid) -> u32 {
    let prior = history
        .iter()
        .filter(|record| record.is_incident())
        .filter(|record| record.student_id == student_id)
        .filter(|record| record.misdemeanor_id == Some(misdemeanor_id))
        .count();
    prior as u32 + 1
}

fn predicted_outcome(tier: RiskTier) -> &'static str {
    match tier {
        RiskTier::Excellent => "Likely to remain in good standing",
        RiskTier::Good => "Stable with occasional minor incidents",
        RiskTier::Warning => "At risk of further escalation within the term",
        RiskTier::Critical => "High likelihood of suspension without intervention",
    }
}

fn suggested_intervention(tier: RiskTier) -> &'static str {
    match tier {
        RiskTier::Excellent => "Continue positive reinforcement",
        RiskTier::Good => "Teacher check-in and merit goals",
        RiskTier::Warning => "Counseling referral and parent contact",
        RiskTier::Critical => "Behavior contract with counselor, parents and administration",
    }
}

pub fn assess(
    student: &Student,
    records: &[BehaviorRecord],
    as_of: DateTime<Utc>,
    config: &ScoringConfig,
) -> RiskAssessment {
    let breakdown = score_breakdown(records, as_of, config);
    let tier = classify(breakdown.score);
    let mut factors = Vec::new();

    let recent = incidents_within(records, as_of, config.burst_window_days);
    if recent > 0 {
        factors.push(format!(
            "{recent} incident(s) in the last {} days",
            config.burst_window_days
        ));
    }

    let mut by_category: BTreeMap<String, usize> = BTreeMap::new();
    for record in ordered_incidents(records, as_of) {
        *by_category.entry(record.offense_key()).or_insert(0) += 1;
    }
    for (category, count) in by_category.iter().filter(|(_, count)| **count > 1) {
        factors.push(format!("repeat offenses in {category} (x{count})"));
    }

    if breakdown.burst {
        factors.push("escalating incident frequency".to_string());
    }
    if breakdown.merit_total > 0.0 {
        factors.push(format!(
            "merits offset {:.2} points",
            breakdown.merit_total
        ));
    }
    if factors.is_empty() {
        factors.push("no behavior records".to_string());
    }

    let counted = records.iter().filter(|record| counts(record, as_of)).count();
    RiskAssessment {
        student_id: student.id,
        risk_score: breakdown.score,
        risk_level: tier,
        factors,
        predicted_outcome: predicted_outcome(tier).to_string(),
        suggested_intervention: suggested_intervention(tier).to_string(),
        confidence: (0.5 + 0.05 * counted as f64).min(0.95),
    }
}
