use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::Serialize;
use uuid::Uuid;

use crate::classify::{classify, RiskTier};
use crate::config::ScoringConfig;
use crate::models::{BehaviorRecord, Student};
use crate::scoring;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreUpdate {
    pub student_id: Uuid,
    pub full_name: String,
    pub grade: String,
    pub previous: f64,
    pub score: f64,
    pub tier: RiskTier,
    pub needs_counseling: bool,
    pub incident_count: usize,
}

impl ScoreUpdate {
    pub fn changed(&self) -> bool {
        (self.previous - self.score).abs() > f64::EPSILON
    }
}

pub fn score_student(
    student: &Student,
    records: &[BehaviorRecord],
    as_of: DateTime<Utc>,
    config: &ScoringConfig,
) -> ScoreUpdate {
    let score = scoring::compute_heat_score_with(records, as_of, config);
    ScoreUpdate {
        student_id: student.id,
        full_name: student.full_name.clone(),
        grade: student.grade.clone(),
        previous: student.behavior_score,
        score,
        tier: classify(score),
        needs_counseling: scoring::needs_counseling(student, score),
        incident_count: records
            .iter()
            .filter(|record| scoring::counted_incident(record, as_of))
            .count(),
    }
}

/// Scores every student in parallel. Students share no state, so the only
/// ordering requirement is on the writes the caller makes afterwards.
pub fn score_students(
    histories: &[(Student, Vec<BehaviorRecord>)],
    as_of: DateTime<Utc>,
    config: &ScoringConfig,
) -> Vec<ScoreUpdate> {
    let mut updates: Vec<ScoreUpdate> = histories
        .par_iter()
        .map(|(student, records)| score_student(student, records, as_of, config))
        .collect();
    rank(&mut updates);
    updates
}

/// Highest score first; ties keep a stable order by name.
pub fn rank(updates: &mut [ScoreUpdate]) {
    updates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.full_name.cmp(&b.full_name))
    });
}
