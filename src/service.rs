use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::batch::{self, ScoreUpdate};
use crate::config::ScoringConfig;
use crate::error::StoreError;
use crate::escalation::{BatchOutcome, EscalationEngine};
use crate::models::{BehaviorRecord, MeritTier, RecordKind, RecordStatus};
use crate::scoring;
use crate::store::BehaviorStore;

#[derive(Debug, Clone)]
pub struct NewIncident {
    pub student_id: Uuid,
    pub misdemeanor_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub description: String,
    pub location: Option<String>,
    pub reported_by: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewMerit {
    pub student_id: Uuid,
    pub tier: MeritTier,
    pub occurred_at: DateTime<Utc>,
    pub description: String,
    pub reported_by: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RecordedIncident {
    pub record: BehaviorRecord,
    pub sanction: Option<String>,
    pub update: ScoreUpdate,
}

/// Recomputes a student's cached score from the full history and stores it.
pub async fn refresh_student<S: BehaviorStore>(
    store: &S,
    student_id: Uuid,
    config: &ScoringConfig,
    as_of: DateTime<Utc>,
) -> Result<ScoreUpdate, StoreError> {
    let student = store.get_student(student_id).await?;
    let records = store.records_for(student_id).await?;
    let update = batch::score_student(&student, &records, as_of, config);
    store
        .update_student_score(student_id, update.score, update.needs_counseling)
        .await?;
    if update.changed() {
        info!(
            student_id = %student_id,
            previous = update.previous,
            score = update.score,
            tier = update.tier.label(),
            "behavior score updated"
        );
    }
    Ok(update)
}

pub async fn record_incident<S: BehaviorStore>(
    store: &S,
    incident: NewIncident,
    config: &ScoringConfig,
    as_of: DateTime<Utc>,
) -> Result<RecordedIncident, StoreError> {
    let student = store.get_student(incident.student_id).await?;
    let misdemeanor = store.get_misdemeanor(incident.misdemeanor_id).await?;
    let history = store.records_for(student.id).await?;
    let ordinal = scoring::offense_ordinal(&history, student.id, misdemeanor.id);
    let sanction = misdemeanor.sanction_for(ordinal).map(str::to_string);

    let record = BehaviorRecord {
        id: Uuid::new_v4(),
        student_id: student.id,
        kind: RecordKind::Incident,
        occurred_at: incident.occurred_at,
        severity: Some(misdemeanor.severity.clamp(1, 5)),
        category: Some(misdemeanor.category.clone()),
        misdemeanor_id: Some(misdemeanor.id),
        points: None,
        merit_tier: None,
        description: incident.description,
        location: incident.location.or_else(|| misdemeanor.location.clone()),
        offense_ordinal: Some(ordinal),
        status: RecordStatus::Open,
        reported_by: incident.reported_by,
    };
    store.insert_record(&record).await?;
    info!(
        student_id = %student.id,
        misdemeanor = %misdemeanor.name,
        ordinal,
        "incident recorded"
    );

    let update = refresh_student(store, student.id, config, as_of).await?;
    Ok(RecordedIncident {
        record,
        sanction,
        update,
    })
}

pub async fn record_merit<S: BehaviorStore>(
    store: &S,
    merit: NewMerit,
    config: &ScoringConfig,
    as_of: DateTime<Utc>,
) -> Result<ScoreUpdate, StoreError> {
    let mut record = BehaviorRecord::merit(merit.student_id, merit.occurred_at, merit.tier);
    record.description = merit.description;
    record.reported_by = merit.reported_by;
    store.insert_record(&record).await?;
    info!(
        student_id = %merit.student_id,
        tier = merit.tier.as_str(),
        "merit recorded"
    );
    refresh_student(store, merit.student_id, config, as_of).await
}

/// Scores every student in parallel, then writes the results one at a time.
pub async fn recompute_all<S: BehaviorStore>(
    store: &S,
    config: &ScoringConfig,
    as_of: DateTime<Utc>,
) -> Result<Vec<ScoreUpdate>, StoreError> {
    let students = store.list_students().await?;
    let mut histories = Vec::with_capacity(students.len());
    for student in students {
        let records = store.records_for(student.id).await?;
        histories.push((student, records));
    }

    let updates = batch::score_students(&histories, as_of, config);
    for update in &updates {
        store
            .update_student_score(update.student_id, update.score, update.needs_counseling)
            .await?;
    }
    info!(students = updates.len(), "recomputed behavior scores");
    Ok(updates)
}

/// Evaluates every student against the engine's rules and persists new
/// escalations. Students that fail evaluation are reported, not fatal.
pub async fn run_escalations<S: BehaviorStore>(
    store: &S,
    engine: &mut EscalationEngine,
    as_of: DateTime<Utc>,
) -> Result<BatchOutcome, StoreError> {
    engine.load(store.load_escalations().await?);

    let students = store.list_students().await?;
    let mut histories = Vec::with_capacity(students.len());
    for student in students {
        let records = store.records_for(student.id).await?;
        histories.push((student, records));
    }

    let outcome = engine.evaluate_batch(&histories, as_of);
    for escalation in &outcome.created {
        store.save_escalation(escalation).await?;
    }
    if !outcome.failures.is_empty() {
        warn!(
            failures = outcome.failures.len(),
            "some students could not be evaluated"
        );
    }
    Ok(outcome)
}
