use std::collections::BTreeSet;

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::classify::RiskTier;
use crate::error::StoreError;
use crate::escalation::{
    ActionType, ActiveEscalation, Condition, EscalationAction, EscalationRule, Priority,
};
use crate::models::{BehaviorRecord, MeritTier, Misdemeanor, RecordKind, RecordStatus, Student};
use crate::store::BehaviorStore;

const STUDENT_COLUMNS: &str =
    "id, full_name, grade, boarding, behavior_score, needs_counseling, counseling_manual";
const RECORD_COLUMNS: &str = "id, student_id, kind, occurred_at, severity, category, \
     misdemeanor_id, points, merit_tier, description, location, offense_ordinal, status, reported_by";

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn student_from_row(row: &PgRow) -> Result<Student, StoreError> {
    Ok(Student {
        id: row.try_get("id")?,
        full_name: row.try_get("full_name")?,
        grade: row.try_get("grade")?,
        boarding: row.try_get("boarding")?,
        behavior_score: row.try_get("behavior_score")?,
        needs_counseling: row.try_get("needs_counseling")?,
        counseling_manual: row.try_get("counseling_manual")?,
    })
}

fn record_from_row(row: &PgRow) -> Result<BehaviorRecord, StoreError> {
    let kind: String = row.try_get("kind")?;
    let kind = RecordKind::parse(&kind)
        .ok_or_else(|| StoreError::InvalidValue(format!("record kind {kind}")))?;
    let status: String = row.try_get("status")?;
    let status = RecordStatus::parse(&status)
        .ok_or_else(|| StoreError::InvalidValue(format!("record status {status}")))?;
    let merit_tier: Option<String> = row.try_get("merit_tier")?;
    let merit_tier = merit_tier
        .map(|tier| {
            MeritTier::parse(&tier)
                .ok_or_else(|| StoreError::InvalidValue(format!("merit tier {tier}")))
        })
        .transpose()?;
    let offense_ordinal: Option<i32> = row.try_get("offense_ordinal")?;

    Ok(BehaviorRecord {
        id: row.try_get("id")?,
        student_id: row.try_get("student_id")?,
        kind,
        occurred_at: row.try_get("occurred_at")?,
        severity: row.try_get("severity")?,
        category: row.try_get("category")?,
        misdemeanor_id: row.try_get("misdemeanor_id")?,
        points: row.try_get("points")?,
        merit_tier,
        description: row.try_get("description")?,
        location: row.try_get("location")?,
        offense_ordinal: offense_ordinal.map(|ordinal| ordinal.max(1) as u32),
        status,
        reported_by: row.try_get("reported_by")?,
    })
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn insert_record_keyed(
        &self,
        record: &BehaviorRecord,
        source_key: Option<&str>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO discipline_heat.behavior_records
            (id, student_id, kind, occurred_at, severity, category, misdemeanor_id, points,
             merit_tier, description, location, offense_ordinal, status, reported_by, source_key)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (source_key) DO NOTHING
            "#,
        )
        .bind(record.id)
        .bind(record.student_id)
        .bind(record.kind.as_str())
        .bind(record.occurred_at)
        .bind(record.severity)
        .bind(record.category.as_deref())
        .bind(record.misdemeanor_id)
        .bind(record.points)
        .bind(record.merit_tier.map(MeritTier::as_str))
        .bind(&record.description)
        .bind(record.location.as_deref())
        .bind(record.offense_ordinal.map(|ordinal| ordinal as i32))
        .bind(record.status.as_str())
        .bind(record.reported_by.as_deref())
        .bind(source_key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn next_ordinal(&self, student_id: Uuid, misdemeanor_id: Uuid) -> Result<u32, StoreError> {
        let prior: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) AS prior FROM discipline_heat.behavior_records
            WHERE student_id = $1 AND misdemeanor_id = $2 AND kind = 'incident'
            "#,
        )
        .bind(student_id)
        .bind(misdemeanor_id)
        .fetch_one(&self.pool)
        .await?
        .try_get("prior")?;
        Ok(prior as u32 + 1)
    }

    async fn misdemeanor_by_name(&self, name: &str) -> Result<Option<Misdemeanor>, StoreError> {
        let row = sqlx::query(
            "SELECT id FROM discipline_heat.misdemeanors WHERE LOWER(name) = LOWER($1)",
        )
        .bind(name.trim())
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(self.get_misdemeanor(row.try_get("id")?).await?)),
            None => Ok(None),
        }
    }

    pub async fn upsert_student(
        &self,
        student_number: &str,
        full_name: &str,
        grade: &str,
        boarding: bool,
    ) -> Result<Uuid, StoreError> {
        let id: Uuid = sqlx::query(
            r#"
            INSERT INTO discipline_heat.students (id, student_number, full_name, grade, boarding)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (student_number) DO UPDATE
            SET full_name = EXCLUDED.full_name, grade = EXCLUDED.grade
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(student_number)
        .bind(full_name)
        .bind(grade)
        .bind(boarding)
        .fetch_one(&self.pool)
        .await?
        .try_get("id")?;
        Ok(id)
    }

    pub async fn upsert_misdemeanor(&self, misdemeanor: &Misdemeanor) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO discipline_heat.misdemeanors (id, name, category, severity, location, sanctions)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name, category = EXCLUDED.category, severity = EXCLUDED.severity,
                location = EXCLUDED.location, sanctions = EXCLUDED.sanctions
            "#,
        )
        .bind(misdemeanor.id)
        .bind(&misdemeanor.name)
        .bind(&misdemeanor.category)
        .bind(misdemeanor.severity)
        .bind(misdemeanor.location.as_deref())
        .bind(Json(&misdemeanor.sanctions))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_rule(&self, rule: &EscalationRule) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO discipline_heat.escalation_rules (id, name, definition)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name, definition = EXCLUDED.definition
            "#,
        )
        .bind(rule.id)
        .bind(&rule.name)
        .bind(Json(rule))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

impl BehaviorStore for PgStore {
    async fn list_students(&self) -> Result<Vec<Student>, StoreError> {
        let query = format!(
            "SELECT {STUDENT_COLUMNS} FROM discipline_heat.students ORDER BY full_name"
        );
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(student_from_row).collect()
    }

    async fn get_student(&self, id: Uuid) -> Result<Student, StoreError> {
        let query = format!("SELECT {STUDENT_COLUMNS} FROM discipline_heat.students WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::StudentNotFound(id))?;
        student_from_row(&row)
    }

    async fn records_for(&self, student_id: Uuid) -> Result<Vec<BehaviorRecord>, StoreError> {
        let query = format!(
            "SELECT {RECORD_COLUMNS} FROM discipline_heat.behavior_records \
             WHERE student_id = $1 ORDER BY occurred_at, id"
        );
        let rows = sqlx::query(&query)
            .bind(student_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn records_since(&self, since: DateTime<Utc>) -> Result<Vec<BehaviorRecord>, StoreError> {
        let query = format!(
            "SELECT {RECORD_COLUMNS} FROM discipline_heat.behavior_records \
             WHERE occurred_at >= $1 ORDER BY occurred_at, id"
        );
        let rows = sqlx::query(&query).bind(since).fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn insert_record(&self, record: &BehaviorRecord) -> Result<(), StoreError> {
        self.insert_record_keyed(record, None).await?;
        Ok(())
    }

    async fn update_student_score(
        &self,
        student_id: Uuid,
        score: f64,
        needs_counseling: bool,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE discipline_heat.students
            SET behavior_score = $2, needs_counseling = $3
            WHERE id = $1
            "#,
        )
        .bind(student_id)
        .bind(score)
        .bind(needs_counseling)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::StudentNotFound(student_id));
        }
        Ok(())
    }

    async fn get_misdemeanor(&self, id: Uuid) -> Result<Misdemeanor, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, category, severity, location, sanctions
            FROM discipline_heat.misdemeanors WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::MisdemeanorNotFound(id))?;
        let sanctions: Json<Vec<String>> = row.try_get("sanctions")?;
        Ok(Misdemeanor {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            category: row.try_get("category")?,
            severity: row.try_get("severity")?,
            location: row.try_get("location")?,
            sanctions: sanctions.0,
        })
    }

    async fn list_rules(&self) -> Result<Vec<EscalationRule>, StoreError> {
        let rows = sqlx::query("SELECT definition FROM discipline_heat.escalation_rules ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> Result<EscalationRule, StoreError> {
                let definition: Json<EscalationRule> = row.try_get("definition")?;
                Ok(definition.0)
            })
            .collect()
    }

    async fn load_escalations(&self) -> Result<Vec<ActiveEscalation>, StoreError> {
        let rows = sqlx::query(
            "SELECT payload FROM discipline_heat.active_escalations ORDER BY updated_at, id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<ActiveEscalation, StoreError> {
                let payload: Json<ActiveEscalation> = row.try_get("payload")?;
                Ok(payload.0)
            })
            .collect()
    }

    async fn save_escalation(&self, escalation: &ActiveEscalation) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO discipline_heat.active_escalations
            (id, rule_id, student_id, status, payload, updated_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (id) DO UPDATE
            SET status = EXCLUDED.status, payload = EXCLUDED.payload, updated_at = NOW()
            "#,
        )
        .bind(escalation.id)
        .bind(escalation.rule_id)
        .bind(escalation.student_id)
        .bind(escalation.status.as_str())
        .bind(Json(escalation))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn seed_misdemeanors() -> anyhow::Result<Vec<Misdemeanor>> {
    let sanctions = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    Ok(vec![
        Misdemeanor {
            id: Uuid::parse_str("8a1c3f52-6a7e-4b1d-9f7c-2f4f5a0e7c11")?,
            name: "Late to class".to_string(),
            category: "punctuality".to_string(),
            severity: 1,
            location: Some("Classroom".to_string()),
            sanctions: sanctions(&["Verbal warning", "Lunch detention", "Parent notified"]),
        },
        Misdemeanor {
            id: Uuid::parse_str("b4e2d9a0-1c3b-4f6e-8d2a-5e9c7b1f3a22")?,
            name: "Disrupting lessons".to_string(),
            category: "disruption".to_string(),
            severity: 2,
            location: Some("Classroom".to_string()),
            sanctions: sanctions(&["Teacher warning", "After-school detention", "Parent meeting"]),
        },
        Misdemeanor {
            id: Uuid::parse_str("f0d7c6b5-3a2e-4c1d-b9e8-7a6f5d4c3b33")?,
            name: "Fighting".to_string(),
            category: "violence".to_string(),
            severity: 5,
            location: None,
            sanctions: sanctions(&["One-day suspension", "Three-day suspension", "Expulsion review"]),
        },
    ])
}

fn seed_rules() -> anyhow::Result<Vec<EscalationRule>> {
    Ok(vec![
        EscalationRule {
            id: Uuid::parse_str("1e7a9c3d-5b2f-4e8a-a1c6-9d3b7f2e4a44")?,
            name: "Three incidents in a week".to_string(),
            description: "Notify administration and book counseling".to_string(),
            conditions: vec![Condition::IncidentsWithin { count: 3, days: 7 }],
            actions: vec![
                EscalationAction::new(ActionType::Notify, "admin", 0),
                EscalationAction::new(ActionType::Schedule, "counseling", 60),
            ],
            priority: Priority::High,
            active: true,
            auto_execute: true,
            assignee: Some("counselor".to_string()),
        },
        EscalationRule {
            id: Uuid::parse_str("6c2b8e4f-9a1d-4b7c-8e3f-1a5d9c7b2e55")?,
            name: "Critical heat".to_string(),
            description: "Parent conference and principal review".to_string(),
            conditions: vec![Condition::TierAtLeast {
                tier: RiskTier::Critical,
            }],
            actions: vec![
                EscalationAction::new(ActionType::Notify, "parent", 0),
                EscalationAction::new(ActionType::Escalate, "principal", 1440),
                EscalationAction::new(ActionType::Document, "student-file", 1440),
            ],
            priority: Priority::Urgent,
            active: true,
            auto_execute: false,
            assignee: Some("dean".to_string()),
        },
    ])
}

/// Loads demo students, catalog entries and rules. Returns the students
/// whose histories changed so their scores can be refreshed.
pub async fn seed(store: &PgStore) -> anyhow::Result<BTreeSet<Uuid>> {
    let misdemeanors = seed_misdemeanors()?;
    for misdemeanor in &misdemeanors {
        store.upsert_misdemeanor(misdemeanor).await?;
    }
    for rule in seed_rules()? {
        store.upsert_rule(&rule).await?;
    }

    let students = vec![
        ("S-1001", "Avery Lee", "10", false),
        ("S-1002", "Jules Moreno", "11", true),
        ("S-1003", "Kiara Patel", "9", false),
    ];
    let mut ids = Vec::new();
    for (number, name, grade, boarding) in students {
        ids.push(store.upsert_student(number, name, grade, boarding).await?);
    }

    let now = Utc::now();
    let incidents = vec![
        ("seed-001", ids[0], 0, 2, "Arrived after the bell twice"),
        ("seed-002", ids[1], 1, 1, "Talking over the teacher"),
        ("seed-003", ids[1], 1, 3, "Phone out during test"),
        ("seed-004", ids[1], 2, 5, "Argument escalated in corridor"),
        ("seed-005", ids[2], 0, 20, "Late after lunch"),
    ];

    let mut touched = BTreeSet::new();
    for (source_key, student_id, catalog_index, days_ago, note) in incidents {
        let misdemeanor = &misdemeanors[catalog_index];
        let mut record = BehaviorRecord::incident(
            student_id,
            now - Duration::days(days_ago),
            &misdemeanor.category,
            misdemeanor.severity,
        );
        record.misdemeanor_id = Some(misdemeanor.id);
        record.description = note.to_string();
        record.offense_ordinal = Some(store.next_ordinal(student_id, misdemeanor.id).await?);
        if store.insert_record_keyed(&record, Some(source_key)).await? {
            touched.insert(student_id);
        }
    }

    let mut merit = BehaviorRecord::merit(ids[2], now - Duration::days(3), MeritTier::Gold);
    merit.description = "Led the science fair team".to_string();
    if store.insert_record_keyed(&merit, Some("seed-merit-001")).await? {
        touched.insert(ids[2]);
    }

    Ok(touched)
}

#[derive(serde::Deserialize)]
struct CsvRow {
    student_number: String,
    full_name: String,
    grade: String,
    kind: String,
    occurred_at: DateTime<Utc>,
    misdemeanor: Option<String>,
    category: Option<String>,
    severity: Option<i32>,
    merit_tier: Option<String>,
    description: String,
    location: Option<String>,
    reported_by: Option<String>,
    source_key: Option<String>,
}

/// Imports behavior records from CSV. Returns the students whose
/// histories changed.
pub async fn import_csv(
    store: &PgStore,
    csv_path: &std::path::Path,
) -> anyhow::Result<BTreeSet<Uuid>> {
    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let mut touched = BTreeSet::new();

    for (line, result) in reader.deserialize::<CsvRow>().enumerate() {
        let row = result.with_context(|| format!("invalid CSV row {}", line + 2))?;
        let student_id = store
            .upsert_student(&row.student_number, &row.full_name, &row.grade, false)
            .await?;
        let kind = RecordKind::parse(&row.kind)
            .with_context(|| format!("row {}: unknown record kind {:?}", line + 2, row.kind))?;

        let mut record = match kind {
            RecordKind::Incident => {
                let mut record = BehaviorRecord::incident(
                    student_id,
                    row.occurred_at,
                    row.category.as_deref().unwrap_or(""),
                    row.severity.unwrap_or(1),
                );
                if let Some(name) = row.misdemeanor.as_deref().filter(|n| !n.trim().is_empty()) {
                    let misdemeanor = store
                        .misdemeanor_by_name(name)
                        .await?
                        .with_context(|| format!("row {}: unknown misdemeanor {name:?}", line + 2))?;
                    record.category = Some(misdemeanor.category.clone());
                    record.severity = Some(misdemeanor.severity);
                    record.misdemeanor_id = Some(misdemeanor.id);
                    record.offense_ordinal =
                        Some(store.next_ordinal(student_id, misdemeanor.id).await?);
                }
                record
            }
            RecordKind::Merit => {
                let tier = row
                    .merit_tier
                    .as_deref()
                    .and_then(MeritTier::parse)
                    .with_context(|| format!("row {}: merit needs a valid merit_tier", line + 2))?;
                BehaviorRecord::merit(student_id, row.occurred_at, tier)
            }
        };
        record.description = row.description;
        record.location = row.location;
        record.reported_by = row.reported_by;

        let source_key = row
            .source_key
            .unwrap_or_else(|| format!("import-{}", Uuid::new_v4()));
        if store.insert_record_keyed(&record, Some(&source_key)).await? {
            touched.insert(student_id);
        }
    }

    Ok(touched)
}
