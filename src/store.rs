use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::escalation::{ActiveEscalation, EscalationRule};
use crate::models::{BehaviorRecord, Misdemeanor, Student};

/// Data access used by the service layer. Cached scores are only written
/// through `update_student_score`, after a recompute over the full history.
#[allow(async_fn_in_trait)]
pub trait BehaviorStore {
    async fn list_students(&self) -> Result<Vec<Student>, StoreError>;
    async fn get_student(&self, id: Uuid) -> Result<Student, StoreError>;
    async fn records_for(&self, student_id: Uuid) -> Result<Vec<BehaviorRecord>, StoreError>;
    async fn records_since(&self, since: DateTime<Utc>) -> Result<Vec<BehaviorRecord>, StoreError>;
    async fn insert_record(&self, record: &BehaviorRecord) -> Result<(), StoreError>;
    async fn update_student_score(
        &self,
        student_id: Uuid,
        score: f64,
        needs_counseling: bool,
    ) -> Result<(), StoreError>;
    async fn get_misdemeanor(&self, id: Uuid) -> Result<Misdemeanor, StoreError>;
    async fn list_rules(&self) -> Result<Vec<EscalationRule>, StoreError>;
    async fn load_escalations(&self) -> Result<Vec<ActiveEscalation>, StoreError>;
    async fn save_escalation(&self, escalation: &ActiveEscalation) -> Result<(), StoreError>;
}

#[derive(Default)]
struct MemoryState {
    students: Vec<Student>,
    records: Vec<BehaviorRecord>,
    misdemeanors: HashMap<Uuid, Misdemeanor>,
    rules: Vec<EscalationRule>,
    escalations: Vec<ActiveEscalation>,
}

/// In-process store for tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_student(&self, student: Student) {
        self.state().students.push(student);
    }

    pub fn add_misdemeanor(&self, misdemeanor: Misdemeanor) {
        self.state().misdemeanors.insert(misdemeanor.id, misdemeanor);
    }

    pub fn add_rule(&self, rule: EscalationRule) {
        self.state().rules.push(rule);
    }
}

impl BehaviorStore for MemoryStore {
    async fn list_students(&self) -> Result<Vec<Student>, StoreError> {
        Ok(self.state().students.clone())
    }

    async fn get_student(&self, id: Uuid) -> Result<Student, StoreError> {
        self.state()
            .students
            .iter()
            .find(|student| student.id == id)
            .cloned()
            .ok_or(StoreError::StudentNotFound(id))
    }

    async fn records_for(&self, student_id: Uuid) -> Result<Vec<BehaviorRecord>, StoreError> {
        let mut records: Vec<BehaviorRecord> = self
            .state()
            .records
            .iter()
            .filter(|record| record.student_id == student_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.occurred_at.cmp(&b.occurred_at));
        Ok(records)
    }

    async fn records_since(&self, since: DateTime<Utc>) -> Result<Vec<BehaviorRecord>, StoreError> {
        Ok(self
            .state()
            .records
            .iter()
            .filter(|record| record.occurred_at >= since)
            .cloned()
            .collect())
    }

    async fn insert_record(&self, record: &BehaviorRecord) -> Result<(), StoreError> {
        let mut state = self.state();
        if !state.students.iter().any(|s| s.id == record.student_id) {
            return Err(StoreError::StudentNotFound(record.student_id));
        }
        state.records.push(record.clone());
        Ok(())
    }

    async fn update_student_score(
        &self,
        student_id: Uuid,
        score: f64,
        needs_counseling: bool,
    ) -> Result<(), StoreError> {
        let mut state = self.state();
        let student = state
            .students
            .iter_mut()
            .find(|student| student.id == student_id)
            .ok_or(StoreError::StudentNotFound(student_id))?;
        student.behavior_score = score;
        student.needs_counseling = needs_counseling;
        Ok(())
    }

    async fn get_misdemeanor(&self, id: Uuid) -> Result<Misdemeanor, StoreError> {
        self.state()
            .misdemeanors
            .get(&id)
            .cloned()
            .ok_or(StoreError::MisdemeanorNotFound(id))
    }

    async fn list_rules(&self) -> Result<Vec<EscalationRule>, StoreError> {
        Ok(self.state().rules.clone())
    }

    async fn load_escalations(&self) -> Result<Vec<ActiveEscalation>, StoreError> {
        Ok(self.state().escalations.clone())
    }

    async fn save_escalation(&self, escalation: &ActiveEscalation) -> Result<(), StoreError> {
        let mut state = self.state();
        match state.escalations.iter_mut().find(|e| e.id == escalation.id) {
            Some(existing) => *existing = escalation.clone(),
            None => state.escalations.push(escalation.clone()),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_records_for_unknown_students() {
        let store = MemoryStore::new();
        let record = BehaviorRecord::incident(Uuid::new_v4(), Utc::now(), "noise", 1);
        let err = store.insert_record(&record).await.unwrap_err();
        assert!(matches!(err, StoreError::StudentNotFound(_)));
    }

    #[tokio::test]
    async fn save_escalation_upserts_by_id() {
        use crate::escalation::{ActionType, EscalationAction, EscalationEngine, Priority};
        use crate::escalation::Condition;

        let store = MemoryStore::new();
        let student = Student::new("Avery Lee", "10");
        let records: Vec<BehaviorRecord> = (0..3)
            .map(|_| BehaviorRecord::incident(student.id, Utc::now(), "noise", 1))
            .collect();
        let mut engine = EscalationEngine::new(vec![EscalationRule {
            id: Uuid::new_v4(),
            name: "burst".to_string(),
            description: String::new(),
            conditions: vec![Condition::IncidentsWithin { count: 3, days: 7 }],
            actions: vec![EscalationAction::new(ActionType::Document, "file", 0)],
            priority: Priority::Low,
            active: true,
            auto_execute: true,
            assignee: None,
        }]);
        let created = engine.evaluate(&student, &records, Utc::now()).unwrap();
        store.save_escalation(&created[0]).await.unwrap();
        let done = engine.complete_step(created[0].id, Utc::now()).unwrap().clone();
        store.save_escalation(&done).await.unwrap();

        let stored = store.load_escalations().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0], done);
    }
}
