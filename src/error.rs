use thiserror::Error;
use uuid::Uuid;

use crate::escalation::EscalationStatus;

/// Rule definition problems, reported when rules are loaded. The rule is disabled.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuleError {
    #[error("rule {rule} has no trigger conditions")]
    NoConditions { rule: String },
    #[error("rule {rule} has no actions")]
    NoActions { rule: String },
    #[error("rule {rule} action {step} has negative delay {delay_minutes}")]
    NegativeDelay {
        rule: String,
        step: usize,
        delay_minutes: i64,
    },
    #[error("rule {rule} action {step} delay {delay_minutes} is earlier than the previous action")]
    DecreasingDelay {
        rule: String,
        step: usize,
        delay_minutes: i64,
    },
    #[error("rule {rule} action {step} delay {delay_minutes} exceeds {max} minutes")]
    DelayOutOfRange {
        rule: String,
        step: usize,
        delay_minutes: i64,
        max: i64,
    },
    #[error("rule {rule} reuses id {id} of an earlier rule")]
    DuplicateId { rule: String, id: Uuid },
    #[error("rule {rule} action {step} has an empty target")]
    EmptyTarget { rule: String, step: usize },
    #[error("rule {rule} has an invalid condition: {reason}")]
    InvalidCondition { rule: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EscalationError {
    #[error("escalation {0} not found")]
    NotFound(Uuid),
    #[error("escalation {id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        id: Uuid,
        from: EscalationStatus,
        to: EscalationStatus,
    },
    #[error("escalation {id} step {step} is not in a failed state")]
    StepNotFailed { id: Uuid, step: usize },
    #[error("escalation {id} step {step} is awaiting retry")]
    StepFailed { id: Uuid, step: usize },
    #[error("escalation {id} has no remaining steps")]
    NoRemainingSteps { id: Uuid },
    #[error("escalation {id} cannot be rescheduled before the previous step")]
    RescheduleTooEarly { id: Uuid },
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("dispatch to {target} failed: {reason}")]
pub struct DispatchError {
    pub target: String,
    pub reason: String,
}

/// Per-student failure during a batch; the batch continues with other students.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvaluationError {
    #[error("student {0} has no name or grade on file")]
    MissingStudentData(Uuid),
    #[error("record {record} belongs to student {owner}, not {student}")]
    ForeignRecord {
        record: Uuid,
        owner: Uuid,
        student: Uuid,
    },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("student {0} not found")]
    StudentNotFound(Uuid),
    #[error("misdemeanor {0} not found")]
    MisdemeanorNotFound(Uuid),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid stored value: {0}")]
    InvalidValue(String),
}
