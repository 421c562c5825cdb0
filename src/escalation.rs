use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::classify::{classify, RiskTier};
use crate::config::ScoringConfig;
use crate::error::{DispatchError, EscalationError, EvaluationError, RuleError};
use crate::models::{BehaviorRecord, Student};
use crate::scoring::{self, counted_incident};

/// Longest delay an action may carry: one year.
pub const MAX_DELAY_MINUTES: i64 = 60 * 24 * 366;
/// Widest trailing window an incident condition may look back over.
pub const MAX_WINDOW_DAYS: i64 = 3660;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Notify,
    Schedule,
    Assign,
    Escalate,
    Document,
}

impl ActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::Notify => "notify",
            ActionType::Schedule => "schedule",
            ActionType::Assign => "assign",
            ActionType::Escalate => "escalate",
            ActionType::Document => "document",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationAction {
    pub action_type: ActionType,
    pub target: String,
    /// Minutes after the trigger time, not after the previous action.
    pub delay_minutes: i64,
}

impl EscalationAction {
    pub fn new(action_type: ActionType, target: &str, delay_minutes: i64) -> Self {
        Self {
            action_type,
            target: target.to_string(),
            delay_minutes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

/// One trigger predicate. A rule fires when all of its conditions hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    HeatScoreAtLeast { threshold: f64 },
    TierAtLeast { tier: RiskTier },
    IncidentsWithin { count: usize, days: i64 },
    RepeatOffense {
        #[serde(default)]
        category: Option<String>,
        ordinal: u32,
    },
    PreviousInterventionUnsuccessful,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRule {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub conditions: Vec<Condition>,
    pub actions: Vec<EscalationAction>,
    pub priority: Priority,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub auto_execute: bool,
    #[serde(default)]
    pub assignee: Option<String>,
}

fn default_true() -> bool {
    true
}

impl EscalationRule {
    pub fn validate(&self) -> Result<(), RuleError> {
        let rule = self.name.clone();
        if self.conditions.is_empty() {
            return Err(RuleError::NoConditions { rule });
        }
        for condition in &self.conditions {
            let reason = match condition {
                Condition::HeatScoreAtLeast { threshold }
                    if !threshold.is_finite() || *threshold < 0.0 =>
                {
                    Some(format!("heat score threshold {threshold} is not a finite non-negative number"))
                }
                Condition::IncidentsWithin { count, days } if *count == 0 || *days <= 0 => {
                    Some(format!("incident window {count} in {days} days is empty"))
                }
                Condition::IncidentsWithin { days, .. } if *days > MAX_WINDOW_DAYS => Some(format!(
                    "incident window of {days} days exceeds {MAX_WINDOW_DAYS} days"
                )),
                Condition::RepeatOffense { ordinal, .. } if *ordinal == 0 => {
                    Some("repeat offense ordinal must start at 1".to_string())
                }
                _ => None,
            };
            if let Some(reason) = reason {
                return Err(RuleError::InvalidCondition { rule, reason });
            }
        }

        if self.actions.is_empty() {
            return Err(RuleError::NoActions { rule });
        }
        let mut previous = 0;
        for (step, action) in self.actions.iter().enumerate() {
            if action.delay_minutes < 0 {
                return Err(RuleError::NegativeDelay {
                    rule,
                    step,
                    delay_minutes: action.delay_minutes,
                });
            }
            if action.delay_minutes > MAX_DELAY_MINUTES {
                return Err(RuleError::DelayOutOfRange {
                    rule,
                    step,
                    delay_minutes: action.delay_minutes,
                    max: MAX_DELAY_MINUTES,
                });
            }
            if action.delay_minutes < previous {
                return Err(RuleError::DecreasingDelay {
                    rule,
                    step,
                    delay_minutes: action.delay_minutes,
                });
            }
            if action.target.trim().is_empty() {
                return Err(RuleError::EmptyTarget { rule, step });
            }
            previous = action.delay_minutes;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationStatus {
    Pending,
    InProgress,
    Completed,
    Paused,
    Cancelled,
}

impl EscalationStatus {
    pub fn is_open(self) -> bool {
        matches!(
            self,
            EscalationStatus::Pending | EscalationStatus::InProgress | EscalationStatus::Paused
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EscalationStatus::Pending => "pending",
            EscalationStatus::InProgress => "in_progress",
            EscalationStatus::Completed => "completed",
            EscalationStatus::Paused => "paused",
            EscalationStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(EscalationStatus::Pending),
            "in_progress" => Some(EscalationStatus::InProgress),
            "completed" => Some(EscalationStatus::Completed),
            "paused" => Some(EscalationStatus::Paused),
            "cancelled" => Some(EscalationStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Scheduled,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledAction {
    pub step: usize,
    pub action_type: ActionType,
    pub target: String,
    pub effective_at: DateTime<Utc>,
    pub state: StepState,
    #[serde(default)]
    pub failure: Option<String>,
    #[serde(default)]
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveEscalation {
    pub id: Uuid,
    pub rule_id: Uuid,
    pub rule_name: String,
    pub student_id: Uuid,
    pub priority: Priority,
    pub current_step: usize,
    pub total_steps: usize,
    pub status: EscalationStatus,
    pub triggered_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub assignee: Option<String>,
    pub actions: Vec<ScheduledAction>,
}

impl ActiveEscalation {
    fn instantiate(rule: &EscalationRule, student_id: Uuid, now: DateTime<Utc>) -> Self {
        let actions: Vec<ScheduledAction> = rule
            .actions
            .iter()
            .enumerate()
            .map(|(step, action)| ScheduledAction {
                step,
                action_type: action.action_type,
                target: action.target.clone(),
                effective_at: minutes_after(now, action.delay_minutes),
                state: StepState::Scheduled,
                failure: None,
                attempts: 0,
            })
            .collect();

        Self {
            id: Uuid::new_v4(),
            rule_id: rule.id,
            rule_name: rule.name.clone(),
            student_id,
            priority: rule.priority,
            current_step: 0,
            total_steps: actions.len(),
            status: if rule.auto_execute {
                EscalationStatus::InProgress
            } else {
                EscalationStatus::Pending
            },
            triggered_at: now,
            completed_at: None,
            assignee: rule.assignee.clone(),
            actions,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }

    pub fn next_action(&self) -> Option<&ScheduledAction> {
        if !self.is_open() {
            return None;
        }
        self.actions.get(self.current_step)
    }

    pub fn next_action_time(&self) -> Option<DateTime<Utc>> {
        self.next_action().map(|action| action.effective_at)
    }

    fn transition(&mut self, to: EscalationStatus) -> Result<(), EscalationError> {
        use EscalationStatus::*;
        let allowed = matches!(
            (self.status, to),
            (Pending, InProgress)
                | (Pending, Paused)
                | (Paused, Pending)
                | (InProgress, Completed)
                | (Pending | InProgress | Paused, Cancelled)
        );
        if !allowed {
            return Err(EscalationError::InvalidTransition {
                id: self.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    fn require_in_progress(&self) -> Result<(), EscalationError> {
        if self.status != EscalationStatus::InProgress {
            return Err(EscalationError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: EscalationStatus::InProgress,
            });
        }
        if self.current_step >= self.total_steps {
            return Err(EscalationError::NoRemainingSteps { id: self.id });
        }
        Ok(())
    }

    fn current_action(&mut self) -> Result<&mut ScheduledAction, EscalationError> {
        let id = self.id;
        self.actions
            .get_mut(self.current_step)
            .ok_or(EscalationError::NoRemainingSteps { id })
    }

    fn complete_step(&mut self, now: DateTime<Utc>) -> Result<(), EscalationError> {
        self.require_in_progress()?;
        let (id, step) = (self.id, self.current_step);
        let action = self.current_action()?;
        if action.state == StepState::Failed {
            return Err(EscalationError::StepFailed { id, step });
        }
        action.state = StepState::Completed;
        action.attempts += 1;
        self.current_step += 1;
        if self.current_step == self.total_steps {
            self.transition(EscalationStatus::Completed)?;
            self.completed_at = Some(now);
        }
        Ok(())
    }

    fn fail_step(&mut self, reason: &str) -> Result<(), EscalationError> {
        self.require_in_progress()?;
        let action = self.current_action()?;
        action.state = StepState::Failed;
        action.failure = Some(reason.to_string());
        action.attempts += 1;
        Ok(())
    }

    fn retry_step(&mut self, reschedule_at: Option<DateTime<Utc>>) -> Result<(), EscalationError> {
        self.require_in_progress()?;
        let (id, step) = (self.id, self.current_step);
        if self.current_action()?.state != StepState::Failed {
            return Err(EscalationError::StepNotFailed { id, step });
        }
        if let Some(at) = reschedule_at {
            if step > 0 && at < self.actions[step - 1].effective_at {
                return Err(EscalationError::RescheduleTooEarly { id: self.id });
            }
            // Later steps keep their trigger-relative time unless that would reorder them.
            for action in self.actions[step..].iter_mut() {
                if action.effective_at < at || action.step == step {
                    action.effective_at = at;
                }
            }
        }
        let action = self.current_action()?;
        action.state = StepState::Scheduled;
        action.failure = None;
        Ok(())
    }
}

/// Delivers one escalation step to people or calendars.
pub trait Dispatcher {
    fn dispatch(
        &mut self,
        escalation: &ActiveEscalation,
        action: &ScheduledAction,
    ) -> Result<(), DispatchError>;
}

/// Records dispatches in the log only.
#[derive(Debug, Default)]
pub struct LogDispatcher;

impl Dispatcher for LogDispatcher {
    fn dispatch(
        &mut self,
        escalation: &ActiveEscalation,
        action: &ScheduledAction,
    ) -> Result<(), DispatchError> {
        info!(
            escalation_id = %escalation.id,
            student_id = %escalation.student_id,
            rule = %escalation.rule_name,
            step = action.step,
            action = action.action_type.as_str(),
            target = %action.target,
            "dispatching escalation step"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DisabledRule {
    pub rule: EscalationRule,
    pub error: RuleError,
}

#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub created: Vec<ActiveEscalation>,
    pub failures: Vec<(Uuid, EvaluationError)>,
}

#[derive(Debug, Default)]
pub struct DispatchReport {
    pub dispatched: Vec<(Uuid, usize)>,
    pub failed: Vec<(Uuid, usize, DispatchError)>,
}

pub struct EscalationEngine {
    rules: Vec<EscalationRule>,
    disabled: Vec<DisabledRule>,
    config: ScoringConfig,
    ledger: Vec<ActiveEscalation>,
}

impl EscalationEngine {
    pub fn new(rules: Vec<EscalationRule>) -> Self {
        Self::with_config(rules, ScoringConfig::default())
    }

    pub fn with_config(rules: Vec<EscalationRule>, config: ScoringConfig) -> Self {
        let mut enabled = Vec::new();
        let mut disabled = Vec::new();
        let mut seen = HashSet::new();
        for rule in rules {
            let verdict = rule.validate().and_then(|()| {
                if seen.contains(&rule.id) {
                    Err(RuleError::DuplicateId {
                        rule: rule.name.clone(),
                        id: rule.id,
                    })
                } else {
                    Ok(())
                }
            });
            match verdict {
                Ok(()) => {
                    seen.insert(rule.id);
                    enabled.push(rule);
                }
                Err(error) => {
                    warn!(rule = %rule.name, error = %error, "disabling malformed escalation rule");
                    disabled.push(DisabledRule { rule, error });
                }
            }
        }
        Self {
            rules: enabled,
            disabled,
            config,
            ledger: Vec::new(),
        }
    }

    /// Seeds the ledger with escalations already persisted elsewhere.
    pub fn load<I>(&mut self, escalations: I)
    where
        I: IntoIterator<Item = ActiveEscalation>,
    {
        for escalation in escalations {
            match self.ledger.iter_mut().find(|e| e.id == escalation.id) {
                Some(existing) => *existing = escalation,
                None => self.ledger.push(escalation),
            }
        }
    }

    pub fn rules(&self) -> &[EscalationRule] {
        &self.rules
    }

    pub fn disabled_rules(&self) -> &[DisabledRule] {
        &self.disabled
    }

    pub fn escalations(&self) -> &[ActiveEscalation] {
        &self.ledger
    }

    pub fn get(&self, id: Uuid) -> Option<&ActiveEscalation> {
        self.ledger.iter().find(|e| e.id == id)
    }

    pub fn open_for(&self, student_id: Uuid) -> Vec<&ActiveEscalation> {
        self.ledger
            .iter()
            .filter(|e| e.student_id == student_id && e.is_open())
            .collect()
    }

    fn has_open(&self, student_id: Uuid, rule_id: Uuid) -> bool {
        self.ledger
            .iter()
            .any(|e| e.student_id == student_id && e.rule_id == rule_id && e.is_open())
    }

    fn condition_holds(
        &self,
        condition: &Condition,
        student: &Student,
        records: &[BehaviorRecord],
        score: f64,
        now: DateTime<Utc>,
    ) -> bool {
        match condition {
            Condition::HeatScoreAtLeast { threshold } => score >= *threshold,
            Condition::TierAtLeast { tier } => classify(score) >= *tier,
            Condition::IncidentsWithin { count, days } => {
                scoring::incidents_within(records, now, *days) >= *count
            }
            Condition::RepeatOffense { category, ordinal } => {
                let wanted = category.as_ref().map(|c| c.trim().to_ascii_lowercase());
                let mut counts: HashMap<String, u32> = HashMap::new();
                for record in records.iter().filter(|r| counted_incident(r, now)) {
                    *counts.entry(record.offense_key()).or_insert(0) += 1;
                }
                counts.iter().any(|(key, count)| {
                    wanted.as_ref().map_or(true, |wanted| wanted == key) && count >= ordinal
                })
            }
            Condition::PreviousInterventionUnsuccessful => self
                .ledger
                .iter()
                .filter(|e| e.student_id == student.id && e.status == EscalationStatus::Completed)
                .filter_map(|e| e.completed_at)
                .any(|completed_at| {
                    records
                        .iter()
                        .any(|r| counted_incident(r, now) && r.occurred_at > completed_at)
                }),
        }
    }

    /// Instantiates escalations for every rule the student now triggers.
    /// Rules with an open escalation for this student are skipped.
    pub fn evaluate(
        &mut self,
        student: &Student,
        records: &[BehaviorRecord],
        now: DateTime<Utc>,
    ) -> Result<Vec<ActiveEscalation>, EvaluationError> {
        if student.full_name.trim().is_empty() || student.grade.trim().is_empty() {
            return Err(EvaluationError::MissingStudentData(student.id));
        }
        if let Some(foreign) = records.iter().find(|r| r.student_id != student.id) {
            return Err(EvaluationError::ForeignRecord {
                record: foreign.id,
                owner: foreign.student_id,
                student: student.id,
            });
        }

        let score = scoring::compute_heat_score_with(records, now, &self.config);
        let mut created = Vec::new();

        for rule in self.rules.iter().filter(|rule| rule.active) {
            if self.has_open(student.id, rule.id) {
                debug!(
                    student_id = %student.id,
                    rule = %rule.name,
                    "escalation already open, skipping"
                );
                continue;
            }
            let triggered = rule
                .conditions
                .iter()
                .all(|condition| self.condition_holds(condition, student, records, score, now));
            if !triggered {
                continue;
            }

            let escalation = ActiveEscalation::instantiate(rule, student.id, now);
            info!(
                student_id = %student.id,
                rule = %rule.name,
                escalation_id = %escalation.id,
                status = escalation.status.as_str(),
                score,
                "escalation triggered"
            );
            created.push(escalation);
        }

        self.ledger.extend(created.iter().cloned());
        Ok(created)
    }

    pub fn evaluate_batch(
        &mut self,
        students: &[(Student, Vec<BehaviorRecord>)],
        now: DateTime<Utc>,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for (student, records) in students {
            match self.evaluate(student, records, now) {
                Ok(created) => outcome.created.extend(created),
                Err(error) => {
                    warn!(student_id = %student.id, error = %error, "skipping student");
                    outcome.failures.push((student.id, error));
                }
            }
        }
        outcome
    }

    fn entry(&mut self, id: Uuid) -> Result<&mut ActiveEscalation, EscalationError> {
        self.ledger
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(EscalationError::NotFound(id))
    }

    pub fn approve(&mut self, id: Uuid) -> Result<&ActiveEscalation, EscalationError> {
        let escalation = self.entry(id)?;
        escalation.transition(EscalationStatus::InProgress)?;
        Ok(&*escalation)
    }

    pub fn pause(&mut self, id: Uuid) -> Result<&ActiveEscalation, EscalationError> {
        let escalation = self.entry(id)?;
        escalation.transition(EscalationStatus::Paused)?;
        Ok(&*escalation)
    }

    pub fn resume(&mut self, id: Uuid) -> Result<&ActiveEscalation, EscalationError> {
        let escalation = self.entry(id)?;
        escalation.transition(EscalationStatus::Pending)?;
        Ok(&*escalation)
    }

    pub fn cancel(&mut self, id: Uuid) -> Result<&ActiveEscalation, EscalationError> {
        let escalation = self.entry(id)?;
        escalation.transition(EscalationStatus::Cancelled)?;
        info!(escalation_id = %id, "escalation cancelled");
        Ok(&*escalation)
    }

    pub fn complete_step(
        &mut self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<&ActiveEscalation, EscalationError> {
        let escalation = self.entry(id)?;
        escalation.complete_step(now)?;
        Ok(&*escalation)
    }

    pub fn fail_step(
        &mut self,
        id: Uuid,
        reason: &str,
    ) -> Result<&ActiveEscalation, EscalationError> {
        let escalation = self.entry(id)?;
        escalation.fail_step(reason)?;
        warn!(
            escalation_id = %id,
            step = escalation.current_step,
            reason,
            "escalation step failed"
        );
        Ok(&*escalation)
    }

    pub fn retry_step(
        &mut self,
        id: Uuid,
        reschedule_at: Option<DateTime<Utc>>,
    ) -> Result<&ActiveEscalation, EscalationError> {
        let escalation = self.entry(id)?;
        escalation.retry_step(reschedule_at)?;
        Ok(&*escalation)
    }

    /// Dispatches every in-progress step whose time has come. A failed
    /// dispatch leaves the escalation at that step until it is retried.
    pub fn dispatch_due<D: Dispatcher>(
        &mut self,
        now: DateTime<Utc>,
        dispatcher: &mut D,
    ) -> DispatchReport {
        let mut report = DispatchReport::default();
        for escalation in self.ledger.iter_mut() {
            while escalation.status == EscalationStatus::InProgress {
                let Some(action) = escalation.actions.get(escalation.current_step) else {
                    break;
                };
                if action.state != StepState::Scheduled || action.effective_at > now {
                    break;
                }
                let step = action.step;
                match dispatcher.dispatch(escalation, action) {
                    Ok(()) => {
                        if escalation.complete_step(now).is_err() {
                            break;
                        }
                        report.dispatched.push((escalation.id, step));
                    }
                    Err(error) => {
                        warn!(
                            escalation_id = %escalation.id,
                            step,
                            error = %error,
                            "dispatch failed, step held for retry"
                        );
                        if escalation.fail_step(&error.reason).is_err() {
                            break;
                        }
                        report.failed.push((escalation.id, step, error));
                        break;
                    }
                }
            }
        }
        report
    }
}

fn minutes_after(at: DateTime<Utc>, minutes: i64) -> DateTime<Utc> {
    Duration::try_minutes(minutes)
        .and_then(|span| at.checked_add_signed(span))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
    }

    fn three_incident_rule(auto_execute: bool) -> EscalationRule {
        EscalationRule {
            id: Uuid::new_v4(),
            name: "Three strikes".to_string(),
            description: "3 incidents in a week".to_string(),
            conditions: vec![Condition::IncidentsWithin { count: 3, days: 7 }],
            actions: vec![
                EscalationAction::new(ActionType::Notify, "admin", 0),
                EscalationAction::new(ActionType::Schedule, "counseling", 60),
            ],
            priority: Priority::High,
            active: true,
            auto_execute,
            assignee: Some("dean".to_string()),
        }
    }

    fn student_with_incidents(count: i64) -> (Student, Vec<BehaviorRecord>) {
        let student = Student::new("Avery Lee", "10");
        let records = (0..count)
            .map(|days| {
                BehaviorRecord::incident(student.id, now() - Duration::days(days + 1), "disruption", 2)
            })
            .collect();
        (student, records)
    }

    struct FailingDispatcher;

    impl Dispatcher for FailingDispatcher {
        fn dispatch(
            &mut self,
            _escalation: &ActiveEscalation,
            action: &ScheduledAction,
        ) -> Result<(), DispatchError> {
            Err(DispatchError {
                target: action.target.clone(),
                reason: "smtp unavailable".to_string(),
            })
        }
    }

    #[test]
    fn malformed_rules_are_disabled() {
        let mut no_actions = three_incident_rule(true);
        no_actions.actions.clear();
        let mut decreasing = three_incident_rule(true);
        decreasing.actions[1].delay_minutes = -5;
        let mut reordered = three_incident_rule(true);
        reordered.actions.swap(0, 1);
        let mut no_conditions = three_incident_rule(true);
        no_conditions.conditions.clear();

        let engine = EscalationEngine::new(vec![
            three_incident_rule(true),
            no_actions,
            decreasing,
            reordered,
            no_conditions,
        ]);
        assert_eq!(engine.rules().len(), 1);
        let errors: Vec<&RuleError> = engine.disabled_rules().iter().map(|d| &d.error).collect();
        assert!(matches!(errors[0], RuleError::NoActions { .. }));
        assert!(matches!(errors[1], RuleError::NegativeDelay { step: 1, .. }));
        assert!(matches!(errors[2], RuleError::DecreasingDelay { step: 1, .. }));
        assert!(matches!(errors[3], RuleError::NoConditions { .. }));
    }

    #[test]
    fn invalid_conditions_are_rejected() {
        let mut rule = three_incident_rule(true);
        rule.conditions = vec![Condition::HeatScoreAtLeast { threshold: f64::NAN }];
        assert!(matches!(rule.validate(), Err(RuleError::InvalidCondition { .. })));
        rule.conditions = vec![Condition::IncidentsWithin { count: 0, days: 7 }];
        assert!(matches!(rule.validate(), Err(RuleError::InvalidCondition { .. })));
        rule.conditions = vec![Condition::RepeatOffense {
            category: None,
            ordinal: 0,
        }];
        assert!(matches!(rule.validate(), Err(RuleError::InvalidCondition { .. })));
        rule.actions[0].target = "  ".to_string();
        rule.conditions = vec![Condition::PreviousInterventionUnsuccessful];
        assert!(matches!(rule.validate(), Err(RuleError::EmptyTarget { step: 0, .. })));
    }

    #[test]
    fn trigger_schedules_actions_from_trigger_time() {
        let (student, records) = student_with_incidents(3);
        let mut engine = EscalationEngine::new(vec![three_incident_rule(true)]);
        let created = engine.evaluate(&student, &records, now()).unwrap();

        assert_eq!(created.len(), 1);
        let escalation = &created[0];
        assert_eq!(escalation.status, EscalationStatus::InProgress);
        assert_eq!(escalation.current_step, 0);
        assert_eq!(escalation.total_steps, 2);
        assert_eq!(escalation.assignee.as_deref(), Some("dean"));
        let next = escalation.next_action().unwrap();
        assert_eq!(next.action_type, ActionType::Notify);
        assert_eq!(next.target, "admin");
        assert_eq!(escalation.next_action_time(), Some(now()));
        assert_eq!(escalation.actions[1].effective_at, now() + Duration::minutes(60));
    }

    #[test]
    fn below_threshold_does_not_trigger() {
        let (student, records) = student_with_incidents(2);
        let mut engine = EscalationEngine::new(vec![three_incident_rule(true)]);
        assert!(engine.evaluate(&student, &records, now()).unwrap().is_empty());
        assert!(engine.escalations().is_empty());
    }

    #[test]
    fn re_evaluation_is_idempotent_while_open() {
        let (student, records) = student_with_incidents(3);
        let mut engine = EscalationEngine::new(vec![three_incident_rule(true)]);
        engine.evaluate(&student, &records, now()).unwrap();
        let again = engine.evaluate(&student, &records, now()).unwrap();
        assert!(again.is_empty());
        assert_eq!(engine.escalations().len(), 1);

        let id = engine.escalations()[0].id;
        engine.cancel(id).unwrap();
        let after_cancel = engine.evaluate(&student, &records, now()).unwrap();
        assert_eq!(after_cancel.len(), 1);
        assert_eq!(engine.escalations().len(), 2);
    }

    #[test]
    fn manual_rules_wait_for_approval() {
        let (student, records) = student_with_incidents(3);
        let mut engine = EscalationEngine::new(vec![three_incident_rule(false)]);
        let id = engine.evaluate(&student, &records, now()).unwrap()[0].id;
        assert_eq!(engine.get(id).unwrap().status, EscalationStatus::Pending);

        let report = engine.dispatch_due(now(), &mut LogDispatcher);
        assert!(report.dispatched.is_empty());
        assert!(engine.complete_step(id, now()).is_err());

        engine.pause(id).unwrap();
        assert!(engine.approve(id).is_err());
        engine.resume(id).unwrap();
        engine.approve(id).unwrap();
        assert_eq!(engine.get(id).unwrap().status, EscalationStatus::InProgress);
        assert!(engine.pause(id).is_err());
    }

    #[test]
    fn steps_complete_in_order_and_close_escalation() {
        let (student, records) = student_with_incidents(3);
        let mut engine = EscalationEngine::new(vec![three_incident_rule(true)]);
        let id = engine.evaluate(&student, &records, now()).unwrap()[0].id;

        let after_first = engine.complete_step(id, now()).unwrap();
        assert_eq!(after_first.current_step, 1);
        assert_eq!(after_first.next_action().unwrap().action_type, ActionType::Schedule);

        let done = engine.complete_step(id, now() + Duration::minutes(60)).unwrap();
        assert_eq!(done.status, EscalationStatus::Completed);
        assert_eq!(done.current_step, done.total_steps);
        assert!(done.next_action().is_none());
        assert!(engine.complete_step(id, now()).is_err());
        assert!(engine.cancel(id).is_err());
    }

    #[test]
    fn dispatch_sends_only_due_steps() {
        let (student, records) = student_with_incidents(3);
        let mut engine = EscalationEngine::new(vec![three_incident_rule(true)]);
        let id = engine.evaluate(&student, &records, now()).unwrap()[0].id;

        let report = engine.dispatch_due(now(), &mut LogDispatcher);
        assert_eq!(report.dispatched, vec![(id, 0)]);
        assert_eq!(engine.get(id).unwrap().current_step, 1);

        let report = engine.dispatch_due(now() + Duration::minutes(61), &mut LogDispatcher);
        assert_eq!(report.dispatched, vec![(id, 1)]);
        assert_eq!(engine.get(id).unwrap().status, EscalationStatus::Completed);
    }

    #[test]
    fn failed_dispatch_holds_step_for_retry() {
        let (student, records) = student_with_incidents(3);
        let mut engine = EscalationEngine::new(vec![three_incident_rule(true)]);
        let id = engine.evaluate(&student, &records, now()).unwrap()[0].id;

        let report = engine.dispatch_due(now(), &mut FailingDispatcher);
        assert_eq!(report.failed.len(), 1);
        let escalation = engine.get(id).unwrap();
        assert_eq!(escalation.status, EscalationStatus::InProgress);
        assert_eq!(escalation.current_step, 0);
        assert_eq!(escalation.actions[0].state, StepState::Failed);
        assert_eq!(escalation.actions[0].failure.as_deref(), Some("smtp unavailable"));

        // Held steps are not redispatched until retried.
        let report = engine.dispatch_due(now(), &mut LogDispatcher);
        assert!(report.dispatched.is_empty());
        assert!(matches!(
            engine.complete_step(id, now()),
            Err(EscalationError::StepFailed { step: 0, .. })
        ));

        let later = now() + Duration::minutes(90);
        let retried = engine.retry_step(id, Some(later)).unwrap();
        assert_eq!(retried.actions[0].effective_at, later);
        assert_eq!(retried.actions[1].effective_at, later);
        let report = engine.dispatch_due(later, &mut LogDispatcher);
        assert_eq!(report.dispatched, vec![(id, 0), (id, 1)]);
        assert_eq!(engine.get(id).unwrap().status, EscalationStatus::Completed);
    }

    #[test]
    fn retry_requires_failed_step_and_monotonic_time() {
        let (student, records) = student_with_incidents(3);
        let mut engine = EscalationEngine::new(vec![three_incident_rule(true)]);
        let id = engine.evaluate(&student, &records, now()).unwrap()[0].id;
        assert!(matches!(
            engine.retry_step(id, None),
            Err(EscalationError::StepNotFailed { step: 0, .. })
        ));

        engine.complete_step(id, now()).unwrap();
        engine.fail_step(id, "calendar offline").unwrap();
        assert!(matches!(
            engine.retry_step(id, Some(now() - Duration::minutes(1))),
            Err(EscalationError::RescheduleTooEarly { .. })
        ));
        let retried = engine.retry_step(id, None).unwrap();
        assert_eq!(retried.actions[1].state, StepState::Scheduled);
        assert_eq!(retried.actions[1].effective_at, now() + Duration::minutes(60));
    }

    #[test]
    fn heat_and_repeat_conditions() {
        let student = Student::new("Kiara Patel", "9");
        let records: Vec<BehaviorRecord> = (0..2)
            .map(|i| BehaviorRecord::incident(student.id, now() - Duration::days(20 + i), "vaping", 5))
            .collect();
        let mut rule = three_incident_rule(true);
        rule.conditions = vec![
            Condition::HeatScoreAtLeast { threshold: 4.0 },
            Condition::RepeatOffense {
                category: Some("Vaping".to_string()),
                ordinal: 2,
            },
        ];
        let mut tier_rule = three_incident_rule(true);
        tier_rule.id = Uuid::new_v4();
        tier_rule.conditions = vec![Condition::TierAtLeast {
            tier: RiskTier::Critical,
        }];

        let mut engine = EscalationEngine::new(vec![rule.clone(), tier_rule]);
        let created = engine.evaluate(&student, &records, now()).unwrap();
        // 1.75 + 1.75 * 1.5 = 4.375, tier Good
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].rule_id, rule.id);
    }

    #[test]
    fn previous_intervention_unsuccessful_needs_later_incident() {
        let (student, mut records) = student_with_incidents(3);
        let first_rule = three_incident_rule(true);
        let mut follow_up = three_incident_rule(true);
        follow_up.id = Uuid::new_v4();
        follow_up.name = "Follow up".to_string();
        follow_up.conditions = vec![Condition::PreviousInterventionUnsuccessful];

        let mut engine = EscalationEngine::new(vec![first_rule, follow_up]);
        let created = engine.evaluate(&student, &records, now()).unwrap();
        assert_eq!(created.len(), 1);
        let id = created[0].id;
        engine.complete_step(id, now()).unwrap();
        engine.complete_step(id, now()).unwrap();

        let later = now() + Duration::days(2);
        records.push(BehaviorRecord::incident(student.id, later, "disruption", 1));
        let created = engine.evaluate(&student, &records, later).unwrap();
        let names: Vec<&str> = created.iter().map(|e| e.rule_name.as_str()).collect();
        assert!(names.contains(&"Follow up"));
    }

    #[test]
    fn batch_isolates_bad_students() {
        let (student, records) = student_with_incidents(3);
        let nameless = Student::new("", "10");
        let (other, other_records) = student_with_incidents(3);
        let mut foreign = other_records.clone();
        foreign.push(BehaviorRecord::incident(student.id, now(), "x", 1));

        let mut engine = EscalationEngine::new(vec![three_incident_rule(true)]);
        let outcome = engine.evaluate_batch(
            &[
                (nameless.clone(), Vec::new()),
                (other.clone(), foreign),
                (student.clone(), records),
            ],
            now(),
        );
        assert_eq!(outcome.created.len(), 1);
        assert_eq!(outcome.created[0].student_id, student.id);
        assert_eq!(outcome.failures.len(), 2);
        assert_eq!(
            outcome.failures[0].1,
            EvaluationError::MissingStudentData(nameless.id)
        );
    }

    struct RejectsTarget(&'static str);

    impl Dispatcher for RejectsTarget {
        fn dispatch(
            &mut self,
            _escalation: &ActiveEscalation,
            action: &ScheduledAction,
        ) -> Result<(), DispatchError> {
            if action.target == self.0 {
                return Err(DispatchError {
                    target: action.target.clone(),
                    reason: "mailbox full".to_string(),
                });
            }
            Ok(())
        }
    }

    #[test]
    fn out_of_range_delays_and_windows_disable_the_rule() {
        let mut huge_delay = three_incident_rule(true);
        huge_delay.actions[1].delay_minutes = i64::MAX;
        let mut huge_window = three_incident_rule(true);
        huge_window.id = Uuid::new_v4();
        huge_window.conditions = vec![Condition::IncidentsWithin {
            count: 1,
            days: 100_000_000,
        }];
        assert!(matches!(
            huge_delay.validate(),
            Err(RuleError::DelayOutOfRange { step: 1, .. })
        ));
        assert!(matches!(
            huge_window.validate(),
            Err(RuleError::InvalidCondition { .. })
        ));

        let mut widest = three_incident_rule(true);
        widest.id = Uuid::new_v4();
        widest.conditions = vec![Condition::IncidentsWithin {
            count: 3,
            days: MAX_WINDOW_DAYS,
        }];
        widest.actions[1].delay_minutes = MAX_DELAY_MINUTES;
        assert!(widest.validate().is_ok());

        let (student, records) = student_with_incidents(3);
        let mut engine = EscalationEngine::new(vec![huge_delay, huge_window, widest.clone()]);
        assert_eq!(engine.disabled_rules().len(), 2);
        let created = engine.evaluate(&student, &records, now()).unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].rule_id, widest.id);
        assert_eq!(
            created[0].actions[1].effective_at,
            now() + Duration::minutes(MAX_DELAY_MINUTES)
        );
    }

    #[test]
    fn duplicate_rule_ids_keep_the_first() {
        let first = three_incident_rule(true);
        let mut copy = first.clone();
        copy.name = "Three strikes again".to_string();

        let (student, records) = student_with_incidents(3);
        let mut engine = EscalationEngine::new(vec![first.clone(), copy]);
        assert_eq!(engine.rules().len(), 1);
        assert!(matches!(
            engine.disabled_rules()[0].error,
            RuleError::DuplicateId { id, .. } if id == first.id
        ));
        assert_eq!(engine.evaluate(&student, &records, now()).unwrap().len(), 1);
        assert_eq!(engine.escalations().len(), 1);
    }

    #[test]
    fn manual_escalation_is_not_duplicated_while_pending_or_paused() {
        let (student, records) = student_with_incidents(3);
        let mut engine = EscalationEngine::new(vec![three_incident_rule(false)]);
        let id = engine.evaluate(&student, &records, now()).unwrap()[0].id;

        assert!(engine.evaluate(&student, &records, now()).unwrap().is_empty());
        assert_eq!(engine.escalations().len(), 1);
        assert_eq!(engine.get(id).unwrap().status, EscalationStatus::Pending);

        engine.pause(id).unwrap();
        let later = now() + Duration::hours(2);
        assert!(engine.evaluate(&student, &records, later).unwrap().is_empty());
        assert_eq!(engine.escalations().len(), 1);
        assert_eq!(engine.open_for(student.id).len(), 1);
    }

    #[test]
    fn one_failed_dispatch_does_not_block_others() {
        let (student, records) = student_with_incidents(3);
        let notify_admin = three_incident_rule(true);
        let mut call_principal = three_incident_rule(true);
        call_principal.id = Uuid::new_v4();
        call_principal.name = "Principal call".to_string();
        call_principal.actions = vec![EscalationAction::new(ActionType::Escalate, "principal", 0)];

        let mut engine = EscalationEngine::new(vec![notify_admin, call_principal]);
        let created = engine.evaluate(&student, &records, now()).unwrap();
        assert_eq!(created.len(), 2);
        let (admin_id, principal_id) = (created[0].id, created[1].id);

        let report = engine.dispatch_due(now(), &mut RejectsTarget("admin"));
        assert_eq!(report.failed.len(), 1);
        assert_eq!((report.failed[0].0, report.failed[0].1), (admin_id, 0));
        assert_eq!(report.dispatched, vec![(principal_id, 0)]);
        assert_eq!(
            engine.get(principal_id).unwrap().status,
            EscalationStatus::Completed
        );
        assert_eq!(engine.get(admin_id).unwrap().actions[0].state, StepState::Failed);
    }

    #[test]
    fn step_count_beyond_stored_actions_is_an_error() {
        let (student, records) = student_with_incidents(3);
        let mut engine = EscalationEngine::new(vec![three_incident_rule(true)]);
        let mut escalation = engine.evaluate(&student, &records, now()).unwrap().remove(0);
        escalation.total_steps = 3;
        let id = escalation.id;
        engine.load(vec![escalation]);

        engine.complete_step(id, now()).unwrap();
        engine.complete_step(id, now()).unwrap();
        assert_eq!(engine.get(id).unwrap().status, EscalationStatus::InProgress);
        assert!(matches!(
            engine.complete_step(id, now()),
            Err(EscalationError::NoRemainingSteps { .. })
        ));
        assert!(matches!(
            engine.fail_step(id, "gone"),
            Err(EscalationError::NoRemainingSteps { .. })
        ));
        assert!(matches!(
            engine.retry_step(id, None),
            Err(EscalationError::NoRemainingSteps { .. })
        ));
        assert!(engine.dispatch_due(now(), &mut LogDispatcher).dispatched.is_empty());
    }

    #[test]
    fn rules_round_trip_through_json() {
        let raw = r#"{
            "id": "3d7f5d6f-24f7-4e8e-8b4b-3e7e44b4a7b2",
            "name": "Critical heat",
            "conditions": [{"type": "tier_at_least", "tier": "critical"}],
            "actions": [{"action_type": "escalate", "target": "principal", "delay_minutes": 0}],
            "priority": "urgent"
        }"#;
        let rule: EscalationRule = serde_json::from_str(raw).unwrap();
        assert!(rule.active);
        assert!(!rule.auto_execute);
        assert!(rule.validate().is_ok());
        assert_eq!(
            rule.conditions,
            vec![Condition::TierAtLeast {
                tier: RiskTier::Critical
            }]
        );
    }
}
