use std::collections::HashMap;
use std::fmt::Write;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::batch::ScoreUpdate;
use crate::classify::RiskTier;
use crate::escalation::ActiveEscalation;
use crate::models::BehaviorRecord;
use crate::scoring::display_score;
use crate::trend;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategorySummary {
    pub category: String,
    pub count: usize,
    pub avg_severity: f64,
}

pub fn summarize_by_category(records: &[BehaviorRecord]) -> Vec<CategorySummary> {
    let mut map: HashMap<String, (usize, i32)> = HashMap::new();

    for record in records.iter().filter(|record| record.is_incident()) {
        let entry = map.entry(record.offense_key()).or_insert((0, 0));
        entry.0 += 1;
        entry.1 += record.severity.unwrap_or(1).clamp(1, 5);
    }

    let mut summaries: Vec<CategorySummary> = map
        .into_iter()
        .map(|(category, (count, total_severity))| CategorySummary {
            category,
            count,
            avg_severity: if count == 0 {
                0.0
            } else {
                total_severity as f64 / count as f64
            },
        })
        .collect();

    summaries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.category.cmp(&b.category)));
    summaries
}

pub fn tier_mix(updates: &[ScoreUpdate]) -> Vec<(RiskTier, usize)> {
    [
        RiskTier::Critical,
        RiskTier::Warning,
        RiskTier::Good,
        RiskTier::Excellent,
    ]
    .into_iter()
    .map(|tier| (tier, updates.iter().filter(|u| u.tier == tier).count()))
    .collect()
}

pub struct ReportInput<'a> {
    pub scope: Option<&'a str>,
    pub since_days: i64,
    pub cutoff: DateTime<Utc>,
    pub now: DateTime<Utc>,
    pub updates: &'a [ScoreUpdate],
    pub records: &'a [BehaviorRecord],
    pub escalations: &'a [ActiveEscalation],
}

pub fn build_report(input: &ReportInput<'_>) -> String {
    let mut output = String::new();
    // Records before the cutoff only feed the trend's prior period.
    let in_window: Vec<BehaviorRecord> = input
        .records
        .iter()
        .filter(|record| record.occurred_at >= input.cutoff)
        .cloned()
        .collect();
    let scope_label = input.scope.unwrap_or("all students");

    let _ = writeln!(output, "# Behavior Heat Report");
    let _ = writeln!(
        output,
        "Generated for {} (records since {})",
        scope_label,
        input.cutoff.date_naive()
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Risk Tiers");
    if input.updates.is_empty() {
        let _ = writeln!(output, "No students on file.");
    } else {
        for (tier, count) in tier_mix(input.updates) {
            let _ = writeln!(output, "- {}: {} students", tier.label(), count);
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Highest Heat Scores");
    let flagged: Vec<&ScoreUpdate> = input.updates.iter().filter(|u| u.score > 0.0).collect();
    if flagged.is_empty() {
        let _ = writeln!(output, "No students with a heat score in this window.");
    } else {
        for update in flagged.iter().take(10) {
            let _ = writeln!(
                output,
                "- {} (grade {}) heat {:.2} [{}] across {} incidents{}",
                update.full_name,
                update.grade,
                display_score(update.score),
                update.tier.label(),
                update.incident_count,
                if update.needs_counseling {
                    ", counseling recommended"
                } else {
                    ""
                }
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Incident Trend");
    let period = input.since_days.max(1);
    let incident_trend = trend::incident_trend(input.records, input.now, period);
    let _ = writeln!(
        output,
        "Incidents are {} {}% against the previous {} days{}.",
        incident_trend.direction.arrow(),
        incident_trend.percentage,
        period,
        if incident_trend.baseline_missing {
            " (no prior incidents)"
        } else {
            ""
        }
    );

    let _ = writeln!(output);
    let _ = writeln!(output, "## Incident Mix");
    let summaries = summarize_by_category(&in_window);
    if summaries.is_empty() {
        let _ = writeln!(output, "No incidents recorded for this window.");
    } else {
        for summary in &summaries {
            let _ = writeln!(
                output,
                "- {}: {} incidents (avg severity {:.1})",
                summary.category, summary.count, summary.avg_severity
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Weekly Activity");
    let buckets = trend::weekly_buckets(input.records, input.cutoff);
    if buckets.is_empty() {
        let _ = writeln!(output, "No activity recorded for this window.");
    } else {
        for bucket in &buckets {
            let _ = writeln!(
                output,
                "- week of {}: {} incidents, {} merits, {} students (avg severity {:.1})",
                bucket.week_start,
                bucket.incident_count,
                bucket.merit_count,
                bucket.student_count,
                bucket.avg_severity
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Open Escalations");
    let mut open: Vec<&ActiveEscalation> = input.escalations.iter().filter(|e| e.is_open()).collect();
    open.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.triggered_at.cmp(&b.triggered_at)));
    if open.is_empty() {
        let _ = writeln!(output, "No open escalations.");
    } else {
        let names: HashMap<_, _> = input
            .updates
            .iter()
            .map(|u| (u.student_id, u.full_name.as_str()))
            .collect();
        for escalation in open {
            let student = names
                .get(&escalation.student_id)
                .copied()
                .unwrap_or("unknown student");
            let next = match escalation.next_action() {
                Some(action) => format!(
                    "next {} {} at {}",
                    action.action_type.as_str(),
                    action.target,
                    action.effective_at.format("%Y-%m-%d %H:%M")
                ),
                None => "no remaining steps".to_string(),
            };
            let _ = writeln!(
                output,
                "- {} for {} ({}, step {}/{}): {}",
                escalation.rule_name,
                student,
                escalation.status.as_str(),
                escalation.current_step,
                escalation.total_steps,
                next
            );
        }
    }

    let mut recent: Vec<&BehaviorRecord> =
        in_window.iter().filter(|record| record.is_incident()).collect();
    recent.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at));
    let _ = writeln!(output);
    let _ = writeln!(output, "## Recent Incident Notes");
    if recent.is_empty() {
        let _ = writeln!(output, "No incidents recorded for this window.");
    } else {
        for record in recent.iter().take(5) {
            let _ = writeln!(
                output,
                "- {} on {}: {}",
                record.offense_key(),
                record.occurred_at.date_naive(),
                if record.description.is_empty() {
                    "(no description)"
                } else {
                    record.description.as_str()
                }
            );
        }
    }

    output
}
