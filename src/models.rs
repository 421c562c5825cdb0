use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::classify::RiskTier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Incident,
    Merit,
}

impl RecordKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::Incident => "incident",
            RecordKind::Merit => "merit",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "incident" => Some(RecordKind::Incident),
            "merit" => Some(RecordKind::Merit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    #[default]
    Open,
    Resolved,
    Dismissed,
}

impl RecordStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordStatus::Open => "open",
            RecordStatus::Resolved => "resolved",
            RecordStatus::Dismissed => "dismissed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "open" => Some(RecordStatus::Open),
            "resolved" => Some(RecordStatus::Resolved),
            "dismissed" => Some(RecordStatus::Dismissed),
            _ => None,
        }
    }
}

/// Merit award tiers, ordered from least to most valuable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeritTier {
    Bronze,
    Silver,
    Gold,
    Diamond,
    Platinum,
}

impl MeritTier {
    pub const ALL: [MeritTier; 5] = [
        MeritTier::Bronze,
        MeritTier::Silver,
        MeritTier::Gold,
        MeritTier::Diamond,
        MeritTier::Platinum,
    ];

    pub fn points(self) -> f64 {
        match self {
            MeritTier::Bronze => 1.0,
            MeritTier::Silver => 2.0,
            MeritTier::Gold => 3.0,
            MeritTier::Diamond => 4.0,
            MeritTier::Platinum => 5.0,
        }
    }

    pub fn color(self) -> &'static str {
        match self {
            MeritTier::Bronze => "#cd7f32",
            MeritTier::Silver => "#c0c0c0",
            MeritTier::Gold => "#ffd700",
            MeritTier::Diamond => "#b9f2ff",
            MeritTier::Platinum => "#e5e4e2",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MeritTier::Bronze => "bronze",
            MeritTier::Silver => "silver",
            MeritTier::Gold => "gold",
            MeritTier::Diamond => "diamond",
            MeritTier::Platinum => "platinum",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|tier| tier.as_str().eq_ignore_ascii_case(value.trim()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorRecord {
    pub id: Uuid,
    pub student_id: Uuid,
    pub kind: RecordKind,
    pub occurred_at: DateTime<Utc>,
    /// Incident severity 1-5; `None` is scored as 1.
    pub severity: Option<i32>,
    pub category: Option<String>,
    pub misdemeanor_id: Option<Uuid>,
    pub points: Option<f64>,
    pub merit_tier: Option<MeritTier>,
    pub description: String,
    pub location: Option<String>,
    pub offense_ordinal: Option<u32>,
    pub status: RecordStatus,
    pub reported_by: Option<String>,
}

impl BehaviorRecord {
    pub fn incident(
        student_id: Uuid,
        occurred_at: DateTime<Utc>,
        category: &str,
        severity: i32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            student_id,
            kind: RecordKind::Incident,
            occurred_at,
            severity: Some(severity),
            category: Some(category.to_string()),
            misdemeanor_id: None,
            points: None,
            merit_tier: None,
            description: String::new(),
            location: None,
            offense_ordinal: None,
            status: RecordStatus::Open,
            reported_by: None,
        }
    }

    pub fn merit(student_id: Uuid, occurred_at: DateTime<Utc>, tier: MeritTier) -> Self {
        Self {
            id: Uuid::new_v4(),
            student_id,
            kind: RecordKind::Merit,
            occurred_at,
            severity: None,
            category: None,
            misdemeanor_id: None,
            points: Some(tier.points()),
            merit_tier: Some(tier),
            description: String::new(),
            location: None,
            offense_ordinal: None,
            status: RecordStatus::Open,
            reported_by: None,
        }
    }

    pub fn is_incident(&self) -> bool {
        self.kind == RecordKind::Incident
    }

    pub fn is_merit(&self) -> bool {
        self.kind == RecordKind::Merit
    }

    /// Category used to group repeat offenses.
    pub fn offense_key(&self) -> String {
        match (&self.category, self.misdemeanor_id) {
            (Some(category), _) if !category.trim().is_empty() => {
                category.trim().to_ascii_lowercase()
            }
            (_, Some(id)) => id.to_string(),
            _ => "uncategorized".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Student {
    pub id: Uuid,
    pub full_name: String,
    pub grade: String,
    pub boarding: bool,
    pub behavior_score: f64,
    pub needs_counseling: bool,
    pub counseling_manual: bool,
}

impl Student {
    pub fn new(full_name: &str, grade: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            full_name: full_name.to_string(),
            grade: grade.to_string(),
            boarding: false,
            behavior_score: 0.0,
            needs_counseling: false,
            counseling_manual: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Misdemeanor {
    pub id: Uuid,
    pub name: String,
    pub category: String,
    pub severity: i32,
    pub location: Option<String>,
    /// Progressive sanctions for the 1st, 2nd, 3rd... offense.
    pub sanctions: Vec<String>,
}

impl Misdemeanor {
    pub fn sanction_for(&self, ordinal: u32) -> Option<&str> {
        if self.sanctions.is_empty() {
            return None;
        }
        let index = (ordinal.max(1) as usize - 1).min(self.sanctions.len() - 1);
        self.sanctions.get(index).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub student_id: Uuid,
    pub risk_score: f64,
    pub risk_level: RiskTier,
    pub factors: Vec<String>,
    pub predicted_outcome: String,
    pub suggested_intervention: String,
    pub confidence: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merit_tiers_are_ordered_by_points() {
        for pair in MeritTier::ALL.windows(2) {
            assert!(pair[0] < pair[1]);
            assert!(pair[0].points() < pair[1].points());
        }
        assert_eq!(MeritTier::parse(" Gold "), Some(MeritTier::Gold));
        assert_eq!(MeritTier::parse("tin"), None);
    }

    #[test]
    fn sanction_saturates_at_last_entry() {
        let misdemeanor = Misdemeanor {
            id: Uuid::new_v4(),
            name: "Late to class".to_string(),
            category: "punctuality".to_string(),
            severity: 1,
            location: None,
            sanctions: vec![
                "Verbal warning".to_string(),
                "Detention".to_string(),
                "Parent meeting".to_string(),
            ],
        };
        assert_eq!(misdemeanor.sanction_for(1), Some("Verbal warning"));
        assert_eq!(misdemeanor.sanction_for(3), Some("Parent meeting"));
        assert_eq!(misdemeanor.sanction_for(7), Some("Parent meeting"));
        assert_eq!(misdemeanor.sanction_for(0), Some("Verbal warning"));
    }

    #[test]
    fn offense_key_prefers_category() {
        let student = Uuid::new_v4();
        let record = BehaviorRecord::incident(student, Utc::now(), " Fighting ", 4);
        assert_eq!(record.offense_key(), "fighting");

        let mut bare = BehaviorRecord::incident(student, Utc::now(), "", 2);
        assert_eq!(bare.offense_key(), "uncategorized");
        let id = Uuid::new_v4();
        bare.misdemeanor_id = Some(id);
        assert_eq!(bare.offense_key(), id.to_string());
    }
}
