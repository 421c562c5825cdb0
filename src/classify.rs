use serde::{Deserialize, Serialize};

pub const EXCELLENT_MAX: f64 = 3.0;
pub const GOOD_MAX: f64 = 5.0;
pub const WARNING_MAX: f64 = 7.0;

/// Risk tier for a heat score. Each tier covers `(lower, upper]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    Excellent,
    Good,
    Warning,
    Critical,
}

impl RiskTier {
    pub fn label(self) -> &'static str {
        match self {
            RiskTier::Excellent => "Excellent",
            RiskTier::Good => "Good",
            RiskTier::Warning => "Warning",
            RiskTier::Critical => "Critical",
        }
    }

    pub fn color(self) -> &'static str {
        match self {
            RiskTier::Excellent => "green",
            RiskTier::Good => "blue",
            RiskTier::Warning => "orange",
            RiskTier::Critical => "red",
        }
    }

    pub fn advice(self) -> &'static str {
        match self {
            RiskTier::Excellent => "Behavior is on track; keep recognising merits.",
            RiskTier::Good => "Minor concerns; monitor for new incidents.",
            RiskTier::Warning => "Pattern forming; schedule a check-in with the student.",
            RiskTier::Critical => "Immediate intervention required; involve counseling and parents.",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "excellent" => Some(RiskTier::Excellent),
            "good" => Some(RiskTier::Good),
            "warning" => Some(RiskTier::Warning),
            "critical" => Some(RiskTier::Critical),
            _ => None,
        }
    }
}

pub fn classify(score: f64) -> RiskTier {
    if score.is_nan() || score <= EXCELLENT_MAX {
        RiskTier::Excellent
    } else if score <= GOOD_MAX {
        RiskTier::Good
    } else if score <= WARNING_MAX {
        RiskTier::Warning
    } else {
        RiskTier::Critical
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundaries_are_upper_inclusive() {
        assert_eq!(classify(3.0), RiskTier::Excellent);
        assert_eq!(classify(3.0001), RiskTier::Good);
        assert_eq!(classify(5.0), RiskTier::Good);
        assert_eq!(classify(5.0001), RiskTier::Warning);
        assert_eq!(classify(7.0), RiskTier::Warning);
        assert_eq!(classify(7.0001), RiskTier::Critical);
    }

    #[test]
    fn out_of_range_values_are_total() {
        assert_eq!(classify(-4.0), RiskTier::Excellent);
        assert_eq!(classify(f64::NAN), RiskTier::Excellent);
        assert_eq!(classify(42.0), RiskTier::Critical);
        assert_eq!(classify(f64::INFINITY), RiskTier::Critical);
    }

    #[test]
    fn tiers_parse_from_labels() {
        for tier in [
            RiskTier::Excellent,
            RiskTier::Good,
            RiskTier::Warning,
            RiskTier::Critical,
        ] {
            assert_eq!(RiskTier::parse(tier.label()), Some(tier));
        }
    }
}
