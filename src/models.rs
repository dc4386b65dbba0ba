use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub type OwnerId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssessmentStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl AssessmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for AssessmentStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown assessment status '{other}'")),
        }
    }
}

/// The five quality dimensions a resource score is composed of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dimension {
    Completeness,
    Conformity,
    Plausibility,
    Timeliness,
    Calculability,
}

impl Dimension {
    pub const ALL: [Dimension; 5] = [
        Self::Completeness,
        Self::Conformity,
        Self::Plausibility,
        Self::Timeliness,
        Self::Calculability,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completeness => "completeness",
            Self::Conformity => "conformity",
            Self::Plausibility => "plausibility",
            Self::Timeliness => "timeliness",
            Self::Calculability => "calculability",
        }
    }
}

impl FromStr for Dimension {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|dimension| dimension.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| format!("unknown dimension '{value}'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown severity '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub assessment_id: String,
    pub owner_id: OwnerId,
    pub target_server: String,
    pub executed_at: DateTime<Utc>,
    pub resources: Vec<String>,
    pub sample_size: i32,
    pub validator: String,
    pub framework: String,
    pub status: AssessmentStatus,
    pub overall_score: Option<f64>,
    pub created_at: DateTime<Utc>,
}

/// Per-dimension scores; `None` means the dimension does not apply.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DimensionScores {
    pub completeness: Option<f64>,
    pub conformity: Option<f64>,
    pub plausibility: Option<f64>,
    pub timeliness: Option<f64>,
    pub calculability: Option<f64>,
}

impl DimensionScores {
    pub fn get(&self, dimension: Dimension) -> Option<f64> {
        match dimension {
            Dimension::Completeness => self.completeness,
            Dimension::Conformity => self.conformity,
            Dimension::Plausibility => self.plausibility,
            Dimension::Timeliness => self.timeliness,
            Dimension::Calculability => self.calculability,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceScoreRecord {
    pub result_id: String,
    pub assessment_id: String,
    pub resource_type: String,
    pub quality_score: f64,
    pub dimensions: DimensionScores,
    pub execution_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationIssue {
    pub issue_id: String,
    pub result_id: String,
    pub assessment_id: String,
    pub resource_type: String,
    pub resource_id: String,
    pub dimension: Dimension,
    pub severity: Severity,
    pub message: String,
    pub field_path: Option<String>,
    pub is_auto_fixed: bool,
    pub detected_at: DateTime<Utc>,
}

impl ValidationIssue {
    pub fn detected_date(&self) -> NaiveDate {
        self.detected_at.date_naive()
    }
}

/// Everything one assessment payload normalizes into. Persisted as a unit.
#[derive(Debug, Clone, PartialEq)]
pub struct FactSet {
    pub assessment: Assessment,
    pub scores: Vec<ResourceScoreRecord>,
    pub issues: Vec<ValidationIssue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrendKey {
    pub date: NaiveDate,
    pub owner_id: OwnerId,
    pub resource_type: String,
}

impl TrendKey {
    pub fn new(date: NaiveDate, owner_id: OwnerId, resource_type: impl Into<String>) -> Self {
        Self {
            date,
            owner_id,
            resource_type: resource_type.into(),
        }
    }
}

impl fmt::Display for TrendKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.date, self.owner_id, self.resource_type)
    }
}

/// Derived metrics for one trend key, before they are stamped by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct TrendMetrics {
    pub key: TrendKey,
    pub avg_quality_score: f64,
    pub total_resources_evaluated: i64,
    pub total_issues: i64,
    pub assessment_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyTrend {
    pub date: NaiveDate,
    pub owner_id: OwnerId,
    pub resource_type: String,
    pub avg_quality_score: f64,
    pub total_resources_evaluated: i64,
    pub total_issues: i64,
    pub assessment_count: i64,
    pub updated_at: DateTime<Utc>,
    /// Bumped on every write; the compare-and-swap token for upserts.
    pub version: i64,
}

impl DailyTrend {
    pub fn stamp(metrics: &TrendMetrics, updated_at: DateTime<Utc>, version: i64) -> Self {
        Self {
            date: metrics.key.date,
            owner_id: metrics.key.owner_id,
            resource_type: metrics.key.resource_type.clone(),
            avg_quality_score: metrics.avg_quality_score,
            total_resources_evaluated: metrics.total_resources_evaluated,
            total_issues: metrics.total_issues,
            assessment_count: metrics.assessment_count,
            updated_at,
            version,
        }
    }

    pub fn key(&self) -> TrendKey {
        TrendKey::new(self.date, self.owner_id, self.resource_type.clone())
    }

    pub fn metrics(&self) -> TrendMetrics {
        TrendMetrics {
            key: self.key(),
            avg_quality_score: self.avg_quality_score,
            total_resources_evaluated: self.total_resources_evaluated,
            total_issues: self.total_issues,
            assessment_count: self.assessment_count,
        }
    }
}

/// Average of each dimension over the records where it is present.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DimensionAverages {
    pub resource_type: String,
    pub record_count: usize,
    pub completeness: Option<f64>,
    pub conformity: Option<f64>,
    pub plausibility: Option<f64>,
    pub timeliness: Option<f64>,
    pub calculability: Option<f64>,
}

impl DimensionAverages {
    pub fn get(&self, dimension: Dimension) -> Option<f64> {
        match dimension {
            Dimension::Completeness => self.completeness,
            Dimension::Conformity => self.conformity,
            Dimension::Plausibility => self.plausibility,
            Dimension::Timeliness => self.timeliness,
            Dimension::Calculability => self.calculability,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IssueSummary {
    pub dimension: Dimension,
    pub severity: Severity,
    pub message: String,
    pub occurrences: usize,
    pub affected_assessments: usize,
    pub auto_fix_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enums_parse_case_insensitively() {
        assert_eq!("Completed".parse::<AssessmentStatus>(), Ok(AssessmentStatus::Completed));
        assert_eq!("TIMELINESS".parse::<Dimension>(), Ok(Dimension::Timeliness));
        assert_eq!(" warning ".parse::<Severity>(), Ok(Severity::Warning));
        assert!("archived".parse::<AssessmentStatus>().is_err());
        assert!("accuracy".parse::<Dimension>().is_err());
    }

    #[test]
    fn trend_key_displays_as_path() {
        let key = TrendKey::new(NaiveDate::from_ymd_opt(2026, 3, 4).unwrap(), 7, "Patient");
        assert_eq!(key.to_string(), "2026-03-04/7/Patient");
    }

    #[test]
    fn stamped_trend_round_trips_metrics() {
        let metrics = TrendMetrics {
            key: TrendKey::new(NaiveDate::from_ymd_opt(2026, 3, 4).unwrap(), 7, "Patient"),
            avg_quality_score: 71.5,
            total_resources_evaluated: 4,
            total_issues: 3,
            assessment_count: 2,
        };
        let trend = DailyTrend::stamp(&metrics, Utc::now(), 1);
        assert_eq!(trend.metrics(), metrics);
        assert_eq!(trend.version, 1);
    }
}
