//! Persistence seams for facts and trend rows.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::error::{QualityError, QualityResult};
use crate::models::{
    Assessment, DailyTrend, FactSet, ResourceScoreRecord, TrendKey, TrendMetrics,
    ValidationIssue,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Rows actually written by an append; replayed facts count as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendOutcome {
    pub assessments: u64,
    pub scores: u64,
    pub issues: u64,
}

impl AppendOutcome {
    pub fn is_replay(&self) -> bool {
        self.assessments == 0 && self.scores == 0 && self.issues == 0
    }
}

fn conflicting_replay(assessment_id: &str) -> QualityError {
    QualityError::integrity(format!(
        "assessment {assessment_id} was already ingested with different facts"
    ))
}

/// Append-only fact storage.
#[async_trait]
pub trait FactStore: Send + Sync {
    /// Writes one assessment's facts atomically. Re-sending the same fact set
    /// is a replay and writes nothing; a different fact set under a known
    /// assessment id is an `Integrity` error.
    async fn append_facts(&self, facts: &FactSet) -> QualityResult<AppendOutcome>;

    /// Score records in the partitions for `date`, any resource type.
    async fn scores_on(&self, date: NaiveDate) -> QualityResult<Vec<ResourceScoreRecord>>;

    /// Issues in the detection partition for `date`.
    async fn issues_on(&self, date: NaiveDate) -> QualityResult<Vec<ValidationIssue>>;

    /// Score records executed within `from..=to`. Empty when `from > to`.
    async fn scores_between(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> QualityResult<Vec<ResourceScoreRecord>>;

    /// Issues detected within `from..=to`. Empty when `from > to`.
    async fn issues_between(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> QualityResult<Vec<ValidationIssue>>;

    async fn assessments_by_id(&self, ids: &[String]) -> QualityResult<Vec<Assessment>>;

    /// Distinct execution dates that hold score records, oldest first.
    async fn score_partition_dates(&self) -> QualityResult<Vec<NaiveDate>>;

    /// Creation time of the newest assessment, for freshness checks.
    async fn latest_assessment_at(&self) -> QualityResult<Option<DateTime<Utc>>>;
}

/// Keyed, mutable rollup storage.
#[async_trait]
pub trait TrendStore: Send + Sync {
    async fn get_trend(&self, key: &TrendKey) -> QualityResult<Option<DailyTrend>>;

    async fn trends_on(&self, date: NaiveDate) -> QualityResult<Vec<DailyTrend>>;

    async fn trends_between(&self, from: NaiveDate, to: NaiveDate) -> QualityResult<Vec<DailyTrend>>;

    /// Compare-and-swap upsert. `expected_version` is `None` when the caller
    /// saw no row for the key. A mismatch yields `ConcurrentUpdateConflict`
    /// and writes nothing.
    async fn upsert_trend(
        &self,
        metrics: &TrendMetrics,
        expected_version: Option<i64>,
    ) -> QualityResult<DailyTrend>;
}
