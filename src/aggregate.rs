//! Daily trend rollups.
//!
//! A run for one date reads the stored versions of that date's trend rows,
//! then the date's fact partitions, derives every `(date, owner, resource
//! type)` row and writes each one with a compare-and-swap upsert. Reading the
//! versions before the facts is what makes a successful swap safe: any row
//! committed earlier was derived from facts no newer than ours. A key that
//! loses the swap re-reads its version and the facts and tries again.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::NaiveDate;
use uuid::Uuid;

use crate::error::{QualityError, QualityResult};
use crate::models::{
    DailyTrend, Dimension, DimensionAverages, OwnerId, ResourceScoreRecord, TrendKey,
    TrendMetrics, ValidationIssue,
};
use crate::retry::RetryPolicy;
use crate::store::{FactStore, TrendStore};

/// Facts of one date, as read from their partitions.
#[derive(Debug, Clone, Default)]
pub struct FactSnapshot {
    pub scores: Vec<ResourceScoreRecord>,
    pub issues: Vec<ValidationIssue>,
    pub owners: HashMap<String, OwnerId>,
}

#[derive(Debug, Clone, Default)]
pub struct TrendComputation {
    pub rows: Vec<TrendMetrics>,
    /// Score records whose assessment could not be found.
    pub orphaned: usize,
}

#[derive(Debug)]
pub struct KeyFailure {
    pub key: TrendKey,
    pub error: QualityError,
}

#[derive(Debug)]
pub struct AggregationOutcome {
    pub run_id: Uuid,
    pub date: NaiveDate,
    pub touched: Vec<TrendKey>,
    pub failed: Vec<KeyFailure>,
    pub orphaned: usize,
}

impl AggregationOutcome {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.orphaned == 0
    }
}

#[derive(Default)]
struct Accumulator {
    score_sum: f64,
    records: i64,
    assessments: BTreeSet<String>,
    issues: i64,
}

/// Derives trend metrics for `date`. Records outside the date are ignored, so
/// a snapshot that strays across partitions cannot leak into another day.
pub fn compute_trends(date: NaiveDate, snapshot: &FactSnapshot) -> TrendComputation {
    let mut issue_counts: HashMap<(&str, &str), i64> = HashMap::new();
    for issue in snapshot.issues.iter().filter(|issue| issue.detected_date() == date) {
        *issue_counts
            .entry((issue.assessment_id.as_str(), issue.resource_type.as_str()))
            .or_insert(0) += 1;
    }

    let mut groups: BTreeMap<TrendKey, Accumulator> = BTreeMap::new();
    let mut orphaned = 0;
    for record in snapshot.scores.iter().filter(|record| record.execution_date == date) {
        let Some(owner_id) = snapshot.owners.get(&record.assessment_id) else {
            tracing::warn!(
                result_id = %record.result_id,
                assessment_id = %record.assessment_id,
                "score record without assessment, skipped",
            );
            orphaned += 1;
            continue;
        };

        let key = TrendKey::new(date, *owner_id, record.resource_type.clone());
        let group = groups.entry(key).or_default();
        group.score_sum += record.quality_score;
        group.records += 1;
        // One record per (assessment, resource type), so each issue count joins once.
        if group.assessments.insert(record.assessment_id.clone()) {
            group.issues += issue_counts
                .get(&(record.assessment_id.as_str(), record.resource_type.as_str()))
                .copied()
                .unwrap_or(0);
        }
    }

    let rows = groups
        .into_iter()
        .map(|(key, group)| TrendMetrics {
            key,
            avg_quality_score: group.score_sum / group.records as f64,
            total_resources_evaluated: group.records,
            total_issues: group.issues,
            assessment_count: group.assessments.len() as i64,
        })
        .collect();

    TrendComputation { rows, orphaned }
}

/// Per resource type, each dimension averaged over the records that carry it.
/// A dimension no record carries stays `None`.
pub fn dimension_averages(records: &[ResourceScoreRecord]) -> Vec<DimensionAverages> {
    let mut sums: BTreeMap<&str, (usize, [(f64, usize); 5])> = BTreeMap::new();
    for record in records {
        let (count, dims) = sums
            .entry(record.resource_type.as_str())
            .or_insert((0, [(0.0, 0); 5]));
        *count += 1;
        for (slot, dimension) in dims.iter_mut().zip(Dimension::ALL) {
            if let Some(score) = record.dimensions.get(dimension) {
                slot.0 += score;
                slot.1 += 1;
            }
        }
    }

    sums.into_iter()
        .map(|(resource_type, (record_count, dims))| {
            let avg = |(sum, n): (f64, usize)| (n > 0).then(|| sum / n as f64);
            DimensionAverages {
                resource_type: resource_type.to_string(),
                record_count,
                completeness: avg(dims[0]),
                conformity: avg(dims[1]),
                plausibility: avg(dims[2]),
                timeliness: avg(dims[3]),
                calculability: avg(dims[4]),
            }
        })
        .collect()
}

pub struct TrendAggregator {
    facts: Arc<dyn FactStore>,
    trends: Arc<dyn TrendStore>,
    retry: RetryPolicy,
    conflict_retries: u32,
}

impl TrendAggregator {
    pub fn new(facts: Arc<dyn FactStore>, trends: Arc<dyn TrendStore>) -> Self {
        Self {
            facts,
            trends,
            retry: RetryPolicy::default(),
            conflict_retries: 8,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_conflict_retries(mut self, conflict_retries: u32) -> Self {
        self.conflict_retries = conflict_retries;
        self
    }

    /// Recomputes every trend row for `date`. Failing to read the date's facts
    /// fails the run; a failure on one key is recorded and the rest carry on.
    pub async fn run_aggregation(&self, date: NaiveDate) -> QualityResult<AggregationOutcome> {
        let run_id = Uuid::new_v4();
        let versions: HashMap<TrendKey, i64> = self
            .retry
            .run("trends_on", || self.trends.trends_on(date))
            .await?
            .into_iter()
            .map(|row| (row.key(), row.version))
            .collect();

        let snapshot = self.load_snapshot(date).await?;
        let computation = compute_trends(date, &snapshot);

        let mut touched = Vec::with_capacity(computation.rows.len());
        let mut failed = Vec::new();
        for metrics in computation.rows {
            let key = metrics.key.clone();
            let expected = versions.get(&key).copied();
            match self.merge(date, metrics, expected).await {
                Ok(row) => {
                    tracing::debug!(%run_id, key = %key, version = row.version, "trend merged");
                    touched.push(key);
                }
                Err(error) => {
                    tracing::warn!(%run_id, key = %key, error = %error, "trend merge failed");
                    failed.push(KeyFailure { key, error });
                }
            }
        }

        tracing::info!(
            %run_id,
            %date,
            touched = touched.len(),
            failed = failed.len(),
            orphaned = computation.orphaned,
            "aggregation finished",
        );

        Ok(AggregationOutcome {
            run_id,
            date,
            touched,
            failed,
            orphaned: computation.orphaned,
        })
    }

    pub async fn get_trend(&self, key: &TrendKey) -> QualityResult<Option<DailyTrend>> {
        self.retry.run("get_trend", || self.trends.get_trend(key)).await
    }

    async fn load_snapshot(&self, date: NaiveDate) -> QualityResult<FactSnapshot> {
        let scores = self
            .retry
            .run("scores_on", || self.facts.scores_on(date))
            .await?;
        let issues = self
            .retry
            .run("issues_on", || self.facts.issues_on(date))
            .await?;

        let ids: Vec<String> = scores
            .iter()
            .map(|score| score.assessment_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let owners = self
            .retry
            .run("assessments_by_id", || self.facts.assessments_by_id(&ids))
            .await?
            .into_iter()
            .map(|assessment| (assessment.assessment_id, assessment.owner_id))
            .collect();

        Ok(FactSnapshot {
            scores,
            issues,
            owners,
        })
    }

    async fn merge(
        &self,
        date: NaiveDate,
        mut metrics: TrendMetrics,
        mut expected: Option<i64>,
    ) -> QualityResult<DailyTrend> {
        let key = metrics.key.clone();
        let mut conflicts = 0u32;

        loop {
            let attempt = self
                .retry
                .run("upsert_trend", || self.trends.upsert_trend(&metrics, expected))
                .await;
            match attempt {
                Ok(row) => return Ok(row),
                Err(QualityError::ConcurrentUpdateConflict(_)) if conflicts < self.conflict_retries => {
                    conflicts += 1;
                    tracing::warn!(key = %key, conflicts, "trend row changed underneath, recomputing");

                    expected = self.get_trend(&key).await?.map(|row| row.version);
                    let snapshot = self.load_snapshot(date).await?;
                    metrics = compute_trends(date, &snapshot)
                        .rows
                        .into_iter()
                        .find(|fresh| fresh.key == key)
                        .ok_or_else(|| {
                            QualityError::integrity(format!("facts behind {key} are gone"))
                        })?;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
