//! In-process backend used by `preview` and the test suite.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::{QualityError, QualityResult};
use crate::models::{
    Assessment, DailyTrend, FactSet, ResourceScoreRecord, TrendKey, TrendMetrics,
    ValidationIssue,
};
use crate::normalize::fact_digest;
use crate::partition::{IssuePartition, ScorePartition};
use crate::store::{conflicting_replay, AppendOutcome, FactStore, TrendStore};

#[derive(Default)]
struct FactTables {
    assessments: HashMap<String, Assessment>,
    digests: HashMap<String, String>,
    scores: BTreeMap<ScorePartition, Vec<ResourceScoreRecord>>,
    score_ids: HashSet<String>,
    issues: BTreeMap<IssuePartition, Vec<ValidationIssue>>,
    issue_ids: HashSet<String>,
}

/// Facts sit behind one lock so a fact group lands all at once. Trend rows
/// live in a `DashMap`, whose entry guard serializes writers per key.
#[derive(Default)]
pub struct MemoryStore {
    facts: RwLock<FactTables>,
    trends: DashMap<TrendKey, DailyTrend>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Partitions currently holding score records.
    pub fn score_partitions(&self) -> QualityResult<Vec<ScorePartition>> {
        Ok(self.read()?.scores.keys().cloned().collect())
    }

    fn read(&self) -> QualityResult<RwLockReadGuard<'_, FactTables>> {
        self.facts
            .read()
            .map_err(|_| QualityError::store("fact tables lock poisoned"))
    }

    fn write(&self) -> QualityResult<RwLockWriteGuard<'_, FactTables>> {
        self.facts
            .write()
            .map_err(|_| QualityError::store("fact tables lock poisoned"))
    }
}

fn check_ownership(facts: &FactSet) -> QualityResult<()> {
    let owner = &facts.assessment.assessment_id;
    let orphan = facts
        .scores
        .iter()
        .map(|score| &score.assessment_id)
        .chain(facts.issues.iter().map(|issue| &issue.assessment_id))
        .find(|id| *id != owner);
    match orphan {
        Some(id) => Err(QualityError::integrity(format!(
            "fact references assessment {id} but belongs to {owner}"
        ))),
        None => Ok(()),
    }
}

#[async_trait]
impl FactStore for MemoryStore {
    async fn append_facts(&self, facts: &FactSet) -> QualityResult<AppendOutcome> {
        check_ownership(facts)?;
        let digest = fact_digest(facts);
        let mut tables = self.write()?;
        let mut outcome = AppendOutcome::default();

        let assessment_id = &facts.assessment.assessment_id;
        if let Some(stored) = tables.digests.get(assessment_id) {
            return if *stored == digest {
                Ok(outcome)
            } else {
                Err(conflicting_replay(assessment_id))
            };
        }
        tables.digests.insert(assessment_id.clone(), digest);
        tables
            .assessments
            .insert(assessment_id.clone(), facts.assessment.clone());
        outcome.assessments += 1;

        for score in &facts.scores {
            if tables.score_ids.insert(score.result_id.clone()) {
                tables
                    .scores
                    .entry(ScorePartition::of(score))
                    .or_default()
                    .push(score.clone());
                outcome.scores += 1;
            }
        }

        for issue in &facts.issues {
            if tables.issue_ids.insert(issue.issue_id.clone()) {
                tables
                    .issues
                    .entry(IssuePartition::of(issue))
                    .or_default()
                    .push(issue.clone());
                outcome.issues += 1;
            }
        }

        Ok(outcome)
    }

    async fn scores_on(&self, date: NaiveDate) -> QualityResult<Vec<ResourceScoreRecord>> {
        let tables = self.read()?;
        let start = ScorePartition {
            execution_date: date,
            resource_type: String::new(),
        };
        Ok(tables
            .scores
            .range(start..)
            .take_while(|(partition, _)| partition.execution_date == date)
            .flat_map(|(_, records)| records.iter().cloned())
            .collect())
    }

    async fn issues_on(&self, date: NaiveDate) -> QualityResult<Vec<ValidationIssue>> {
        let tables = self.read()?;
        Ok(tables
            .issues
            .get(&IssuePartition {
                detected_date: date,
            })
            .cloned()
            .unwrap_or_default())
    }

    async fn scores_between(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> QualityResult<Vec<ResourceScoreRecord>> {
        if from > to {
            return Ok(Vec::new());
        }
        let tables = self.read()?;
        let start = ScorePartition {
            execution_date: from,
            resource_type: String::new(),
        };
        Ok(tables
            .scores
            .range(start..)
            .take_while(|(partition, _)| partition.execution_date <= to)
            .flat_map(|(_, records)| records.iter().cloned())
            .collect())
    }

    async fn issues_between(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> QualityResult<Vec<ValidationIssue>> {
        if from > to {
            return Ok(Vec::new());
        }
        let tables = self.read()?;
        Ok(tables
            .issues
            .range(IssuePartition { detected_date: from }..=IssuePartition { detected_date: to })
            .flat_map(|(_, issues)| issues.iter().cloned())
            .collect())
    }

    async fn assessments_by_id(&self, ids: &[String]) -> QualityResult<Vec<Assessment>> {
        let tables = self.read()?;
        Ok(ids
            .iter()
            .filter_map(|id| tables.assessments.get(id).cloned())
            .collect())
    }

    async fn score_partition_dates(&self) -> QualityResult<Vec<NaiveDate>> {
        let tables = self.read()?;
        let mut dates: Vec<NaiveDate> = tables
            .scores
            .keys()
            .map(|partition| partition.execution_date)
            .collect();
        dates.dedup();
        Ok(dates)
    }

    async fn latest_assessment_at(&self) -> QualityResult<Option<DateTime<Utc>>> {
        let tables = self.read()?;
        Ok(tables
            .assessments
            .values()
            .map(|assessment| assessment.created_at)
            .max())
    }
}

#[async_trait]
impl TrendStore for MemoryStore {
    async fn get_trend(&self, key: &TrendKey) -> QualityResult<Option<DailyTrend>> {
        Ok(self.trends.get(key).map(|row| row.value().clone()))
    }

    async fn trends_on(&self, date: NaiveDate) -> QualityResult<Vec<DailyTrend>> {
        self.trends_between(date, date).await
    }

    async fn trends_between(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> QualityResult<Vec<DailyTrend>> {
        let mut rows: Vec<DailyTrend> = self
            .trends
            .iter()
            .filter(|row| row.key().date >= from && row.key().date <= to)
            .map(|row| row.value().clone())
            .collect();
        rows.sort_by_key(DailyTrend::key);
        Ok(rows)
    }

    async fn upsert_trend(
        &self,
        metrics: &TrendMetrics,
        expected_version: Option<i64>,
    ) -> QualityResult<DailyTrend> {
        match self.trends.entry(metrics.key.clone()) {
            Entry::Occupied(mut slot) => {
                let current = slot.get().version;
                if expected_version != Some(current) {
                    return Err(QualityError::ConcurrentUpdateConflict(metrics.key.clone()));
                }
                let row = DailyTrend::stamp(metrics, Utc::now(), current + 1);
                slot.insert(row.clone());
                Ok(row)
            }
            Entry::Vacant(slot) => {
                if expected_version.is_some() {
                    return Err(QualityError::ConcurrentUpdateConflict(metrics.key.clone()));
                }
                let row = DailyTrend::stamp(metrics, Utc::now(), 1);
                slot.insert(row.clone());
                Ok(row)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize_value;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 2, d).unwrap()
    }

    fn facts(id: &str, completed_at: &str, resource_type: &str) -> FactSet {
        normalize_value(json!({
            "id": id,
            "userId": 1,
            "serverId": 1,
            "createdAt": completed_at,
            "completedAt": completed_at,
            "resources": [resource_type],
            "sampleSize": 10,
            "validator": "hl7-validator",
            "qualityFramework": "kahn",
            "status": "completed",
            "resourceScores": [{
                "resourceType": resource_type,
                "overallScore": 80.0,
                "dimensionScores": { "completeness": 80.0, "conformity": 80.0, "plausibility": 80.0 }
            }],
            "topIssues": [{
                "resourceType": resource_type,
                "dimension": "conformity",
                "severity": "info",
                "message": "profile not declared"
            }]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn replayed_facts_are_not_duplicated() {
        let store = MemoryStore::new();
        let set = facts("a-1", "2026-02-03T10:00:00Z", "Patient");

        let first = store.append_facts(&set).await.unwrap();
        assert_eq!(first, AppendOutcome { assessments: 1, scores: 1, issues: 1 });

        let second = store.append_facts(&set).await.unwrap();
        assert!(second.is_replay());
        assert_eq!(store.scores_on(day(3)).await.unwrap().len(), 1);
        assert_eq!(store.issues_on(day(3)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn conflicting_reingest_is_rejected_without_new_facts() {
        let store = MemoryStore::new();
        store
            .append_facts(&facts("a-1", "2026-02-03T10:00:00Z", "Patient"))
            .await
            .unwrap();

        let mut changed = facts("a-1", "2026-02-05T10:00:00Z", "Observation");
        changed.assessment.owner_id = 99;
        assert_matches!(store.append_facts(&changed).await, Err(QualityError::Integrity(_)));

        assert!(store.scores_on(day(5)).await.unwrap().is_empty());
        assert!(store.issues_on(day(5)).await.unwrap().is_empty());
        let stored = store.assessments_by_id(&["a-1".to_string()]).await.unwrap();
        assert_eq!(stored[0].owner_id, 1);
        assert_eq!(stored[0].executed_at.date_naive(), day(3));
        assert_eq!(store.score_partitions().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn orphaned_facts_reject_the_whole_group() {
        let store = MemoryStore::new();
        let mut set = facts("a-1", "2026-02-03T10:00:00Z", "Patient");
        set.issues[0].assessment_id = "a-2".to_string();

        assert_matches!(store.append_facts(&set).await, Err(QualityError::Integrity(_)));
        assert!(store.scores_on(day(3)).await.unwrap().is_empty());
        assert!(store.assessments_by_id(&["a-1".to_string()]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn date_scans_stay_inside_their_partitions() {
        let store = MemoryStore::new();
        store.append_facts(&facts("a-1", "2026-02-03T10:00:00Z", "Patient")).await.unwrap();
        store.append_facts(&facts("a-2", "2026-02-03T11:00:00Z", "Observation")).await.unwrap();
        store.append_facts(&facts("a-3", "2026-02-04T00:00:01Z", "Patient")).await.unwrap();

        let on_third = store.scores_on(day(3)).await.unwrap();
        assert_eq!(on_third.len(), 2);
        assert!(on_third.iter().all(|score| score.execution_date == day(3)));
        assert_eq!(store.score_partition_dates().await.unwrap(), vec![day(3), day(4)]);
        assert_eq!(store.scores_between(day(3), day(4)).await.unwrap().len(), 3);
        assert_eq!(store.issues_between(day(4), day(9)).await.unwrap().len(), 1);
        assert!(store.scores_between(day(4), day(3)).await.unwrap().is_empty());
        assert_eq!(store.score_partitions().unwrap().len(), 3);
        assert_eq!(
            store.latest_assessment_at().await.unwrap().map(|at| at.date_naive()),
            Some(day(4))
        );
    }

    #[tokio::test]
    async fn upsert_is_compare_and_swap() {
        let store = MemoryStore::new();
        let metrics = TrendMetrics {
            key: TrendKey::new(day(3), 1, "Patient"),
            avg_quality_score: 80.0,
            total_resources_evaluated: 1,
            total_issues: 0,
            assessment_count: 1,
        };

        let inserted = store.upsert_trend(&metrics, None).await.unwrap();
        assert_eq!(inserted.version, 1);

        assert_matches!(
            store.upsert_trend(&metrics, None).await,
            Err(QualityError::ConcurrentUpdateConflict(_))
        );
        assert_matches!(
            store.upsert_trend(&metrics, Some(7)).await,
            Err(QualityError::ConcurrentUpdateConflict(_))
        );

        let updated = store.upsert_trend(&metrics, Some(1)).await.unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(store.trends_on(day(3)).await.unwrap(), vec![updated]);
        assert!(store.trends_on(day(4)).await.unwrap().is_empty());
    }
}
