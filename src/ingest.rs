//! Batch ingestion. Each payload is its own failure domain: a rejected or
//! failed assessment is recorded and the others still land.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::NaiveDate;
use tokio::task::JoinSet;

use crate::error::{QualityError, QualityResult};
use crate::normalize::normalize_value;
use crate::payload::split_document;
use crate::retry::RetryPolicy;
use crate::store::{AppendOutcome, FactStore};

#[derive(Debug)]
pub struct Ingested {
    pub assessment_id: String,
    pub execution_date: NaiveDate,
    pub outcome: AppendOutcome,
}

#[derive(Debug)]
pub struct Rejected {
    /// Position of the payload in the submitted document.
    pub index: usize,
    pub error: QualityError,
}

#[derive(Debug, Default)]
pub struct IngestReport {
    pub ingested: Vec<Ingested>,
    pub rejected: Vec<Rejected>,
}

impl IngestReport {
    /// Execution dates that received new facts and need re-aggregation.
    pub fn dirty_dates(&self) -> BTreeSet<NaiveDate> {
        self.ingested
            .iter()
            .filter(|item| !item.outcome.is_replay())
            .map(|item| item.execution_date)
            .collect()
    }

    pub fn replays(&self) -> usize {
        self.ingested
            .iter()
            .filter(|item| item.outcome.is_replay())
            .count()
    }
}

async fn ingest_one(
    store: Arc<dyn FactStore>,
    retry: RetryPolicy,
    value: serde_json::Value,
) -> QualityResult<Ingested> {
    let facts = normalize_value(value)?;
    let outcome = retry
        .run("append_facts", || store.append_facts(&facts))
        .await?;
    Ok(Ingested {
        assessment_id: facts.assessment.assessment_id.clone(),
        execution_date: facts.assessment.executed_at.date_naive(),
        outcome,
    })
}

/// Normalizes and appends every payload concurrently.
pub async fn ingest_values(
    store: Arc<dyn FactStore>,
    retry: &RetryPolicy,
    values: Vec<serde_json::Value>,
) -> IngestReport {
    let mut tasks = JoinSet::new();
    for (index, value) in values.into_iter().enumerate() {
        let store = store.clone();
        let retry = retry.clone();
        // The inner task holds the fallible work, so a panic still reports its index.
        tasks.spawn(async move {
            let joined = tokio::spawn(ingest_one(store, retry, value)).await;
            (index, joined)
        });
    }

    let mut report = IngestReport::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, Ok(Ok(ingested)))) => {
                tracing::info!(
                    assessment_id = %ingested.assessment_id,
                    scores = ingested.outcome.scores,
                    issues = ingested.outcome.issues,
                    replay = ingested.outcome.is_replay(),
                    "assessment ingested",
                );
                report.ingested.push(ingested);
            }
            Ok((index, Ok(Err(error)))) => {
                tracing::warn!(index, error = %error, "assessment rejected");
                report.rejected.push(Rejected { index, error });
            }
            Ok((index, Err(join_error))) => {
                tracing::error!(index, error = %join_error, "ingestion task aborted");
                report.rejected.push(Rejected {
                    index,
                    error: QualityError::store(format!("ingestion task aborted: {join_error}")),
                });
            }
            Err(join_error) => {
                tracing::error!(error = %join_error, "ingestion task aborted");
            }
        }
    }

    report.ingested.sort_by(|a, b| a.assessment_id.cmp(&b.assessment_id));
    report.rejected.sort_by_key(|rejected| rejected.index);
    report
}

pub async fn ingest_file(
    store: Arc<dyn FactStore>,
    retry: &RetryPolicy,
    path: &Path,
) -> anyhow::Result<IngestReport> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let values = split_document(&raw)
        .with_context(|| format!("{} is not valid JSON", path.display()))?;
    Ok(ingest_values(store, retry, values).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Assessment, FactSet, ResourceScoreRecord, ValidationIssue};
    use crate::store::MemoryStore;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde_json::json;

    /// Panics while appending one chosen assessment.
    struct PanicsOn {
        assessment_id: &'static str,
        inner: MemoryStore,
    }

    #[async_trait]
    impl FactStore for PanicsOn {
        async fn append_facts(&self, facts: &FactSet) -> QualityResult<AppendOutcome> {
            if facts.assessment.assessment_id == self.assessment_id {
                panic!("append blew up");
            }
            self.inner.append_facts(facts).await
        }
        async fn scores_on(&self, date: NaiveDate) -> QualityResult<Vec<ResourceScoreRecord>> {
            self.inner.scores_on(date).await
        }
        async fn issues_on(&self, date: NaiveDate) -> QualityResult<Vec<ValidationIssue>> {
            self.inner.issues_on(date).await
        }
        async fn scores_between(&self, from: NaiveDate, to: NaiveDate) -> QualityResult<Vec<ResourceScoreRecord>> {
            self.inner.scores_between(from, to).await
        }
        async fn issues_between(&self, from: NaiveDate, to: NaiveDate) -> QualityResult<Vec<ValidationIssue>> {
            self.inner.issues_between(from, to).await
        }
        async fn assessments_by_id(&self, ids: &[String]) -> QualityResult<Vec<Assessment>> {
            self.inner.assessments_by_id(ids).await
        }
        async fn score_partition_dates(&self) -> QualityResult<Vec<NaiveDate>> {
            self.inner.score_partition_dates().await
        }
        async fn latest_assessment_at(&self) -> QualityResult<Option<DateTime<Utc>>> {
            self.inner.latest_assessment_at().await
        }
    }

    fn payload(id: &str, at: &str) -> serde_json::Value {
        json!({
            "id": id,
            "userId": 4,
            "serverId": 9,
            "createdAt": at,
            "resources": ["Patient"],
            "sampleSize": 25,
            "validator": "hl7-validator",
            "qualityFramework": "kahn",
            "status": "completed",
            "resourceScores": [{
                "resourceType": "Patient",
                "overallScore": 70.0,
                "dimensionScores": { "completeness": 70.0, "conformity": 70.0, "plausibility": 70.0 }
            }],
            "topIssues": []
        })
    }

    #[tokio::test]
    async fn malformed_payloads_do_not_block_others() {
        let store = Arc::new(MemoryStore::new());
        let mut broken = payload("a-2", "2026-02-03T10:00:00Z");
        broken["resourceScores"][0]["dimensionScores"]
            .as_object_mut()
            .unwrap()
            .remove("conformity");

        let report = ingest_values(
            store.clone(),
            &RetryPolicy::immediate(1),
            vec![payload("a-1", "2026-02-03T10:00:00Z"), broken, payload("a-3", "2026-02-05T10:00:00Z")],
        )
        .await;

        assert_eq!(report.ingested.len(), 2);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].index, 1);
        assert_matches!(report.rejected[0].error, QualityError::MalformedPayload { .. });
        assert!(store
            .assessments_by_id(&["a-2".to_string()])
            .await
            .unwrap()
            .is_empty());

        let dates: Vec<_> = report.dirty_dates().into_iter().collect();
        assert_eq!(
            dates,
            vec![
                NaiveDate::from_ymd_opt(2026, 2, 3).unwrap(),
                NaiveDate::from_ymd_opt(2026, 2, 5).unwrap()
            ]
        );
    }

    #[tokio::test]
    async fn replayed_document_is_reported_as_replay() {
        let store = Arc::new(MemoryStore::new());
        let retry = RetryPolicy::immediate(1);
        let values = vec![payload("a-1", "2026-02-03T10:00:00Z")];

        ingest_values(store.clone(), &retry, values.clone()).await;
        let again = ingest_values(store.clone(), &retry, values).await;

        assert_eq!(again.replays(), 1);
        assert!(again.dirty_dates().is_empty());
        let date = NaiveDate::from_ymd_opt(2026, 2, 3).unwrap();
        assert_eq!(store.scores_on(date).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn panicking_task_is_reported_as_rejected() {
        let store = Arc::new(PanicsOn {
            assessment_id: "a-2",
            inner: MemoryStore::new(),
        });
        let report = ingest_values(
            store,
            &RetryPolicy::immediate(1),
            vec![
                payload("a-1", "2026-02-03T10:00:00Z"),
                payload("a-2", "2026-02-03T11:00:00Z"),
                payload("a-3", "2026-02-03T12:00:00Z"),
            ],
        )
        .await;

        assert_eq!(report.ingested.len(), 2);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].index, 1);
        assert_matches!(&report.rejected[0].error, QualityError::Store(reason) if reason.contains("aborted"));
    }
}
