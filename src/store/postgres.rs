use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};

use crate::error::{QualityError, QualityResult};
use crate::models::{
    Assessment, DailyTrend, DimensionScores, FactSet, ResourceScoreRecord, TrendKey,
    TrendMetrics, ValidationIssue,
};
use crate::normalize::fact_digest;
use crate::store::{conflicting_replay, AppendOutcome, FactStore, TrendStore};

const TREND_COLUMNS: &str = "\
    date, owner_id, resource_type, avg_quality_score, total_resources_evaluated, \
    total_issues, assessment_count, updated_at, version";

const SCORE_COLUMNS: &str = "\
    result_id, assessment_id, resource_type, quality_score, completeness_score, \
    conformity_score, plausibility_score, timeliness_score, calculability_score, \
    execution_date";

const ISSUE_COLUMNS: &str = "\
    issue_id, result_id, assessment_id, resource_type, resource_id, dimension, \
    severity, message, field_path, is_auto_fixed, detected_at";

const ASSESSMENT_COLUMNS: &str = "\
    assessment_id, owner_id, target_server, executed_at, resources, sample_size, \
    validator, framework, status, overall_score, created_at";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> QualityResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn init_db(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn parse_column<T>(value: String, column: &str) -> QualityResult<T>
where
    T: std::str::FromStr<Err = String>,
{
    value
        .parse()
        .map_err(|err: String| QualityError::store(format!("bad {column} in store: {err}")))
}

fn score_from_row(row: &PgRow) -> QualityResult<ResourceScoreRecord> {
    Ok(ResourceScoreRecord {
        result_id: row.try_get("result_id")?,
        assessment_id: row.try_get("assessment_id")?,
        resource_type: row.try_get("resource_type")?,
        quality_score: row.try_get("quality_score")?,
        dimensions: DimensionScores {
            completeness: row.try_get("completeness_score")?,
            conformity: row.try_get("conformity_score")?,
            plausibility: row.try_get("plausibility_score")?,
            timeliness: row.try_get("timeliness_score")?,
            calculability: row.try_get("calculability_score")?,
        },
        execution_date: row.try_get("execution_date")?,
    })
}

fn issue_from_row(row: &PgRow) -> QualityResult<ValidationIssue> {
    Ok(ValidationIssue {
        issue_id: row.try_get("issue_id")?,
        result_id: row.try_get("result_id")?,
        assessment_id: row.try_get("assessment_id")?,
        resource_type: row.try_get("resource_type")?,
        resource_id: row.try_get("resource_id")?,
        dimension: parse_column(row.try_get("dimension")?, "dimension")?,
        severity: parse_column(row.try_get("severity")?, "severity")?,
        message: row.try_get("message")?,
        field_path: row.try_get("field_path")?,
        is_auto_fixed: row.try_get("is_auto_fixed")?,
        detected_at: row.try_get("detected_at")?,
    })
}

fn assessment_from_row(row: &PgRow) -> QualityResult<Assessment> {
    Ok(Assessment {
        assessment_id: row.try_get("assessment_id")?,
        owner_id: row.try_get("owner_id")?,
        target_server: row.try_get("target_server")?,
        executed_at: row.try_get("executed_at")?,
        resources: row.try_get("resources")?,
        sample_size: row.try_get("sample_size")?,
        validator: row.try_get("validator")?,
        framework: row.try_get("framework")?,
        status: parse_column(row.try_get("status")?, "status")?,
        overall_score: row.try_get("overall_score")?,
        created_at: row.try_get("created_at")?,
    })
}

fn trend_from_row(row: &PgRow) -> QualityResult<DailyTrend> {
    Ok(DailyTrend {
        date: row.try_get("date")?,
        owner_id: row.try_get("owner_id")?,
        resource_type: row.try_get("resource_type")?,
        avg_quality_score: row.try_get("avg_quality_score")?,
        total_resources_evaluated: row.try_get("total_resources_evaluated")?,
        total_issues: row.try_get("total_issues")?,
        assessment_count: row.try_get("assessment_count")?,
        updated_at: row.try_get("updated_at")?,
        version: row.try_get("version")?,
    })
}

#[async_trait]
impl FactStore for PgStore {
    async fn append_facts(&self, facts: &FactSet) -> QualityResult<AppendOutcome> {
        let digest = fact_digest(facts);
        let mut tx = self.pool.begin().await?;
        let mut outcome = AppendOutcome::default();
        let assessment = &facts.assessment;

        outcome.assessments = sqlx::query(&format!(
            "INSERT INTO fhir_quality.assessments_meta ({ASSESSMENT_COLUMNS}, content_digest) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             ON CONFLICT (assessment_id) DO NOTHING"
        ))
        .bind(&assessment.assessment_id)
        .bind(assessment.owner_id)
        .bind(&assessment.target_server)
        .bind(assessment.executed_at)
        .bind(&assessment.resources)
        .bind(assessment.sample_size)
        .bind(&assessment.validator)
        .bind(&assessment.framework)
        .bind(assessment.status.as_str())
        .bind(assessment.overall_score)
        .bind(assessment.created_at)
        .bind(&digest)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if outcome.assessments == 0 {
            // The conflicting insert waited for the first writer to commit.
            let stored: String = sqlx::query(
                "SELECT content_digest FROM fhir_quality.assessments_meta \
                 WHERE assessment_id = $1",
            )
            .bind(&assessment.assessment_id)
            .fetch_one(&mut *tx)
            .await?
            .try_get("content_digest")?;
            tx.rollback().await?;
            return if stored == digest {
                Ok(outcome)
            } else {
                Err(conflicting_replay(&assessment.assessment_id))
            };
        }

        for score in &facts.scores {
            outcome.scores += sqlx::query(&format!(
                "INSERT INTO fhir_quality.assessment_results ({SCORE_COLUMNS}) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
                 ON CONFLICT (result_id) DO NOTHING"
            ))
            .bind(&score.result_id)
            .bind(&score.assessment_id)
            .bind(&score.resource_type)
            .bind(score.quality_score)
            .bind(score.dimensions.completeness)
            .bind(score.dimensions.conformity)
            .bind(score.dimensions.plausibility)
            .bind(score.dimensions.timeliness)
            .bind(score.dimensions.calculability)
            .bind(score.execution_date)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        for issue in &facts.issues {
            outcome.issues += sqlx::query(&format!(
                "INSERT INTO fhir_quality.validation_issues ({ISSUE_COLUMNS}, detected_date) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
                 ON CONFLICT (issue_id) DO NOTHING"
            ))
            .bind(&issue.issue_id)
            .bind(&issue.result_id)
            .bind(&issue.assessment_id)
            .bind(&issue.resource_type)
            .bind(&issue.resource_id)
            .bind(issue.dimension.as_str())
            .bind(issue.severity.as_str())
            .bind(&issue.message)
            .bind(&issue.field_path)
            .bind(issue.is_auto_fixed)
            .bind(issue.detected_at)
            .bind(issue.detected_date())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn scores_on(&self, date: NaiveDate) -> QualityResult<Vec<ResourceScoreRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {SCORE_COLUMNS} FROM fhir_quality.assessment_results \
             WHERE execution_date = $1 ORDER BY resource_type, result_id"
        ))
        .bind(date)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(score_from_row).collect()
    }

    async fn issues_on(&self, date: NaiveDate) -> QualityResult<Vec<ValidationIssue>> {
        let rows = sqlx::query(&format!(
            "SELECT {ISSUE_COLUMNS} FROM fhir_quality.validation_issues \
             WHERE detected_date = $1 ORDER BY issue_id"
        ))
        .bind(date)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(issue_from_row).collect()
    }

    async fn scores_between(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> QualityResult<Vec<ResourceScoreRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {SCORE_COLUMNS} FROM fhir_quality.assessment_results \
             WHERE execution_date BETWEEN $1 AND $2 \
             ORDER BY execution_date, resource_type, result_id"
        ))
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(score_from_row).collect()
    }

    async fn issues_between(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> QualityResult<Vec<ValidationIssue>> {
        let rows = sqlx::query(&format!(
            "SELECT {ISSUE_COLUMNS} FROM fhir_quality.validation_issues \
             WHERE detected_date BETWEEN $1 AND $2 ORDER BY detected_date, issue_id"
        ))
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(issue_from_row).collect()
    }

    async fn assessments_by_id(&self, ids: &[String]) -> QualityResult<Vec<Assessment>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(&format!(
            "SELECT {ASSESSMENT_COLUMNS} FROM fhir_quality.assessments_meta \
             WHERE assessment_id = ANY($1)"
        ))
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(assessment_from_row).collect()
    }

    async fn score_partition_dates(&self) -> QualityResult<Vec<NaiveDate>> {
        let rows = sqlx::query(
            "SELECT DISTINCT execution_date FROM fhir_quality.assessment_results \
             ORDER BY execution_date",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get("execution_date").map_err(QualityError::from))
            .collect()
    }

    async fn latest_assessment_at(&self) -> QualityResult<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT MAX(created_at) AS latest FROM fhir_quality.assessments_meta")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("latest")?)
    }
}

#[async_trait]
impl TrendStore for PgStore {
    async fn get_trend(&self, key: &TrendKey) -> QualityResult<Option<DailyTrend>> {
        let row = sqlx::query(&format!(
            "SELECT {TREND_COLUMNS} FROM fhir_quality.quality_trends_daily \
             WHERE date = $1 AND owner_id = $2 AND resource_type = $3"
        ))
        .bind(key.date)
        .bind(key.owner_id)
        .bind(&key.resource_type)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(trend_from_row).transpose()
    }

    async fn trends_on(&self, date: NaiveDate) -> QualityResult<Vec<DailyTrend>> {
        self.trends_between(date, date).await
    }

    async fn trends_between(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> QualityResult<Vec<DailyTrend>> {
        let rows = sqlx::query(&format!(
            "SELECT {TREND_COLUMNS} FROM fhir_quality.quality_trends_daily \
             WHERE date BETWEEN $1 AND $2 \
             ORDER BY date, owner_id, resource_type"
        ))
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(trend_from_row).collect()
    }

    async fn upsert_trend(
        &self,
        metrics: &TrendMetrics,
        expected_version: Option<i64>,
    ) -> QualityResult<DailyTrend> {
        let key = &metrics.key;
        // Each branch is one statement, so a key is either fully written or untouched.
        let row = match expected_version {
            None => {
                sqlx::query(&format!(
                    "INSERT INTO fhir_quality.quality_trends_daily ({TREND_COLUMNS}) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 1) \
                     ON CONFLICT (date, owner_id, resource_type) DO NOTHING \
                     RETURNING {TREND_COLUMNS}"
                ))
                .bind(key.date)
                .bind(key.owner_id)
                .bind(&key.resource_type)
                .bind(metrics.avg_quality_score)
                .bind(metrics.total_resources_evaluated)
                .bind(metrics.total_issues)
                .bind(metrics.assessment_count)
                .bind(Utc::now())
                .fetch_optional(&self.pool)
                .await?
            }
            Some(version) => {
                sqlx::query(&format!(
                    "UPDATE fhir_quality.quality_trends_daily SET \
                     avg_quality_score = $4, total_resources_evaluated = $5, \
                     total_issues = $6, assessment_count = $7, updated_at = $8, \
                     version = version + 1 \
                     WHERE date = $1 AND owner_id = $2 AND resource_type = $3 AND version = $9 \
                     RETURNING {TREND_COLUMNS}"
                ))
                .bind(key.date)
                .bind(key.owner_id)
                .bind(&key.resource_type)
                .bind(metrics.avg_quality_score)
                .bind(metrics.total_resources_evaluated)
                .bind(metrics.total_issues)
                .bind(metrics.assessment_count)
                .bind(Utc::now())
                .bind(version)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        match row {
            Some(row) => trend_from_row(&row),
            None => Err(QualityError::ConcurrentUpdateConflict(key.clone())),
        }
    }
}
