use std::collections::{HashMap, HashSet};

use sha2::{Digest, Sha256};

use crate::error::{QualityError, QualityResult};
use crate::models::{
    Assessment, AssessmentStatus, Dimension, DimensionScores, FactSet, ResourceScoreRecord,
    Severity, ValidationIssue,
};
use crate::partition::partition_date;
use crate::payload::{AssessmentPayload, DimensionScoresPayload, IssuePayload, RawId};

/// Placeholder used by the adapter when an issue is not tied to a resource.
pub const UNKNOWN: &str = "unknown";

const ID_HEX_LEN: usize = 32;

/// Deserializes and normalizes one raw payload value.
pub fn normalize_value(value: serde_json::Value) -> QualityResult<FactSet> {
    let assessment_id = value.get("id").and_then(|id| match id {
        serde_json::Value::String(text) => Some(text.clone()),
        serde_json::Value::Number(number) => Some(number.to_string()),
        _ => None,
    });
    let payload: AssessmentPayload = serde_json::from_value(value)
        .map_err(|err| QualityError::malformed(assessment_id.as_deref(), err.to_string()))?;
    normalize(payload)
}

/// Shapes a payload into its fact set. Any invalid part rejects the whole
/// assessment; identifiers depend only on payload content.
pub fn normalize(payload: AssessmentPayload) -> QualityResult<FactSet> {
    let assessment_id = payload
        .id
        .as_ref()
        .map(RawId::as_text)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| QualityError::malformed(None, "missing assessment id"))?;
    let id = Some(assessment_id.as_str());

    let owner_id = required(id, "userId", payload.user_id)?;
    let status: AssessmentStatus = required(id, "status", payload.status.as_deref())?
        .parse()
        .map_err(|err: String| QualityError::malformed(id, err))?;
    let server = required(id, "serverId", payload.server_id.as_ref())?.as_text();
    if server.is_empty() {
        return Err(QualityError::malformed(id, "serverId must not be blank"));
    }
    let resources = required(id, "resources", payload.resources)?;
    let sample_size = required(id, "sampleSize", payload.sample_size)?;
    let validator = required(id, "validator", payload.validator)?;
    let framework = required(id, "qualityFramework", payload.quality_framework)?;
    let resource_scores = required(id, "resourceScores", payload.resource_scores)?;
    let top_issues = required(id, "topIssues", payload.top_issues)?;

    if sample_size < 0 {
        return Err(QualityError::malformed(id, "sampleSize must not be negative"));
    }
    if let Some(score) = payload.overall_quality_score {
        check_score(id, "overallQualityScore", score)?;
    }

    let executed_at = payload.completed_at.unwrap_or(payload.created_at);
    let execution_date = partition_date(executed_at);

    let mut seen_types = HashSet::new();
    let mut scores = Vec::with_capacity(resource_scores.len());
    for block in &resource_scores {
        let resource_type = block.resource_type.trim();
        if resource_type.is_empty() {
            return Err(QualityError::malformed(id, "resourceScores entry without resourceType"));
        }
        if !seen_types.insert(resource_type.to_string()) {
            return Err(QualityError::malformed(
                id,
                format!("duplicate score block for {resource_type}"),
            ));
        }
        check_score(id, "overallScore", block.overall_score)?;
        let dimensions = dimension_scores(id, resource_type, &block.dimension_scores)?;

        scores.push(ResourceScoreRecord {
            result_id: result_id(&assessment_id, resource_type),
            assessment_id: assessment_id.clone(),
            resource_type: resource_type.to_string(),
            quality_score: block.overall_score,
            dimensions,
            execution_date,
        });
    }

    let mut occurrences: HashMap<String, usize> = HashMap::new();
    let mut issues = Vec::with_capacity(top_issues.len());
    for raw in &top_issues {
        let mut issue = shape_issue(id, &assessment_id, raw, executed_at)?;
        // Identical issues reported twice in one payload are distinct facts.
        let ordinal = occurrences.entry(issue.issue_id.clone()).or_insert(0);
        if *ordinal > 0 {
            issue.issue_id = digest_id(&[&issue.issue_id, &ordinal.to_string()]);
        }
        *ordinal += 1;
        issues.push(issue);
    }

    let assessment = Assessment {
        assessment_id: assessment_id.clone(),
        owner_id,
        target_server: format!("server_{server}"),
        executed_at,
        resources,
        sample_size,
        validator,
        framework,
        status,
        overall_score: payload.overall_quality_score,
        created_at: payload.created_at,
    };

    Ok(FactSet {
        assessment,
        scores,
        issues,
    })
}

fn required<T>(id: Option<&str>, field: &str, value: Option<T>) -> QualityResult<T> {
    value.ok_or_else(|| QualityError::malformed(id, format!("missing {field}")))
}

/// Digest of a whole fact set. Two payloads for the same assessment are the
/// same replay exactly when their digests match; record order is ignored.
pub fn fact_digest(facts: &FactSet) -> String {
    let assessment = &facts.assessment;
    let overall = assessment
        .overall_score
        .map(|score| score.to_string())
        .unwrap_or_default();
    let mut parts = vec![
        assessment.assessment_id.clone(),
        assessment.owner_id.to_string(),
        assessment.target_server.clone(),
        assessment.executed_at.to_rfc3339(),
        assessment.resources.join(","),
        assessment.sample_size.to_string(),
        assessment.validator.clone(),
        assessment.framework.clone(),
        assessment.status.as_str().to_string(),
        overall,
        assessment.created_at.to_rfc3339(),
    ];

    let mut records: Vec<String> = facts
        .scores
        .iter()
        .map(|score| {
            let dims = Dimension::ALL
                .into_iter()
                .map(|dimension| {
                    score
                        .dimensions
                        .get(dimension)
                        .map(|value| value.to_string())
                        .unwrap_or_default()
                })
                .collect::<Vec<_>>()
                .join(",");
            format!("{}:{}:{}", score.result_id, score.quality_score, dims)
        })
        .chain(
            facts
                .issues
                .iter()
                .map(|issue| format!("{}:{}", issue.issue_id, issue.is_auto_fixed)),
        )
        .collect();
    records.sort();
    parts.extend(records);

    let borrowed: Vec<&str> = parts.iter().map(String::as_str).collect();
    digest_id(&borrowed)
}

pub fn result_id(assessment_id: &str, resource_type: &str) -> String {
    digest_id(&["result", assessment_id, resource_type])
}

pub fn issue_id(
    assessment_id: &str,
    resource_type: &str,
    dimension: Dimension,
    severity: Severity,
    message: &str,
    field_path: Option<&str>,
    resource_id: &str,
) -> String {
    let content = digest_id(&[
        dimension.as_str(),
        severity.as_str(),
        message,
        field_path.unwrap_or(""),
        resource_id,
    ]);
    digest_id(&["issue", assessment_id, resource_type, &content])
}

fn shape_issue(
    id: Option<&str>,
    assessment_id: &str,
    raw: &IssuePayload,
    detected_at: chrono::DateTime<chrono::Utc>,
) -> QualityResult<ValidationIssue> {
    let dimension: Dimension = raw
        .dimension
        .parse()
        .map_err(|err: String| QualityError::malformed(id, err))?;
    let severity: Severity = raw
        .severity
        .parse()
        .map_err(|err: String| QualityError::malformed(id, err))?;
    if raw.message.trim().is_empty() {
        return Err(QualityError::malformed(id, "issue without message"));
    }

    let resource_type = non_blank(raw.resource_type.as_deref()).unwrap_or(UNKNOWN).to_string();
    let resource_id = non_blank(raw.resource_id.as_deref()).unwrap_or(UNKNOWN).to_string();
    let field_path = non_blank(raw.field.as_deref()).map(str::to_string);

    Ok(ValidationIssue {
        issue_id: issue_id(
            assessment_id,
            &resource_type,
            dimension,
            severity,
            &raw.message,
            field_path.as_deref(),
            &resource_id,
        ),
        result_id: result_id(assessment_id, &resource_type),
        assessment_id: assessment_id.to_string(),
        resource_type,
        resource_id,
        dimension,
        severity,
        message: raw.message.clone(),
        field_path,
        is_auto_fixed: raw.auto_fixed.unwrap_or(false),
        detected_at,
    })
}

fn dimension_scores(
    id: Option<&str>,
    resource_type: &str,
    raw: &DimensionScoresPayload,
) -> QualityResult<DimensionScores> {
    let required = |dimension: Dimension, value: Option<f64>| -> QualityResult<Option<f64>> {
        let score = value.ok_or_else(|| {
            QualityError::malformed(
                id,
                format!("{resource_type} is missing required {} score", dimension.as_str()),
            )
        })?;
        check_score(id, dimension.as_str(), score)?;
        Ok(Some(score))
    };
    let optional = |dimension: Dimension, value: Option<f64>| -> QualityResult<Option<f64>> {
        if let Some(score) = value {
            check_score(id, dimension.as_str(), score)?;
        }
        Ok(value)
    };

    Ok(DimensionScores {
        completeness: required(Dimension::Completeness, raw.completeness)?,
        conformity: required(Dimension::Conformity, raw.conformity)?,
        plausibility: required(Dimension::Plausibility, raw.plausibility)?,
        timeliness: optional(Dimension::Timeliness, raw.timeliness)?,
        calculability: optional(Dimension::Calculability, raw.calculability)?,
    })
}

fn check_score(id: Option<&str>, field: &str, score: f64) -> QualityResult<()> {
    if score.is_finite() && (0.0..=100.0).contains(&score) {
        Ok(())
    } else {
        Err(QualityError::malformed(
            id,
            format!("{field} score {score} is outside 0-100"),
        ))
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

/// Hex SHA-256 over NUL-separated parts, truncated to a fixed width.
fn digest_id(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (index, part) in parts.iter().enumerate() {
        if index > 0 {
            hasher.update([0u8]);
        }
        hasher.update(part.as_bytes());
    }
    let mut hex = format!("{:x}", hasher.finalize());
    hex.truncate(ID_HEX_LEN);
    hex
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::NaiveDate;
    use serde_json::json;

    fn payload() -> serde_json::Value {
        json!({
            "id": "a-100",
            "userId": 7,
            "serverId": 3,
            "createdAt": "2026-02-01T08:00:00Z",
            "completedAt": "2026-02-02T09:30:00Z",
            "resources": ["Patient", "Observation"],
            "sampleSize": 50,
            "validator": "inferno",
            "qualityFramework": "kahn",
            "status": "completed",
            "overallQualityScore": 81.5,
            "resourceScores": [
                {
                    "resourceType": "Patient",
                    "overallScore": 88.0,
                    "dimensionScores": {
                        "completeness": 90.0,
                        "conformity": 85.0,
                        "plausibility": 89.0,
                        "timeliness": 70.0
                    }
                },
                {
                    "resourceType": "Observation",
                    "overallScore": 75.0,
                    "dimensionScores": {
                        "completeness": 80.0,
                        "conformity": 70.0,
                        "plausibility": 75.0
                    }
                }
            ],
            "topIssues": [
                {
                    "resourceType": "Patient",
                    "resourceId": "p-1",
                    "dimension": "completeness",
                    "severity": "warning",
                    "message": "birthDate missing",
                    "field": "Patient.birthDate"
                },
                {
                    "dimension": "conformity",
                    "severity": "error",
                    "message": "unknown profile",
                    "autoFixed": true
                }
            ]
        })
    }

    #[test]
    fn shapes_assessment_scores_and_issues() {
        let facts = normalize_value(payload()).unwrap();

        assert_eq!(facts.assessment.assessment_id, "a-100");
        assert_eq!(facts.assessment.owner_id, 7);
        assert_eq!(facts.assessment.target_server, "server_3");
        assert_eq!(facts.assessment.status, AssessmentStatus::Completed);
        assert_eq!(facts.assessment.overall_score, Some(81.5));

        assert_eq!(facts.scores.len(), 2);
        let patient = &facts.scores[0];
        assert_eq!(patient.execution_date, NaiveDate::from_ymd_opt(2026, 2, 2).unwrap());
        assert_eq!(patient.dimensions.timeliness, Some(70.0));
        assert_eq!(patient.dimensions.calculability, None);
        assert_eq!(facts.scores[1].dimensions.timeliness, None);

        assert_eq!(facts.issues.len(), 2);
        assert_eq!(facts.issues[0].result_id, patient.result_id);
        assert_eq!(facts.issues[0].field_path.as_deref(), Some("Patient.birthDate"));
        assert_eq!(facts.issues[1].resource_type, UNKNOWN);
        assert_eq!(facts.issues[1].resource_id, UNKNOWN);
        assert!(facts.issues[1].is_auto_fixed);
        assert_eq!(facts.issues[1].detected_at, facts.assessment.executed_at);
    }

    #[test]
    fn identifiers_are_stable_across_replays() {
        let first = normalize_value(payload()).unwrap();
        let second = normalize_value(payload()).unwrap();
        assert_eq!(first, second);

        let ids: HashSet<_> = first.issues.iter().map(|issue| &issue.issue_id).collect();
        assert_eq!(ids.len(), first.issues.len());
        assert_ne!(first.scores[0].result_id, first.scores[1].result_id);
    }

    #[test]
    fn fact_digest_tracks_content_not_order() {
        let facts = normalize_value(payload()).unwrap();
        let mut reordered = facts.clone();
        reordered.scores.reverse();
        reordered.issues.reverse();
        assert_eq!(fact_digest(&facts), fact_digest(&reordered));

        let mut raw = payload();
        raw["resourceScores"][0]["overallScore"] = json!(87.0);
        assert_ne!(fact_digest(&facts), fact_digest(&normalize_value(raw).unwrap()));

        let mut raw = payload();
        raw["userId"] = json!(8);
        assert_ne!(fact_digest(&facts), fact_digest(&normalize_value(raw).unwrap()));
    }

    #[test]
    fn repeated_identical_issues_get_distinct_ids() {
        let mut raw = payload();
        let issue = raw["topIssues"][0].clone();
        raw["topIssues"].as_array_mut().unwrap().push(issue);

        let facts = normalize_value(raw).unwrap();
        assert_eq!(facts.issues.len(), 3);
        assert_ne!(facts.issues[0].issue_id, facts.issues[2].issue_id);
        assert_eq!(facts, normalize_value({
            let mut again = payload();
            let issue = again["topIssues"][0].clone();
            again["topIssues"].as_array_mut().unwrap().push(issue);
            again
        }).unwrap());
    }

    #[test]
    fn falls_back_to_created_at_without_completion() {
        let mut raw = payload();
        raw.as_object_mut().unwrap().remove("completedAt");
        let facts = normalize_value(raw).unwrap();
        assert_eq!(
            facts.scores[0].execution_date,
            NaiveDate::from_ymd_opt(2026, 2, 1).unwrap()
        );
    }

    #[test]
    fn rejects_missing_identity_fields() {
        for field in [
            "id",
            "userId",
            "status",
            "serverId",
            "resources",
            "sampleSize",
            "validator",
            "qualityFramework",
            "resourceScores",
            "topIssues",
        ] {
            let mut raw = payload();
            raw.as_object_mut().unwrap().remove(field);
            assert_matches!(
                normalize_value(raw),
                Err(QualityError::MalformedPayload { .. }),
                "removing {field} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_missing_required_dimension_instead_of_defaulting() {
        let mut raw = payload();
        raw["resourceScores"][1]["dimensionScores"]
            .as_object_mut()
            .unwrap()
            .remove("plausibility");
        assert_matches!(
            normalize_value(raw),
            Err(QualityError::MalformedPayload { assessment_id: Some(id), reason })
                if id == "a-100" && reason.contains("plausibility")
        );
    }

    #[test]
    fn rejects_out_of_range_and_unknown_values() {
        let mut raw = payload();
        raw["resourceScores"][0]["overallScore"] = json!(120.0);
        assert_matches!(normalize_value(raw), Err(QualityError::MalformedPayload { .. }));

        let mut raw = payload();
        raw["topIssues"][0]["severity"] = json!("fatal");
        assert_matches!(normalize_value(raw), Err(QualityError::MalformedPayload { .. }));

        let mut raw = payload();
        raw["status"] = json!("archived");
        assert_matches!(normalize_value(raw), Err(QualityError::MalformedPayload { .. }));
    }

    #[test]
    fn rejects_duplicate_resource_blocks() {
        let mut raw = payload();
        let block = raw["resourceScores"][0].clone();
        raw["resourceScores"].as_array_mut().unwrap().push(block);
        assert_matches!(
            normalize_value(raw),
            Err(QualityError::MalformedPayload { reason, .. }) if reason.contains("duplicate")
        );
    }

    #[test]
    fn type_errors_keep_the_assessment_id() {
        let mut raw = payload();
        raw["createdAt"] = json!("yesterday");
        assert_matches!(
            normalize_value(raw),
            Err(QualityError::MalformedPayload { assessment_id: Some(id), .. }) if id == "a-100"
        );
    }
}
