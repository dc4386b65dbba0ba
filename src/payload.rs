//! Wire shape of one assessment as delivered by the ingestion adapter.
//!
//! Fields the normalizer must reject on absence are still `Option` here so a
//! missing value surfaces as a `MalformedPayload` naming the field, rather
//! than as an opaque serde error.

use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Identifiers arrive as either JSON numbers or strings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RawId {
    Number(i64),
    Text(String),
}

impl RawId {
    pub fn as_text(&self) -> String {
        match self {
            Self::Number(value) => value.to_string(),
            Self::Text(value) => value.trim().to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssessmentPayload {
    pub id: Option<RawId>,
    pub user_id: Option<i64>,
    pub server_id: Option<RawId>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub resources: Option<Vec<String>>,
    pub sample_size: Option<i32>,
    pub validator: Option<String>,
    pub quality_framework: Option<String>,
    pub status: Option<String>,
    pub overall_quality_score: Option<f64>,
    pub resource_scores: Option<Vec<ResourceScorePayload>>,
    pub top_issues: Option<Vec<IssuePayload>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceScorePayload {
    pub resource_type: String,
    pub overall_score: f64,
    pub dimension_scores: DimensionScoresPayload,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DimensionScoresPayload {
    pub completeness: Option<f64>,
    pub conformity: Option<f64>,
    pub plausibility: Option<f64>,
    pub timeliness: Option<f64>,
    pub calculability: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuePayload {
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub dimension: String,
    pub severity: String,
    pub message: String,
    pub field: Option<String>,
    pub auto_fixed: Option<bool>,
}

/// Splits a document into individual payload values. Accepts a single object
/// or an array of objects so one bad element cannot poison its neighbours.
pub fn split_document(raw: &str) -> Result<Vec<serde_json::Value>, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    Ok(match value {
        serde_json::Value::Array(items) => items,
        other => vec![other],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_numeric_and_string_ids() {
        let payload: AssessmentPayload = serde_json::from_value(serde_json::json!({
            "id": 42,
            "userId": 3,
            "serverId": "fhir-eu",
            "createdAt": "2026-02-01T10:00:00Z",
            "status": "completed"
        }))
        .unwrap();
        assert_eq!(payload.id.unwrap().as_text(), "42");
        assert_eq!(payload.server_id.unwrap().as_text(), "fhir-eu");
        assert!(payload.resource_scores.is_none());
        assert!(payload.top_issues.is_none());
    }

    #[test]
    fn missing_optional_dimensions_stay_absent() {
        let scores: DimensionScoresPayload = serde_json::from_value(serde_json::json!({
            "completeness": 90.0,
            "conformity": 80.0,
            "plausibility": 70.0
        }))
        .unwrap();
        assert_eq!(scores.timeliness, None);
        assert_eq!(scores.calculability, None);
    }

    #[test]
    fn split_document_handles_object_and_array() {
        assert_eq!(split_document(r#"{"id": 1}"#).unwrap().len(), 1);
        assert_eq!(split_document(r#"[{"id": 1}, {"id": 2}, 3]"#).unwrap().len(), 3);
        assert!(split_document("not json").is_err());
    }
}
