use thiserror::Error;

use crate::models::TrendKey;

#[derive(Debug, Error)]
pub enum QualityError {
    #[error("malformed payload ({}): {reason}", assessment_id.as_deref().unwrap_or("unidentified"))]
    MalformedPayload {
        assessment_id: Option<String>,
        reason: String,
    },
    #[error("transient store error: {0}")]
    TransientStore(String),
    #[error("concurrent update conflict on {0}")]
    ConcurrentUpdateConflict(TrendKey),
    #[error("integrity violation: {0}")]
    Integrity(String),
    #[error("store error: {0}")]
    Store(String),
}

impl QualityError {
    pub fn malformed(assessment_id: Option<&str>, reason: impl Into<String>) -> Self {
        Self::MalformedPayload {
            assessment_id: assessment_id.map(str::to_string),
            reason: reason.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientStore(message.into())
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        Self::Integrity(message.into())
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    /// Only transient store failures are worth retrying with backoff.
    /// Conflicts are retried by the aggregator itself with a fresh read.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientStore(_))
    }
}

pub type QualityResult<T> = Result<T, QualityError>;

impl From<sqlx::Error> for QualityError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::transient(err.to_string()),
            sqlx::Error::Database(db) => match db.code().as_deref() {
                // serialization_failure, deadlock_detected
                Some("40001") | Some("40P01") => Self::transient(db.message().to_string()),
                // foreign_key_violation
                Some("23503") => Self::integrity(db.message().to_string()),
                _ => Self::store(db.message().to_string()),
            },
            _ => Self::store(err.to_string()),
        }
    }
}
