//! Partition keys shared by every fact backend.
//!
//! Score records are laid out by `(execution_date, resource_type)` and issues
//! by `detected_date`, so a date-scoped aggregation only has to touch the
//! partitions for that one day.

use std::fmt;

use chrono::{DateTime, Days, NaiveDate, Utc};

use crate::models::{ResourceScoreRecord, ValidationIssue};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScorePartition {
    pub execution_date: NaiveDate,
    pub resource_type: String,
}

impl ScorePartition {
    pub fn of(record: &ResourceScoreRecord) -> Self {
        Self {
            execution_date: record.execution_date,
            resource_type: record.resource_type.clone(),
        }
    }
}

impl fmt::Display for ScorePartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "execution_date={}/resource_type={}",
            self.execution_date, self.resource_type
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IssuePartition {
    pub detected_date: NaiveDate,
}

impl IssuePartition {
    pub fn of(issue: &ValidationIssue) -> Self {
        Self {
            detected_date: issue.detected_date(),
        }
    }
}

impl fmt::Display for IssuePartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "detected_date={}", self.detected_date)
    }
}

/// Calendar date (UTC) a timestamp is partitioned under.
pub fn partition_date(timestamp: DateTime<Utc>) -> NaiveDate {
    timestamp.date_naive()
}

/// `days` calendar days before `date`, saturating at the earliest
/// representable date. Negative counts are treated as zero.
pub fn days_before(date: NaiveDate, days: i64) -> NaiveDate {
    let days = u64::try_from(days).unwrap_or(0);
    date.checked_sub_days(Days::new(days)).unwrap_or(NaiveDate::MIN)
}

/// Oldest partition date still inside a retention window of `keep_days`.
pub fn retention_cutoff(today: NaiveDate, keep_days: i64) -> NaiveDate {
    days_before(today, keep_days)
}

pub fn is_expired(partition_date: NaiveDate, cutoff: NaiveDate) -> bool {
    partition_date < cutoff
}
