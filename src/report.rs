use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write;
use std::path::Path;

use chrono::NaiveDate;

use crate::aggregate::dimension_averages;
use crate::models::{
    DailyTrend, Dimension, IssueSummary, OwnerId, ResourceScoreRecord, Severity, ValidationIssue,
};
use crate::partition::days_before;

/// Score every resource type is measured against.
pub const TARGET_SCORE: f64 = 90.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Declining,
    Improving,
    Stable,
}

impl Direction {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Declining => "declining",
            Self::Improving => "improving",
            Self::Stable => "stable",
        }
    }
}

pub fn quality_category(score: f64) -> &'static str {
    match score {
        s if s >= 90.0 => "Excellent (90-100)",
        s if s >= 75.0 => "Good (75-89)",
        s if s >= 50.0 => "Fair (50-74)",
        _ => "Poor (<50)",
    }
}

pub fn improvement_priority(avg_score: f64) -> &'static str {
    match avg_score {
        s if s < 50.0 => "Critical - immediate action required",
        s if s < 75.0 => "Medium - improvement needed",
        s if s < TARGET_SCORE => "Low - minor improvements",
        _ => "Good - maintain quality",
    }
}

pub fn direction(last_week: f64, previous_week: f64) -> Direction {
    if last_week < previous_week {
        Direction::Declining
    } else if last_week > previous_week {
        Direction::Improving
    } else {
        Direction::Stable
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDirection {
    pub resource_type: String,
    pub last_week: f64,
    pub previous_week: f64,
    pub direction: Direction,
}

/// Compares the mean daily score of the seven days ending at `end` with the
/// seven days before. Resource types missing either week are left out.
pub fn weekly_directions(trends: &[DailyTrend], end: NaiveDate) -> Vec<ResourceDirection> {
    let last_start = days_before(end, 6);
    let previous_start = days_before(end, 13);
    let mut weeks: BTreeMap<&str, ((f64, usize), (f64, usize))> = BTreeMap::new();

    for row in trends.iter().filter(|row| row.date <= end) {
        let entry = weeks.entry(row.resource_type.as_str()).or_default();
        if row.date >= last_start {
            entry.0 .0 += row.avg_quality_score;
            entry.0 .1 += 1;
        } else if row.date >= previous_start {
            entry.1 .0 += row.avg_quality_score;
            entry.1 .1 += 1;
        }
    }

    weeks
        .into_iter()
        .filter(|(_, (last, previous))| last.1 > 0 && previous.1 > 0)
        .map(|(resource_type, (last, previous))| {
            let last_week = last.0 / last.1 as f64;
            let previous_week = previous.0 / previous.1 as f64;
            ResourceDirection {
                resource_type: resource_type.to_string(),
                last_week,
                previous_week,
                direction: direction(last_week, previous_week),
            }
        })
        .collect()
}

pub fn summarize_issues(issues: &[ValidationIssue]) -> Vec<IssueSummary> {
    let mut map: HashMap<(Dimension, Severity, &str), (usize, usize, BTreeSet<&str>)> =
        HashMap::new();

    for issue in issues {
        let entry = map
            .entry((issue.dimension, issue.severity, issue.message.as_str()))
            .or_default();
        entry.0 += 1;
        if issue.is_auto_fixed {
            entry.1 += 1;
        }
        entry.2.insert(issue.assessment_id.as_str());
    }

    let mut summaries: Vec<IssueSummary> = map
        .into_iter()
        .map(
            |((dimension, severity, message), (occurrences, fixed, assessments))| IssueSummary {
                dimension,
                severity,
                message: message.to_string(),
                occurrences,
                affected_assessments: assessments.len(),
                auto_fix_rate: fixed as f64 / occurrences as f64 * 100.0,
            },
        )
        .collect();

    summaries.sort_by(|a, b| {
        b.occurrences
            .cmp(&a.occurrences)
            .then_with(|| b.severity.cmp(&a.severity))
            .then_with(|| a.message.cmp(&b.message))
    });
    summaries
}

pub struct ReportInput<'a> {
    pub owner: Option<OwnerId>,
    pub end: NaiveDate,
    pub days: i64,
    pub trends: &'a [DailyTrend],
    pub scores: &'a [ResourceScoreRecord],
    pub issues: &'a [ValidationIssue],
}

fn fmt_score(score: Option<f64>) -> String {
    score
        .map(|value| format!("{value:.1}"))
        .unwrap_or_else(|| "n/a".to_string())
}

pub fn build_report(input: &ReportInput<'_>) -> String {
    let start = days_before(input.end, input.days.max(1) - 1);
    let window: Vec<&DailyTrend> = input
        .trends
        .iter()
        .filter(|row| row.date >= start && row.date <= input.end)
        .collect();

    let mut output = String::new();
    let owner_label = input
        .owner
        .map(|owner| format!("owner {owner}"))
        .unwrap_or_else(|| "all owners".to_string());

    let _ = writeln!(output, "# FHIR Data Quality Report");
    let _ = writeln!(output, "Generated for {} ({} to {})", owner_label, start, input.end);
    let _ = writeln!(output);
    let _ = writeln!(output, "## Overview");

    if window.is_empty() {
        let _ = writeln!(output, "No trend rows for this window.");
    } else {
        let resources: i64 = window.iter().map(|row| row.total_resources_evaluated).sum();
        let issues: i64 = window.iter().map(|row| row.total_issues).sum();
        let weighted: f64 = window
            .iter()
            .map(|row| row.avg_quality_score * row.total_resources_evaluated as f64)
            .sum();
        let average = weighted / resources.max(1) as f64;
        let owners: BTreeSet<OwnerId> = window.iter().map(|row| row.owner_id).collect();
        let _ = writeln!(output, "- Resources evaluated: {resources}");
        let _ = writeln!(output, "- Issues recorded: {issues}");
        let _ = writeln!(
            output,
            "- Average quality score: {:.2} ({})",
            average,
            quality_category(average)
        );
        let _ = writeln!(output, "- Owners reporting: {}", owners.len());
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Improvement Targets");
    let mut by_type: BTreeMap<&str, (f64, i64)> = BTreeMap::new();
    for row in &window {
        let entry = by_type.entry(row.resource_type.as_str()).or_default();
        entry.0 += row.avg_quality_score * row.total_resources_evaluated as f64;
        entry.1 += row.total_resources_evaluated;
    }
    let mut targets: Vec<(&str, f64)> = by_type
        .into_iter()
        .filter(|(_, (_, count))| *count > 0)
        .map(|(resource_type, (sum, count))| (resource_type, sum / count as f64))
        .collect();
    targets.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

    if targets.is_empty() {
        let _ = writeln!(output, "No resource types evaluated in this window.");
    } else {
        for (resource_type, average) in targets.iter().take(10) {
            let _ = writeln!(
                output,
                "- {}: {:.2} ({:.2} points to target) {}",
                resource_type,
                average,
                (TARGET_SCORE - average).max(0.0),
                improvement_priority(*average)
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Week over Week");
    let directions = weekly_directions(input.trends, input.end);
    if directions.is_empty() {
        let _ = writeln!(output, "Not enough history for a weekly comparison.");
    } else {
        for item in &directions {
            let _ = writeln!(
                output,
                "- {}: {:.2} vs {:.2} ({:+.2}, {})",
                item.resource_type,
                item.last_week,
                item.previous_week,
                item.last_week - item.previous_week,
                item.direction.label()
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Dimension Scores");
    let averages = dimension_averages(input.scores);
    if averages.is_empty() {
        let _ = writeln!(output, "No score records in this window.");
    } else {
        let _ = writeln!(
            output,
            "| Resource | Records | Completeness | Conformity | Plausibility | Timeliness | Calculability |"
        );
        let _ = writeln!(output, "|---|---|---|---|---|---|---|");
        for row in &averages {
            let _ = writeln!(
                output,
                "| {} | {} | {} | {} | {} | {} | {} |",
                row.resource_type,
                row.record_count,
                fmt_score(row.get(Dimension::Completeness)),
                fmt_score(row.get(Dimension::Conformity)),
                fmt_score(row.get(Dimension::Plausibility)),
                fmt_score(row.get(Dimension::Timeliness)),
                fmt_score(row.get(Dimension::Calculability)),
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Top Issues");
    let summaries = summarize_issues(input.issues);
    if summaries.is_empty() {
        let _ = writeln!(output, "No issues recorded for this window.");
    } else {
        for summary in summaries.iter().take(10) {
            let _ = writeln!(
                output,
                "- [{} / {}] {}: {} occurrences across {} assessments ({:.1}% auto-fixed)",
                summary.dimension.as_str(),
                summary.severity.as_str(),
                summary.message,
                summary.occurrences,
                summary.affected_assessments,
                summary.auto_fix_rate
            );
        }
    }

    output
}

pub fn write_trends_csv(path: &Path, rows: &[DailyTrend]) -> anyhow::Result<usize> {
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(rows.len())
}
