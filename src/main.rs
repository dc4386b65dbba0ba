use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod aggregate;
mod config;
mod error;
mod ingest;
mod models;
mod normalize;
mod partition;
mod payload;
mod report;
mod retry;
mod store;

use aggregate::{AggregationOutcome, TrendAggregator};
use config::Settings;
use ingest::IngestReport;
use models::{OwnerId, TrendKey};
use store::{FactStore, MemoryStore, PgStore, TrendStore};

#[derive(Parser)]
#[command(name = "quality-trends")]
#[command(about = "Daily FHIR data-quality trends from validator assessments", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Ingest assessment payloads from a JSON file (one object or an array)
    Ingest {
        #[arg(long)]
        json: PathBuf,
        /// Re-aggregate every date that received new facts
        #[arg(long)]
        aggregate: bool,
    },
    /// Recompute the trend rows of one date
    Aggregate {
        /// Defaults to today (UTC)
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Show one trend row
    Trend {
        #[arg(long)]
        date: NaiveDate,
        #[arg(long)]
        owner: OwnerId,
        #[arg(long)]
        resource_type: String,
    },
    /// Generate a markdown quality report
    Report {
        #[arg(long)]
        owner: Option<OwnerId>,
        /// Last day of the window, defaults to today (UTC)
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long, default_value_t = 30)]
        days: i64,
        #[arg(long, default_value = "quality-report.md")]
        out: PathBuf,
    },
    /// Export trend rows to CSV
    Export {
        #[arg(long)]
        from: NaiveDate,
        #[arg(long)]
        to: NaiveDate,
        #[arg(long, default_value = "quality-trends.csv")]
        out: PathBuf,
    },
    /// List fact partitions and those past the retention window
    Partitions {
        #[arg(long, default_value_t = 365)]
        keep_days: i64,
    },
    /// Ingest and aggregate a file in memory, without a database
    Preview {
        #[arg(long)]
        json: PathBuf,
    },
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

fn print_ingest(report: &IngestReport) {
    println!(
        "Ingested {} assessments ({} replays), rejected {}.",
        report.ingested.len(),
        report.replays(),
        report.rejected.len()
    );
    for rejected in &report.rejected {
        println!("- payload #{}: {}", rejected.index, rejected.error);
    }
}

fn print_aggregation(outcome: &AggregationOutcome) {
    println!(
        "Aggregated {} (run {}): {} trend rows updated, {} failed.",
        outcome.date,
        outcome.run_id,
        outcome.touched.len(),
        outcome.failed.len()
    );
    if outcome.is_clean() {
        return;
    }
    if outcome.orphaned > 0 {
        println!("- {} score records had no assessment and were skipped", outcome.orphaned);
    }
    for failure in &outcome.failed {
        println!("- {}: {}", failure.key, failure.error);
    }
}

async fn aggregate_dates(
    aggregator: &TrendAggregator,
    dates: &BTreeSet<NaiveDate>,
) -> anyhow::Result<usize> {
    let mut failed = 0;
    for date in dates {
        let outcome = aggregator
            .run_aggregation(*date)
            .await
            .with_context(|| format!("aggregation for {date} failed"))?;
        print_aggregation(&outcome);
        failed += outcome.failed.len();
    }
    Ok(failed)
}

async fn connect(settings: &Settings) -> anyhow::Result<Arc<PgStore>> {
    let url = settings.require_database_url()?;
    let store = PgStore::connect(url, settings.max_connections)
        .await
        .context("failed to connect to Postgres")?;
    Ok(Arc::new(store))
}

fn aggregator_for<S>(store: &Arc<S>, settings: &Settings) -> TrendAggregator
where
    S: FactStore + TrendStore + 'static,
{
    TrendAggregator::new(store.clone(), store.clone())
        .with_retry(settings.retry.clone())
        .with_conflict_retries(settings.conflict_retries)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::from_env()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fhir_quality_trends=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Commands::InitDb => {
            let store = connect(&settings).await?;
            store.init_db().await?;
            println!("Schema ready.");
        }
        Commands::Ingest { json, aggregate } => {
            let store = connect(&settings).await?;
            let report = ingest::ingest_file(store.clone(), &settings.retry, &json).await?;
            print_ingest(&report);
            if aggregate {
                let aggregator = aggregator_for(&store, &settings);
                let failed = aggregate_dates(&aggregator, &report.dirty_dates()).await?;
                if failed > 0 {
                    anyhow::bail!("{failed} trend rows could not be merged");
                }
            }
        }
        Commands::Aggregate { date } => {
            let store = connect(&settings).await?;
            let date = date.unwrap_or_else(today);
            let outcome = aggregator_for(&store, &settings)
                .run_aggregation(date)
                .await
                .with_context(|| format!("aggregation for {date} failed"))?;
            print_aggregation(&outcome);
            if !outcome.failed.is_empty() {
                anyhow::bail!("{} trend rows could not be merged", outcome.failed.len());
            }
        }
        Commands::Trend {
            date,
            owner,
            resource_type,
        } => {
            let store = connect(&settings).await?;
            let key = TrendKey::new(date, owner, resource_type);
            match aggregator_for(&store, &settings).get_trend(&key).await? {
                Some(row) => println!(
                    "{}: avg {:.2} over {} resources, {} issues, {} assessments (updated {})",
                    key,
                    row.avg_quality_score,
                    row.total_resources_evaluated,
                    row.total_issues,
                    row.assessment_count,
                    row.updated_at
                ),
                None => println!("No trend row for {key}."),
            }
        }
        Commands::Report {
            owner,
            date,
            days,
            out,
        } => {
            let store = connect(&settings).await?;
            let retry = &settings.retry;
            let end = date.unwrap_or_else(today);
            let days = days.max(1);
            let start = partition::days_before(end, days - 1);
            // Two full weeks are needed for the week-over-week section.
            let history_start = start.min(partition::days_before(end, 13));

            let mut trends = retry
                .run("trends_between", || store.trends_between(history_start, end))
                .await?;
            let mut scores = retry
                .run("scores_between", || store.scores_between(start, end))
                .await?;
            let mut issues = retry
                .run("issues_between", || store.issues_between(start, end))
                .await?;

            if let Some(owner) = owner {
                trends.retain(|row| row.owner_id == owner);
                let ids: Vec<String> = scores
                    .iter()
                    .map(|score| score.assessment_id.clone())
                    .chain(issues.iter().map(|issue| issue.assessment_id.clone()))
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect();
                let owned: HashSet<String> = retry
                    .run("assessments_by_id", || store.assessments_by_id(&ids))
                    .await?
                    .into_iter()
                    .filter(|assessment| assessment.owner_id == owner)
                    .map(|assessment| assessment.assessment_id)
                    .collect();
                scores.retain(|score| owned.contains(&score.assessment_id));
                issues.retain(|issue| owned.contains(&issue.assessment_id));
            }

            let markdown = report::build_report(&report::ReportInput {
                owner,
                end,
                days,
                trends: &trends,
                scores: &scores,
                issues: &issues,
            });
            std::fs::write(&out, markdown)?;
            println!("Report written to {}.", out.display());
        }
        Commands::Export { from, to, out } => {
            let store = connect(&settings).await?;
            let rows = store.trends_between(from, to).await?;
            let written = report::write_trends_csv(&out, &rows)?;
            println!("Exported {written} trend rows to {}.", out.display());
        }
        Commands::Partitions { keep_days } => {
            let store = connect(&settings).await?;
            let cutoff = partition::retention_cutoff(today(), keep_days);
            let dates = store.score_partition_dates().await?;
            if dates.is_empty() {
                println!("No fact partitions yet.");
            }
            for date in &dates {
                let marker = if partition::is_expired(*date, cutoff) {
                    " (past retention)"
                } else {
                    ""
                };
                println!("- execution_date={date}{marker}");
            }
            if let Some(latest) = store.latest_assessment_at().await? {
                println!(
                    "Latest assessment created {} ({} days ago).",
                    latest,
                    (today() - latest.date_naive()).num_days()
                );
            }
        }
        Commands::Preview { json } => {
            let store = Arc::new(MemoryStore::new());
            let report = ingest::ingest_file(store.clone(), &settings.retry, &json).await?;
            print_ingest(&report);

            let aggregator = aggregator_for(&store, &settings);
            let dates = report.dirty_dates();
            aggregate_dates(&aggregator, &dates).await?;

            for partition in store.score_partitions()? {
                println!("- partition {partition}");
            }
            if let (Some(first), Some(last)) = (dates.first(), dates.last()) {
                for row in store.trends_between(*first, *last).await? {
                    println!(
                        "{} | owner {} | {} | avg {:.2} | resources {} | issues {} | assessments {}",
                        row.date,
                        row.owner_id,
                        row.resource_type,
                        row.avg_quality_score,
                        row.total_resources_evaluated,
                        row.total_issues,
                        row.assessment_count
                    );
                }
            }
        }
    }

    Ok(())
}
