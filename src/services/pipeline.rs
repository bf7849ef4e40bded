use std::path::Path;

use serde_json::{Map, Value};

use crate::config::Config;
use crate::error::AppError;
use crate::models::{AnalysisReport, RecordSet};
use crate::services::{charts, ingest, insight::InsightAgent, profile};

/// File-based entry: Ingestor -> Profiler -> Requestor -> Synthesizer.
/// Any stage failure short-circuits.
pub async fn analyze_file(
    path: &Path,
    questions: Option<&str>,
    agent: &InsightAgent,
    config: &Config,
) -> Result<AnalysisReport, AppError> {
    let ingest_start = std::time::Instant::now();
    let records = ingest::ingest_path(path, limits(config)).await?;
    tracing::info!(
        "ingested {} rows x {} columns in {:?}",
        records.row_count(),
        records.column_count(),
        ingest_start.elapsed()
    );

    run(records, questions, agent, config).await
}

/// Records-based entry: skips ingestion apart from canonicalizing the
/// pre-structured input.
pub async fn analyze_records(
    data: &[Map<String, Value>],
    questions: Option<&str>,
    agent: &InsightAgent,
    config: &Config,
) -> Result<AnalysisReport, AppError> {
    let records = ingest::ingest_records(data, config.schema_sample_rows, limits(config))?;
    run(records, questions, agent, config).await
}

async fn run(
    records: RecordSet,
    questions: Option<&str>,
    agent: &InsightAgent,
    config: &Config,
) -> Result<AnalysisReport, AppError> {
    let profile_start = std::time::Instant::now();
    let profile = profile::profile(&records, &config.profiler)?;
    tracing::info!("profiled {} columns in {:?}", profile.columns.len(), profile_start.elapsed());

    let insight_start = std::time::Instant::now();
    let outcome = agent.request_insights(&profile, &records, questions).await?;
    tracing::info!(
        "insight request produced {} suggestions in {:?}",
        outcome.suggestions.len(),
        insight_start.elapsed()
    );

    let specs = charts::synthesize(&outcome.suggestions, &records, &config.charts);
    tracing::info!("synthesized {} charts", specs.len());

    Ok(AnalysisReport {
        summary: outcome.summary,
        insights: outcome.insights,
        statistics: profile,
        recommendations: outcome.recommendations,
        charts: specs,
    })
}

fn limits(config: &Config) -> ingest::IngestLimits {
    ingest::IngestLimits {
        max_bytes: config.max_file_size,
        max_rows: config.max_rows,
    }
}
