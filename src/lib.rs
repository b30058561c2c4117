use chrono::Utc;
use tracing::info;

pub mod config;
pub mod context;
pub mod error;
pub mod job;
pub mod manifest;
pub mod report;
pub mod spreadsheet;

use crate::config::RunConfig;
use crate::context::{GeneticContext, SchemaTable};
use crate::error::Result;
use crate::job::{CancelFlag, JobExecutor, SubmissionJob};
use crate::report::BatchReport;

/// Loads the spreadsheet, writes one manifest per row, runs the external
/// tool for every manifest and writes the batch report.
///
/// Input problems (unreadable sheet, missing columns or files, duplicate
/// runs) are returned as errors before any manifest is written. Failures of
/// individual jobs are recorded in the returned report instead.
pub fn run(config: &RunConfig, cancel: &CancelFlag) -> Result<BatchReport> {
    let started_at = Utc::now();

    let table = SchemaTable::load()?;
    let schema = table.schema(config.context())?;

    let sheet = spreadsheet::load(config.spreadsheet(), config.format(), schema)?;
    info!(rows = sheet.rows.len(), context = %config.context(), "spreadsheet loaded");

    let manifest_dir = config.manifest_dir();
    let manifests = manifest::build_manifests(&sheet, schema, config.data_dir(), &manifest_dir)?;
    manifest::write_manifests(&manifests, &manifest_dir)?;

    let jobs: Vec<SubmissionJob> = manifests
        .iter()
        .map(|manifest| SubmissionJob::from_manifest(manifest, config))
        .collect();

    let executor = JobExecutor::new(
        config.tool().clone(),
        config.timeout(),
        config.poll_interval(),
        cancel.clone(),
    );
    let results = executor.run_all(&jobs, config.parallelism())?;

    let report = BatchReport::new(config.context(), config.mode(), started_at, results);
    report.write(config.output_dir(), &sheet)?;
    Ok(report)
}

/// Column table for a context, for showing next to a schema error.
pub fn column_help(context: GeneticContext) -> Option<String> {
    let table = SchemaTable::load().ok()?;
    table.schema(context).ok().map(|schema| schema.describe())
}
