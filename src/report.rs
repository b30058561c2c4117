// MARK: Imports
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use colored::Colorize;
use getset::{CopyGetters, Getters};
use itertools::Itertools;
use serde::Serialize;
use tracing::info;

use crate::config::Mode;
use crate::context::GeneticContext;
use crate::error::Result;
use crate::job::{JobOutcome, JobResult};
use crate::spreadsheet::Spreadsheet;

pub const SUMMARY_JSON: &str = "batch_summary.json";
pub const SUMMARY_CSV: &str = "batch_summary.csv";
pub const FAILURE_LOG: &str = "failed_validation.txt";
pub const FAILED_ROWS: &str = "failed_rows.tsv";

/// Exit status when the batch was interrupted.
pub const EXIT_INTERRUPTED: i32 = 130;

/// MARK: BatchReport
/// Outcome of every job in one invocation, in spreadsheet row order.
#[derive(Debug, Clone, Serialize, Getters, CopyGetters)]
pub struct BatchReport {
    #[getset(get_copy = "pub")]
    context: GeneticContext,
    #[getset(get_copy = "pub")]
    mode: Mode,
    #[getset(get_copy = "pub")]
    started_at: DateTime<Utc>,
    #[getset(get_copy = "pub")]
    finished_at: DateTime<Utc>,
    #[getset(get_copy = "pub")]
    total: usize,
    #[getset(get = "pub")]
    counts: BTreeMap<JobOutcome, usize>,
    #[getset(get_copy = "pub")]
    exit_code: i32,
    #[getset(get = "pub")]
    results: Vec<JobResult>,
}

/// One line of `batch_summary.csv`.
#[derive(Debug, Serialize)]
struct SummaryRecord<'a> {
    line: usize,
    label: &'a str,
    outcome: JobOutcome,
    exit_code: Option<i32>,
    accession: Option<&'a str>,
    manifest: String,
    stdout_log: String,
    stderr_log: String,
    duration_ms: u64,
}

impl BatchReport {
    pub fn new(
        context: GeneticContext,
        mode: Mode,
        started_at: DateTime<Utc>,
        mut results: Vec<JobResult>,
    ) -> BatchReport {
        results.sort_by_key(|r| r.line);
        let counts: BTreeMap<JobOutcome, usize> =
            results.iter().map(|r| r.outcome).counts().into_iter().collect();

        let exit_code = if counts.contains_key(&JobOutcome::Cancelled) {
            EXIT_INTERRUPTED
        } else if results.iter().all(|r| r.outcome.is_success()) {
            0
        } else {
            1
        };

        BatchReport {
            context,
            mode,
            started_at,
            finished_at: Utc::now(),
            total: results.len(),
            counts,
            exit_code,
            results,
        }
    }

    pub fn count(&self, outcome: JobOutcome) -> usize {
        self.counts.get(&outcome).copied().unwrap_or(0)
    }

    pub fn failures(&self) -> impl Iterator<Item = &JobResult> {
        self.results.iter().filter(|r| !r.outcome.is_success())
    }

    /// Writes the JSON and CSV summaries, plus the failure digest and a
    /// sheet of the failed rows when anything failed.
    pub fn write(&self, output_dir: &Path, sheet: &Spreadsheet) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(output_dir)?;
        let mut written = Vec::new();

        let json_path = output_dir.join(SUMMARY_JSON);
        fs::write(&json_path, serde_json::to_string_pretty(self)?)?;
        written.push(json_path);

        let csv_path = output_dir.join(SUMMARY_CSV);
        self.write_csv(&csv_path)?;
        written.push(csv_path);

        let failure_log = output_dir.join(FAILURE_LOG);
        let failed_rows = output_dir.join(FAILED_ROWS);
        if self.failures().next().is_some() {
            self.write_failure_log(&failure_log)?;
            self.write_failed_rows(&failed_rows, sheet)?;
            written.push(failure_log);
            written.push(failed_rows);
        } else {
            // leftovers from an earlier run would point at jobs that now pass
            remove_if_present(&failure_log)?;
            remove_if_present(&failed_rows)?;
        }

        info!(dir = %output_dir.display(), files = written.len(), "batch report written");
        Ok(written)
    }

    fn write_csv(&self, path: &Path) -> Result<()> {
        let mut wtr = csv::Writer::from_path(path)?;
        for result in &self.results {
            wtr.serialize(SummaryRecord {
                line: result.line,
                label: &result.label,
                outcome: result.outcome,
                exit_code: result.exit_code,
                accession: result.accession.as_deref(),
                manifest: result.manifest.to_string_lossy().into_owned(),
                stdout_log: result.stdout_log.to_string_lossy().into_owned(),
                stderr_log: result.stderr_log.to_string_lossy().into_owned(),
                duration_ms: result.duration_ms,
            })?;
        }
        wtr.flush()?;
        Ok(())
    }

    /// Every failed job with the tool's captured output, for reading
    /// without opening each log.
    fn write_failure_log(&self, path: &Path) -> Result<()> {
        let rule = "*".repeat(100);
        let timestamp = self.finished_at.format("%Y-%m-%d %H:%M:%S");
        let mut file = io::BufWriter::new(fs::File::create(path)?);

        for failure in self.failures() {
            writeln!(file, "{}", rule)?;
            writeln!(
                file,
                "[{}] {} (row {}): {}",
                timestamp, failure.label, failure.line, failure.outcome
            )?;
            if let Some(message) = &failure.message {
                writeln!(file, "{}", message)?;
            }
            writeln!(file, "manifest: {}", failure.manifest.display())?;
            writeln!(file, "stdout:   {}", failure.stdout_log.display())?;
            writeln!(file, "stderr:   {}", failure.stderr_log.display())?;
            for log in [&failure.stderr_log, &failure.stdout_log] {
                let content = fs::read(log).unwrap_or_default();
                let content = String::from_utf8_lossy(&content);
                if !content.trim().is_empty() {
                    writeln!(file, "{}", content.trim_end())?;
                }
            }
        }
        writeln!(file, "{}", rule)?;
        file.flush()?;
        Ok(())
    }

    /// The original header plus each failed row, ready to be fed back in.
    fn write_failed_rows(&self, path: &Path, sheet: &Spreadsheet) -> Result<()> {
        let failed: HashSet<usize> = self.failures().map(|r| r.line).collect();
        let mut wtr = csv::WriterBuilder::new().delimiter(b'\t').from_path(path)?;
        wtr.write_record(&sheet.headers)?;
        for row in sheet.rows.iter().filter(|row| failed.contains(&row.line)) {
            wtr.write_record(&row.cells)?;
        }
        wtr.flush()?;
        Ok(())
    }

    /// MARK: console
    pub fn print_summary(&self, output_dir: &Path) {
        println!();
        println!(
            "{}",
            format!(
                "Batch summary: {} job(s), context {}, mode {}",
                self.total, self.context, self.mode
            )
            .bold()
        );

        let succeeded = self.count(JobOutcome::Succeeded);
        println!(
            "{}",
            format!("✅ {} of {} succeeded", succeeded, self.total).green()
        );
        for result in self.results.iter().filter(|r| r.accession.is_some()) {
            println!(
                "   row {} {}: {}",
                result.line,
                result.label,
                result.accession.as_deref().unwrap_or_default()
            );
        }

        let failures: Vec<&JobResult> = self.failures().collect();
        if !failures.is_empty() {
            let by_outcome = self
                .counts
                .iter()
                .filter(|(outcome, _)| !outcome.is_success())
                .map(|(outcome, count)| format!("{} {}", count, outcome))
                .join(", ");
            println!("{}", format!("❌ {} failed ({})", failures.len(), by_outcome).red().bold());
            for failure in failures {
                println!(
                    "   row {} {}: {} -> {}",
                    failure.line,
                    failure.label,
                    failure.outcome.to_string().red(),
                    failure.stderr_log.display()
                );
            }
            println!(
                "   Re-run only these rows with {}",
                output_dir.join(FAILED_ROWS).display()
            );
        }
        println!("📄 Summary written to {}", output_dir.join(SUMMARY_JSON).display());
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
