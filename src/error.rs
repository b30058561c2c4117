use std::path::PathBuf;

use thiserror::Error;

/// Errors that abort a batch. Per-job failures are not errors; they are
/// recorded as a [`JobOutcome`](crate::job::JobOutcome) on the job's result.
#[derive(Error, Debug)]
pub enum SubmissionError {
    #[error("cannot read {} as a spreadsheet: {reason}", path.display())]
    Format { path: PathBuf, reason: String },

    #[error("{0}")]
    Schema(String),

    #[error(
        "rows {first_line} and {second_line} both produce manifest {}",
        path.display()
    )]
    DuplicateJob {
        path: PathBuf,
        first_line: usize,
        second_line: usize,
    },

    #[error("settings error: {0}")]
    Settings(#[from] config::ConfigError),

    #[error("cannot start worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SubmissionError {
    pub(crate) fn format(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        SubmissionError::Format {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// True when the input or its configuration is at fault rather than the
    /// machine running the batch.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            SubmissionError::Format { .. }
                | SubmissionError::Schema(_)
                | SubmissionError::DuplicateJob { .. }
                | SubmissionError::Settings(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SubmissionError>;
