use std::fmt::{self, Display};
use std::fs::{self, File};
use std::io;
use std::path::PathBuf;
#[cfg(unix)]
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::thread;
use std::time::{Duration, Instant};

#[cfg(unix)]
use nix::sys::signal::{Signal, killpg};
#[cfg(unix)]
use nix::unistd::Pid;
use rayon::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{Mode, RunConfig};
use crate::context::GeneticContext;
use crate::error::Result;
use crate::manifest::ManifestFile;

static ACCESSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"accession was assigned to the submission:\s*([A-Z]+[0-9]+)").unwrap()
});

/// Webin account credentials. `Debug` never shows the password.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"********")
            .finish()
    }
}

/// Program plus leading arguments used to start the external tool,
/// e.g. `java -jar /webin-cli.jar`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Set once on interrupt; running jobs are killed at their next poll and
/// jobs that have not started are skipped.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One invocation of the external tool for one manifest.
#[derive(Debug, Clone)]
pub struct SubmissionJob {
    pub label: String,
    pub line: usize,
    pub manifest: PathBuf,
    pub context: GeneticContext,
    pub mode: Mode,
    pub credentials: Credentials,
    pub center_name: Option<String>,
    pub test: bool,
    /// directory the tool resolves data files against
    pub input_dir: PathBuf,
    /// directory the tool writes its reports into; also holds our logs
    pub output_dir: PathBuf,
}

impl SubmissionJob {
    pub fn from_manifest(manifest: &ManifestFile, config: &RunConfig) -> SubmissionJob {
        SubmissionJob {
            label: manifest.label.clone(),
            line: manifest.line,
            manifest: manifest.path.clone(),
            context: config.context(),
            mode: config.mode(),
            credentials: config.credentials().clone(),
            center_name: config.center_name().clone(),
            test: config.test(),
            input_dir: config.data_dir().clone(),
            output_dir: config.submission_dir().join(&manifest.label),
        }
    }

    /// Arguments passed after the tool's own program and leading arguments.
    pub fn arguments(&self) -> Vec<String> {
        let mut args = vec![
            "-context".to_string(),
            self.context.as_str().to_string(),
            "-userName".to_string(),
            self.credentials.username.clone(),
            "-password".to_string(),
            self.credentials.password.clone(),
            "-manifest".to_string(),
            self.manifest.to_string_lossy().into_owned(),
            "-inputDir".to_string(),
            self.input_dir.to_string_lossy().into_owned(),
            "-outputDir".to_string(),
            self.output_dir.to_string_lossy().into_owned(),
        ];
        if let Some(center_name) = &self.center_name {
            args.push("-centerName".to_string());
            args.push(center_name.clone());
        }
        args.push(format!("-{}", self.mode.as_str()));
        if self.test {
            args.push("-test".to_string());
        }
        args
    }

    /// Arguments for logs and console output, with the password masked.
    pub fn display_arguments(&self) -> String {
        let mut args = self.arguments();
        if let Some(i) = args.iter().position(|a| a == "-password") {
            if let Some(password) = args.get_mut(i + 1) {
                *password = "********".to_string();
            }
        }
        args.join(" ")
    }

    pub fn stdout_log(&self) -> PathBuf {
        self.output_dir.join(format!("{}.out", self.label))
    }

    pub fn stderr_log(&self) -> PathBuf {
        self.output_dir.join(format!("{}.err", self.label))
    }
}

/// Terminal state of a job.
#[derive(Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded,
    ValidationFailed,
    SubmissionFailed,
    ExecutionError,
    TimedOut,
    Cancelled,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Succeeded => "succeeded",
            JobOutcome::ValidationFailed => "validation failed",
            JobOutcome::SubmissionFailed => "submission failed",
            JobOutcome::ExecutionError => "execution error",
            JobOutcome::TimedOut => "timed out",
            JobOutcome::Cancelled => "cancelled",
        }
    }

    pub fn is_success(&self) -> bool {
        *self == JobOutcome::Succeeded
    }
}

impl Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub label: String,
    pub line: usize,
    pub manifest: PathBuf,
    pub outcome: JobOutcome,
    pub exit_code: Option<i32>,
    /// accession reported by the tool after a successful submission
    pub accession: Option<String>,
    pub message: Option<String>,
    pub output_dir: PathBuf,
    pub stdout_log: PathBuf,
    pub stderr_log: PathBuf,
    pub duration_ms: u64,
}

/// Maps the tool's exit code to an outcome. Webin-CLI exits with 2 on a
/// user error, which in submit mode means the manifest or its files were
/// rejected before anything was submitted.
pub fn classify(mode: Mode, exit_code: Option<i32>) -> JobOutcome {
    match (exit_code, mode) {
        (Some(0), _) => JobOutcome::Succeeded,
        (Some(_), Mode::Validate) => JobOutcome::ValidationFailed,
        (Some(2), Mode::Submit) => JobOutcome::ValidationFailed,
        (Some(_), Mode::Submit) => JobOutcome::SubmissionFailed,
        // killed by a signal we did not send
        (None, _) => JobOutcome::ExecutionError,
    }
}

pub fn find_accession(output: &str) -> Option<String> {
    ACCESSION
        .captures(output)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Runs jobs against the external tool on a fixed-size worker pool.
#[derive(Debug, Clone)]
pub struct JobExecutor {
    tool: ToolCommand,
    timeout: Option<Duration>,
    poll_interval: Duration,
    cancel: CancelFlag,
}

impl JobExecutor {
    pub fn new(
        tool: ToolCommand,
        timeout: Option<Duration>,
        poll_interval: Duration,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            tool,
            timeout,
            poll_interval,
            cancel,
        }
    }

    /// Runs every job to a terminal state with at most `parallelism` tool
    /// processes alive at once. Results come back in job order.
    pub fn run_all(&self, jobs: &[SubmissionJob], parallelism: usize) -> Result<Vec<JobResult>> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(parallelism.max(1))
            .thread_name(|i| format!("webin-job-{}", i))
            .build()?;
        info!(jobs = jobs.len(), parallelism, "running jobs");

        Ok(pool.install(|| jobs.par_iter().map(|job| self.execute(job)).collect()))
    }

    /// Runs one job. Never fails: anything that goes wrong is recorded in
    /// the result's outcome.
    pub fn execute(&self, job: &SubmissionJob) -> JobResult {
        let started = Instant::now();

        let (outcome, exit_code, message) = if self.cancel.is_cancelled() {
            (
                JobOutcome::Cancelled,
                None,
                Some("interrupted before the job started".to_string()),
            )
        } else {
            match self.spawn(job) {
                Ok(child) => self.wait(job, child),
                Err(e) => {
                    warn!(label = %job.label, error = %e, "cannot start job");
                    (
                        JobOutcome::ExecutionError,
                        None,
                        Some(format!("cannot run {}: {}", self.tool.program, e)),
                    )
                }
            }
        };

        let accession = if outcome.is_success() {
            fs::read(job.stdout_log())
                .ok()
                .and_then(|out| find_accession(&String::from_utf8_lossy(&out)))
        } else {
            None
        };

        info!(label = %job.label, line = job.line, %outcome, ?exit_code, "job finished");
        JobResult {
            label: job.label.clone(),
            line: job.line,
            manifest: job.manifest.clone(),
            outcome,
            exit_code,
            accession,
            message,
            output_dir: job.output_dir.clone(),
            stdout_log: job.stdout_log(),
            stderr_log: job.stderr_log(),
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn spawn(&self, job: &SubmissionJob) -> io::Result<Child> {
        fs::create_dir_all(&job.output_dir)?;
        let stdout = File::create(job.stdout_log())?;
        let stderr = File::create(job.stderr_log())?;

        info!(
            label = %job.label,
            command = %format!("{} {} {}", self.tool.program, self.tool.args.join(" "), job.display_arguments()),
            "starting job"
        );
        let mut command = Command::new(&self.tool.program);
        command
            .args(&self.tool.args)
            .args(job.arguments())
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        // own process group, so that stop() also reaches whatever a launcher script forks
        #[cfg(unix)]
        command.process_group(0);
        command.spawn()
    }

    fn wait(&self, job: &SubmissionJob, mut child: Child) -> (JobOutcome, Option<i32>, Option<String>) {
        let started = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    let code = status.code();
                    // a tool dying alongside an interrupt is not a tool failure
                    if !status.success() && self.cancel.is_cancelled() {
                        return (
                            JobOutcome::Cancelled,
                            code,
                            Some("interrupted while running".to_string()),
                        );
                    }
                    let outcome = classify(job.mode, code);
                    let message = match code {
                        Some(0) => None,
                        Some(code) => Some(format!("exited with code {}", code)),
                        None => Some("terminated by a signal".to_string()),
                    };
                    return (outcome, code, message);
                }
                Ok(None) => {}
                Err(e) => {
                    stop(&mut child);
                    return (
                        JobOutcome::ExecutionError,
                        None,
                        Some(format!("cannot wait for process: {}", e)),
                    );
                }
            }

            if self.cancel.is_cancelled() {
                stop(&mut child);
                return (
                    JobOutcome::Cancelled,
                    None,
                    Some("interrupted while running".to_string()),
                );
            }

            if let Some(limit) = self.timeout {
                if started.elapsed() >= limit {
                    warn!(label = %job.label, timeout_secs = limit.as_secs_f64(), "job timed out");
                    stop(&mut child);
                    return (
                        JobOutcome::TimedOut,
                        None,
                        Some(format!("killed after {:.1?}", limit)),
                    );
                }
            }

            thread::sleep(self.poll_interval);
        }
    }
}

/// Kills the child together with its process group and reaps it.
#[cfg(unix)]
fn stop(child: &mut Child) {
    let group = Pid::from_raw(child.id() as i32);
    if let Err(e) = killpg(group, Signal::SIGKILL) {
        debug!(error = %e, "killpg failed; falling back to the child alone");
        if let Err(e) = child.kill() {
            debug!(error = %e, "kill failed; process may have exited");
        }
    }
    let _ = child.wait();
}

#[cfg(not(unix))]
fn stop(child: &mut Child) {
    if let Err(e) = child.kill() {
        debug!(error = %e, "kill failed; process may have exited");
    }
    let _ = child.wait();
}
