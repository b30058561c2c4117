//! # config.rs
//!
//! Command-line parsing and run configuration for bulk Webin-CLI submissions.
//! It includes:
//! - `InputConfig`: the command-line arguments.
//! - `Settings`: tool location, timeout and limits, layered from the built-in
//!   defaults, an optional `--config` TOML file and `WEBIN_BULK_*` variables.
//! - `RunConfig`: the validated configuration threaded through the pipeline.
//! - `Mode`: validate or submit.
//!
//! Command-line flags take precedence over settings, which take precedence
//! over the built-in defaults.

use std::fmt::{self, Display};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser, ValueEnum};
use config::{Config, ConfigError, Environment, FileFormat, Map};
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};

use crate::context::GeneticContext;
use crate::job::{Credentials, ToolCommand};
use crate::spreadsheet::SpreadsheetFormat;

/// Built-in settings, compiled into the binary.
pub const DEFAULT_SETTINGS_STR: &str = include_str!("../data/defaults.toml");

pub const MANIFEST_DIR: &str = "manifests";
pub const SUBMISSION_DIR: &str = "submissions";

/// Command-line arguments.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "webin-bulk",
    version = env!("CARGO_PKG_VERSION"),
    about = "Generate Webin-CLI manifests from a metadata spreadsheet and validate or submit every row."
)]
pub struct InputConfig {
    /// Webin submission account username (e.g. Webin-XXXXX)
    #[arg(short, long, required = true)]
    pub username: String,
    /// Password for the Webin submission account
    #[arg(short, long, required = true)]
    pub password: String,
    /// Submission context
    #[arg(short = 'g', long = "genetic-context", alias = "geneticContext", value_enum)]
    pub context: GeneticContext,
    /// Spreadsheet with one row of metadata per submission (csv, tsv/txt, xlsx/xls/ods)
    #[arg(short, long, required = true)]
    pub spreadsheet: PathBuf,
    /// Parent directory of the data files named in the spreadsheet
    #[arg(short, long, default_value = ".")]
    pub directory: PathBuf,
    /// Where manifests, logs and the batch summary go [default: the data directory]
    #[arg(short, long)]
    pub output: Option<PathBuf>,
    /// Center name, for broker accounts only
    #[arg(short, long = "center-name", alias = "centerName")]
    pub center_name: Option<String>,
    #[arg(short, long, value_enum, default_value_t = Mode::Validate)]
    pub mode: Mode,
    /// Use the test submission service
    #[arg(short, long)]
    pub test: bool,
    /// Number of submissions to run at once
    #[arg(short = 'j', long, default_value_t = 1)]
    pub parallel: usize,
    /// Spreadsheet format, when the extension does not say
    #[arg(short, long, value_enum)]
    pub format: Option<SpreadsheetFormat>,
    /// Kill a submission after this many seconds (0 waits forever)
    #[arg(long)]
    pub timeout: Option<u64>,
    /// Path to the Webin-CLI jar; runs `<tool.program> -jar <path>`, so a
    /// custom `tool.program` in the settings must be a Java launcher
    #[arg(long)]
    pub jar: Option<PathBuf>,
    /// Settings file overriding the built-in defaults
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Log more (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Validate,
    Submit,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Validate => "validate",
            Mode::Submit => "submit",
        }
    }
}

impl Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub tool: ToolSettings,
    pub limits: Limits,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolSettings {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub timeout_secs: u64,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Limits {
    pub max_parallel: usize,
}

impl Settings {
    pub fn load(user_file: Option<&Path>) -> Result<Settings, ConfigError> {
        Settings::load_with_env(user_file, None)
    }

    /// Like [`Settings::load`], reading `WEBIN_BULK_*` variables from `env`
    /// instead of the process environment when given.
    pub fn load_with_env(
        user_file: Option<&Path>,
        env: Option<Map<String, String>>,
    ) -> Result<Settings, ConfigError> {
        let mut builder = Config::builder().add_source(config::File::from_str(
            DEFAULT_SETTINGS_STR,
            FileFormat::Toml,
        ));
        if let Some(path) = user_file {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder
            .add_source(
                Environment::with_prefix("WEBIN_BULK")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()?
            .try_deserialize::<Settings>()
    }
}

/// Validated configuration for one batch.
#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct RunConfig {
    #[getset(get = "pub")]
    credentials: Credentials,
    #[getset(get_copy = "pub")]
    context: GeneticContext,
    #[getset(get_copy = "pub")]
    mode: Mode,
    #[getset(get = "pub")]
    spreadsheet: PathBuf,
    #[getset(get_copy = "pub")]
    format: Option<SpreadsheetFormat>,
    #[getset(get = "pub")]
    data_dir: PathBuf,
    #[getset(get = "pub")]
    output_dir: PathBuf,
    #[getset(get = "pub")]
    center_name: Option<String>,
    #[getset(get_copy = "pub")]
    test: bool,
    #[getset(get_copy = "pub")]
    parallelism: usize,
    #[getset(get = "pub")]
    tool: ToolCommand,
    #[getset(get_copy = "pub")]
    timeout: Option<Duration>,
    #[getset(get_copy = "pub")]
    poll_interval: Duration,
}

impl RunConfig {
    pub fn manifest_dir(&self) -> PathBuf {
        self.output_dir.join(MANIFEST_DIR)
    }

    pub fn submission_dir(&self) -> PathBuf {
        self.output_dir.join(SUBMISSION_DIR)
    }
}

impl InputConfig {
    /// Checks the arguments against the filesystem, loads settings and
    /// creates the output directory if needed.
    pub fn validate(&self) -> Result<RunConfig> {
        if !self.spreadsheet.is_file() {
            bail!("Spreadsheet {} does not exist", self.spreadsheet.display());
        }
        if !self.directory.is_dir() {
            bail!(
                "Data directory {} does not exist or is not a directory",
                self.directory.display()
            );
        }

        let output_dir = self.output.clone().unwrap_or_else(|| self.directory.clone());
        if output_dir.is_file() {
            bail!(
                "Output path {} is a file, please use a directory",
                output_dir.display()
            );
        }
        fs::create_dir_all(&output_dir)
            .with_context(|| format!("cannot create output directory {}", output_dir.display()))?;

        let settings = Settings::load(self.config.as_deref()).context("cannot load settings")?;

        let max_parallel = settings.limits.max_parallel;
        if self.parallel == 0 || self.parallel > max_parallel {
            bail!(
                "Invalid number of parallel submissions {}; it should be between 1 and {}",
                self.parallel,
                max_parallel
            );
        }

        let mut tool = ToolCommand {
            program: settings.tool.program,
            args: settings.tool.args,
        };
        if let Some(jar) = &self.jar {
            if !jar.is_file() {
                bail!("Webin-CLI jar {} does not exist", jar.display());
            }
            tool.args = vec!["-jar".to_string(), jar.to_string_lossy().into_owned()];
        }

        let timeout_secs = self.timeout.unwrap_or(settings.tool.timeout_secs);

        Ok(RunConfig {
            credentials: Credentials {
                username: self.username.clone(),
                password: self.password.clone(),
            },
            context: self.context,
            mode: self.mode,
            spreadsheet: self.spreadsheet.clone(),
            format: self.format,
            data_dir: self.directory.clone(),
            output_dir,
            center_name: self
                .center_name
                .clone()
                .filter(|name| !name.trim().is_empty()),
            test: self.test,
            parallelism: self.parallel,
            tool,
            timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
            poll_interval: Duration::from_millis(settings.tool.poll_interval_ms.max(1)),
        })
    }
}
