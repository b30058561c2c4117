use clap::Parser;
use colored::Colorize;
use std::process;
use tracing_subscriber::EnvFilter;

use webin_bulk::config::InputConfig;
use webin_bulk::error::SubmissionError;
use webin_bulk::job::CancelFlag;

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("webin_bulk={}", level)));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn main() {
    let input = InputConfig::parse();
    init_logging(input.verbose);

    println!(
        "{} {}",
        "webin-bulk: bulk manifest generation and Webin-CLI validation/submission.\n Version:"
            .cyan()
            .bold(),
        env!("CARGO_PKG_VERSION").cyan().bold()
    );

    let config = input.validate().unwrap_or_else(|err| {
        eprintln!(
            "Problem parsing arguments: {}",
            format!("{:#}", err).red().bold()
        );
        process::exit(2);
    });
    println!(
        "✅ Configurations validated: {} {} submissions from {}",
        config.mode(),
        config.context(),
        config.spreadsheet().display()
    );

    let cancel = CancelFlag::default();
    let on_interrupt = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("{}", "Interrupted, stopping running submissions...".yellow());
        on_interrupt.cancel();
    }) {
        tracing::warn!(error = %e, "cannot install interrupt handler");
    }

    match webin_bulk::run(&config, &cancel) {
        Ok(report) => {
            report.print_summary(config.output_dir());
            process::exit(report.exit_code());
        }
        Err(e) => {
            eprintln!("Application error: {}", e.to_string().red().bold());
            if let SubmissionError::Schema(_) = e {
                if let Some(columns) = webin_bulk::column_help(config.context()) {
                    eprintln!("\nColumns for context {}:\n{}", config.context(), columns);
                }
            }
            process::exit(if e.is_input_error() { 2 } else { 1 });
        }
    }
}
