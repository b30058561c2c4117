use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;
use rand::Rng;
use rand::prelude::IndexedRandom;

const INSTRUMENTS: [&str; 4] = [
    "Illumina NovaSeq 6000",
    "Illumina MiSeq",
    "MinION",
    "Illumina HiSeq 2500",
];

const HEADER: [&str; 11] = [
    "study_accession",
    "sample_accession",
    "experiment_name",
    "sequencing_platform",
    "sequencing_instrument",
    "library_source",
    "library_selection",
    "library_strategy",
    "insert_size",
    "uploaded file 1",
    "uploaded file 2",
];

/// Writes a reads spreadsheet with placeholder data files, for trying out
/// webin-bulk against the test service or a stub tool.
#[derive(Debug, Parser)]
#[command(name = "mockdata")]
struct Args {
    /// number of rows to generate
    rows: usize,
    /// directory for the spreadsheet and data files
    #[arg(short, long, default_value = "mock_data")]
    output: PathBuf,
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    fs::create_dir_all(&args.output)?;

    let sheet = write_mock_sheet(&args.output, args.rows)?;
    println!("Wrote {} rows to {}", args.rows, sheet.display());
    Ok(())
}

fn write_mock_sheet(dir: &Path, rows: usize) -> Result<PathBuf, Box<dyn Error>> {
    let mut rng = rand::rng();
    let study = format!("PRJEB{}", rng.random_range(10000..99999));

    let path = dir.join("metadata.tsv");
    let mut wtr = csv::WriterBuilder::new().delimiter(b'\t').from_path(&path)?;
    wtr.write_record(HEADER)?;

    for i in 1..=rows {
        let instrument = INSTRUMENTS.choose(&mut rng).copied().unwrap_or("MinION");
        let platform = if instrument == "MinION" {
            "OXFORD_NANOPORE"
        } else {
            "ILLUMINA"
        };
        let r1 = format!("sample_{:04}_1.fastq.gz", i);
        let r2 = format!("sample_{:04}_2.fastq.gz", i);
        fs::write(dir.join(&r1), b"")?;
        fs::write(dir.join(&r2), b"")?;

        wtr.write_record([
            study.clone(),
            format!("ERS{}", rng.random_range(1000000..9999999)),
            format!("mock experiment {}", i),
            platform.to_string(),
            instrument.to_string(),
            "GENOMIC".to_string(),
            "RANDOM".to_string(),
            "WGS".to_string(),
            rng.random_range(200..600).to_string(),
            r1,
            r2,
        ])?;
    }
    wtr.flush()?;
    Ok(path)
}
