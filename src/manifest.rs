use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::context::{ContextSchema, FieldKind, FieldSpec};
use crate::error::{Result, SubmissionError};
use crate::spreadsheet::{Spreadsheet, SubmissionRow};

/// A Webin-CLI manifest generated from one spreadsheet row.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestFile {
    pub path: PathBuf,
    pub label: String,
    /// sheet line of the row this manifest was built from
    pub line: usize,
    /// `(KEY, value)` in manifest order
    pub entries: Vec<(String, String)>,
    pub data_files: Vec<PathBuf>,
}

impl ManifestFile {
    /// Tab-separated `KEY value` lines, one per entry.
    pub fn render(&self) -> String {
        self.entries
            .iter()
            .map(|(key, value)| format!("{}\t{}\n", key, value))
            .collect()
    }

    pub fn write(&self) -> std::io::Result<()> {
        fs::write(&self.path, self.render())
    }
}

pub fn manifest_path(manifest_dir: &Path, label: &str) -> PathBuf {
    manifest_dir.join(format!("Manifest_{}.txt", label))
}

/// Manifest key for a read file, chosen by its extension once any
/// compression suffix is removed.
pub fn read_file_key(value: &str) -> Option<&'static str> {
    let name = Path::new(value).file_name()?.to_string_lossy().to_lowercase();
    let name = [".gz", ".bz2", ".zst"]
        .iter()
        .find_map(|suffix| name.strip_suffix(suffix))
        .unwrap_or(&name);

    match Path::new(name).extension()?.to_str()? {
        "fastq" | "fq" => Some("FASTQ"),
        "bam" => Some("BAM"),
        "cram" => Some("CRAM"),
        _ => None,
    }
}

fn parse_integer(value: &str) -> Option<i64> {
    value.parse::<i64>().ok().or_else(|| {
        value
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .map(|f| f.trunc() as i64)
    })
}

/// Joins relative paths onto the data directory, checks the file can be
/// opened and returns its canonical absolute path.
fn resolve_data_file(value: &str, data_dir: &Path) -> std::result::Result<PathBuf, String> {
    let path = Path::new(value);
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        data_dir.join(path)
    };

    if !joined.is_file() {
        return Err(format!("data file {} does not exist", joined.display()));
    }
    File::open(&joined).map_err(|e| format!("data file {} is not readable: {}", joined.display(), e))?;
    fs::canonicalize(&joined).map_err(|e| format!("cannot resolve {}: {}", joined.display(), e))
}

fn fixed_key(field: &FieldSpec, line: usize) -> Result<String> {
    field.key.clone().ok_or_else(|| {
        SubmissionError::Schema(format!(
            "row {}: column '{}' has no manifest key",
            line, field.column
        ))
    })
}

/// Maps one row onto the context's manifest fields.
pub fn build_manifest(
    row: &SubmissionRow,
    schema: &ContextSchema,
    data_dir: &Path,
    manifest_dir: &Path,
) -> Result<ManifestFile> {
    let line = row.line;
    let mut entries = Vec::new();
    let mut data_files = Vec::new();

    for field in &schema.fields {
        let Some(value) = row.get(&field.column) else {
            if field.required {
                return Err(SubmissionError::Schema(format!(
                    "row {}: required column '{}' is empty",
                    line, field.column
                )));
            }
            continue;
        };

        match field.kind {
            FieldKind::Text => entries.push((fixed_key(field, line)?, value.to_string())),
            FieldKind::Integer => {
                let number = parse_integer(value).ok_or_else(|| {
                    SubmissionError::Schema(format!(
                        "row {}: column '{}' expects a number, found '{}'",
                        line, field.column, value
                    ))
                })?;
                entries.push((fixed_key(field, line)?, number.to_string()));
            }
            FieldKind::File | FieldKind::ReadFile => {
                let key = match field.kind {
                    FieldKind::ReadFile => read_file_key(value)
                        .map(str::to_string)
                        .ok_or_else(|| {
                            SubmissionError::Schema(format!(
                                "row {}: cannot tell the read file type of '{}' (expected fastq, bam or cram)",
                                line, value
                            ))
                        })?,
                    _ => fixed_key(field, line)?,
                };
                let resolved = resolve_data_file(value, data_dir).map_err(|reason| {
                    SubmissionError::Schema(format!(
                        "row {}: column '{}': {}",
                        line, field.column, reason
                    ))
                })?;
                entries.push((key, resolved.to_string_lossy().into_owned()));
                data_files.push(resolved);
            }
        }
    }

    Ok(ManifestFile {
        path: manifest_path(manifest_dir, &row.label),
        label: row.label.clone(),
        line,
        entries,
        data_files,
    })
}

/// Builds every manifest in memory. Fails on the first bad row or on two
/// rows that would write the same manifest; nothing is written here.
pub fn build_manifests(
    sheet: &Spreadsheet,
    schema: &ContextSchema,
    data_dir: &Path,
    manifest_dir: &Path,
) -> Result<Vec<ManifestFile>> {
    let mut seen: HashMap<PathBuf, usize> = HashMap::new();
    let mut manifests = Vec::with_capacity(sheet.rows.len());

    for row in &sheet.rows {
        let manifest = build_manifest(row, schema, data_dir, manifest_dir)?;
        if let Some(first_line) = seen.insert(manifest.path.clone(), row.line) {
            return Err(SubmissionError::DuplicateJob {
                path: manifest.path,
                first_line,
                second_line: row.line,
            });
        }
        debug!(line = row.line, label = %manifest.label, "manifest built");
        manifests.push(manifest);
    }
    Ok(manifests)
}

pub fn write_manifests(manifests: &[ManifestFile], manifest_dir: &Path) -> Result<()> {
    fs::create_dir_all(manifest_dir)?;
    for manifest in manifests {
        manifest.write()?;
    }
    info!(count = manifests.len(), dir = %manifest_dir.display(), "manifests written");
    Ok(())
}
