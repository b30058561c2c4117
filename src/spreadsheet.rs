use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use calamine::{Data, Reader, open_workbook_auto};
use clap::ValueEnum;
use itertools::Itertools;
use regex::Regex;
use tracing::{debug, warn};

use crate::context::ContextSchema;
use crate::error::{Result, SubmissionError};

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

#[derive(Debug, PartialEq, Eq, Clone, Copy, ValueEnum)]
pub enum SpreadsheetFormat {
    /// comma-separated text
    Csv,
    /// tab-separated text
    Tsv,
    /// xlsx, xlsm, xls, xlsb or ods workbook; the first sheet is read
    Excel,
}

impl SpreadsheetFormat {
    /// Picks the format from the file extension, falling back to sniffing the
    /// first line for a tab or a comma.
    pub fn detect(path: &Path) -> Result<SpreadsheetFormat> {
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        match extension.as_str() {
            "csv" => Ok(SpreadsheetFormat::Csv),
            "tsv" | "txt" | "tab" => Ok(SpreadsheetFormat::Tsv),
            "xlsx" | "xlsm" | "xls" | "xlsb" | "ods" => Ok(SpreadsheetFormat::Excel),
            _ => sniff(path),
        }
    }
}

fn sniff(path: &Path) -> Result<SpreadsheetFormat> {
    let content = fs::read(path)?;
    let first_line = content.split(|b| *b == b'\n').next().unwrap_or_default();
    if first_line.contains(&b'\t') {
        Ok(SpreadsheetFormat::Tsv)
    } else if first_line.contains(&b',') {
        Ok(SpreadsheetFormat::Csv)
    } else {
        Err(SubmissionError::format(
            path,
            "unrecognized extension and no tab or comma in the header line",
        ))
    }
}

/// One data row of the input sheet.
#[derive(Debug, Clone)]
pub struct SubmissionRow {
    /// line number in the sheet, the header being line 1
    pub line: usize,
    /// run label, taken from the primary data file's name
    pub label: String,
    /// cells as read, in sheet column order
    pub cells: Vec<String>,
    values: HashMap<String, String>,
}

impl SubmissionRow {
    /// Non-empty value of a normalized column.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.values.get(column).map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct Spreadsheet {
    /// headers as written in the file
    pub headers: Vec<String>,
    pub rows: Vec<SubmissionRow>,
}

/// Lowercases a header and collapses its whitespace, so that
/// `" Uploaded  File 1"` and `"uploaded file 1"` name the same column.
pub fn normalize_header(header: &str) -> String {
    WHITESPACE
        .replace_all(header.trim(), " ")
        .to_lowercase()
}

/// File name without up to two extensions: `run1.fastq.gz` becomes `run1`.
pub fn run_label(file_value: &str) -> Option<String> {
    let file_name = Path::new(file_value).file_name()?;
    let stem = Path::new(file_name).file_stem()?;
    let stem = Path::new(stem).file_stem()?;
    let label = stem.to_string_lossy().trim().to_string();
    if label.is_empty() { None } else { Some(label) }
}

/// Reads the sheet and checks it against the context's required columns.
pub fn load(
    path: &Path,
    format: Option<SpreadsheetFormat>,
    schema: &ContextSchema,
) -> Result<Spreadsheet> {
    let format = match format {
        Some(format) => format,
        None => SpreadsheetFormat::detect(path)?,
    };
    debug!(path = %path.display(), ?format, "reading spreadsheet");

    let table = match format {
        SpreadsheetFormat::Csv => read_delimited(path, b',')?,
        SpreadsheetFormat::Tsv => read_delimited(path, b'\t')?,
        SpreadsheetFormat::Excel => read_workbook(path)?,
    };
    from_table(path, table, schema)
}

fn read_delimited(path: &Path, delimiter: u8) -> Result<Vec<Vec<String>>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| SubmissionError::format(path, e))?;

    let mut table = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| SubmissionError::format(path, e))?;
        table.push(record.iter().map(str::to_string).collect());
    }
    Ok(table)
}

fn read_workbook(path: &Path) -> Result<Vec<Vec<String>>> {
    let mut workbook = open_workbook_auto(path).map_err(|e| SubmissionError::format(path, e))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| SubmissionError::format(path, "workbook has no sheets"))?
        .map_err(|e| SubmissionError::format(path, e))?;

    Ok(range
        .rows()
        .map(|row| row.iter().map(cell_to_string).collect())
        .collect())
}

fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.trim().to_string(),
        // whole numbers come back as floats; 250.0 must be written as 250
        Data::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", *f as i64),
        Data::Float(f) => f.to_string(),
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

fn quoted<'a>(columns: impl Iterator<Item = &'a str>) -> String {
    columns.map(|c| format!("'{}'", c)).join(", ")
}

fn from_table(path: &Path, mut table: Vec<Vec<String>>, schema: &ContextSchema) -> Result<Spreadsheet> {
    if table.is_empty() {
        return Err(SubmissionError::format(path, "file is empty"));
    }
    let headers = table.remove(0);
    let normalized: Vec<String> = headers.iter().map(|h| normalize_header(h)).collect();
    if normalized.iter().all(String::is_empty) {
        return Err(SubmissionError::format(path, "header row is empty"));
    }

    let mut seen = HashSet::new();
    for column in normalized.iter().filter(|c| !c.is_empty()) {
        if !seen.insert(column.as_str()) {
            return Err(SubmissionError::format(
                path,
                format!("column '{}' appears more than once", column),
            ));
        }
    }

    let missing: Vec<&str> = schema
        .required_columns()
        .filter(|c| !seen.contains(c))
        .collect();
    if !missing.is_empty() {
        return Err(SubmissionError::Schema(format!(
            "spreadsheet is missing required column(s): {}",
            missing.iter().map(|c| format!("'{}'", c)).join(", ")
        )));
    }
    if !schema.label_columns().any(|c| seen.contains(c)) {
        return Err(SubmissionError::Schema(format!(
            "spreadsheet needs one of the column(s): {}",
            quoted(schema.label_columns())
        )));
    }

    let mut rows = Vec::with_capacity(table.len());
    for (index, cells) in table.into_iter().enumerate() {
        let line = index + 2;
        if cells.iter().all(|c| c.trim().is_empty()) {
            debug!(line, "skipping blank row");
            continue;
        }

        let values: HashMap<String, String> = normalized
            .iter()
            .zip(cells.iter())
            .filter(|(column, value)| !column.is_empty() && !value.trim().is_empty())
            .map(|(column, value)| (column.clone(), value.trim().to_string()))
            .collect();

        let empty: Vec<&str> = schema
            .required_columns()
            .filter(|c| !values.contains_key(*c))
            .collect();
        if !empty.is_empty() {
            return Err(SubmissionError::Schema(format!(
                "row {}: required column(s) empty: {}",
                line,
                empty.iter().map(|c| format!("'{}'", c)).join(", ")
            )));
        }

        let Some((column, file)) = schema
            .label_columns()
            .find_map(|c| values.get(c).map(|v| (c, v.as_str())))
        else {
            return Err(SubmissionError::Schema(format!(
                "row {}: one of {} must be given",
                line,
                quoted(schema.label_columns())
            )));
        };
        let label = run_label(file).ok_or_else(|| {
            SubmissionError::Schema(format!(
                "row {}: cannot derive a run name from '{}' in column '{}'",
                line, file, column
            ))
        })?;

        rows.push(SubmissionRow {
            line,
            label,
            cells,
            values,
        });
    }

    if rows.is_empty() {
        warn!(path = %path.display(), "spreadsheet has no data rows");
    }
    Ok(Spreadsheet { headers, rows })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{GeneticContext, SchemaTable};
    use std::path::PathBuf;

    const READS_HEADER: &str = "study_accession,sample_accession,experiment_name,sequencing_instrument,library_source,library_selection,library_strategy,uploaded file 1";

    fn reads_schema() -> ContextSchema {
        SchemaTable::load()
            .unwrap()
            .schema(GeneticContext::Reads)
            .unwrap()
            .clone()
    }

    fn write_sheet(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_detect_format() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            SpreadsheetFormat::detect(Path::new("meta.csv")).unwrap(),
            SpreadsheetFormat::Csv
        );
        assert_eq!(
            SpreadsheetFormat::detect(Path::new("meta.TSV")).unwrap(),
            SpreadsheetFormat::Tsv
        );
        assert_eq!(
            SpreadsheetFormat::detect(Path::new("meta.xlsx")).unwrap(),
            SpreadsheetFormat::Excel
        );

        let tabbed = write_sheet(dir.path(), "meta.dat", "a\tb\n1\t2\n");
        assert_eq!(SpreadsheetFormat::detect(&tabbed).unwrap(), SpreadsheetFormat::Tsv);

        let neither = write_sheet(dir.path(), "meta.dat2", "just one column\n");
        assert!(matches!(
            SpreadsheetFormat::detect(&neither),
            Err(SubmissionError::Format { .. })
        ));
    }

    #[test]
    fn test_normalize_header() {
        assert_eq!(normalize_header("  Uploaded   File 1 "), "uploaded file 1");
        assert_eq!(normalize_header("Study_Accession"), "study_accession");
    }

    #[test]
    fn test_run_label() {
        assert_eq!(run_label("run1.fastq.gz").as_deref(), Some("run1"));
        assert_eq!(run_label("data/sub/run2.cram").as_deref(), Some("run2"));
        assert_eq!(run_label("plain").as_deref(), Some("plain"));
        assert_eq!(run_label("/"), None);
    }

    #[test]
    fn test_cell_to_string() {
        assert_eq!(cell_to_string(&Data::Float(250.0)), "250");
        assert_eq!(cell_to_string(&Data::Float(2.5)), "2.5");
        assert_eq!(cell_to_string(&Data::String("  ERP1 ".into())), "ERP1");
        assert_eq!(cell_to_string(&Data::Empty), "");
    }

    #[test]
    fn test_load_csv() {
        let dir = tempfile::tempdir().unwrap();
        let content = format!(
            "{}\nERP1,ERS1,exp1,Illumina NovaSeq 6000,GENOMIC,RANDOM,WGS,run1_R1.fastq.gz\n\
             ,,,,,,,\n\
             ERP1,ERS2,exp2,Illumina NovaSeq 6000,GENOMIC,RANDOM,WGS,run2_R1.fastq.gz\n",
            READS_HEADER
        );
        let path = write_sheet(dir.path(), "meta.csv", &content);
        let sheet = load(&path, None, &reads_schema()).unwrap();

        assert_eq!(sheet.headers.len(), 8);
        assert_eq!(sheet.rows.len(), 2);
        assert_eq!(sheet.rows[0].line, 2);
        assert_eq!(sheet.rows[0].label, "run1_R1");
        assert_eq!(sheet.rows[1].line, 4, "blank line 3 is skipped");
        assert_eq!(sheet.rows[1].get("sample_accession"), Some("ERS2"));
    }

    #[test]
    fn test_load_tsv_with_messy_headers() {
        let dir = tempfile::tempdir().unwrap();
        let header = READS_HEADER
            .replace(',', "\t")
            .replace("uploaded file 1", "Uploaded  File 1");
        let content = format!(
            "{}\tnotes\nERP1\tERS1\texp1\tMinION\tGENOMIC\tRANDOM\tWGS\trun1.bam\tunused\n",
            header
        );
        let path = write_sheet(dir.path(), "meta.tsv", &content);
        let sheet = load(&path, None, &reads_schema()).unwrap();
        assert_eq!(sheet.rows[0].get("uploaded file 1"), Some("run1.bam"));
        assert_eq!(sheet.rows[0].get("notes"), Some("unused"));
    }

    #[test]
    fn test_load_workbook() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/data/reads.xlsx");
        let sheet = load(&path, None, &reads_schema()).unwrap();

        assert_eq!(sheet.headers.len(), 10);
        assert_eq!(sheet.headers[9], "Uploaded  File 1");
        assert_eq!(sheet.rows.len(), 2);
        assert_eq!(sheet.rows[0].label, "runA_1");
        assert_eq!(sheet.rows[0].get("insert_size"), Some("250"));
        assert_eq!(sheet.rows[1].line, 4, "empty row 3 is skipped");
        assert_eq!(sheet.rows[1].get("insert_size"), Some("312.5"));
        assert_eq!(sheet.rows[1].get("uploaded file 1"), Some("runB_1.fastq.gz"));
    }

    #[test]
    fn test_missing_required_column() {
        let dir = tempfile::tempdir().unwrap();
        let header = READS_HEADER.replace(",library_strategy", "");
        let content = format!("{}\nERP1,ERS1,exp1,MinION,GENOMIC,RANDOM,run1.bam\n", header);
        let path = write_sheet(dir.path(), "meta.csv", &content);
        let err = load(&path, None, &reads_schema()).unwrap_err();
        assert!(matches!(err, SubmissionError::Schema(_)));
        assert!(err.to_string().contains("library_strategy"));
    }

    #[test]
    fn test_empty_required_cell() {
        let dir = tempfile::tempdir().unwrap();
        let content = format!(
            "{}\nERP1,,exp1,MinION,GENOMIC,RANDOM,WGS,run1.bam\n",
            READS_HEADER
        );
        let path = write_sheet(dir.path(), "meta.csv", &content);
        let err = load(&path, None, &reads_schema()).unwrap_err();
        assert!(err.to_string().contains("row 2"), "{}", err);
        assert!(err.to_string().contains("sample_accession"));
    }

    #[test]
    fn test_flatfile_names_the_run_when_tab_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let table = SchemaTable::load().unwrap();
        let schema = table.schema(GeneticContext::Sequence).unwrap();

        let content = "study_accession,name,tab,flatfile
                       ERP1,seq1,seq1.tsv.gz,
                       ERP1,seq2,,seq2.embl.gz
";
        let path = write_sheet(dir.path(), "meta.csv", content);
        let sheet = load(&path, None, schema).unwrap();
        assert_eq!(sheet.rows[0].label, "seq1");
        assert_eq!(sheet.rows[1].label, "seq2");

        let neither = write_sheet(dir.path(), "neither.csv", "study_accession,name,tab
ERP1,seq1,
");
        let err = load(&neither, None, schema).unwrap_err();
        assert!(err.to_string().contains("row 2: one of 'tab', 'flatfile'"), "{}", err);

        let no_column = write_sheet(dir.path(), "nocol.csv", "study_accession,name
ERP1,seq1
");
        assert!(matches!(load(&no_column, None, schema), Err(SubmissionError::Schema(_))));
    }

    #[test]
    fn test_ragged_rows_are_a_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let content = format!("{}\nERP1,ERS1\n", READS_HEADER);
        let path = write_sheet(dir.path(), "meta.csv", &content);
        assert!(matches!(
            load(&path, None, &reads_schema()),
            Err(SubmissionError::Format { .. })
        ));
    }

    #[test]
    fn test_duplicate_header_is_a_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let content = format!("{},Study_Accession\n", READS_HEADER);
        let path = write_sheet(dir.path(), "meta.csv", &content);
        assert!(matches!(
            load(&path, None, &reads_schema()),
            Err(SubmissionError::Format { .. })
        ));
    }

    #[test]
    fn test_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sheet(dir.path(), "meta.csv", "");
        assert!(matches!(
            load(&path, None, &reads_schema()),
            Err(SubmissionError::Format { .. })
        ));
    }
}
