//! # context.rs
//!
//! Genetic contexts and the declarative table that maps spreadsheet columns
//! to Webin-CLI manifest fields for each of them.
//!
//! The table ships as `data/manifest_fields.toml` and is read through the
//! `config` crate. Each context lists its fields in manifest order together
//! with whether the column is required and how its value is interpreted.
//! Adding a context or a column is a change to the TOML only.

use clap::ValueEnum;
use config::{Config, ConfigError, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{self, Display};

/// Column-to-manifest table, compiled into the binary.
pub const MANIFEST_FIELDS_STR: &str = include_str!("../data/manifest_fields.toml");

/// Submission category; selects the manifest schema and the required columns.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeneticContext {
    Genome,
    Transcriptome,
    /// Targeted sequences (annotated or unannotated)
    Sequence,
    Reads,
    /// Taxonomic reference set
    #[value(name = "taxrefset")]
    #[serde(rename = "taxrefset")]
    TaxRefSet,
}

impl GeneticContext {
    /// The name Webin-CLI expects after `-context`.
    pub fn as_str(&self) -> &'static str {
        match self {
            GeneticContext::Genome => "genome",
            GeneticContext::Transcriptome => "transcriptome",
            GeneticContext::Sequence => "sequence",
            GeneticContext::Reads => "reads",
            GeneticContext::TaxRefSet => "taxrefset",
        }
    }
}

impl Display for GeneticContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a cell value becomes a manifest value.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    #[default]
    Text,
    Integer,
    File,
    ReadFile,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldSpec {
    /// normalized spreadsheet header
    pub column: String,
    /// manifest key; `None` only for `read_file`, whose key follows the extension
    pub key: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub kind: FieldKind,
}

impl FieldSpec {
    pub fn is_data_file(&self) -> bool {
        matches!(self.kind, FieldKind::File | FieldKind::ReadFile)
    }

    fn key_label(&self) -> &str {
        match (&self.key, self.kind) {
            (Some(key), _) => key,
            (None, FieldKind::ReadFile) => "FASTQ/BAM/CRAM",
            (None, _) => "?",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContextSchema {
    /// column whose file name becomes the run label
    pub primary_file: String,
    /// file columns that may replace the primary file in a row, tried in order
    #[serde(default)]
    pub alternative_files: Vec<String>,
    pub fields: Vec<FieldSpec>,
}

impl ContextSchema {
    pub fn required_columns(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(|f| f.required)
            .map(|f| f.column.as_str())
    }

    /// The primary file column followed by its alternatives.
    pub fn label_columns(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary_file.as_str())
            .chain(self.alternative_files.iter().map(String::as_str))
    }

    pub fn field(&self, column: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.column == column)
    }

    /// Human-readable column table, printed when a spreadsheet does not fit.
    pub fn describe(&self) -> String {
        let mut out = format!("{:<32}{:<18}{}\n", "column", "manifest key", "required");
        for field in &self.fields {
            out.push_str(&format!(
                "{:<32}{:<18}{}\n",
                field.column,
                field.key_label(),
                if field.required { "yes" } else { "no" }
            ));
        }
        if !self.alternative_files.is_empty() {
            out.push_str(&format!(
                "each row needs one of: {}\n",
                self.label_columns().collect::<Vec<_>>().join(", ")
            ));
        }
        out
    }

    fn check(&self, context: &str) -> Result<(), ConfigError> {
        for field in &self.fields {
            if field.key.is_none() && field.kind != FieldKind::ReadFile {
                return Err(ConfigError::Message(format!(
                    "context {}: column '{}' has no manifest key",
                    context, field.column
                )));
            }
        }
        if self.alternative_files.is_empty() {
            return match self.field(&self.primary_file) {
                Some(f) if f.is_data_file() && f.required => Ok(()),
                _ => Err(ConfigError::Message(format!(
                    "context {}: primary file '{}' must be a required file column",
                    context, self.primary_file
                ))),
            };
        }
        for column in self.label_columns() {
            match self.field(column) {
                Some(f) if f.is_data_file() && !f.required => {}
                _ => {
                    return Err(ConfigError::Message(format!(
                        "context {}: '{}' must be an optional file column to stand in for another",
                        context, column
                    )));
                }
            }
        }
        Ok(())
    }
}

/// All context schemas, keyed by context name.
#[derive(Debug, Clone)]
pub struct SchemaTable {
    contexts: HashMap<String, ContextSchema>,
}

impl SchemaTable {
    /// Loads the table compiled into the binary.
    pub fn load() -> Result<SchemaTable, ConfigError> {
        SchemaTable::from_toml(MANIFEST_FIELDS_STR)
    }

    pub fn from_toml(toml: &str) -> Result<SchemaTable, ConfigError> {
        let contexts = Config::builder()
            .add_source(config::File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize::<HashMap<String, ContextSchema>>()?;
        for (name, schema) in &contexts {
            schema.check(name)?;
        }
        Ok(SchemaTable { contexts })
    }

    pub fn schema(&self, context: GeneticContext) -> Result<&ContextSchema, ConfigError> {
        self.contexts.get(context.as_str()).ok_or_else(|| {
            ConfigError::Message(format!("no manifest fields defined for context {}", context))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_CONTEXTS: [GeneticContext; 5] = [
        GeneticContext::Genome,
        GeneticContext::Transcriptome,
        GeneticContext::Sequence,
        GeneticContext::Reads,
        GeneticContext::TaxRefSet,
    ];

    #[test]
    fn test_every_context_has_a_schema() {
        let table = SchemaTable::load().unwrap();
        for context in ALL_CONTEXTS {
            let schema = table.schema(context).unwrap();
            assert!(!schema.fields.is_empty(), "{} has no fields", context);
        }
    }

    #[test]
    fn test_reads_schema_order() {
        let table = SchemaTable::load().unwrap();
        let reads = table.schema(GeneticContext::Reads).unwrap();
        assert_eq!(reads.primary_file, "uploaded file 1");
        assert_eq!(reads.fields[0].column, "study_accession");
        assert_eq!(reads.fields[0].key.as_deref(), Some("STUDY"));

        let insert_size = reads.field("insert_size").unwrap();
        assert_eq!(insert_size.kind, FieldKind::Integer);
        assert!(!insert_size.required);

        let file2 = reads.field("uploaded file 2").unwrap();
        assert_eq!(file2.kind, FieldKind::ReadFile);
        assert!(file2.key.is_none());

        let required: Vec<&str> = reads.required_columns().collect();
        assert!(required.contains(&"library_strategy"));
        assert!(!required.contains(&"sequencing_platform"));
    }

    #[test]
    fn test_describe_lists_columns() {
        let table = SchemaTable::load().unwrap();
        let text = table.schema(GeneticContext::Reads).unwrap().describe();
        assert!(text.starts_with("column"));
        assert!(text.contains("uploaded file 1"));
        assert!(text.contains("FASTQ/BAM/CRAM"));
    }

    #[test]
    fn test_rejects_field_without_key() {
        let toml = r#"
            [reads]
            primary_file = "uploaded file 1"
            fields = [
                { column = "study_accession" },
                { column = "uploaded file 1", kind = "read_file", required = true },
            ]
        "#;
        assert!(SchemaTable::from_toml(toml).is_err());
    }

    #[test]
    fn test_rejects_primary_file_that_is_not_a_file() {
        let toml = r#"
            [genome]
            primary_file = "assembly_name"
            fields = [
                { column = "assembly_name", key = "ASSEMBLYNAME", required = true },
            ]
        "#;
        assert!(SchemaTable::from_toml(toml).is_err());
    }

    #[test]
    fn test_flatfile_stands_in_for_sequence_files() {
        let table = SchemaTable::load().unwrap();
        for context in [
            GeneticContext::Genome,
            GeneticContext::Transcriptome,
            GeneticContext::Sequence,
        ] {
            let schema = table.schema(context).unwrap();
            assert_eq!(schema.alternative_files, vec!["flatfile"], "{}", context);
            assert!(!schema.field(&schema.primary_file).unwrap().required);
            assert!(schema.describe().contains("each row needs one of:"));
        }

        let taxrefset = table.schema(GeneticContext::TaxRefSet).unwrap();
        assert!(taxrefset.alternative_files.is_empty());
        assert!(!taxrefset.describe().contains("one of"));
    }

    #[test]
    fn test_rejects_required_alternative() {
        let toml = r#"
            [sequence]
            primary_file = "tab"
            alternative_files = ["flatfile"]
            fields = [
                { column = "tab", key = "TAB", kind = "file", required = true },
                { column = "flatfile", key = "FLATFILE", kind = "file" },
            ]
        "#;
        assert!(SchemaTable::from_toml(toml).is_err());
    }

    #[test]
    fn test_context_names() {
        assert_eq!(GeneticContext::TaxRefSet.to_string(), "taxrefset");
        assert_eq!(
            GeneticContext::from_str("taxrefset", true).unwrap(),
            GeneticContext::TaxRefSet
        );
    }
}
