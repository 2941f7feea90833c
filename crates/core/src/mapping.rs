//! Column-to-field mapping of a bulk update job and submission validation.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::fields::{DateOrder, FieldSpec, NumberLocale, ParseOptions};

/// One source column written to one downstream field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMapping {
    /// Source column header.
    pub column: String,
    /// Downstream field identifier.
    pub field_id: String,
    pub field: FieldSpec,
}

/// The full mapping stored with a job (`jobs.mapping`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMapping {
    /// Source column holding the downstream record identifier.
    pub id_column: String,
    pub columns: Vec<ColumnMapping>,
    #[serde(default)]
    pub locale: NumberLocale,
    #[serde(default)]
    pub date_order: DateOrder,
}

impl JobMapping {
    pub fn parse_options(&self) -> ParseOptions {
        ParseOptions {
            locale: self.locale,
            date_order: self.date_order,
        }
    }
}

/// Reasons a job submission is rejected before it is queued.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidJob {
    #[error("Job title must not be blank")]
    BlankTitle,

    #[error("Mapping must contain at least one column")]
    EmptyMapping,

    #[error("Job must contain at least one row")]
    NoRows,

    #[error("Row identifier column must be specified")]
    MissingIdColumn,

    #[error("Row identifier column '{0}' is not present in the source columns")]
    IdColumnNotInSource(String),

    #[error("Mapped column '{0}' is not present in the source columns")]
    UnknownColumn(String),

    #[error("Field '{0}' is mapped more than once")]
    DuplicateField(String),

    #[error("Choice field '{0}' has no options")]
    EmptyChoiceOptions(String),
}

/// Validate a submission before it is persisted.
///
/// `source_columns` is the header row of the uploaded rows and `row_count`
/// the number of data rows.
pub fn validate_submission(
    title: &str,
    source_columns: &[String],
    mapping: &JobMapping,
    row_count: usize,
) -> Result<(), InvalidJob> {
    if title.trim().is_empty() {
        return Err(InvalidJob::BlankTitle);
    }
    if mapping.columns.is_empty() {
        return Err(InvalidJob::EmptyMapping);
    }
    if row_count == 0 {
        return Err(InvalidJob::NoRows);
    }

    let id_column = mapping.id_column.trim();
    if id_column.is_empty() {
        return Err(InvalidJob::MissingIdColumn);
    }

    let known: HashSet<&str> = source_columns.iter().map(|c| c.as_str()).collect();
    if !known.contains(id_column) {
        return Err(InvalidJob::IdColumnNotInSource(id_column.to_string()));
    }

    let mut fields = HashSet::new();
    for col in &mapping.columns {
        if !known.contains(col.column.as_str()) {
            return Err(InvalidJob::UnknownColumn(col.column.clone()));
        }
        if !fields.insert(col.field_id.as_str()) {
            return Err(InvalidJob::DuplicateField(col.field_id.clone()));
        }
        if let FieldSpec::Choice { options } = &col.field {
            if options.is_empty() {
                return Err(InvalidJob::EmptyChoiceOptions(col.field_id.clone()));
            }
        }
    }

    Ok(())
}
