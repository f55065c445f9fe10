use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// A single field that failed to parse under its expected shape.
///
/// Format errors are row- or column-scoped: the offending cell is left in a safe
/// default state, the batch continues and the error goes into the run's reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormatError {
    pub table: String,
    pub column: String,
    pub row: Option<usize>,
    pub value: String,
    pub reason: String,
}

impl FormatError {
    pub fn new(
        table: impl Into<String>,
        column: impl Into<String>,
        row: Option<usize>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
            row,
            value: value.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.row {
            Some(row) => write!(
                f,
                "{}.{} row {}: {} (value '{}')",
                self.table, self.column, row, self.reason, self.value
            ),
            None => write!(
                f,
                "{}.{}: {} (value '{}')",
                self.table, self.column, self.reason, self.value
            ),
        }
    }
}

#[derive(Debug, Error)]
pub enum EtlError {
    /// A required table or join key is absent.
    #[error("Missing input: {0}")]
    MissingInput(String),

    #[error("Sink {target} failed: {message}")]
    Sink { target: String, message: String },

    #[error("Failed loading {source_name}: {message}")]
    Load {
        source_name: String,
        message: String,
    },

    /// Structural problem with a row set (ragged columns, duplicate names, ...).
    #[error("Table {table}: {message}")]
    Table { table: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl EtlError {
    pub fn sink(target: impl Into<String>, err: impl fmt::Display) -> Self {
        Self::Sink {
            target: target.into(),
            message: err.to_string(),
        }
    }

    pub fn load(source_name: impl Into<String>, err: impl fmt::Display) -> Self {
        Self::Load {
            source_name: source_name.into(),
            message: err.to_string(),
        }
    }

    pub fn table(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Table {
            table: table.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EtlError>;
