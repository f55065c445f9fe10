use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs, path::Path};

use crate::{
    constants::{
        DATE_SENTINEL, DEFAULT_DATE_COLUMNS, DOSAGE_UNIT_SUFFIX, NUMERIC_SENTINEL, TEXT_SENTINEL,
    },
    error::{EtlError, Result},
    table::TableName,
    units::UnitConversion,
};

/// The cleaning policy of one deployment. One value of each sentinel applies to
/// every table in a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleaningPolicy {
    pub text_sentinel: String,
    pub numeric_sentinel: i64,
    pub date_sentinel: String,
    pub date_columns: Vec<String>,
    pub dosage_unit_suffix: String,
    pub unit_conversion: UnitConversion,
}

impl Default for CleaningPolicy {
    fn default() -> Self {
        Self {
            text_sentinel: TEXT_SENTINEL.to_string(),
            numeric_sentinel: NUMERIC_SENTINEL,
            date_sentinel: DATE_SENTINEL.to_string(),
            date_columns: DEFAULT_DATE_COLUMNS.iter().map(|c| c.to_string()).collect(),
            dosage_unit_suffix: DOSAGE_UNIT_SUFFIX.to_string(),
            unit_conversion: UnitConversion::default(),
        }
    }
}

impl CleaningPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.text_sentinel.trim().is_empty() {
            return Err(EtlError::Config("text_sentinel must not be empty".into()));
        }
        // Text columns are uppercased after filling, so a lowercase sentinel
        // would not survive a second cleaning pass unchanged.
        if self.text_sentinel != self.text_sentinel.to_uppercase() {
            return Err(EtlError::Config(format!(
                "text_sentinel '{}' must be uppercase",
                self.text_sentinel
            )));
        }
        NaiveDate::parse_from_str(&self.date_sentinel, "%Y-%m-%d").map_err(|e| {
            EtlError::Config(format!(
                "date_sentinel '{}' is not YYYY-MM-DD: {e}",
                self.date_sentinel
            ))
        })?;
        if self.dosage_unit_suffix.trim().is_empty() {
            return Err(EtlError::Config("dosage_unit_suffix must not be empty".into()));
        }
        self.unit_conversion.validate()
    }

    pub fn is_date_column(&self, column: &str) -> bool {
        self.date_columns.iter().any(|c| c == column)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// Overrides for the per-table file name, keyed by table name.
    pub files: BTreeMap<String, String>,
}

impl InputConfig {
    pub fn file_name(&self, table: TableName) -> String {
        self.files
            .get(table.as_str())
            .cloned()
            .unwrap_or_else(|| format!("{}.csv", table.as_str()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Skip the merge when any table failed to clean.
    pub fail_on_clean_error: bool,
    pub write_null_audit: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct EtlConfig {
    pub input: InputConfig,
    pub cleaning: CleaningPolicy,
    pub run: RunConfig,
}

impl EtlConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            EtlError::Config(format!("Failed to read config file '{}': {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: EtlConfig =
            toml::from_str(content).map_err(|e| EtlError::Config(e.to_string()))?;
        for key in config.input.files.keys() {
            if TableName::from_name(key).is_none() {
                return Err(EtlError::Config(format!("unknown table '{key}' in [input.files]")));
            }
        }
        config.cleaning.validate()?;
        Ok(config)
    }
}
