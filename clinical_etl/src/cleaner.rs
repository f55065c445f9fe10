//! Per-table column repair.
//!
//! Each table is cleaned on its own copy, so a failure in one table never
//! touches another. Steps run in a fixed order:
//!
//! 1. structural validation and removal of rows without a `patient_id`
//! 2. exact-duplicate removal
//! 3. `dosage` → `dosage_mg` and numeric coercion of declared numeric columns
//! 4. `age` median fill (before any sentinel is written) and integer cast
//! 5. lab unit normalization and annotation, while nulls are still nulls
//! 6. date canonicalization
//! 7. text fill + uppercase, numeric sentinel fill
//! 8. a second exact-duplicate pass over the cleaned representation
//!
//! The last pass is what makes cleaning idempotent: rows that differed only by
//! case or by null-vs-sentinel collapse on the first run, not the second.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::Serialize;

use crate::{
    annotator::annotate_lab_results,
    config::CleaningPolicy,
    error::{EtlError, FormatError, Result},
    schema::declared_kind,
    table::{ColumnKind, Mask, Table, TableName, TableSet, Value, mask_count},
    units::normalize_lab_units,
};

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%Y.%m.%d",
    "%Y%m%d",
    "%m/%d/%Y",
    "%m-%d-%Y",
    "%d.%m.%Y",
    "%d %b %Y",
    "%d %B %Y",
    "%b %d %Y",
    "%B %d %Y",
    "%b %d, %Y",
    "%B %d, %Y",
];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

/// Lenient date parsing over the formats seen in clinical extracts.
pub fn parse_date_lenient(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.date_naive());
    }
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            DATETIME_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
                .map(|dt| dt.date())
        })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum CleanStatus {
    Cleaned,
    Failed(String),
}

/// A row removed because it cannot be attributed to a patient.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedRow {
    pub row: usize,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableCleanReport {
    pub table: TableName,
    #[serde(flatten)]
    pub status: CleanStatus,
    pub rows_in: usize,
    pub rows_out: usize,
    pub duplicates_removed: usize,
    pub units_converted: usize,
    pub notes_annotated: usize,
    pub rejected_rows: Vec<RejectedRow>,
    pub format_errors: Vec<FormatError>,
}

impl TableCleanReport {
    fn new(table: TableName, rows_in: usize) -> Self {
        Self {
            table,
            status: CleanStatus::Cleaned,
            rows_in,
            rows_out: rows_in,
            duplicates_removed: 0,
            units_converted: 0,
            notes_annotated: 0,
            rejected_rows: Vec::new(),
            format_errors: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == CleanStatus::Cleaned
    }
}

#[derive(Debug, Clone)]
pub struct CleanOutcome {
    pub tables: TableSet,
    pub reports: Vec<TableCleanReport>,
}

impl CleanOutcome {
    pub fn failed_tables(&self) -> Vec<TableName> {
        self.reports
            .iter()
            .filter(|r| !r.succeeded())
            .map(|r| r.table)
            .collect()
    }
}

/// Working copy of one table plus the extract row number of every current row.
struct CleaningState<'a> {
    name: TableName,
    table: Table,
    origin: Vec<usize>,
    policy: &'a CleaningPolicy,
    report: TableCleanReport,
}

impl CleaningState<'_> {
    fn retain(&mut self, keep: &Mask) {
        self.table.retain_rows(keep);
        let mut idx = 0;
        self.origin.retain(|_| {
            let keep_row = keep[idx];
            idx += 1;
            keep_row
        });
    }

    fn record_format_errors(&mut self, errors: Vec<FormatError>) {
        for mut err in errors {
            err.row = err.row.and_then(|row| self.origin.get(row).copied());
            self.report.format_errors.push(err);
        }
    }

    fn format_error(&mut self, column: &str, row: usize, value: &Value, reason: &str) {
        let err = FormatError::new(
            self.name.as_str(),
            column,
            self.origin.get(row).copied(),
            value.render(),
            reason,
        );
        self.report.format_errors.push(err);
    }

    fn kind_of(&self, column: &str) -> ColumnKind {
        if self.policy.is_date_column(column) {
            return ColumnKind::Date;
        }
        declared_kind(self.name, column)
            .or_else(|| self.table.column(column).and_then(|c| c.inferred_kind()))
            .unwrap_or(ColumnKind::Text)
    }

    fn is_missing_text(&self, value: &Value) -> bool {
        match value {
            Value::Null => true,
            Value::Text(s) => {
                let s = s.trim();
                s.is_empty() || s.eq_ignore_ascii_case(&self.policy.text_sentinel)
            }
            _ => false,
        }
    }

    fn drop_rows_without_patient_id(&mut self) -> Result<()> {
        let Some(ids) = self.table.column("patient_id") else {
            return Err(EtlError::MissingInput(format!(
                "{} has no patient_id column",
                self.name
            )));
        };
        let keep: Mask = ids.values.iter().map(|v| !self.is_missing_text(v)).collect();
        let dropped = keep.len() - mask_count(&keep);
        if dropped == 0 {
            return Ok(());
        }
        for (row, kept) in keep.iter().enumerate() {
            if !kept {
                self.report.rejected_rows.push(RejectedRow {
                    row: self.origin[row],
                    reason: "missing patient_id".to_string(),
                });
            }
        }
        tracing::warn!("Dropped {} {} row(s) without a patient_id", dropped, self.name);
        self.retain(&keep);
        Ok(())
    }

    fn remove_duplicates(&mut self) {
        let keep = self.table.distinct_mask();
        let removed = keep.len() - mask_count(&keep);
        if removed > 0 {
            self.retain(&keep);
            self.report.duplicates_removed += removed;
            tracing::info!("Removed {} duplicate row(s) in {}", removed, self.name);
        }
    }

    fn strip_dosage_units(&mut self) -> Result<()> {
        if !self.table.has_column("dosage") {
            return Ok(());
        }
        if self.table.has_column("dosage_mg") {
            return Err(EtlError::table(
                self.name.as_str(),
                "both dosage and dosage_mg are present",
            ));
        }
        let suffix = self.policy.dosage_unit_suffix.to_ascii_lowercase();
        let mut failures = Vec::new();
        if let Some(column) = self.table.column_mut("dosage") {
            for (row, value) in column.values.iter_mut().enumerate() {
                let parsed = match &*value {
                    Value::Null => continue,
                    Value::Int(i) => Some(*i as f64),
                    Value::Float(f) => Some(*f),
                    Value::Text(s) => {
                        let lowered = s.trim().to_ascii_lowercase();
                        let number = lowered.strip_suffix(&suffix).unwrap_or(&lowered);
                        number.trim().parse::<f64>().ok().filter(|v| v.is_finite())
                    }
                };
                match parsed {
                    Some(v) => *value = Value::Float(v),
                    None => {
                        failures.push((row, value.clone()));
                        *value = Value::Null;
                    }
                }
            }
        }
        for (row, value) in failures {
            self.format_error("dosage", row, &value, "dosage is not a number with a mg suffix");
        }
        self.table.rename_column("dosage", "dosage_mg")
    }

    fn coerce_numeric_columns(&mut self) {
        let numeric: Vec<(String, ColumnKind)> = self
            .table
            .column_names()
            .into_iter()
            .filter_map(|name| match declared_kind(self.name, name) {
                Some(kind @ (ColumnKind::Integer | ColumnKind::Float)) => {
                    Some((name.to_string(), kind))
                }
                _ => None,
            })
            .collect();

        for (name, kind) in numeric {
            let mut failures = Vec::new();
            if let Some(column) = self.table.column_mut(&name) {
                for (row, value) in column.values.iter_mut().enumerate() {
                    let coerced = match &*value {
                        Value::Text(s) => match s.trim().parse::<f64>() {
                            Ok(v) if v.is_finite() => Value::Float(v),
                            _ => {
                                failures.push((row, value.clone()));
                                Value::Null
                            }
                        },
                        Value::Int(i) if kind == ColumnKind::Float => Value::Float(*i as f64),
                        other => other.clone(),
                    };
                    *value = coerced;
                }
            }
            for (row, value) in failures {
                self.format_error(&name, row, &value, "value is not numeric");
            }
        }
    }

    fn fill_age_with_median(&mut self) {
        let sentinel = self.policy.numeric_sentinel as f64;
        let Some(column) = self.table.column_mut("age") else {
            return;
        };
        let mut observed: Vec<f64> = column
            .values
            .iter()
            .filter_map(Value::as_f64)
            .filter(|v| *v != sentinel)
            .collect();
        observed.sort_by(f64::total_cmp);
        let median = match observed.len() {
            0 => None,
            n if n % 2 == 1 => Some(observed[n / 2]),
            n => Some((observed[n / 2 - 1] + observed[n / 2]) / 2.0),
        };

        let mut filled = 0usize;
        for value in column.values.iter_mut() {
            let current = value.as_f64().filter(|v| *v != sentinel);
            *value = match (current, median) {
                (Some(age), _) => Value::Int(age.trunc() as i64),
                (None, Some(m)) => {
                    filled += 1;
                    Value::Int(m.trunc() as i64)
                }
                (None, None) => Value::Null,
            };
        }
        if filled > 0 {
            tracing::info!(
                "Filled {} missing age(s) in {} with median {:?}",
                filled,
                self.name,
                median
            );
        }
    }

    fn normalize_lab_results(&mut self) {
        if self.name != TableName::LabResults {
            return;
        }
        let units = normalize_lab_units(
            &mut self.table,
            &self.policy.unit_conversion,
            &self.policy.text_sentinel,
        );
        self.report.units_converted = units.converted_rows;
        self.record_format_errors(units.format_errors);

        let notes = annotate_lab_results(&mut self.table, self.policy);
        self.report.notes_annotated = notes.annotated;
        self.record_format_errors(notes.format_errors);
    }

    fn canonicalize_dates(&mut self) {
        let date_columns: Vec<String> = self
            .table
            .column_names()
            .into_iter()
            .filter(|name| self.policy.is_date_column(name))
            .map(str::to_string)
            .collect();
        let sentinel = self.policy.date_sentinel.clone();

        for name in date_columns {
            let mut failures = Vec::new();
            if let Some(column) = self.table.column_mut(&name) {
                for (row, value) in column.values.iter_mut().enumerate() {
                    let parsed = match &*value {
                        Value::Null => None,
                        Value::Text(s) => {
                            let parsed = parse_date_lenient(s);
                            if parsed.is_none() && !s.trim().is_empty() {
                                failures.push((row, value.clone()));
                            }
                            parsed
                        }
                        Value::Int(i) => {
                            let parsed = NaiveDate::parse_from_str(&i.to_string(), "%Y%m%d").ok();
                            if parsed.is_none() {
                                failures.push((row, value.clone()));
                            }
                            parsed
                        }
                        Value::Float(_) => {
                            failures.push((row, value.clone()));
                            None
                        }
                    };
                    *value = Value::Text(
                        parsed
                            .map(|d| d.format("%Y-%m-%d").to_string())
                            .unwrap_or_else(|| sentinel.clone()),
                    );
                }
            }
            for (row, value) in failures {
                self.format_error(&name, row, &value, "unparseable date");
            }
        }
    }

    fn fill_and_normalize_columns(&mut self) {
        let kinds: Vec<(String, ColumnKind)> = self
            .table
            .column_names()
            .into_iter()
            .map(|name| (name.to_string(), self.kind_of(name)))
            .collect();
        let text_sentinel = self.policy.text_sentinel.clone();
        let numeric_sentinel = self.policy.numeric_sentinel;

        for (name, kind) in kinds {
            let Some(column) = self.table.column_mut(&name) else {
                continue;
            };
            for value in column.values.iter_mut() {
                let next = match (kind, &*value) {
                    (ColumnKind::Date, _) => continue,
                    (ColumnKind::Text, Value::Null) => Value::Text(text_sentinel.clone()),
                    (ColumnKind::Text, Value::Text(s)) => Value::Text(s.trim().to_uppercase()),
                    (ColumnKind::Text, other) => Value::Text(other.render().to_uppercase()),
                    (ColumnKind::Integer, Value::Null) => Value::Int(numeric_sentinel),
                    (ColumnKind::Float, Value::Null) => Value::Float(numeric_sentinel as f64),
                    (ColumnKind::Float, Value::Int(i)) => Value::Float(*i as f64),
                    (_, other) => other.clone(),
                };
                *value = next;
            }
        }
    }
}

fn run_steps(state: &mut CleaningState<'_>) -> Result<()> {
    state.table.validate()?;
    state.drop_rows_without_patient_id()?;
    state.remove_duplicates();
    state.strip_dosage_units()?;
    state.coerce_numeric_columns();
    state.fill_age_with_median();
    state.normalize_lab_results();
    state.canonicalize_dates();
    state.fill_and_normalize_columns();
    state.remove_duplicates();
    Ok(())
}

/// Cleans one table. On failure the partially cleaned table is returned with a
/// `Failed` status instead of an error, so other tables are unaffected.
pub fn clean_table(
    name: TableName,
    table: &Table,
    policy: &CleaningPolicy,
) -> (Table, TableCleanReport) {
    let rows_in = table.row_count();
    let mut state = CleaningState {
        name,
        table: table.clone(),
        origin: (0..rows_in).collect(),
        policy,
        report: TableCleanReport::new(name, rows_in),
    };

    if let Err(err) = run_steps(&mut state) {
        tracing::error!("Error cleaning data for {}: {}", name, err);
        state.report.status = CleanStatus::Failed(err.to_string());
    } else {
        tracing::info!("Cleaned data for {}", name);
    }
    if !state.report.format_errors.is_empty() {
        tracing::warn!(
            "{} field(s) in {} failed to parse and were set to sentinels",
            state.report.format_errors.len(),
            name
        );
    }
    state.report.rows_out = state.table.row_count();
    (state.table, state.report)
}

/// Cleans every table independently of the others.
pub fn clean_tables(raw: &TableSet, policy: &CleaningPolicy) -> CleanOutcome {
    let mut tables = TableSet::new();
    let mut reports = Vec::with_capacity(raw.len());
    for (name, table) in raw.iter() {
        let (cleaned, report) = clean_table(name, table, policy);
        tables.insert(name, cleaned);
        reports.push(report);
    }
    CleanOutcome { tables, reports }
}
