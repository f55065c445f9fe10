use csv::Writer;
use serde::Serialize;
use std::{collections::HashMap, fs, path::Path};

use crate::{
    cleaner::TableCleanReport,
    common::{ensure_parent_dir, tmp_path_for},
    error::{EtlError, Result},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectKind {
    MissingPatientId,
    FormatError,
}

impl RejectKind {
    fn as_str(self) -> &'static str {
        match self {
            RejectKind::MissingPatientId => "missing_patient_id",
            RejectKind::FormatError => "format_error",
        }
    }
}

/// A row dropped or a field defaulted while cleaning.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectRow {
    pub table: String,
    pub kind: RejectKind,
    pub row: Option<usize>,
    pub column: String,
    pub value: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectCount {
    pub table: String,
    pub column: String,
    pub reason: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectSummary {
    pub rows_dropped: usize,
    pub fields_defaulted: usize,
    /// Most frequent first.
    pub by_reason: Vec<RejectCount>,
}

pub fn collect_rejects(reports: &[TableCleanReport]) -> Vec<RejectRow> {
    let mut rows = Vec::new();
    for report in reports {
        for rejected in &report.rejected_rows {
            rows.push(RejectRow {
                table: report.table.as_str().to_string(),
                kind: RejectKind::MissingPatientId,
                row: Some(rejected.row),
                column: "patient_id".to_string(),
                value: String::new(),
                reason: rejected.reason.clone(),
            });
        }
        for err in &report.format_errors {
            rows.push(RejectRow {
                table: err.table.clone(),
                kind: RejectKind::FormatError,
                row: err.row,
                column: err.column.clone(),
                value: err.value.clone(),
                reason: err.reason.clone(),
            });
        }
    }
    rows
}

pub fn summarize_rejects(rows: &[RejectRow]) -> RejectSummary {
    let mut counts: HashMap<(&str, &str, &str), usize> = HashMap::new();
    for row in rows {
        *counts
            .entry((row.table.as_str(), row.column.as_str(), row.reason.as_str()))
            .or_insert(0) += 1;
    }
    let mut by_reason: Vec<RejectCount> = counts
        .into_iter()
        .map(|((table, column, reason), count)| RejectCount {
            table: table.to_string(),
            column: column.to_string(),
            reason: reason.to_string(),
            count,
        })
        .collect();
    by_reason.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then_with(|| a.table.cmp(&b.table))
            .then_with(|| a.column.cmp(&b.column))
    });

    RejectSummary {
        rows_dropped: rows
            .iter()
            .filter(|r| r.kind == RejectKind::MissingPatientId)
            .count(),
        fields_defaulted: rows
            .iter()
            .filter(|r| r.kind == RejectKind::FormatError)
            .count(),
        by_reason,
    }
}

fn write_reject_rows(path: &Path, rows: &[RejectRow]) -> Result<()> {
    let target = path.display().to_string();
    let mut writer = Writer::from_path(path)
        .map_err(|e| EtlError::sink(&target, format!("creating reject report: {e}")))?;
    writer
        .write_record(["table", "kind", "row", "column", "value", "reason"])
        .map_err(|e| EtlError::sink(&target, format!("writing header: {e}")))?;
    for row in rows {
        let row_number = row.row.map(|r| r.to_string()).unwrap_or_default();
        writer
            .write_record([
                row.table.as_str(),
                row.kind.as_str(),
                row_number.as_str(),
                row.column.as_str(),
                row.value.as_str(),
                row.reason.as_str(),
            ])
            .map_err(|e| EtlError::sink(&target, format!("writing row: {e}")))?;
    }
    writer
        .flush()
        .map_err(|e| EtlError::sink(&target, format!("flushing: {e}")))?;
    Ok(())
}

/// Writes one CSV line per reject, staged through a `.tmp` file.
pub fn write_rejects(path: &Path, rows: &[RejectRow]) -> Result<RejectSummary> {
    ensure_parent_dir(path)?;
    let tmp_path = tmp_path_for(path);
    if let Err(err) = write_reject_rows(&tmp_path, rows) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    fs::rename(&tmp_path, path).map_err(|e| {
        EtlError::sink(
            path.display().to_string(),
            format!("moving {} into place: {e}", tmp_path.display()),
        )
    })?;
    let summary = summarize_rejects(rows);
    tracing::info!(
        "Wrote {} reject(s) to {} ({} dropped row(s), {} defaulted field(s))",
        rows.len(),
        path.display(),
        summary.rows_dropped,
        summary.fields_defaulted
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cleaner::{CleanStatus, RejectedRow},
        error::FormatError,
        table::TableName,
    };

    fn report() -> TableCleanReport {
        TableCleanReport {
            table: TableName::Medications,
            status: CleanStatus::Cleaned,
            rows_in: 4,
            rows_out: 3,
            duplicates_removed: 0,
            units_converted: 0,
            notes_annotated: 0,
            rejected_rows: vec![RejectedRow {
                row: 2,
                reason: "missing patient_id".to_string(),
            }],
            format_errors: vec![
                FormatError::new("patient_medications", "dosage", Some(0), "lots", "not numeric"),
                FormatError::new("patient_medications", "dosage", Some(3), "few", "not numeric"),
            ],
        }
    }

    #[test]
    fn summary_counts_by_reason() {
        let rows = collect_rejects(&[report()]);
        let summary = summarize_rejects(&rows);
        assert_eq!(rows.len(), 3);
        assert_eq!(summary.rows_dropped, 1);
        assert_eq!(summary.fields_defaulted, 2);
        assert_eq!(summary.by_reason[0].column, "dosage");
        assert_eq!(summary.by_reason[0].count, 2);
    }

    #[test]
    fn reject_csv_has_one_line_per_issue() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rejects.csv");
        write_rejects(&path, &collect_rejects(&[report()])).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "table,kind,row,column,value,reason");
        assert_eq!(lines[1], "patient_medications,missing_patient_id,2,patient_id,,missing patient_id");
        assert_eq!(lines.len(), 4);
    }
}
