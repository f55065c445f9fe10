//! Load → clean → merge → sink, with the run report and side reports.

use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::{
    cleaner::{CleanOutcome, CleanStatus, TableCleanReport, clean_tables},
    common::{now_unix_seconds, write_atomic},
    config::EtlConfig,
    constants::{NULL_AUDIT_FILE, REJECTS_REPORT_FILE, RUN_REPORT_FILE},
    error::{EtlError, Result},
    loader::{Loader, TableLoadReport},
    merge::{MergePolicy, MergeReport, merge_tables},
    null_audit::{TableAuditSection, write_null_audit},
    rejects::{RejectSummary, collect_rejects, write_rejects},
    sink::{Sink, SinkSummary},
    table::{Table, TableName},
};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum StageStatus {
    Succeeded,
    Failed(String),
    Skipped(String),
    NotRun,
}

/// Per-table cleaning result without the row-level detail (that goes to the
/// reject report).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableCleanSummary {
    pub table: TableName,
    #[serde(flatten)]
    pub status: CleanStatus,
    pub rows_in: usize,
    pub rows_out: usize,
    pub duplicates_removed: usize,
    pub rows_rejected: usize,
    pub format_errors: usize,
    pub units_converted: usize,
    pub notes_annotated: usize,
}

impl From<&TableCleanReport> for TableCleanSummary {
    fn from(report: &TableCleanReport) -> Self {
        Self {
            table: report.table,
            status: report.status.clone(),
            rows_in: report.rows_in,
            rows_out: report.rows_out,
            duplicates_removed: report.duplicates_removed,
            rows_rejected: report.rejected_rows.len(),
            format_errors: report.format_errors.len(),
            units_converted: report.units_converted,
            notes_annotated: report.notes_annotated,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub started_at_unix: i64,
    pub finished_at_unix: i64,
    pub source: String,
    pub target: String,
    pub load: Vec<TableLoadReport>,
    pub clean: Vec<TableCleanSummary>,
    pub rejects: Option<RejectSummary>,
    pub merge: StageStatus,
    pub merge_report: Option<MergeReport>,
    pub sink: StageStatus,
    pub sink_summary: Option<SinkSummary>,
    pub reports: Vec<String>,
}

impl RunReport {
    fn new(source: String, target: String) -> Self {
        Self {
            started_at_unix: now_unix_seconds(),
            finished_at_unix: 0,
            source,
            target,
            load: Vec::new(),
            clean: Vec::new(),
            rejects: None,
            merge: StageStatus::NotRun,
            merge_report: None,
            sink: StageStatus::NotRun,
            sink_summary: None,
            reports: Vec::new(),
        }
    }

    pub fn failed_tables(&self) -> Vec<TableName> {
        self.clean
            .iter()
            .filter(|c| c.status != CleanStatus::Cleaned)
            .map(|c| c.table)
            .collect()
    }

    /// Merge and sink both went through. Failed tables are listed separately.
    pub fn succeeded(&self) -> bool {
        self.merge == StageStatus::Succeeded && self.sink == StageStatus::Succeeded
    }
}

fn write_json(path: &Path, v: &impl Serialize) -> Result<()> {
    let s = serde_json::to_string_pretty(v)
        .map_err(|e| EtlError::sink(path.display().to_string(), format!("serializing: {e}")))?;
    write_atomic(path, &s)
}

/// Where the side reports of a run are written.
#[derive(Debug, Clone)]
pub struct ReportPaths {
    pub run_report: PathBuf,
    pub rejects: PathBuf,
    pub null_audit: PathBuf,
}

impl ReportPaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            run_report: dir.join(RUN_REPORT_FILE),
            rejects: dir.join(REJECTS_REPORT_FILE),
            null_audit: dir.join(NULL_AUDIT_FILE),
        }
    }
}

fn finish(mut report: RunReport, paths: &ReportPaths) -> Result<RunReport> {
    report.finished_at_unix = now_unix_seconds();
    report.reports.push(paths.run_report.display().to_string());
    write_json(&paths.run_report, &report)?;
    tracing::info!("Wrote run report {}", paths.run_report.display());
    Ok(report)
}

fn clean_stage(
    loader: &dyn Loader,
    config: &EtlConfig,
    report: &mut RunReport,
    paths: &ReportPaths,
) -> Result<CleanOutcome> {
    let loaded = loader.load()?;
    report.load = loaded.reports;

    let cleaned = clean_tables(&loaded.tables, &config.cleaning);
    report.clean = cleaned.reports.iter().map(TableCleanSummary::from).collect();

    let rejects = collect_rejects(&cleaned.reports);
    report.rejects = Some(write_rejects(&paths.rejects, &rejects)?);
    report.reports.push(paths.rejects.display().to_string());
    Ok(cleaned)
}

/// Runs one full batch. Merge and sink failures are recorded in the run report
/// (which is still written) and then returned as the error of the run.
pub fn run_pipeline(
    loader: &dyn Loader,
    sink: &mut dyn Sink,
    config: &EtlConfig,
    paths: &ReportPaths,
) -> Result<RunReport> {
    config.cleaning.validate()?;
    let mut report = RunReport::new(loader.describe(), sink.describe());
    tracing::info!("Starting run: {} -> {}", report.source, report.target);

    let cleaned = clean_stage(loader, config, &mut report, paths)?;
    let failed = cleaned.failed_tables();
    if !failed.is_empty() {
        tracing::warn!("Tables that failed to clean: {:?}", failed);
        if config.run.fail_on_clean_error {
            let names: Vec<&str> = failed.iter().map(|t| t.as_str()).collect();
            report.merge = StageStatus::Skipped("tables failed to clean".to_string());
            report.sink = StageStatus::Skipped("merge skipped".to_string());
            finish(report, paths)?;
            return Err(EtlError::table(
                names.join(","),
                "cleaning failed and fail_on_clean_error is set",
            ));
        }
    }

    let policy = MergePolicy::from_cleaning(&config.cleaning);
    let merged = match merge_tables(&cleaned.tables, &policy) {
        Ok(outcome) => {
            report.merge = StageStatus::Succeeded;
            report.merge_report = Some(outcome.report);
            outcome.table
        }
        Err(err) => {
            tracing::error!("Merge aborted: {}", err);
            report.merge = StageStatus::Failed(err.to_string());
            report.sink = StageStatus::Skipped("merge failed".to_string());
            finish(report, paths)?;
            return Err(err);
        }
    };

    if config.run.write_null_audit {
        let tables: Vec<&Table> = cleaned
            .tables
            .iter()
            .map(|(_, t)| t)
            .chain(std::iter::once(&merged))
            .collect();
        write_null_audit(&paths.null_audit, tables, Path::new(&report.source), &config.cleaning)?;
        report.reports.push(paths.null_audit.display().to_string());
    }

    match sink.write(&merged) {
        Ok(summary) => {
            report.sink = StageStatus::Succeeded;
            report.sink_summary = Some(summary);
        }
        Err(err) => {
            tracing::error!("Sink failed: {}", err);
            report.sink = StageStatus::Failed(err.to_string());
            finish(report, paths)?;
            return Err(err);
        }
    }

    let report = finish(report, paths)?;
    tracing::info!("Run finished");
    Ok(report)
}

/// Loads and cleans without merging, then audits the raw and cleaned tables.
pub fn run_audit(
    loader: &dyn Loader,
    config: &EtlConfig,
    paths: &ReportPaths,
) -> Result<Vec<TableAuditSection>> {
    config.cleaning.validate()?;
    let loaded = loader.load()?;
    let cleaned = clean_tables(&loaded.tables, &config.cleaning);
    write_rejects(&paths.rejects, &collect_rejects(&cleaned.reports))?;

    let mut raw: Vec<Table> = Vec::with_capacity(loaded.tables.len());
    for (name, table) in loaded.tables.iter() {
        let mut labelled = table.clone();
        labelled.set_label(format!("{name} (raw)"));
        raw.push(labelled);
    }
    let mut tables: Vec<&Table> = Vec::new();
    for ((_, cleaned_table), raw_table) in cleaned.tables.iter().zip(&raw) {
        tables.push(raw_table);
        tables.push(cleaned_table);
    }
    write_null_audit(
        &paths.null_audit,
        tables,
        Path::new(&loader.describe()),
        &config.cleaning,
    )
}
