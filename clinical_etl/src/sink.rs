use csv::Writer;
use indicatif::{ProgressBar, ProgressStyle};
use rusqlite::{Connection as SqliteConnection, params_from_iter, types::Value as SqlValue};
use serde::Serialize;
use std::{
    collections::HashSet,
    fs,
    io::IsTerminal,
    path::{Path, PathBuf},
};

use crate::{
    common::{ensure_parent_dir, quote_ident, tmp_path_for},
    error::{EtlError, Result},
    parquet_writer::TypedParquetWriter,
    schema::{DESTINATION_TABLES, DestinationTable},
    table::{ColumnKind, Mask, Table, Value, mask_count},
};

const PARQUET_BATCH_SIZE: usize = 8192;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SinkTableSummary {
    pub name: String,
    pub rows_written: usize,
    /// Rows skipped because a primary-key component was null or the sentinel.
    pub rows_without_key: usize,
    /// Rows skipped because an earlier row already used the same primary key.
    pub duplicate_keys: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SinkSummary {
    pub target: String,
    pub rows_written: usize,
    pub tables: Vec<SinkTableSummary>,
}

/// Destination of the merged row set. Implementations own their handle and
/// release it on every exit path.
pub trait Sink {
    fn describe(&self) -> String;
    fn write(&mut self, merged: &Table) -> Result<SinkSummary>;
}

/// Writes the merged rows as one CSV file.
#[derive(Debug, Clone)]
pub struct CsvSink {
    path: PathBuf,
}

impl CsvSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn write_rows(&self, tmp_path: &Path, merged: &Table) -> Result<()> {
        let target = self.describe();
        let mut writer = Writer::from_path(tmp_path)
            .map_err(|e| EtlError::sink(&target, format!("creating {}: {e}", tmp_path.display())))?;
        writer
            .write_record(merged.column_names())
            .map_err(|e| EtlError::sink(&target, format!("writing header: {e}")))?;
        for row in 0..merged.row_count() {
            writer
                .write_record(merged.row(row).iter().map(|v| v.render()))
                .map_err(|e| EtlError::sink(&target, format!("writing row {row}: {e}")))?;
        }
        writer
            .flush()
            .map_err(|e| EtlError::sink(&target, format!("flushing: {e}")))?;
        Ok(())
    }
}

impl Sink for CsvSink {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn write(&mut self, merged: &Table) -> Result<SinkSummary> {
        ensure_parent_dir(&self.path)?;
        let tmp_path = tmp_path_for(&self.path);
        if let Err(err) = self.write_rows(&tmp_path, merged) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }
        fs::rename(&tmp_path, &self.path).map_err(|e| {
            EtlError::sink(
                self.describe(),
                format!("moving {} into place: {e}", tmp_path.display()),
            )
        })?;
        tracing::info!("Wrote {} merged row(s) to {}", merged.row_count(), self.describe());
        Ok(SinkSummary {
            target: self.describe(),
            rows_written: merged.row_count(),
            tables: Vec::new(),
        })
    }
}

/// Writes the merged rows as typed Parquet.
#[derive(Debug, Clone)]
pub struct ParquetSink {
    path: PathBuf,
}

impl ParquetSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Sink for ParquetSink {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn write(&mut self, merged: &Table) -> Result<SinkSummary> {
        let columns: Vec<(&str, ColumnKind)> = merged
            .columns()
            .iter()
            .map(|c| (c.name.as_str(), c.inferred_kind().unwrap_or(ColumnKind::Text)))
            .collect();
        let mut writer = TypedParquetWriter::try_new(&self.path, &columns, PARQUET_BATCH_SIZE)?;
        for row in 0..merged.row_count() {
            if let Err(err) = writer.push_row(&merged.row(row)) {
                writer.abort();
                return Err(err);
            }
        }
        writer.finish()?;
        tracing::info!("Wrote {} merged row(s) to {}", merged.row_count(), self.describe());
        Ok(SinkSummary {
            target: self.describe(),
            rows_written: merged.row_count(),
            tables: Vec::new(),
        })
    }
}

fn sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Int(i) => SqlValue::Integer(*i),
        Value::Float(f) => SqlValue::Real(*f),
    }
}

fn sqlite_decl_for(kind: Option<ColumnKind>) -> &'static str {
    match kind {
        Some(ColumnKind::Integer) => "INTEGER",
        Some(ColumnKind::Float) => "REAL",
        _ => "TEXT",
    }
}

/// One destination table cut out of the merged rows, ready to insert.
struct Projection {
    table: Table,
    summary: SinkTableSummary,
}

fn project(merged: &Table, dest: &DestinationTable, text_sentinel: &str) -> Projection {
    let mut table = merged.select(dest.name, &dest.column_names());

    let keyed: Mask = (0..table.row_count())
        .map(|row| {
            dest.primary_keys.iter().all(|key| {
                table
                    .value(row, key)
                    .and_then(|v| v.join_key(text_sentinel))
                    .is_some()
            })
        })
        .collect();
    let rows_without_key = keyed.len() - mask_count(&keyed);
    table.retain_rows(&keyed);
    table.distinct();

    let mut seen = HashSet::new();
    let first_per_key: Mask = (0..table.row_count())
        .map(|row| {
            let key: Vec<Option<String>> = dest
                .primary_keys
                .iter()
                .map(|k| table.value(row, k).and_then(|v| v.join_key(text_sentinel)))
                .collect();
            seen.insert(key)
        })
        .collect();
    let duplicate_keys = first_per_key.len() - mask_count(&first_per_key);
    table.retain_rows(&first_per_key);
    if duplicate_keys > 0 {
        tracing::warn!(
            "{}: kept the first of {} row(s) sharing a primary key",
            dest.name,
            duplicate_keys
        );
    }

    let rows_written = table.row_count();
    Projection {
        table,
        summary: SinkTableSummary {
            name: dest.name.to_string(),
            rows_written,
            rows_without_key,
            duplicate_keys,
        },
    }
}

/// Splits the merged rows into the destination tables and stores them, plus
/// the full merged table, in one SQLite transaction.
#[derive(Debug, Clone)]
pub struct SqliteSink {
    path: PathBuf,
    merged_table_name: String,
    text_sentinel: String,
    show_progress: bool,
}

impl SqliteSink {
    pub fn new(
        path: impl Into<PathBuf>,
        merged_table_name: impl Into<String>,
        text_sentinel: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            merged_table_name: merged_table_name.into(),
            text_sentinel: text_sentinel.into(),
            show_progress: true,
        }
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    fn progress_bar(&self, total: usize) -> ProgressBar {
        if !self.show_progress || !std::io::stderr().is_terminal() {
            return ProgressBar::hidden();
        }
        let progress = ProgressBar::new(total as u64);
        if let Ok(style) = ProgressStyle::with_template(
            "{spinner:.green} {prefix:.bold} [{elapsed_precise}] [{bar:32.cyan/blue}] \
{pos}/{len} ({percent}%) {msg}",
        ) {
            progress.set_style(style.progress_chars("=> "));
        }
        progress.set_prefix("SQLite");
        progress
    }

    fn replace_table(
        &self,
        tx: &rusqlite::Transaction<'_>,
        name: &str,
        columns: &[(String, String)],
        primary_keys: &[&str],
        rows: &Table,
        progress: &ProgressBar,
    ) -> Result<()> {
        let target = self.describe();
        let ident = quote_ident(name);
        let mut defs: Vec<String> = columns
            .iter()
            .map(|(col, decl)| format!("{} {decl}", quote_ident(col)))
            .collect();
        if !primary_keys.is_empty() {
            let keys: Vec<String> = primary_keys.iter().map(|k| quote_ident(k)).collect();
            defs.push(format!("PRIMARY KEY ({})", keys.join(", ")));
        }
        tx.execute_batch(&format!(
            "DROP TABLE IF EXISTS {ident}; CREATE TABLE {ident} ({});",
            defs.join(", ")
        ))
        .map_err(|e| EtlError::sink(&target, format!("replacing table {name}: {e}")))?;

        if columns.is_empty() {
            return Ok(());
        }
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
        let column_list: Vec<String> = columns.iter().map(|(col, _)| quote_ident(col)).collect();
        let mut stmt = tx
            .prepare(&format!(
                "INSERT INTO {ident} ({}) VALUES ({})",
                column_list.join(", "),
                placeholders.join(", ")
            ))
            .map_err(|e| EtlError::sink(&target, format!("preparing insert into {name}: {e}")))?;
        progress.set_message(name.to_string());
        for row in 0..rows.row_count() {
            let values = rows.row(row).into_iter().map(sql_value);
            stmt.execute(params_from_iter(values))
                .map_err(|e| EtlError::sink(&target, format!("inserting into {name}: {e}")))?;
            progress.inc(1);
        }
        Ok(())
    }
}

impl Sink for SqliteSink {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn write(&mut self, merged: &Table) -> Result<SinkSummary> {
        let target = self.describe();
        ensure_parent_dir(&self.path)?;
        let mut conn = SqliteConnection::open(&self.path)
            .map_err(|e| EtlError::sink(&target, format!("opening: {e}")))?;
        let tx = conn
            .transaction()
            .map_err(|e| EtlError::sink(&target, format!("starting transaction: {e}")))?;

        let projections: Vec<Projection> = DESTINATION_TABLES
            .iter()
            .map(|dest| project(merged, dest, &self.text_sentinel))
            .collect();
        let total: usize = merged.row_count()
            + projections.iter().map(|p| p.table.row_count()).sum::<usize>();
        let progress = self.progress_bar(total);

        for (dest, projection) in DESTINATION_TABLES.iter().zip(&projections) {
            let columns: Vec<(String, String)> = dest
                .columns
                .iter()
                .map(|(name, ty)| (name.to_string(), ty.sqlite_decl()))
                .collect();
            self.replace_table(
                &tx,
                dest.name,
                &columns,
                dest.primary_keys,
                &projection.table,
                &progress,
            )?;
        }

        let merged_columns: Vec<(String, String)> = merged
            .columns()
            .iter()
            .map(|c| (c.name.clone(), sqlite_decl_for(c.inferred_kind()).to_string()))
            .collect();
        self.replace_table(&tx, &self.merged_table_name, &merged_columns, &[], merged, &progress)?;

        tx.commit()
            .map_err(|e| EtlError::sink(&target, format!("committing: {e}")))?;
        progress.finish_and_clear();

        let mut tables: Vec<SinkTableSummary> = projections.into_iter().map(|p| p.summary).collect();
        tables.push(SinkTableSummary {
            name: self.merged_table_name.clone(),
            rows_written: merged.row_count(),
            rows_without_key: 0,
            duplicate_keys: 0,
        });
        let rows_written = tables.iter().map(|t| t.rows_written).sum();
        for table in &tables {
            tracing::info!("Inserted {} row(s) into {}", table.rows_written, table.name);
        }
        Ok(SinkSummary {
            target,
            rows_written,
            tables,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> Value {
        Value::text(s)
    }

    fn merged() -> Table {
        Table::from_rows(
            "cleaned_data",
            &[
                "patient_id",
                "age",
                "age_group",
                "visit_id",
                "lab_test_id",
                "result_value",
                "physician_id",
                "visit_frequency",
            ],
            vec![
                vec![t("P1"), Value::Int(25), t("19-35"), t("V1"), t("L1"), Value::Float(15600.0), t("D1"), Value::Int(2)],
                vec![t("P1"), Value::Int(25), t("19-35"), t("V1"), t("L2"), Value::Float(90.0), t("D1"), Value::Int(2)],
                vec![t("P1"), Value::Int(25), t("19-35"), t("V2"), Value::Null, Value::Null, Value::Null, Value::Int(2)],
                vec![t("P2"), Value::Int(70), t("65+"), Value::Null, Value::Null, Value::Null, Value::Null, Value::Int(0)],
            ],
        )
        .unwrap()
    }

    fn count(conn: &SqliteConnection, table: &str) -> i64 {
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn projection_drops_null_keys_and_fan_out_duplicates() {
        let visits = DESTINATION_TABLES.iter().find(|d| d.name == "patient_visits").unwrap();
        let projection = project(&merged(), visits, "UNKNOWN");
        assert_eq!(projection.summary.rows_without_key, 1);
        assert_eq!(projection.table.row_count(), 2);
        assert!(projection.table.has_column("patients_visits_other_fields"));
    }

    #[test]
    fn csv_sink_writes_header_and_rendered_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cleaned_data.csv");
        let summary = CsvSink::new(&path).write(&merged()).unwrap();

        assert_eq!(summary.rows_written, 4);
        let text = fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("patient_id,age,age_group,visit_id,lab_test_id,result_value,physician_id,visit_frequency")
        );
        assert_eq!(lines.next(), Some("P1,25,19-35,V1,L1,15600.0,D1,2"));
        assert!(!tmp_path_for(&path).exists());
    }

    #[test]
    fn sqlite_sink_replaces_destination_tables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clinical.db");
        let mut sink = SqliteSink::new(&path, "cleaned_data", "UNKNOWN").with_progress(false);

        sink.write(&merged()).unwrap();
        let summary = sink.write(&merged()).unwrap();

        let conn = SqliteConnection::open(&path).unwrap();
        assert_eq!(count(&conn, "patient_demographics"), 2);
        assert_eq!(count(&conn, "patient_visits"), 2);
        assert_eq!(count(&conn, "patient_lab_results"), 2);
        assert_eq!(count(&conn, "physician_assignments"), 1);
        assert_eq!(count(&conn, "patient_medications"), 0);
        assert_eq!(count(&conn, "cleaned_data"), 4);
        let lab = summary.tables.iter().find(|t| t.name == "patient_lab_results").unwrap();
        assert_eq!(lab.rows_without_key, 2);
    }

    #[test]
    fn parquet_sink_renames_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cleaned_data.parquet");
        let summary = ParquetSink::new(&path).write(&merged()).unwrap();
        assert_eq!(summary.rows_written, 4);
        assert!(path.exists());
        assert!(!tmp_path_for(&path).exists());
    }
}
