use duckdb::Connection;
use rusqlite::{Connection as SqliteConnection, OpenFlags, types::ValueRef};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::{
    common::{quote_ident, source_expr},
    config::InputConfig,
    error::{EtlError, Result},
    table::{Column, Table, TableName, TableSet, Value},
};

/// Tokens a raw extract uses for "no value". Compared case-insensitively after trimming.
const NA_TOKENS: &[&str] = &["", "NA", "N/A", "#N/A", "#NA", "<NA>", "NAN", "-NAN", "NULL", "NONE"];

pub fn is_na_token(raw: &str) -> bool {
    let upper = raw.trim().to_ascii_uppercase();
    NA_TOKENS.contains(&upper.as_str())
}

/// Trimmed text cell, or `Null` for an NA token.
pub fn text_cell(raw: &str) -> Value {
    if is_na_token(raw) {
        Value::Null
    } else {
        Value::text(raw.trim())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoadStatus {
    Loaded { rows: usize, columns: usize },
    Missing,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableLoadReport {
    pub table: TableName,
    pub source: String,
    #[serde(flatten)]
    pub status: LoadStatus,
}

#[derive(Debug, Clone, Default)]
pub struct LoadOutcome {
    pub tables: TableSet,
    pub reports: Vec<TableLoadReport>,
}

impl LoadOutcome {
    fn record(&mut self, table: TableName, source: String, loaded: Result<Option<Table>>) {
        let status = match loaded {
            Ok(Some(data)) => {
                let status = LoadStatus::Loaded {
                    rows: data.row_count(),
                    columns: data.columns().len(),
                };
                tracing::info!("Loaded {} row(s) of {} from {}", data.row_count(), table, source);
                self.tables.insert(table, data);
                status
            }
            Ok(None) => {
                tracing::warn!("No data for {} at {}", table, source);
                LoadStatus::Missing
            }
            Err(err) => {
                tracing::error!("Failed loading {}: {}", table, err);
                LoadStatus::Failed {
                    reason: err.to_string(),
                }
            }
        };
        self.reports.push(TableLoadReport {
            table,
            source,
            status,
        });
    }
}

/// Produces the raw table set for one run. Absent or unreadable tables are
/// reported, not fatal; the merge decides whether it can go on without them.
pub trait Loader {
    fn describe(&self) -> String;
    fn load(&self) -> Result<LoadOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CellKind {
    Int,
    Float,
    Text,
}

fn cell_kind(duckdb_type: &str) -> CellKind {
    let upper = duckdb_type.trim().to_ascii_uppercase();
    match upper.as_str() {
        "BIGINT" | "INTEGER" | "SMALLINT" | "TINYINT" | "UINTEGER" | "USMALLINT" | "UTINYINT" => {
            CellKind::Int
        }
        "DOUBLE" | "FLOAT" | "REAL" => CellKind::Float,
        other if other.starts_with("DECIMAL") => CellKind::Float,
        _ => CellKind::Text,
    }
}

/// Reads `<data_dir>/<file>` per table through an in-memory DuckDB.
#[derive(Debug, Clone)]
pub struct FileLoader {
    data_dir: PathBuf,
    input: InputConfig,
}

impl FileLoader {
    pub fn new(data_dir: impl Into<PathBuf>, input: InputConfig) -> Self {
        Self {
            data_dir: data_dir.into(),
            input,
        }
    }

    pub fn path_for(&self, table: TableName) -> PathBuf {
        self.data_dir.join(self.input.file_name(table))
    }

    fn load_column_info(conn: &Connection, view_name: &str) -> Result<Vec<(String, CellKind)>> {
        let query = format!("SELECT name, type FROM pragma_table_info('{view_name}') ORDER BY cid");
        let mut stmt = conn
            .prepare(&query)
            .map_err(|e| EtlError::load(view_name, format!("preparing pragma_table_info: {e}")))?;
        let mut rows = stmt
            .query([])
            .map_err(|e| EtlError::load(view_name, format!("querying pragma_table_info: {e}")))?;
        let mut columns = Vec::new();
        while let Some(row) = rows
            .next()
            .map_err(|e| EtlError::load(view_name, format!("iterating pragma_table_info: {e}")))?
        {
            let name: String = row
                .get(0)
                .map_err(|e| EtlError::load(view_name, format!("reading column name: {e}")))?;
            let kind: String = row
                .get(1)
                .map_err(|e| EtlError::load(view_name, format!("reading column type: {e}")))?;
            columns.push((name, cell_kind(&kind)));
        }
        Ok(columns)
    }

    fn load_file(conn: &Connection, table: TableName, path: &Path) -> Result<Table> {
        let source = path.display().to_string();
        let view_name = table.as_str();
        let expr = source_expr(path)?;
        conn.execute(&format!("DROP VIEW IF EXISTS {view_name}"), [])
            .map_err(|e| EtlError::load(&source, format!("dropping view {view_name}: {e}")))?;
        conn.execute(&format!("CREATE VIEW {view_name} AS SELECT * FROM {expr}"), [])
            .map_err(|e| EtlError::load(&source, format!("creating view {view_name}: {e}")))?;

        let info = Self::load_column_info(conn, view_name)?;
        let select_exprs: Vec<String> = info
            .iter()
            .map(|(name, kind)| {
                let ident = quote_ident(name);
                match kind {
                    CellKind::Int => format!("CAST({ident} AS BIGINT)"),
                    CellKind::Float => format!("CAST({ident} AS DOUBLE)"),
                    CellKind::Text => format!("CAST({ident} AS VARCHAR)"),
                }
            })
            .collect();
        let mut columns: Vec<Column> = info
            .iter()
            .map(|(name, _)| Column::new(name.clone(), Vec::new()))
            .collect();
        if columns.is_empty() {
            return Ok(Table::new(view_name));
        }

        let query = format!("SELECT {} FROM {view_name}", select_exprs.join(", "));
        let mut stmt = conn
            .prepare(&query)
            .map_err(|e| EtlError::load(&source, format!("preparing select: {e}")))?;
        let mut rows = stmt
            .query([])
            .map_err(|e| EtlError::load(&source, format!("running select: {e}")))?;
        while let Some(row) = rows
            .next()
            .map_err(|e| EtlError::load(&source, format!("iterating rows: {e}")))?
        {
            for (idx, (column, (name, kind))) in columns.iter_mut().zip(&info).enumerate() {
                let read_err = |e: duckdb::Error| EtlError::load(&source, format!("reading {name}: {e}"));
                let value = match kind {
                    CellKind::Int => row
                        .get::<_, Option<i64>>(idx)
                        .map_err(read_err)?
                        .map(Value::Int)
                        .unwrap_or_default(),
                    CellKind::Float => row
                        .get::<_, Option<f64>>(idx)
                        .map_err(read_err)?
                        .filter(|v| v.is_finite())
                        .map(Value::Float)
                        .unwrap_or_default(),
                    CellKind::Text => row
                        .get::<_, Option<String>>(idx)
                        .map_err(read_err)?
                        .map(|s| text_cell(&s))
                        .unwrap_or_default(),
                };
                column.values.push(value);
            }
        }
        Table::from_columns(view_name, columns)
    }
}

impl Loader for FileLoader {
    fn describe(&self) -> String {
        format!("files under {}", self.data_dir.display())
    }

    fn load(&self) -> Result<LoadOutcome> {
        let conn = Connection::open_in_memory()
            .map_err(|e| EtlError::load("duckdb", format!("opening in-memory database: {e}")))?;
        let mut outcome = LoadOutcome::default();
        for table in TableName::ALL {
            let path = self.path_for(table);
            let loaded = if path.exists() {
                Self::load_file(&conn, table, &path).map(Some)
            } else {
                Ok(None)
            };
            outcome.record(table, path.display().to_string(), loaded);
        }
        Ok(outcome)
    }
}

/// Reads the five tables from an existing SQLite database, opened read-only.
#[derive(Debug, Clone)]
pub struct SqliteLoader {
    path: PathBuf,
}

impl SqliteLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn table_exists(conn: &SqliteConnection, name: &str) -> Result<bool> {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type IN ('table', 'view') AND name = ?1",
            [name],
            |row| row.get::<_, i64>(0),
        )
        .map(|count| count > 0)
        .map_err(|e| EtlError::load(name, format!("checking sqlite_master: {e}")))
    }

    fn load_table(conn: &SqliteConnection, table: TableName) -> Result<Option<Table>> {
        let name = table.as_str();
        if !Self::table_exists(conn, name)? {
            return Ok(None);
        }
        let mut stmt = conn
            .prepare(&format!("SELECT * FROM {}", quote_ident(name)))
            .map_err(|e| EtlError::load(name, format!("preparing select: {e}")))?;
        let mut columns: Vec<Column> = stmt
            .column_names()
            .into_iter()
            .map(|c| Column::new(c, Vec::new()))
            .collect();
        let mut rows = stmt
            .query([])
            .map_err(|e| EtlError::load(name, format!("running select: {e}")))?;
        while let Some(row) = rows
            .next()
            .map_err(|e| EtlError::load(name, format!("iterating rows: {e}")))?
        {
            for (idx, column) in columns.iter_mut().enumerate() {
                let cell = row
                    .get_ref(idx)
                    .map_err(|e| EtlError::load(name, format!("reading {}: {e}", column.name)))?;
                let value = match cell {
                    ValueRef::Null => Value::Null,
                    ValueRef::Integer(i) => Value::Int(i),
                    ValueRef::Real(f) if f.is_finite() => Value::Float(f),
                    ValueRef::Real(_) => Value::Null,
                    ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
                        text_cell(&String::from_utf8_lossy(bytes))
                    }
                };
                column.values.push(value);
            }
        }
        Table::from_columns(name, columns).map(Some)
    }
}

impl Loader for SqliteLoader {
    fn describe(&self) -> String {
        format!("sqlite database {}", self.path.display())
    }

    fn load(&self) -> Result<LoadOutcome> {
        let conn = SqliteConnection::open_with_flags(&self.path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(|e| EtlError::load(self.path.display().to_string(), e))?;
        let mut outcome = LoadOutcome::default();
        for table in TableName::ALL {
            let loaded = Self::load_table(&conn, table);
            outcome.record(table, format!("{}#{}", self.path.display(), table), loaded);
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::BTreeMap, fs};

    #[test]
    fn na_tokens_load_as_null() {
        for raw in ["", "  ", "NA", "n/a", "NaN", "null", "None", "<NA>"] {
            assert_eq!(text_cell(raw), Value::Null, "{raw:?}");
        }
        assert_eq!(text_cell(" male "), Value::text("male"));
        assert_eq!(text_cell("0"), Value::text("0"));
    }

    #[test]
    fn duckdb_types_map_to_cells() {
        assert_eq!(cell_kind("BIGINT"), CellKind::Int);
        assert_eq!(cell_kind("DOUBLE"), CellKind::Float);
        assert_eq!(cell_kind("DECIMAL(9,2)"), CellKind::Float);
        assert_eq!(cell_kind("DATE"), CellKind::Text);
        assert_eq!(cell_kind("VARCHAR"), CellKind::Text);
    }

    #[test]
    fn file_loader_reads_csv_and_reports_missing_tables() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("patient_demographics.csv"),
            "patient_id,age,gender\nP1,25,male\nP2,,NA\n",
        )
        .unwrap();

        let outcome = FileLoader::new(dir.path(), InputConfig::default()).load().unwrap();

        let demographics = outcome.tables.get(TableName::Demographics).unwrap();
        assert_eq!(demographics.row_count(), 2);
        assert_eq!(demographics.value(0, "age"), Some(&Value::Int(25)));
        assert_eq!(demographics.value(1, "age"), Some(&Value::Null));
        assert_eq!(demographics.value(0, "gender"), Some(&Value::text("male")));
        assert_eq!(demographics.value(1, "gender"), Some(&Value::Null));

        let missing: Vec<TableName> = outcome
            .reports
            .iter()
            .filter(|r| r.status == LoadStatus::Missing)
            .map(|r| r.table)
            .collect();
        assert_eq!(missing.len(), 4);
        assert!(!missing.contains(&TableName::Demographics));
    }

    #[test]
    fn file_loader_honours_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("visits_2024.csv"),
            "patient_id,visit_id\nP1,V1\n",
        )
        .unwrap();
        let input = InputConfig {
            files: BTreeMap::from([("patient_visits".to_string(), "visits_2024.csv".to_string())]),
        };

        let outcome = FileLoader::new(dir.path(), input).load().unwrap();

        assert_eq!(outcome.tables.get(TableName::Visits).unwrap().row_count(), 1);
    }

    #[test]
    fn sqlite_loader_reads_existing_tables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("source.db");
        let conn = SqliteConnection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE patient_lab_results (patient_id TEXT, result_value REAL, result_unit TEXT);
             INSERT INTO patient_lab_results VALUES ('P1', 15.6, 'g/dl'), ('P2', NULL, 'N/A');",
        )
        .unwrap();
        drop(conn);

        let outcome = SqliteLoader::new(&path).load().unwrap();

        let labs = outcome.tables.get(TableName::LabResults).unwrap();
        assert_eq!(labs.value(0, "result_value"), Some(&Value::Float(15.6)));
        assert_eq!(labs.value(1, "result_value"), Some(&Value::Null));
        assert_eq!(labs.value(1, "result_unit"), Some(&Value::Null));
        assert_eq!(outcome.tables.len(), 1);
    }
}
