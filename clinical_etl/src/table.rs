use serde::Serialize;
use std::{
    collections::{BTreeMap, HashSet},
    fmt,
    hash::{Hash, Hasher},
};

use crate::error::{EtlError, Result};

/// The five source tables the pipeline knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum TableName {
    #[serde(rename = "patient_demographics")]
    Demographics,
    #[serde(rename = "patient_visits")]
    Visits,
    #[serde(rename = "patient_lab_results")]
    LabResults,
    #[serde(rename = "patient_medications")]
    Medications,
    #[serde(rename = "physician_assignments")]
    PhysicianAssignments,
}

impl TableName {
    pub const ALL: [TableName; 5] = [
        TableName::Demographics,
        TableName::Visits,
        TableName::LabResults,
        TableName::Medications,
        TableName::PhysicianAssignments,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TableName::Demographics => "patient_demographics",
            TableName::Visits => "patient_visits",
            TableName::LabResults => "patient_lab_results",
            TableName::Medications => "patient_medications",
            TableName::PhysicianAssignments => "physician_assignments",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(name.trim()))
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single cell.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Text(String),
    Int(i64),
    Float(f64),
}

// Floats compare bitwise so rows can be hashed for de-duplication.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Text(s) => s.hash(state),
            Value::Int(i) => i.hash(state),
            Value::Float(f) => f.to_bits().hash(state),
        }
    }
}

impl Value {
    pub fn text(value: impl Into<String>) -> Self {
        Value::Text(value.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Numeric view that also accepts numeric text such as `"42"` or `" 3.5 "`.
    pub fn coerce_f64(&self) -> Option<f64> {
        match self {
            Value::Text(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
            other => other.as_f64(),
        }
    }

    /// Rendering used for CSV output and report lines. Null renders empty.
    pub fn render(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Text(s) => s.clone(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => format_float(*f),
        }
    }

    /// Key used for joins. Null, empty text and the text sentinel (any case) never match.
    pub fn join_key(&self, text_sentinel: &str) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Text(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(text_sentinel) {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            }
            Value::Int(i) => Some(i.to_string()),
            Value::Float(f) if f.is_finite() && f.fract() == 0.0 => Some((*f as i64).to_string()),
            Value::Float(f) => Some(f.to_string()),
        }
    }
}

pub fn format_float(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{value:.1}")
    } else {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Text,
    Integer,
    Float,
    Date,
}

/// Row selection produced by a column predicate.
pub type Mask = Vec<bool>;

pub fn mask_count(mask: &[bool]) -> usize {
    mask.iter().filter(|m| **m).count()
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub values: Vec<Value>,
}

impl Column {
    pub fn new(name: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    pub fn nulls(name: impl Into<String>, len: usize) -> Self {
        Self::new(name, vec![Value::Null; len])
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn mask(&self, predicate: impl Fn(&Value) -> bool) -> Mask {
        self.values.iter().map(predicate).collect()
    }

    /// Infers a kind from the non-null cells; `None` for an all-null column.
    pub fn inferred_kind(&self) -> Option<ColumnKind> {
        let mut saw_value = false;
        let mut all_int = true;
        for value in &self.values {
            match value {
                Value::Null => {}
                Value::Int(_) => saw_value = true,
                Value::Float(_) => {
                    saw_value = true;
                    all_int = false;
                }
                Value::Text(_) => return Some(ColumnKind::Text),
            }
        }
        match (saw_value, all_int) {
            (false, _) => None,
            (true, true) => Some(ColumnKind::Integer),
            (true, false) => Some(ColumnKind::Float),
        }
    }

    pub fn null_count(&self) -> usize {
        self.values.iter().filter(|v| v.is_null()).count()
    }
}

/// An in-memory row set stored column by column.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    label: String,
    columns: Vec<Column>,
}

impl Table {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            columns: Vec::new(),
        }
    }

    pub fn from_columns(label: impl Into<String>, columns: Vec<Column>) -> Result<Self> {
        let table = Self {
            label: label.into(),
            columns,
        };
        table.validate()?;
        Ok(table)
    }

    pub fn from_rows(
        label: impl Into<String>,
        headers: &[&str],
        rows: Vec<Vec<Value>>,
    ) -> Result<Self> {
        let label = label.into();
        let mut columns: Vec<Column> = headers
            .iter()
            .map(|h| Column::new(*h, Vec::with_capacity(rows.len())))
            .collect();
        for (idx, row) in rows.into_iter().enumerate() {
            if row.len() != headers.len() {
                return Err(EtlError::table(
                    &label,
                    format!(
                        "row {idx} has {} cells, expected {}",
                        row.len(),
                        headers.len()
                    ),
                ));
            }
            for (column, value) in columns.iter_mut().zip(row) {
                column.values.push(value);
            }
        }
        Self::from_columns(label, columns)
    }

    /// Checks that columns are equally long and uniquely named.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for column in &self.columns {
            if !seen.insert(column.name.as_str()) {
                return Err(EtlError::table(
                    &self.label,
                    format!("duplicate column '{}'", column.name),
                ));
            }
        }
        if let Some(first) = self.columns.first() {
            if let Some(bad) = self.columns.iter().find(|c| c.len() != first.len()) {
                return Err(EtlError::table(
                    &self.label,
                    format!(
                        "column '{}' has {} rows, '{}' has {}",
                        bad.name,
                        bad.len(),
                        first.name,
                        first.len()
                    ),
                ));
            }
        }
        Ok(())
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn set_label(&mut self, label: impl Into<String>) {
        self.label = label.into();
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn row_count(&self) -> usize {
        self.columns.first().map(Column::len).unwrap_or(0)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_mut(&mut self, name: &str) -> Option<&mut Column> {
        self.columns.iter_mut().find(|c| c.name == name)
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        self.column(column).and_then(|c| c.values.get(row))
    }

    pub fn row(&self, row: usize) -> Vec<&Value> {
        self.columns.iter().map(|c| &c.values[row]).collect()
    }

    /// Appends a column; fails on a duplicate name or a length mismatch.
    pub fn push_column(&mut self, column: Column) -> Result<()> {
        if self.has_column(&column.name) {
            return Err(EtlError::table(
                &self.label,
                format!("duplicate column '{}'", column.name),
            ));
        }
        if !self.columns.is_empty() && column.len() != self.row_count() {
            return Err(EtlError::table(
                &self.label,
                format!(
                    "column '{}' has {} rows, table has {}",
                    column.name,
                    column.len(),
                    self.row_count()
                ),
            ));
        }
        self.columns.push(column);
        Ok(())
    }

    /// Adds an all-null column if it is not already present.
    pub fn ensure_column(&mut self, name: &str) {
        if !self.has_column(name) {
            let rows = self.row_count();
            self.columns.push(Column::nulls(name, rows));
        }
    }

    pub fn remove_column(&mut self, name: &str) -> Option<Column> {
        let idx = self.position(name)?;
        Some(self.columns.remove(idx))
    }

    pub fn rename_column(&mut self, from: &str, to: &str) -> Result<()> {
        if from == to {
            return Ok(());
        }
        if self.has_column(to) {
            return Err(EtlError::table(
                &self.label,
                format!("cannot rename '{from}' to '{to}': column already exists"),
            ));
        }
        match self.column_mut(from) {
            Some(column) => {
                column.name = to.to_string();
                Ok(())
            }
            None => Err(EtlError::table(
                &self.label,
                format!("cannot rename missing column '{from}'"),
            )),
        }
    }

    pub fn retain_rows(&mut self, keep: &[bool]) {
        for column in &mut self.columns {
            let mut idx = 0;
            column.values.retain(|_| {
                let keep_row = keep.get(idx).copied().unwrap_or(true);
                idx += 1;
                keep_row
            });
        }
    }

    /// Removes exact duplicate rows, keeping the first occurrence. Returns the
    /// number of rows removed.
    pub fn distinct(&mut self) -> usize {
        let keep = self.distinct_mask();
        let removed = keep.len() - mask_count(&keep);
        if removed > 0 {
            self.retain_rows(&keep);
        }
        removed
    }

    /// `true` for the first occurrence of every distinct row.
    pub fn distinct_mask(&self) -> Mask {
        let rows = self.row_count();
        let mut seen: HashSet<Vec<&Value>> = HashSet::with_capacity(rows);
        (0..rows).map(|row| seen.insert(self.row(row))).collect()
    }

    /// Projects the listed columns (missing ones become all-null) into a new table.
    pub fn select(&self, label: impl Into<String>, columns: &[&str]) -> Table {
        let rows = self.row_count();
        let columns = columns
            .iter()
            .map(|name| {
                self.column(name)
                    .cloned()
                    .unwrap_or_else(|| Column::nulls(*name, rows))
            })
            .collect();
        Table {
            label: label.into(),
            columns,
        }
    }
}

/// Table name → row set, as handed over by a loader.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableSet {
    tables: BTreeMap<TableName, Table>,
}

impl TableSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: TableName, table: Table) -> Option<Table> {
        self.tables.insert(name, table)
    }

    pub fn get(&self, name: TableName) -> Option<&Table> {
        self.tables.get(&name)
    }

    pub fn remove(&mut self, name: TableName) -> Option<Table> {
        self.tables.remove(&name)
    }

    pub fn contains(&self, name: TableName) -> bool {
        self.tables.contains_key(&name)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TableName, &Table)> {
        self.tables.iter().map(|(k, v)| (*k, v))
    }
}

impl FromIterator<(TableName, Table)> for TableSet {
    fn from_iter<I: IntoIterator<Item = (TableName, Table)>>(iter: I) -> Self {
        Self {
            tables: iter.into_iter().collect(),
        }
    }
}
