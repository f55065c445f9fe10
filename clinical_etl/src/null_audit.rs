use serde::Serialize;
use std::path::Path;

use crate::{
    common::{now_unix_seconds, relative_label, write_atomic},
    config::CleaningPolicy,
    error::Result,
    table::{Table, Value},
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnAuditRow {
    pub column: String,
    pub rows_total: usize,
    pub null_count: usize,
    pub sentinel_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableAuditSection {
    pub label: String,
    pub columns: Vec<ColumnAuditRow>,
}

fn is_sentinel(value: &Value, policy: &CleaningPolicy) -> bool {
    match value {
        Value::Text(s) => s == &policy.text_sentinel || s == &policy.date_sentinel,
        Value::Int(i) => *i == policy.numeric_sentinel,
        Value::Float(f) => *f == policy.numeric_sentinel as f64,
        Value::Null => false,
    }
}

/// Null and sentinel counts per column, worst columns first.
pub fn audit_table(table: &Table, policy: &CleaningPolicy) -> TableAuditSection {
    let rows_total = table.row_count();
    let mut columns: Vec<ColumnAuditRow> = table
        .columns()
        .iter()
        .map(|column| ColumnAuditRow {
            column: column.name.clone(),
            rows_total,
            null_count: column.null_count(),
            sentinel_count: column.values.iter().filter(|v| is_sentinel(v, policy)).count(),
        })
        .collect();
    columns.sort_by(|a, b| {
        b.null_count
            .cmp(&a.null_count)
            .then_with(|| b.sentinel_count.cmp(&a.sentinel_count))
            .then_with(|| a.column.cmp(&b.column))
    });
    TableAuditSection {
        label: table.label().to_string(),
        columns,
    }
}

fn fmt_pct(numer: usize, denom: usize) -> String {
    if denom == 0 {
        return "0.00%".to_string();
    }
    format!("{:.2}%", (numer as f64) * 100.0 / (denom as f64))
}

fn escape_markdown_code(text: &str) -> String {
    text.replace('`', "\\`")
}

pub fn render_markdown_table(section: &TableAuditSection) -> String {
    let mut out = String::new();
    out.push_str("| column | rows_total | null_count | null_pct | sentinel_count | sentinel_pct |\n");
    out.push_str("| --- | ---: | ---: | ---: | ---: | ---: |\n");
    for row in &section.columns {
        out.push_str(&format!(
            "| {} | {} | {} | {} | {} | {} |\n",
            row.column,
            row.rows_total,
            row.null_count,
            fmt_pct(row.null_count, row.rows_total),
            row.sentinel_count,
            fmt_pct(row.sentinel_count, row.rows_total),
        ));
    }
    out
}

pub fn render_audit(sections: &[TableAuditSection], source: &str, policy: &CleaningPolicy) -> String {
    let mut out = String::new();
    out.push_str("# Null / Sentinel Audit\n\n");
    out.push_str(&format!("- Generated at (unix seconds): {}\n", now_unix_seconds()));
    out.push_str(&format!("- Source: `{}`\n\n", escape_markdown_code(source)));
    out.push_str("Notes:\n");
    out.push_str("- `null_count` counts cells with no value.\n");
    out.push_str(&format!(
        "- `sentinel_count` counts the fill values `{}`, `{}` and `{}`.\n\n",
        policy.text_sentinel, policy.numeric_sentinel, policy.date_sentinel
    ));
    for section in sections {
        out.push_str(&format!("## {}\n\n", section.label));
        out.push_str(&render_markdown_table(section));
        out.push('\n');
    }
    out
}

/// Audits `tables` and writes the Markdown report to `path`.
pub fn write_null_audit<'a>(
    path: &Path,
    tables: impl IntoIterator<Item = &'a Table>,
    source: &Path,
    policy: &CleaningPolicy,
) -> Result<Vec<TableAuditSection>> {
    let sections: Vec<TableAuditSection> = tables
        .into_iter()
        .map(|table| audit_table(table, policy))
        .collect();
    write_atomic(path, &render_audit(&sections, &relative_label(source), policy))?;
    tracing::info!("Wrote null audit {}", path.display());
    Ok(sections)
}
