use serde::Serialize;
use std::collections::{HashMap, HashSet};

use crate::{
    config::CleaningPolicy,
    constants::{AGE_BUCKET_OPEN_LABEL, AGE_BUCKETS, MERGED_OUTPUT_STEM},
    error::{EtlError, Result},
    schema::source_fields,
    table::{Column, Table, TableName, TableSet, Value},
};

/// One left join of the cascade.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinStep {
    pub table: TableName,
    pub keys: Vec<String>,
}

/// `column` coming from `source` is renamed to `rename_to` before joining.
#[derive(Debug, Clone, PartialEq)]
pub struct CollisionRule {
    pub column: String,
    pub source: TableName,
    pub rename_to: String,
}

impl CollisionRule {
    fn new(column: &str, source: TableName, rename_to: &str) -> Self {
        Self {
            column: column.to_string(),
            source,
            rename_to: rename_to.to_string(),
        }
    }
}

/// Join order, required tables and the declared collision policy. Any non-key
/// collision not listed here goes to the most recently joined table.
#[derive(Debug, Clone, PartialEq)]
pub struct MergePolicy {
    pub base: TableName,
    pub steps: Vec<JoinStep>,
    pub required: Vec<TableName>,
    pub collisions: Vec<CollisionRule>,
    pub text_sentinel: String,
    pub numeric_sentinel: i64,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self::from_cleaning(&CleaningPolicy::default())
    }
}

impl MergePolicy {
    pub fn from_cleaning(cleaning: &CleaningPolicy) -> Self {
        let patient = vec!["patient_id".to_string()];
        let visit = vec!["patient_id".to_string(), "visit_id".to_string()];
        Self {
            base: TableName::Demographics,
            steps: vec![
                JoinStep { table: TableName::Visits, keys: patient },
                JoinStep { table: TableName::LabResults, keys: visit.clone() },
                JoinStep { table: TableName::Medications, keys: visit.clone() },
                JoinStep { table: TableName::PhysicianAssignments, keys: visit },
            ],
            required: vec![TableName::Demographics, TableName::Visits],
            collisions: vec![
                CollisionRule::new(
                    "other_fields",
                    TableName::Demographics,
                    "patient_demographics_other_fields",
                ),
                CollisionRule::new("other_fields", TableName::Visits, "patients_visits_other_fields"),
                CollisionRule::new("notes", TableName::LabResults, "patient_lab_results_notes"),
                CollisionRule::new("notes", TableName::Medications, "patient_medications_notes"),
            ],
            text_sentinel: cleaning.text_sentinel.clone(),
            numeric_sentinel: cleaning.numeric_sentinel,
        }
    }

    fn keys_for(&self, table: TableName) -> Vec<&str> {
        if table == self.base {
            return vec!["patient_id"];
        }
        self.steps
            .iter()
            .find(|s| s.table == table)
            .map(|s| s.keys.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    fn apply_renames(&self, name: TableName, table: &mut Table) -> Result<()> {
        for rule in self.collisions.iter().filter(|r| r.source == name) {
            if table.has_column(&rule.column) {
                table.rename_column(&rule.column, &rule.rename_to)?;
            }
        }
        Ok(())
    }
}

/// Row counts around one join.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JoinReport {
    pub table: TableName,
    pub present: bool,
    pub rows_before: usize,
    pub rows_after: usize,
    pub matched_rows: usize,
    /// Columns of the earlier tables replaced by this table's values.
    pub overridden_columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeReport {
    pub base_rows: usize,
    pub joins: Vec<JoinReport>,
    pub rows_out: usize,
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub table: Table,
    pub report: MergeReport,
}

pub fn age_group(age: &Value, numeric_sentinel: i64) -> &'static str {
    let Some(age) = age.coerce_f64() else {
        return "UNKNOWN";
    };
    if age < 0.0 || age == numeric_sentinel as f64 {
        return "UNKNOWN";
    }
    AGE_BUCKETS
        .iter()
        .find(|(upper, _)| age <= *upper as f64)
        .map(|(_, label)| *label)
        .unwrap_or(AGE_BUCKET_OPEN_LABEL)
}

/// Visit rows per patient in the pre-join visit table.
pub fn visit_counts(visits: &Table, text_sentinel: &str) -> HashMap<String, i64> {
    let mut counts = HashMap::new();
    if let Some(ids) = visits.column("patient_id") {
        for key in ids.values.iter().filter_map(|v| v.join_key(text_sentinel)) {
            *counts.entry(key).or_insert(0) += 1;
        }
    }
    counts
}

fn require_keys(name: TableName, table: &Table, keys: &[&str]) -> Result<()> {
    match keys.iter().find(|k| !table.has_column(k)) {
        Some(missing) => Err(EtlError::MissingInput(format!(
            "{name} has no '{missing}' join key column"
        ))),
        None => Ok(()),
    }
}

/// Empty stand-in for an absent optional table, with its declared columns.
fn placeholder_table(name: TableName) -> Table {
    let mut table = Table::new(name.as_str());
    for (field, _) in source_fields(name) {
        table.ensure_column(field);
    }
    table
}

fn composite_key(table: &Table, row: usize, keys: &[&str], sentinel: &str) -> Option<Vec<String>> {
    keys.iter()
        .map(|k| table.value(row, k).and_then(|v| v.join_key(sentinel)))
        .collect()
}

/// Left join on `keys`. Key columns come from `left`; a non-key column present
/// on both sides is taken from `right`.
fn left_join(
    left: &Table,
    right: &Table,
    keys: &[&str],
    sentinel: &str,
) -> Result<(Table, usize, Vec<String>)> {
    let mut index: HashMap<Vec<String>, Vec<usize>> = HashMap::new();
    for row in 0..right.row_count() {
        if let Some(key) = composite_key(right, row, keys, sentinel) {
            index.entry(key).or_default().push(row);
        }
    }

    let mut pairs: Vec<(usize, Option<usize>)> = Vec::with_capacity(left.row_count());
    let mut matched = 0usize;
    for row in 0..left.row_count() {
        let hits = composite_key(left, row, keys, sentinel).and_then(|key| index.get(&key));
        match hits {
            Some(rows) => {
                matched += 1;
                pairs.extend(rows.iter().map(|r| (row, Some(*r))));
            }
            None => pairs.push((row, None)),
        }
    }

    let key_set: HashSet<&str> = keys.iter().copied().collect();
    let right_columns: Vec<&Column> = right
        .columns()
        .iter()
        .filter(|c| !key_set.contains(c.name.as_str()))
        .collect();
    let right_names: HashSet<&str> = right_columns.iter().map(|c| c.name.as_str()).collect();

    let mut overridden = Vec::new();
    let mut columns = Vec::with_capacity(left.columns().len() + right_columns.len());
    for column in left.columns() {
        if right_names.contains(column.name.as_str()) {
            overridden.push(column.name.clone());
            continue;
        }
        let values = pairs.iter().map(|(l, _)| column.values[*l].clone()).collect();
        columns.push(Column::new(column.name.clone(), values));
    }
    for column in right_columns {
        let values = pairs
            .iter()
            .map(|(_, r)| r.map(|r| column.values[r].clone()).unwrap_or_default())
            .collect();
        columns.push(Column::new(column.name.clone(), values));
    }

    let joined = Table::from_columns(left.label(), columns)?;
    Ok((joined, matched, overridden))
}

fn replace_column(table: &mut Table, column: Column) -> Result<()> {
    table.remove_column(&column.name);
    table.push_column(column)
}

/// Runs the left-join cascade over cleaned tables and appends `age_group` and
/// `visit_frequency`. Aborts on a missing required table or join key.
pub fn merge_tables(tables: &TableSet, policy: &MergePolicy) -> Result<MergeOutcome> {
    for name in &policy.required {
        if !tables.contains(*name) {
            return Err(EtlError::MissingInput(format!("required table {name} is absent")));
        }
    }
    let Some(base) = tables.get(policy.base) else {
        return Err(EtlError::MissingInput(format!("base table {} is absent", policy.base)));
    };
    require_keys(policy.base, base, &policy.keys_for(policy.base))?;

    let mut merged = base.clone();
    policy.apply_renames(policy.base, &mut merged)?;
    merged.set_label(MERGED_OUTPUT_STEM);
    let base_rows = merged.row_count();
    tracing::info!("Merging {} {} row(s)", base_rows, policy.base);

    let mut joins = Vec::with_capacity(policy.steps.len());
    for step in &policy.steps {
        let keys: Vec<&str> = step.keys.iter().map(String::as_str).collect();
        let (mut right, present) = match tables.get(step.table) {
            Some(table) => {
                require_keys(step.table, table, &keys)?;
                (table.clone(), true)
            }
            None => {
                tracing::warn!("{} is absent; its fields will be null", step.table);
                (placeholder_table(step.table), false)
            }
        };
        policy.apply_renames(step.table, &mut right)?;
        if !present {
            let shadowing: Vec<String> = right
                .column_names()
                .into_iter()
                .filter(|c| !keys.contains(c) && merged.has_column(c))
                .map(str::to_string)
                .collect();
            for column in &shadowing {
                right.remove_column(column);
            }
        }
        if let Some(missing) = keys.iter().find(|k| !merged.has_column(k)) {
            return Err(EtlError::MissingInput(format!(
                "merged rows have no '{missing}' column to join {}",
                step.table
            )));
        }

        let rows_before = merged.row_count();
        let (joined, matched_rows, overridden_columns) =
            left_join(&merged, &right, &keys, &policy.text_sentinel)?;
        merged = joined;
        if !overridden_columns.is_empty() {
            tracing::debug!(
                "{} overrides earlier column(s) {:?}",
                step.table,
                overridden_columns
            );
        }
        tracing::info!(
            "Joined {}: {} -> {} row(s), {} matched",
            step.table,
            rows_before,
            merged.row_count(),
            matched_rows
        );
        joins.push(JoinReport {
            table: step.table,
            present,
            rows_before,
            rows_after: merged.row_count(),
            matched_rows,
            overridden_columns,
        });
    }

    let rows = merged.row_count();
    let age_groups: Vec<Value> = match merged.column("age") {
        Some(ages) => ages
            .values
            .iter()
            .map(|age| Value::text(age_group(age, policy.numeric_sentinel)))
            .collect(),
        None => vec![Value::text("UNKNOWN"); rows],
    };
    replace_column(&mut merged, Column::new("age_group", age_groups))?;

    let counts = tables
        .get(TableName::Visits)
        .map(|visits| visit_counts(visits, &policy.text_sentinel))
        .unwrap_or_default();
    let frequency: Vec<Value> = merged
        .column("patient_id")
        .map(|ids| {
            ids.values
                .iter()
                .map(|id| {
                    let count = id
                        .join_key(&policy.text_sentinel)
                        .and_then(|k| counts.get(&k).copied())
                        .unwrap_or(0);
                    Value::Int(count)
                })
                .collect()
        })
        .unwrap_or_else(|| vec![Value::Int(0); rows]);
    replace_column(&mut merged, Column::new("visit_frequency", frequency))?;

    tracing::info!("Merged data has {} row(s)", rows);
    Ok(MergeOutcome {
        table: merged,
        report: MergeReport {
            base_rows,
            joins,
            rows_out: rows,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleaner::clean_tables;

    fn t(s: &str) -> Value {
        Value::text(s)
    }

    fn demographics() -> Table {
        Table::from_rows(
            "patient_demographics",
            &["patient_id", "age", "gender", "other_fields"],
            vec![
                vec![t("P1"), Value::Int(25), t("MALE"), t("NON-SMOKER")],
                vec![t("P2"), Value::Int(70), t("FEMALE"), t("SMOKER")],
                vec![t("P3"), Value::Int(-1), t("UNKNOWN"), t("UNKNOWN")],
            ],
        )
        .unwrap()
    }

    fn visits() -> Table {
        Table::from_rows(
            "patient_visits",
            &["patient_id", "visit_id", "diagnosis", "medication", "other_fields"],
            vec![
                vec![t("P1"), t("V1"), t("FLU"), t("NONE"), t("WALK-IN")],
                vec![t("P1"), t("V2"), t("COLD"), t("ASPIRIN"), t("UNKNOWN")],
                vec![t("P1"), t("V3"), t("FLU"), t("NONE"), t("UNKNOWN")],
                vec![t("P2"), Value::Null, t("CHECKUP"), t("NONE"), t("UNKNOWN")],
            ],
        )
        .unwrap()
    }

    fn labs() -> Table {
        Table::from_rows(
            "patient_lab_results",
            &["patient_id", "visit_id", "lab_test_id", "result_value", "notes"],
            vec![
                vec![t("P1"), t("V1"), t("L1"), Value::Float(1.0), t("NORMAL")],
                vec![t("P1"), t("V1"), t("L2"), Value::Float(9.0), t("HIGH")],
                vec![t("P2"), Value::Null, t("L3"), Value::Float(2.0), t("LOW")],
            ],
        )
        .unwrap()
    }

    fn medications() -> Table {
        Table::from_rows(
            "patient_medications",
            &["patient_id", "visit_id", "medication_id", "medication", "notes"],
            vec![vec![t("P1"), t("V2"), t("M1"), t("IBUPROFEN"), t("AFTER MEALS")]],
        )
        .unwrap()
    }

    fn set(tables: Vec<(TableName, Table)>) -> TableSet {
        tables.into_iter().collect()
    }

    fn rows_for(table: &Table, patient: &str) -> Vec<usize> {
        let ids = &table.column("patient_id").unwrap().values;
        (0..table.row_count())
            .filter(|r| ids[*r].as_str() == Some(patient))
            .collect()
    }

    #[test]
    fn age_groups_use_inclusive_upper_edges() {
        let cases = [
            (Value::Int(0), "0-18"),
            (Value::Int(18), "0-18"),
            (Value::Int(19), "19-35"),
            (Value::Int(35), "19-35"),
            (Value::Int(50), "36-50"),
            (Value::Int(65), "51-65"),
            (Value::Int(66), "65+"),
            (Value::Int(-1), "UNKNOWN"),
            (Value::Null, "UNKNOWN"),
            (Value::Float(40.0), "36-50"),
        ];
        for (age, expected) in cases {
            assert_eq!(age_group(&age, -1), expected, "{age:?}");
        }
    }

    #[test]
    fn every_patient_with_a_visit_is_present() {
        let tables = set(vec![
            (TableName::Demographics, demographics()),
            (TableName::Visits, visits()),
            (TableName::LabResults, labs()),
        ]);
        let outcome = merge_tables(&tables, &MergePolicy::default()).unwrap();
        let merged = &outcome.table;

        let p1_visits: HashSet<&str> = rows_for(merged, "P1")
            .into_iter()
            .filter_map(|r| merged.value(r, "visit_id").and_then(Value::as_str))
            .collect();
        assert_eq!(p1_visits, HashSet::from(["V1", "V2", "V3"]));
        // V1 fans out over two lab results.
        assert_eq!(rows_for(merged, "P1").len(), 4);
    }

    #[test]
    fn null_visit_id_keeps_patient_but_never_matches() {
        let tables = set(vec![
            (TableName::Demographics, demographics()),
            (TableName::Visits, visits()),
            (TableName::LabResults, labs()),
        ]);
        let merged = merge_tables(&tables, &MergePolicy::default()).unwrap().table;

        let p2 = rows_for(&merged, "P2");
        assert_eq!(p2.len(), 1);
        assert_eq!(merged.value(p2[0], "visit_id"), Some(&Value::Null));
        assert_eq!(merged.value(p2[0], "lab_test_id"), Some(&Value::Null));
    }

    #[test]
    fn visit_frequency_ignores_fan_out() {
        let tables = set(vec![
            (TableName::Demographics, demographics()),
            (TableName::Visits, visits()),
            (TableName::LabResults, labs()),
        ]);
        let merged = merge_tables(&tables, &MergePolicy::default()).unwrap().table;

        for row in rows_for(&merged, "P1") {
            assert_eq!(merged.value(row, "visit_frequency"), Some(&Value::Int(3)));
        }
        let p3 = rows_for(&merged, "P3");
        assert_eq!(merged.value(p3[0], "visit_frequency"), Some(&Value::Int(0)));
        assert_eq!(merged.value(p3[0], "age_group"), Some(&t("UNKNOWN")));
    }

    #[test]
    fn collisions_follow_declared_policy() {
        let tables = set(vec![
            (TableName::Demographics, demographics()),
            (TableName::Visits, visits()),
            (TableName::LabResults, labs()),
            (TableName::Medications, medications()),
        ]);
        let outcome = merge_tables(&tables, &MergePolicy::default()).unwrap();
        let merged = &outcome.table;

        for column in [
            "patient_demographics_other_fields",
            "patients_visits_other_fields",
            "patient_lab_results_notes",
            "patient_medications_notes",
        ] {
            assert!(merged.has_column(column), "missing {column}");
        }
        assert!(!merged.has_column("other_fields"));
        assert!(!merged.has_column("notes"));

        let v2 = rows_for(merged, "P1")
            .into_iter()
            .find(|r| merged.value(*r, "visit_id") == Some(&t("V2")))
            .unwrap();
        assert_eq!(merged.value(v2, "medication"), Some(&t("IBUPROFEN")));
        let meds = outcome.report.joins.iter().find(|j| j.table == TableName::Medications).unwrap();
        assert_eq!(meds.overridden_columns, ["medication"]);
    }

    #[test]
    fn absent_optional_table_becomes_null_columns() {
        let tables = set(vec![
            (TableName::Demographics, demographics()),
            (TableName::Visits, visits()),
        ]);
        let outcome = merge_tables(&tables, &MergePolicy::default()).unwrap();
        assert!(outcome.table.has_column("physician_id"));
        assert!(outcome.table.has_column("dosage_mg"));
        assert_eq!(
            outcome.table.column("physician_id").unwrap().null_count(),
            outcome.table.row_count()
        );
        assert_eq!(outcome.report.joins.iter().filter(|j| !j.present).count(), 3);
    }

    #[test]
    fn absent_table_keeps_columns_already_merged() {
        let tables = set(vec![
            (
                TableName::Demographics,
                Table::from_rows(
                    "patient_demographics",
                    &["patient_id", "age"],
                    vec![vec![t("P1"), Value::Int(30)]],
                )
                .unwrap(),
            ),
            (
                TableName::Visits,
                Table::from_rows(
                    "patient_visits",
                    &["patient_id", "visit_id", "medication"],
                    vec![vec![t("P1"), t("V1"), t("SERTRALINE")]],
                )
                .unwrap(),
            ),
        ]);
        let outcome = merge_tables(&tables, &MergePolicy::default()).unwrap();
        let merged = &outcome.table;

        assert_eq!(merged.value(0, "medication"), Some(&t("SERTRALINE")));
        assert!(merged.has_column("medication_id"));
        let meds = outcome.report.joins.iter().find(|j| j.table == TableName::Medications).unwrap();
        assert!(!meds.present);
        assert!(meds.overridden_columns.is_empty());
    }

    #[test]
    fn missing_required_table_or_key_aborts() {
        let only_demographics = set(vec![(TableName::Demographics, demographics())]);
        let err = merge_tables(&only_demographics, &MergePolicy::default()).unwrap_err();
        assert!(matches!(err, EtlError::MissingInput(_)));

        let keyless = Table::from_rows("patient_lab_results", &["patient_id"], vec![vec![t("P1")]]).unwrap();
        let tables = set(vec![
            (TableName::Demographics, demographics()),
            (TableName::Visits, visits()),
            (TableName::LabResults, keyless),
        ]);
        let err = merge_tables(&tables, &MergePolicy::default()).unwrap_err();
        assert!(matches!(err, EtlError::MissingInput(_)));
    }

    #[test]
    fn cleaned_lab_result_flows_into_merged_row() {
        let raw = set(vec![
            (
                TableName::Demographics,
                Table::from_rows(
                    "patient_demographics",
                    &["patient_id", "age", "gender"],
                    vec![vec![t("P1"), Value::Int(25), t("MALE")]],
                )
                .unwrap(),
            ),
            (
                TableName::Visits,
                Table::from_rows(
                    "patient_visits",
                    &["patient_id", "visit_id", "diagnosis"],
                    vec![vec![t("P1"), t("V101"), t("DEPRESSION")]],
                )
                .unwrap(),
            ),
            (
                TableName::LabResults,
                Table::from_rows(
                    "patient_lab_results",
                    &["patient_id", "visit_id", "result_value", "result_unit", "reference_range"],
                    vec![vec![t("P1"), t("V101"), Value::Float(15.6), t("G/DL"), t("12-16")]],
                )
                .unwrap(),
            ),
        ]);
        let policy = CleaningPolicy::default();
        let cleaned = clean_tables(&raw, &policy);
        let merged = merge_tables(&cleaned.tables, &MergePolicy::from_cleaning(&policy))
            .unwrap()
            .table;

        assert_eq!(merged.row_count(), 1);
        assert_eq!(merged.value(0, "visit_id"), Some(&t("V101")));
        assert_eq!(merged.value(0, "result_unit"), Some(&t("MG/DL")));
        assert_eq!(merged.value(0, "result_value"), Some(&Value::Float(15600.0)));
        assert_eq!(merged.value(0, "reference_range"), Some(&t("12000-16000")));
        assert_eq!(merged.value(0, "patient_lab_results_notes"), Some(&t("NORMAL")));
        assert_eq!(merged.value(0, "age_group"), Some(&t("19-35")));
        assert_eq!(merged.value(0, "visit_frequency"), Some(&Value::Int(1)));
    }
}
