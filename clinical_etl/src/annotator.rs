use serde::Serialize;

use crate::{
    config::CleaningPolicy,
    error::FormatError,
    table::{Mask, Table, Value, mask_count},
};

/// Qualitative reading of a lab value against its reference range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LabFlag {
    Normal,
    Low,
    High,
}

impl LabFlag {
    pub fn as_str(self) -> &'static str {
        match self {
            LabFlag::Normal => "NORMAL",
            LabFlag::Low => "LOW",
            LabFlag::High => "HIGH",
        }
    }
}

/// Both bounds are inclusive.
pub fn classify(value: f64, min: f64, max: f64) -> LabFlag {
    if value < min {
        LabFlag::Low
    } else if value > max {
        LabFlag::High
    } else {
        LabFlag::Normal
    }
}

/// Parses `"min-max"`: two numbers separated by a single hyphen.
pub fn parse_reference_range(range: &str) -> Option<(f64, f64)> {
    let range = range.trim();
    if range.matches('-').count() != 1 {
        return None;
    }
    let (min, max) = range.split_once('-')?;
    let min = min.trim().parse::<f64>().ok().filter(|v| v.is_finite())?;
    let max = max.trim().parse::<f64>().ok().filter(|v| v.is_finite())?;
    Some((min, max))
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnnotationReport {
    pub annotated: usize,
    pub format_errors: Vec<FormatError>,
}

/// The numeric sentinel is only a placeholder when the note was filled in the
/// same pass; a raw `-1` with no note is a real reading.
fn is_filled_placeholder(number: f64, note: &Value, policy: &CleaningPolicy) -> bool {
    number == policy.numeric_sentinel as f64
        && note
            .as_str()
            .is_some_and(|n| n.trim().eq_ignore_ascii_case(&policy.text_sentinel))
}

fn is_missing_text(value: &Value, sentinel: &str) -> bool {
    match value {
        Value::Null => true,
        Value::Text(s) => {
            let s = s.trim();
            s.is_empty() || s.eq_ignore_ascii_case(sentinel)
        }
        _ => false,
    }
}

/// Sets `notes` to NORMAL/LOW/HIGH on every row that has a value, a range and
/// no note yet. Existing notes are never overwritten.
pub fn annotate_lab_results(table: &mut Table, policy: &CleaningPolicy) -> AnnotationReport {
    let mut report = AnnotationReport::default();
    let label = table.label().to_string();
    let (Some(values), Some(ranges)) = (table.column("result_value"), table.column("reference_range"))
    else {
        return report;
    };
    let sentinel = policy.text_sentinel.as_str();

    let numbers: Vec<Option<f64>> = values.values.iter().map(Value::coerce_f64).collect();
    let range_known: Mask = ranges.mask(|v| !is_missing_text(v, sentinel));
    let range_text: Vec<String> = ranges.values.iter().map(Value::render).collect();

    table.ensure_column("notes");
    let Some(notes) = table.column_mut("notes") else {
        return report;
    };
    let needs_note: Mask = notes
        .values
        .iter()
        .zip(&numbers)
        .zip(&range_known)
        .map(|((note, number), known)| {
            number.is_some_and(|n| !is_filled_placeholder(n, note, policy))
                && *known
                && is_missing_text(note, sentinel)
        })
        .collect();
    if mask_count(&needs_note) == 0 {
        return report;
    }

    for (row, note) in notes.values.iter_mut().enumerate() {
        if !needs_note[row] {
            continue;
        }
        let Some(value) = numbers[row] else {
            continue;
        };
        match parse_reference_range(&range_text[row]) {
            Some((min, max)) => {
                *note = Value::text(classify(value, min, max).as_str());
                report.annotated += 1;
            }
            None => {
                tracing::warn!(
                    "Skipping {} row {}: reference range '{}' is not min-max",
                    label,
                    row,
                    range_text[row]
                );
                report.format_errors.push(FormatError::new(
                    &label,
                    "reference_range",
                    Some(row),
                    range_text[row].as_str(),
                    "reference range is not two numbers separated by a hyphen",
                ));
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> Value {
        Value::text(s)
    }

    fn labs(rows: Vec<Vec<Value>>) -> Table {
        Table::from_rows(
            "patient_lab_results",
            &["result_value", "reference_range", "notes"],
            rows,
        )
        .unwrap()
    }

    fn note(table: &Table, row: usize) -> Option<&str> {
        table.value(row, "notes").and_then(Value::as_str)
    }

    #[test]
    fn classifies_against_inclusive_bounds() {
        let mut table = labs(vec![
            vec![Value::Float(1.7), t("1.5-2.0"), Value::Null],
            vec![Value::Float(0.7), t("1.5-2.0"), Value::Null],
            vec![Value::Float(2.7), t("1.5-2.0"), Value::Null],
            vec![Value::Float(1.5), t("1.5-2.0"), Value::Null],
            vec![Value::Float(2.0), t("1.5-2.0"), Value::Null],
        ]);

        let report = annotate_lab_results(&mut table, &CleaningPolicy::default());

        assert_eq!(report.annotated, 5);
        assert_eq!(note(&table, 0), Some("NORMAL"));
        assert_eq!(note(&table, 1), Some("LOW"));
        assert_eq!(note(&table, 2), Some("HIGH"));
        assert_eq!(note(&table, 3), Some("NORMAL"));
        assert_eq!(note(&table, 4), Some("NORMAL"));
    }

    #[test]
    fn existing_notes_are_kept() {
        let mut table = labs(vec![vec![Value::Float(0.7), t("1.5-2.0"), t("RECHECK")]]);
        let report = annotate_lab_results(&mut table, &CleaningPolicy::default());
        assert_eq!(report.annotated, 0);
        assert_eq!(note(&table, 0), Some("RECHECK"));
    }

    #[test]
    fn missing_inputs_leave_notes_null() {
        let mut table = labs(vec![
            vec![Value::Null, t("1.5-2.0"), Value::Null],
            vec![Value::Float(1.0), Value::Null, Value::Null],
            vec![t("n/a"), t("1.5-2.0"), Value::Null],
        ]);
        annotate_lab_results(&mut table, &CleaningPolicy::default());
        assert!(table.column("notes").unwrap().values.iter().all(Value::is_null));
    }

    #[test]
    fn minus_one_is_a_reading_unless_already_filled() {
        let mut table = labs(vec![
            vec![Value::Float(-1.0), t("0-3"), Value::Null],
            vec![Value::Float(-1.0), t("0-3"), t("UNKNOWN")],
            vec![Value::Int(-1), t("0-3"), t("unknown")],
        ]);
        let report = annotate_lab_results(&mut table, &CleaningPolicy::default());
        assert_eq!(report.annotated, 1);
        assert_eq!(note(&table, 0), Some("LOW"));
        assert_eq!(note(&table, 1), Some("UNKNOWN"));
        assert_eq!(note(&table, 2), Some("unknown"));
    }

    #[test]
    fn bad_range_skips_only_that_row() {
        let mut table = labs(vec![
            vec![Value::Float(1.7), t("1.5 to 2.0"), Value::Null],
            vec![Value::Float(1.7), t("1.5-2.0"), Value::Null],
        ]);
        let report = annotate_lab_results(&mut table, &CleaningPolicy::default());
        assert_eq!(report.annotated, 1);
        assert_eq!(report.format_errors.len(), 1);
        assert_eq!(report.format_errors[0].row, Some(0));
        assert_eq!(table.value(0, "notes"), Some(&Value::Null));
        assert_eq!(note(&table, 1), Some("NORMAL"));
    }

    #[test]
    fn notes_column_is_created_when_absent() {
        let mut table = Table::from_rows(
            "patient_lab_results",
            &["result_value", "reference_range"],
            vec![vec![Value::Int(15600), t("12000-16000")]],
        )
        .unwrap();
        annotate_lab_results(&mut table, &CleaningPolicy::default());
        assert_eq!(note(&table, 0), Some("NORMAL"));
    }

    #[test]
    fn range_parser_wants_exactly_one_hyphen() {
        assert_eq!(parse_reference_range("12000-16000"), Some((12000.0, 16000.0)));
        assert_eq!(parse_reference_range("1.5-2.0"), Some((1.5, 2.0)));
        assert_eq!(parse_reference_range("-1-2"), None);
        assert_eq!(parse_reference_range("UNKNOWN"), None);
    }
}
