use serde::{Deserialize, Serialize};

use crate::{
    constants::{LAB_UNIT_FACTOR, SOURCE_LAB_UNIT, TARGET_LAB_UNIT},
    error::{EtlError, FormatError, Result},
    table::{Table, Value, mask_count},
};

/// A fixed multiplicative conversion between two lab units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitConversion {
    pub from_unit: String,
    pub to_unit: String,
    pub factor: f64,
}

impl Default for UnitConversion {
    fn default() -> Self {
        Self {
            from_unit: SOURCE_LAB_UNIT.to_string(),
            to_unit: TARGET_LAB_UNIT.to_string(),
            factor: LAB_UNIT_FACTOR,
        }
    }
}

impl UnitConversion {
    pub fn validate(&self) -> Result<()> {
        if !self.factor.is_finite() || self.factor <= 0.0 {
            return Err(EtlError::Config(format!(
                "unit conversion factor must be a positive number, got {}",
                self.factor
            )));
        }
        if self.from_unit.trim().is_empty() || self.to_unit.trim().is_empty() {
            return Err(EtlError::Config("unit names must not be empty".into()));
        }
        Ok(())
    }

    fn source_unit(&self) -> String {
        self.from_unit.trim().to_uppercase()
    }

    fn target_unit(&self) -> String {
        self.to_unit.trim().to_uppercase()
    }
}

pub fn convert_value(value: f64, factor: f64) -> f64 {
    value * factor
}

fn render_scaled(bound: i64, factor: f64) -> String {
    let scaled = bound as f64 * factor;
    if scaled.fract() == 0.0 && scaled.abs() < 9.0e15 {
        (scaled as i64).to_string()
    } else {
        scaled.to_string()
    }
}

/// Scales both bounds of an integer `"lo-hi"` range.
pub fn convert_range_str(range: &str, factor: f64) -> std::result::Result<String, FormatError> {
    let parsed = range.trim().split_once('-').and_then(|(lo, hi)| {
        let lo = lo.trim().parse::<i64>().ok()?;
        let hi = hi.trim().parse::<i64>().ok()?;
        Some((lo, hi))
    });
    match parsed {
        Some((lo, hi)) => Ok(format!(
            "{}-{}",
            render_scaled(lo, factor),
            render_scaled(hi, factor)
        )),
        None => Err(FormatError::new(
            "",
            "reference_range",
            None,
            range,
            "reference range is not of the form int-int",
        )),
    }
}

/// Range conversion over a cell: text must be an integer range, anything else
/// passes through unchanged.
pub fn convert_range(value: &Value, factor: f64) -> std::result::Result<Value, FormatError> {
    match value {
        Value::Text(range) => convert_range_str(range, factor).map(Value::Text),
        other => Ok(other.clone()),
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnitReport {
    pub converted_rows: usize,
    pub format_errors: Vec<FormatError>,
}

/// Rewrites value, unit and range of every row whose unit is the conversion's
/// source unit. The row mask is computed once, before any column is touched.
pub fn normalize_lab_units(
    table: &mut Table,
    conversion: &UnitConversion,
    text_sentinel: &str,
) -> UnitReport {
    let mut report = UnitReport::default();
    let label = table.label().to_string();
    let source_unit = conversion.source_unit();
    let target_unit = conversion.target_unit();

    let Some(unit_column) = table.column_mut("result_unit") else {
        return report;
    };
    for value in unit_column.values.iter_mut() {
        if let Value::Text(unit) = value {
            *unit = unit.trim().to_uppercase();
        }
    }
    let mask = unit_column.mask(|v| v.as_str() == Some(source_unit.as_str()));
    report.converted_rows = mask_count(&mask);
    if report.converted_rows == 0 {
        return report;
    }

    for (value, selected) in unit_column.values.iter_mut().zip(&mask) {
        if *selected {
            *value = Value::Text(target_unit.clone());
        }
    }

    if let Some(values) = table.column_mut("result_value") {
        for (row, (value, selected)) in values.values.iter_mut().zip(&mask).enumerate() {
            if !*selected || value.is_null() {
                continue;
            }
            match value.coerce_f64() {
                Some(v) => *value = Value::Float(convert_value(v, conversion.factor)),
                None => {
                    report.format_errors.push(FormatError::new(
                        &label,
                        "result_value",
                        Some(row),
                        value.render(),
                        "result value is not numeric",
                    ));
                    *value = Value::Null;
                }
            }
        }
    }

    if let Some(ranges) = table.column_mut("reference_range") {
        for (row, (value, selected)) in ranges.values.iter_mut().zip(&mask).enumerate() {
            if !*selected || value.as_str() == Some(text_sentinel) {
                continue;
            }
            match convert_range(value, conversion.factor) {
                Ok(converted) => *value = converted,
                Err(err) => {
                    // A range left in the source unit would be compared against a
                    // converted value, so it is replaced by the sentinel.
                    report.format_errors.push(FormatError {
                        table: label.clone(),
                        row: Some(row),
                        ..err
                    });
                    *value = Value::Text(text_sentinel.to_string());
                }
            }
        }
    }

    tracing::info!(
        "Converted {} {} row(s) from {} to {}",
        report.converted_rows,
        label,
        source_unit,
        target_unit
    );
    report
}
