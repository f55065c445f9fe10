use crate::table::{ColumnKind, TableName};

/// Declared fields of each source table. Extra columns in an extract are
/// passed through and typed by inference.
pub fn source_fields(table: TableName) -> &'static [(&'static str, ColumnKind)] {
    use ColumnKind::*;
    match table {
        TableName::Demographics => &[
            ("patient_id", Text),
            ("age", Integer),
            ("gender", Text),
            ("other_fields", Text),
        ],
        TableName::Visits => &[
            ("patient_id", Text),
            ("visit_id", Text),
            ("visit_date", Text),
            ("diagnosis", Text),
            ("medication", Text),
            ("other_fields", Text),
        ],
        TableName::LabResults => &[
            ("patient_id", Text),
            ("visit_id", Text),
            ("lab_test_id", Text),
            ("test_date", Date),
            ("test_name", Text),
            ("result_value", Float),
            ("result_unit", Text),
            ("reference_range", Text),
            ("notes", Text),
        ],
        TableName::Medications => &[
            ("patient_id", Text),
            ("visit_id", Text),
            ("medication_id", Text),
            ("medication", Text),
            ("dosage_mg", Float),
            ("start_date", Date),
            ("end_date", Date),
            ("notes", Text),
        ],
        TableName::PhysicianAssignments => &[
            ("patient_id", Text),
            ("visit_id", Text),
            ("physician_id", Text),
            ("physician_name", Text),
            ("assignment_date", Date),
            ("department", Text),
        ],
    }
}

pub fn declared_kind(table: TableName, column: &str) -> Option<ColumnKind> {
    if column == "dosage" && table == TableName::Medications {
        return Some(ColumnKind::Float);
    }
    source_fields(table)
        .iter()
        .find(|(name, _)| *name == column)
        .map(|(_, kind)| *kind)
}

/// Column type in a destination table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    String(u16),
    Integer,
    Float,
    Date,
}

impl SqlType {
    pub fn sqlite_decl(self) -> String {
        match self {
            SqlType::String(len) => format!("VARCHAR({len})"),
            SqlType::Integer => "INTEGER".to_string(),
            SqlType::Float => "REAL".to_string(),
            SqlType::Date => "DATE".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DestinationTable {
    pub name: &'static str,
    pub columns: &'static [(&'static str, SqlType)],
    pub primary_keys: &'static [&'static str],
}

impl DestinationTable {
    pub fn column_names(&self) -> Vec<&'static str> {
        self.columns.iter().map(|(name, _)| *name).collect()
    }
}

/// How the merged row set is split back into relational tables.
pub const DESTINATION_TABLES: [DestinationTable; 5] = [
    DestinationTable {
        name: "patient_demographics",
        columns: &[
            ("patient_id", SqlType::String(10)),
            ("age", SqlType::Integer),
            ("age_group", SqlType::String(20)),
            ("gender", SqlType::String(10)),
            ("patient_demographics_other_fields", SqlType::String(255)),
        ],
        primary_keys: &["patient_id"],
    },
    DestinationTable {
        name: "patient_visits",
        columns: &[
            ("patient_id", SqlType::String(10)),
            ("visit_id", SqlType::String(50)),
            ("visit_date", SqlType::Date),
            ("visit_frequency", SqlType::Integer),
            ("diagnosis", SqlType::String(255)),
            ("medication", SqlType::String(255)),
            ("patients_visits_other_fields", SqlType::String(255)),
        ],
        primary_keys: &["visit_id"],
    },
    DestinationTable {
        name: "patient_lab_results",
        columns: &[
            ("patient_id", SqlType::String(10)),
            ("visit_id", SqlType::String(50)),
            ("lab_test_id", SqlType::String(50)),
            ("test_date", SqlType::Date),
            ("test_name", SqlType::String(255)),
            ("result_value", SqlType::Float),
            ("result_unit", SqlType::String(50)),
            ("reference_range", SqlType::String(50)),
            ("patient_lab_results_notes", SqlType::String(255)),
        ],
        primary_keys: &["lab_test_id"],
    },
    DestinationTable {
        name: "patient_medications",
        columns: &[
            ("patient_id", SqlType::String(10)),
            ("medication_id", SqlType::String(50)),
            ("visit_id", SqlType::String(50)),
            ("medication", SqlType::String(255)),
            ("dosage_mg", SqlType::Float),
            ("start_date", SqlType::Date),
            ("end_date", SqlType::Date),
            ("patient_medications_notes", SqlType::String(255)),
        ],
        primary_keys: &["medication_id"],
    },
    DestinationTable {
        name: "physician_assignments",
        columns: &[
            ("patient_id", SqlType::String(10)),
            ("visit_id", SqlType::String(50)),
            ("physician_id", SqlType::String(50)),
            ("physician_name", SqlType::String(255)),
            ("assignment_date", SqlType::Date),
            ("department", SqlType::String(255)),
        ],
        primary_keys: &["patient_id", "visit_id", "physician_id"],
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_destination_key_is_a_destination_column() {
        for table in DESTINATION_TABLES {
            let columns = table.column_names();
            for key in table.primary_keys {
                assert!(columns.contains(key), "{} missing key {key}", table.name);
            }
        }
    }

    #[test]
    fn raw_dosage_is_numeric() {
        assert_eq!(
            declared_kind(TableName::Medications, "dosage"),
            Some(ColumnKind::Float)
        );
        assert_eq!(declared_kind(TableName::Visits, "dosage"), None);
    }
}
