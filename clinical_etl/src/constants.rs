//! Deployment policy defaults. Every historical variant of this pipeline picked
//! its own sentinels and buckets; these are the single values the tool uses.

pub const TEXT_SENTINEL: &str = "UNKNOWN";
/// Collides with real negative readings. Lab annotation only treats it as a
/// placeholder when the row's note is the text sentinel too.
pub const NUMERIC_SENTINEL: i64 = -1;
pub const DATE_SENTINEL: &str = "1900-01-01";

pub const SOURCE_LAB_UNIT: &str = "G/DL";
pub const TARGET_LAB_UNIT: &str = "MG/DL";
pub const LAB_UNIT_FACTOR: f64 = 1000.0;

pub const DOSAGE_UNIT_SUFFIX: &str = "mg";

pub const DEFAULT_DATE_COLUMNS: [&str; 4] = ["test_date", "start_date", "end_date", "assignment_date"];

/// Upper edges (inclusive) and labels of the age buckets; anything above the
/// last edge falls into [`AGE_BUCKET_OPEN_LABEL`].
pub const AGE_BUCKETS: [(i64, &str); 4] = [(18, "0-18"), (35, "19-35"), (50, "36-50"), (65, "51-65")];
pub const AGE_BUCKET_OPEN_LABEL: &str = "65+";

pub const MERGED_OUTPUT_STEM: &str = "cleaned_data";
pub const RUN_REPORT_FILE: &str = "run_report.json";
pub const REJECTS_REPORT_FILE: &str = "rejects.csv";
pub const NULL_AUDIT_FILE: &str = "null_audit.md";
