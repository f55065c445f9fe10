use std::{collections::HashMap, fs, path::Path};

use clinical_etl::{
    config::EtlConfig,
    error::EtlError,
    loader::FileLoader,
    pipeline::{ReportPaths, run_pipeline},
    sink::{CsvSink, SqliteSink},
};

fn write_extracts(dir: &Path) {
    fs::write(
        dir.join("patient_demographics.csv"),
        "patient_id,age,gender,other_fields\n\
         P1,25,male,non-smoker\n\
         P2,,Female,\n\
         ,40,male,orphan\n\
         P3,70,female,smoker\n",
    )
    .unwrap();
    fs::write(
        dir.join("patient_visits.csv"),
        "patient_id,visit_id,visit_date,diagnosis,medication,other_fields\n\
         P1,V101,2024-01-05,depression,sertraline,\n\
         P1,V102,2024-02-05,flu,ibuprofen,\n\
         P2,V201,2024-03-01,checkup,aspirin,\n",
    )
    .unwrap();
    fs::write(
        dir.join("patient_lab_results.csv"),
        "patient_id,visit_id,lab_test_id,test_date,test_name,result_value,result_unit,reference_range,notes\n\
         P1,V101,L1,2024-01-05,hemoglobin,15.6,G/DL,12-16,\n",
    )
    .unwrap();
}

fn read_csv_rows(path: &Path) -> Vec<HashMap<String, String>> {
    let mut reader = csv::Reader::from_path(path).unwrap();
    let headers = reader.headers().unwrap().clone();
    reader
        .records()
        .map(|record| {
            let record = record.unwrap();
            headers
                .iter()
                .zip(record.iter())
                .map(|(h, v)| (h.to_string(), v.to_string()))
                .collect()
        })
        .collect()
}

#[test]
fn csv_run_merges_one_row_per_patient_visit() {
    let data = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    write_extracts(data.path());

    let config = EtlConfig::default();
    let loader = FileLoader::new(data.path(), config.input.clone());
    let output = out.path().join("cleaned_data.csv");
    let mut sink = CsvSink::new(&output);
    let paths = ReportPaths::in_dir(out.path());

    let report = run_pipeline(&loader, &mut sink, &config, &paths).unwrap();
    assert!(report.succeeded());
    assert!(report.failed_tables().is_empty());

    let rows = read_csv_rows(&output);
    assert_eq!(rows.len(), 4);

    let v101 = rows.iter().find(|r| r["visit_id"] == "V101").unwrap();
    assert_eq!(v101["patient_id"], "P1");
    assert_eq!(v101["gender"], "MALE");
    assert_eq!(v101["age_group"], "19-35");
    assert_eq!(v101["visit_frequency"], "2");
    assert_eq!(v101["result_unit"], "MG/DL");
    assert_eq!(v101["result_value"], "15600.0");
    assert_eq!(v101["reference_range"], "12000-16000");
    assert_eq!(v101["medication"], "SERTRALINE");

    let p3 = rows.iter().find(|r| r["patient_id"] == "P3").unwrap();
    assert_eq!(p3["age_group"], "65+");
    assert_eq!(p3["visit_frequency"], "0");
    assert_eq!(p3["visit_id"], "");

    let rejects = fs::read_to_string(&paths.rejects).unwrap();
    let dropped: Vec<&str> = rejects
        .lines()
        .filter(|l| l.starts_with("patient_demographics,missing_patient_id,"))
        .collect();
    assert_eq!(dropped.len(), 1);

    let json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&paths.run_report).unwrap()).unwrap();
    assert_eq!(json["merge"]["status"], "succeeded");
    assert_eq!(json["rejects"]["rows_dropped"], 1);
}

#[test]
fn sqlite_run_splits_destination_tables() {
    let data = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    write_extracts(data.path());

    let config = EtlConfig::default();
    let loader = FileLoader::new(data.path(), config.input.clone());
    let db_path = out.path().join("cleaned_data.db");
    let mut sink = SqliteSink::new(&db_path, "cleaned_data", "UNKNOWN").with_progress(false);

    let report = run_pipeline(&loader, &mut sink, &config, &ReportPaths::in_dir(out.path())).unwrap();
    let summary = report.sink_summary.unwrap();
    assert_eq!(summary.rows_written, 4);

    let conn = rusqlite::Connection::open(&db_path).unwrap();
    let count = |table: &str| -> i64 {
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
            .unwrap()
    };
    assert_eq!(count("cleaned_data"), 4);
    assert_eq!(count("patient_demographics"), 3);
    assert_eq!(count("patient_visits"), 3);
    assert_eq!(count("patient_lab_results"), 1);
    assert_eq!(count("patient_medications"), 0);

    let frequency: i64 = conn
        .query_row(
            "SELECT visit_frequency FROM patient_visits WHERE visit_id = 'V102'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(frequency, 2);
}

#[test]
fn strict_run_skips_merge_when_a_table_fails() {
    let data = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    write_extracts(data.path());
    fs::write(
        data.path().join("patient_visits.csv"),
        "visit_id,diagnosis\nV101,flu\n",
    )
    .unwrap();

    let mut config = EtlConfig::default();
    config.run.fail_on_clean_error = true;
    let loader = FileLoader::new(data.path(), config.input.clone());
    let output = out.path().join("cleaned_data.csv");
    let mut sink = CsvSink::new(&output);
    let paths = ReportPaths::in_dir(out.path());

    let err = run_pipeline(&loader, &mut sink, &config, &paths).unwrap_err();
    assert!(matches!(err, EtlError::Table { .. }));
    assert!(!output.exists());

    let json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&paths.run_report).unwrap()).unwrap();
    assert_eq!(json["merge"]["status"], "skipped");
    assert_eq!(json["sink"]["status"], "skipped");
}
