use std::{
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use crate::error::{EtlError, Result};

pub fn project_root() -> PathBuf {
    let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    manifest_dir
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or(manifest_dir)
}

pub fn default_data_dir() -> PathBuf {
    project_root().join("data")
}

pub fn default_output_dir() -> PathBuf {
    default_data_dir().join("output")
}

pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            EtlError::sink(parent.display().to_string(), format!("failed creating: {e}"))
        })?;
    }
    Ok(())
}

/// Sibling path the writers stage into before renaming over `path`.
pub fn tmp_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|x| x.to_str())
        .unwrap_or("output");
    path.with_file_name(format!("{file_name}.tmp"))
}

pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    ensure_parent_dir(path)?;
    let tmp_path = tmp_path_for(path);
    fs::write(&tmp_path, contents).map_err(|e| {
        EtlError::sink(tmp_path.display().to_string(), format!("failed writing: {e}"))
    })?;
    fs::rename(&tmp_path, path).map_err(|e| {
        EtlError::sink(
            path.display().to_string(),
            format!("failed moving {} into place: {e}", tmp_path.display()),
        )
    })?;
    Ok(())
}

pub fn sql_escape_path(path: &Path) -> String {
    path.to_string_lossy().replace('\'', "''")
}

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// DuckDB table function reading `input_path`, chosen by extension.
pub fn source_expr(input_path: &Path) -> Result<String> {
    let escaped = sql_escape_path(input_path);
    let extension = input_path
        .extension()
        .and_then(|x| x.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match extension.as_str() {
        "parquet" => Ok(format!("read_parquet('{escaped}')")),
        "csv" => Ok(format!(
            "read_csv_auto('{escaped}', header=true, sample_size=-1)"
        )),
        _ => Err(EtlError::load(
            input_path.display().to_string(),
            "unsupported extension, use .csv or .parquet",
        )),
    }
}

/// `path` relative to the project root when it lives under it.
pub fn relative_label(path: &Path) -> String {
    let root = project_root();
    path.strip_prefix(&root)
        .ok()
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string())
}

pub fn now_unix_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_expr_picks_reader_by_extension() {
        let csv = source_expr(Path::new("/data/patient_visits.CSV")).unwrap();
        assert!(csv.starts_with("read_csv_auto('/data/patient_visits.CSV'"));
        let parquet = source_expr(Path::new("/data/o'brien.parquet")).unwrap();
        assert_eq!(parquet, "read_parquet('/data/o''brien.parquet')");
        assert!(source_expr(Path::new("/data/visits.xlsx")).is_err());
    }

    #[test]
    fn write_atomic_leaves_no_tmp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("report.md");
        write_atomic(&path, "hello").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "hello");
        assert!(!tmp_path_for(&path).exists());
    }

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_ident("age"), "\"age\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
