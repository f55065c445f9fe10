use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "clinical_etl")]
#[command(about = "Clean, normalize and merge clinical extracts into one record per patient visit")]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Load, clean, merge and write the merged rows to the chosen sink.
    Run(RunArgs),
    /// Load and clean only, then write the null/sentinel audit and reject report.
    Audit(SourceArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SourceKind {
    /// One .csv/.parquet file per table under --data-dir.
    Files,
    /// Tables of an existing SQLite database (--source-db).
    Sqlite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SinkKind {
    Csv,
    Parquet,
    Sqlite,
}

#[derive(clap::Args, Debug, Clone)]
pub struct SourceArgs {
    /// Directory holding the raw extracts. Defaults to <project>/data.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Directory for outputs and reports. Defaults to <project>/data/output.
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// TOML file with the cleaning policy and input file names.
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = SourceKind::Files)]
    pub source: SourceKind,

    /// SQLite database to read when --source sqlite.
    #[arg(long)]
    pub source_db: Option<PathBuf>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    #[arg(long, value_enum, default_value_t = SinkKind::Csv)]
    pub sink: SinkKind,

    /// Output path. Defaults to <output-dir>/cleaned_data.<csv|parquet|db>.
    #[arg(long)]
    pub output_path: Option<PathBuf>,

    /// Skip the merge when any table fails to clean.
    #[arg(long, default_value_t = false)]
    pub strict: bool,

    /// Also write null_audit.md for the cleaned and merged tables.
    #[arg(long, default_value_t = false)]
    pub null_audit: bool,

    /// Disable the SQLite insert progress bar.
    #[arg(long, default_value_t = false)]
    pub no_progress: bool,
}
