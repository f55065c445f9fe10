mod args;

use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{fs, path::PathBuf};

use args::{Args, Command, RunArgs, SinkKind, SourceArgs, SourceKind};
use clinical_etl::{
    common::{default_data_dir, default_output_dir},
    config::EtlConfig,
    constants::MERGED_OUTPUT_STEM,
    loader::{FileLoader, Loader, SqliteLoader},
    pipeline::{ReportPaths, run_audit, run_pipeline},
    sink::{CsvSink, ParquetSink, Sink, SqliteSink},
};

struct Resolved {
    config: EtlConfig,
    loader: Box<dyn Loader>,
    output_dir: PathBuf,
}

fn resolve_source(args: &SourceArgs) -> Result<Resolved> {
    let config = match &args.config {
        Some(path) => EtlConfig::load(path)
            .with_context(|| format!("Failed loading config {}", path.display()))?,
        None => EtlConfig::default(),
    };

    let output_dir = args.output_dir.clone().unwrap_or_else(default_output_dir);
    fs::create_dir_all(&output_dir)
        .with_context(|| format!("Failed creating {}", output_dir.display()))?;

    let loader: Box<dyn Loader> = match args.source {
        SourceKind::Files => {
            let data_dir = args.data_dir.clone().unwrap_or_else(default_data_dir);
            if !data_dir.is_dir() {
                bail!("Data directory not found: {}", data_dir.display());
            }
            Box::new(FileLoader::new(data_dir, config.input.clone()))
        }
        SourceKind::Sqlite => {
            let db = args
                .source_db
                .clone()
                .context("--source sqlite requires --source-db")?;
            if !db.exists() {
                bail!("Source database not found: {}", db.display());
            }
            Box::new(SqliteLoader::new(db))
        }
    };

    Ok(Resolved {
        config,
        loader,
        output_dir,
    })
}

fn run(args: RunArgs) -> Result<()> {
    let Resolved {
        mut config,
        loader,
        output_dir,
    } = resolve_source(&args.source)?;
    config.run.fail_on_clean_error |= args.strict;
    config.run.write_null_audit |= args.null_audit;

    let extension = match args.sink {
        SinkKind::Csv => "csv",
        SinkKind::Parquet => "parquet",
        SinkKind::Sqlite => "db",
    };
    let output_path = args
        .output_path
        .clone()
        .unwrap_or_else(|| output_dir.join(format!("{MERGED_OUTPUT_STEM}.{extension}")));

    let mut sink: Box<dyn Sink> = match args.sink {
        SinkKind::Csv => Box::new(CsvSink::new(&output_path)),
        SinkKind::Parquet => Box::new(ParquetSink::new(&output_path)),
        SinkKind::Sqlite => Box::new(
            SqliteSink::new(&output_path, MERGED_OUTPUT_STEM, config.cleaning.text_sentinel.clone())
                .with_progress(!args.no_progress),
        ),
    };

    let paths = ReportPaths::in_dir(&output_dir);
    let report = run_pipeline(loader.as_ref(), sink.as_mut(), &config, &paths)
        .with_context(|| format!("Run failed; see {}", paths.run_report.display()))?;

    let failed = report.failed_tables();
    if !failed.is_empty() {
        tracing::warn!("Merged without fully cleaned tables: {:?}", failed);
    }
    if let Some(summary) = &report.sink_summary {
        println!(
            "Wrote {} row(s) to {} (report: {})",
            summary.rows_written,
            summary.target,
            paths.run_report.display()
        );
    }
    Ok(())
}

fn audit(args: SourceArgs) -> Result<()> {
    let Resolved {
        config,
        loader,
        output_dir,
    } = resolve_source(&args)?;
    let paths = ReportPaths::in_dir(&output_dir);
    let sections = run_audit(loader.as_ref(), &config, &paths).context("Audit failed")?;
    println!(
        "Audited {} table section(s); wrote {} and {}",
        sections.len(),
        paths.null_audit.display(),
        paths.rejects.display()
    );
    Ok(())
}

fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();

    match args.cmd {
        Command::Run(cmd) => run(cmd).context("run failed"),
        Command::Audit(cmd) => audit(cmd).context("audit failed"),
    }
}
