use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use govdata_ingest::app::{App, IngestOptions, IngestReport, PlanResult, TablesResult};
use govdata_ingest::cancel::CancelToken;
use govdata_ingest::config::ConfigLoader;
use govdata_ingest::domain::{DatasetKey, FamilySelector};
use govdata_ingest::error::IngestError;
use govdata_ingest::output::{JsonOutput, LogProgress, OutputMode};
use govdata_ingest::retriever::HttpArchiveSource;
use govdata_ingest::tui::Tui;

#[derive(Parser)]
#[command(name = "govdata")]
#[command(about = "Ingest weekly government open-data archives into DuckDB")]
#[command(version, author)]
struct Cli {
    /// Print a JSON report instead of the progress dashboard.
    #[arg(long, global = true)]
    non_interactive: bool,

    /// JSON config file (defaults to ./govdata.json, then built-in datasets).
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Download, expand and load the selected datasets")]
    Ingest(IngestArgs),
    #[command(about = "Show what an ingest would touch, without any I/O")]
    Plan(SelectArgs),
    #[command(about = "List the tables of each family's store")]
    Tables(FamilyArgs),
}

#[derive(Args, Clone)]
struct FamilyArgs {
    /// Dataset family name, or `all`.
    #[arg(long, default_value = "all")]
    family: String,
}

#[derive(Args, Clone)]
struct SelectArgs {
    #[command(flatten)]
    family: FamilyArgs,

    /// Restrict the run to these dataset keys (repeatable).
    #[arg(long = "dataset")]
    datasets: Vec<String>,
}

#[derive(Args, Clone)]
struct IngestArgs {
    #[command(flatten)]
    select: SelectArgs,

    /// Reuse the archive already on disk.
    #[arg(long)]
    skip_download: bool,

    #[arg(long)]
    keep_archive: bool,

    #[arg(long)]
    keep_extracted: bool,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => ExitCode::from(code),
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(err) = report.downcast_ref::<IngestError>() {
                return ExitCode::from(map_exit_code(err));
            }
            ExitCode::from(3)
        }
    }
}

fn map_exit_code(error: &IngestError) -> u8 {
    if error.is_configuration() { 2 } else { 3 }
}

fn run() -> miette::Result<u8> {
    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };
    let interactive_ingest =
        matches!(output_mode, OutputMode::Interactive) && matches!(cli.command, Commands::Ingest(_));
    let default_filter = if interactive_ingest { "off" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    tracing::debug!(
        data_root = %config.data_root,
        store_root = %config.store_root,
        families = config.families.len(),
        "configuration resolved"
    );

    match cli.command {
        Commands::Ingest(args) => {
            let selector: FamilySelector = args.select.family.family.parse()?;
            let keys = parse_keys(&args.select.datasets)?;
            let options = IngestOptions {
                skip_download: args.skip_download,
                keep_archive: args.keep_archive,
                keep_extracted: args.keep_extracted,
            };
            let cancel = CancelToken::new();
            let source = HttpArchiveSource::new(&config.http)?;
            let app = App::new(config, source).with_cancel(cancel.clone());
            let stamp = app.current_stamp();

            let report = match output_mode {
                OutputMode::NonInteractive => {
                    let report =
                        app.ingest(&selector, &keys, &stamp, &options, &LogProgress::default())?;
                    JsonOutput::print_ingest(&report).into_diagnostic()?;
                    report
                }
                OutputMode::Interactive => {
                    let mut tui = Tui::new(cancel);
                    let report = tui
                        .run(move |sink| app.ingest(&selector, &keys, &stamp, &options, sink))?;
                    print_ingest_summary(&report);
                    report
                }
            };
            Ok(if report.has_failures() { 1 } else { 0 })
        }
        Commands::Plan(args) => {
            let selector: FamilySelector = args.family.family.parse()?;
            let keys = parse_keys(&args.datasets)?;
            let app = App::new(config, NoSource);
            let plan = app.plan(&selector, &keys, &app.current_stamp())?;
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_plan(&plan).into_diagnostic()?,
                OutputMode::Interactive => print_plan(&plan),
            }
            Ok(0)
        }
        Commands::Tables(args) => {
            let selector: FamilySelector = args.family.parse()?;
            let app = App::new(config, NoSource);
            let tables = app.tables(&selector)?;
            match output_mode {
                OutputMode::NonInteractive => {
                    JsonOutput::print_tables(&tables).into_diagnostic()?
                }
                OutputMode::Interactive => print_tables(&tables),
            }
            Ok(0)
        }
    }
}

fn parse_keys(raw: &[String]) -> Result<Vec<DatasetKey>, IngestError> {
    raw.iter().map(|key| key.parse()).collect()
}

fn print_ingest_summary(report: &IngestReport) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let red = "\x1b[31m";
    let reset = "\x1b[0m";

    println!("{cyan}govdata summary (snapshot {}){reset}", report.stamp);
    println!(
        "{green}tables ingested: {}  rows: {}{reset}",
        report.tables_ingested, report.total_rows
    );
    let color = if report.has_failures() { red } else { yellow };
    println!("{color}failed datasets: {}{reset}", report.failed);

    for outcome in &report.datasets {
        match &outcome.error {
            None => println!(
                "{green}  {}/{}: {} tables, {} rows{reset}",
                outcome.family,
                outcome.dataset,
                outcome.tables.iter().filter(|t| t.replaced).count(),
                outcome.rows
            ),
            Some(error) => println!(
                "{red}  {}/{}: {} ({}){reset}",
                outcome.family, outcome.dataset, error.kind, error.message
            ),
        }
    }
}

fn print_plan(plan: &PlanResult) {
    println!("snapshot {}", plan.stamp);
    for entry in &plan.entries {
        println!("{}/{} [{}]", entry.family, entry.dataset, entry.layout);
        println!("  url:      {}", entry.url);
        println!("  archive:  {}", entry.archive_path);
        println!("  extract:  {}", entry.extraction_dir);
        println!("  store:    {}", entry.store_path);
    }
}

fn print_tables(result: &TablesResult) {
    for family in &result.families {
        println!("{} ({})", family.family, family.store_path);
        if family.tables.is_empty() {
            println!("  no tables");
        }
        for table in &family.tables {
            println!(
                "  {:<40} {:>12} rows {:>4} columns",
                table.name, table.rows, table.columns
            );
        }
    }
}

/// Plan and tables never download anything.
struct NoSource;

impl govdata_ingest::retriever::ArchiveSource for NoSource {
    fn fetch(
        &self,
        url: &str,
        _destination: &std::path::Path,
        _observer: govdata_ingest::retriever::TransferObserver<'_>,
        _cancel: &CancelToken,
    ) -> Result<u64, IngestError> {
        Err(IngestError::Retrieval {
            url: url.to_string(),
            message: "downloads are disabled for this command".to_string(),
        })
    }
}
