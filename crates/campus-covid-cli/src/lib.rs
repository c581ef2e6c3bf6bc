//! Command surface for the campus COVID tracker.
//!
//! - [`run_cli`] executes a parsed [`Cli`].
//! - [`driver::IngestDriver`] runs source extractors and reconciles their
//!   output, and is usable without the CLI.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use campus_covid_core::{
    parse_day, Catalog, CollectionId, Reconciler, Record, WeeklyObservation, WeeklyOutcome,
};
use campus_covid_store_sqlite::SqliteRecordStore;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;

pub mod driver;
pub mod export;
pub mod sources;

use driver::{IngestConfig, IngestDriver, RunReport, SourceStatus};
use sources::{
    BabsonDashboard, BostonCollegeDashboard, HttpConfig, JsonFeedSource, SourceExtractor,
    TuftsMetrics, WellesleyDashboard,
};

#[derive(Debug, Parser)]
#[command(name = "campus-covid")]
#[command(about = "Campus COVID testing tracker")]
pub struct Cli {
    #[arg(long, env = "CAMPUS_COVID_DB", default_value = "./campus_covid.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Catalog {
        #[command(subcommand)]
        command: CatalogCommand,
    },
    Record {
        #[command(subcommand)]
        command: Box<RecordCommand>,
    },
    Scrape {
        #[command(subcommand)]
        command: Box<ScrapeCommand>,
    },
    Export(ExportArgs),
}

#[derive(Debug, Subcommand)]
pub enum CatalogCommand {
    List(CatalogListArgs),
}

#[derive(Debug, Args)]
pub struct CatalogListArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum RecordCommand {
    /// Reconcile one cumulative record.
    Add(RecordAddArgs),
    /// Gap-fill and reconcile a trailing 7-day count.
    Weekly(RecordWeeklyArgs),
    List(RecordListArgs),
}

#[derive(Debug, Args)]
pub struct RecordAddArgs {
    #[arg(long)]
    collection: String,
    #[arg(long)]
    date: String,
    #[arg(long)]
    tested: u64,
    #[arg(long)]
    positive: u64,
}

#[derive(Debug, Args)]
pub struct RecordWeeklyArgs {
    #[arg(long)]
    collection: String,
    /// Last day of the 7-day window.
    #[arg(long)]
    date: String,
    #[arg(long)]
    tested: u64,
    #[arg(long)]
    positive: u64,
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Args)]
pub struct RecordListArgs {
    #[arg(long)]
    collection: String,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Subcommand)]
pub enum ScrapeCommand {
    Run(ScrapeRunArgs),
}

#[derive(Debug, Args)]
pub struct ScrapeRunArgs {
    /// Built-in sources to run. Defaults to all of them when no feed is given.
    #[arg(long = "source", value_enum)]
    sources: Vec<SourceArg>,
    /// JSON observation feeds to ingest.
    #[arg(long = "feed")]
    feeds: Vec<PathBuf>,
    #[arg(long, env = "CAMPUS_COVID_ATTEMPTS", default_value_t = 3)]
    attempts: u32,
    #[arg(long, env = "CAMPUS_COVID_RETRY_DELAY_MS", default_value_t = 1_000)]
    retry_delay_ms: u64,
    #[arg(long, default_value_t = 30)]
    http_timeout_secs: u64,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum, Eq, PartialEq)]
pub enum SourceArg {
    Babson,
    Bc,
    Tufts,
    Wellesley,
}

#[derive(Debug, Args)]
pub struct ExportArgs {
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct CatalogEntry<'a> {
    #[serde(flatten)]
    collection: &'a campus_covid_core::Collection,
    records: usize,
    first_date: Option<String>,
    last_date: Option<String>,
}

#[derive(Debug, Serialize)]
struct WeeklyOutput {
    dry_run: bool,
    outcomes: Vec<WeeklyOutcome>,
}

pub fn run_cli(cli: Cli) -> Result<()> {
    let mut store = open_store(&cli.db)?;
    let catalog = Catalog::standard();

    match cli.command {
        Command::Catalog { command } => run_catalog(command, &catalog, &store),
        Command::Record { command } => run_record(*command, &catalog, &mut store),
        Command::Scrape { command } => run_scrape(*command, &catalog, store),
        Command::Export(args) => run_export(&args, &catalog, &store),
    }
}

fn open_store(path: &Path) -> Result<SqliteRecordStore> {
    let store = SqliteRecordStore::open(path)?;
    store.migrate()?;
    Ok(store)
}

fn run_catalog(
    command: CatalogCommand,
    catalog: &Catalog,
    store: &SqliteRecordStore,
) -> Result<()> {
    match command {
        CatalogCommand::List(args) => {
            let summaries = store.collection_summaries()?;
            let entries: Vec<CatalogEntry<'_>> = catalog
                .iter()
                .map(|collection| {
                    let summary = summaries
                        .iter()
                        .find(|summary| summary.collection_id == collection.id);
                    CatalogEntry {
                        collection,
                        records: summary.map_or(0, |summary| summary.records),
                        first_date: summary.and_then(|summary| summary.first_date.clone()),
                        last_date: summary.and_then(|summary| summary.last_date.clone()),
                    }
                })
                .collect();

            if args.json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for entry in &entries {
                    println!(
                        "{:<40} {:<56} records={} last={}",
                        entry.collection.id.as_str(),
                        entry.collection.name,
                        entry.records,
                        entry.last_date.as_deref().unwrap_or("-")
                    );
                }
            }
            Ok(())
        }
    }
}

fn run_record(
    command: RecordCommand,
    catalog: &Catalog,
    store: &mut SqliteRecordStore,
) -> Result<()> {
    let reconciler = Reconciler::new(catalog);

    match command {
        RecordCommand::Add(args) => {
            let record = Record::new(
                parse_collection(&args.collection)?,
                parse_date(&args.date)?,
                args.tested,
                args.positive,
            );
            let outcome = reconciler
                .reconcile(store, &record)
                .map_err(|err| anyhow!("failed to reconcile {record}: {err}"))?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
        RecordCommand::Weekly(args) => {
            let observation = WeeklyObservation::new(
                parse_collection(&args.collection)?,
                parse_date(&args.date)?,
                args.tested,
                args.positive,
            );
            let result = if args.dry_run {
                reconciler.preview_weekly(&*store, &observation)
            } else {
                reconciler.ingest_weekly(store, &observation)
            };
            let outcomes =
                result.map_err(|err| anyhow!("failed to ingest weekly counts: {err}"))?;

            let output = WeeklyOutput {
                dry_run: args.dry_run,
                outcomes,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        RecordCommand::List(args) => {
            let collection = parse_collection(&args.collection)?;
            catalog
                .require(collection)
                .map_err(|err| anyhow!(err.to_string()))?;
            let records = store.list_records(collection, args.limit)?;
            println!("{}", serde_json::to_string_pretty(&records)?);
            Ok(())
        }
    }
}

fn run_scrape(command: ScrapeCommand, catalog: &Catalog, store: SqliteRecordStore) -> Result<()> {
    match command {
        ScrapeCommand::Run(args) => {
            let config = IngestConfig {
                attempts: args.attempts,
                retry_delay: Duration::from_millis(args.retry_delay_ms),
            };
            let http = HttpConfig {
                timeout: Duration::from_secs(args.http_timeout_secs),
                ..HttpConfig::default()
            };
            let sources = build_sources(&args.sources, &args.feeds, &http)?;

            let store = Mutex::new(store);
            let driver = IngestDriver::new(Reconciler::new(catalog), &store, config)?;
            let report = driver.run(&sources)?;

            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_run_summary(&report);
            }

            if !report.all_succeeded {
                bail!("at least one of the scrapes failed (run {})", report.run_id);
            }
            Ok(())
        }
    }
}

fn build_sources(
    selected: &[SourceArg],
    feeds: &[PathBuf],
    http: &HttpConfig,
) -> Result<Vec<Box<dyn SourceExtractor>>> {
    let builtin: Vec<SourceArg> = if selected.is_empty() && feeds.is_empty() {
        SourceArg::value_variants().to_vec()
    } else {
        selected.to_vec()
    };

    let mut sources: Vec<Box<dyn SourceExtractor>> = Vec::new();
    for source in builtin {
        let client = http.build_client()?;
        let extractor: Box<dyn SourceExtractor> = match source {
            SourceArg::Babson => Box::new(BabsonDashboard::new(client)),
            SourceArg::Bc => Box::new(BostonCollegeDashboard::new(client)),
            SourceArg::Tufts => Box::new(TuftsMetrics::new(client)),
            SourceArg::Wellesley => Box::new(WellesleyDashboard::new(client)),
        };
        sources.push(extractor);
    }
    for feed in feeds {
        sources.push(Box::new(JsonFeedSource::new(feed.clone())));
    }
    Ok(sources)
}

fn print_run_summary(report: &RunReport) {
    println!("run {} started {}", report.run_id, report.started_at);
    for source in &report.sources {
        let status = match source.status {
            SourceStatus::Succeeded => "ok",
            SourceStatus::Failed => "FAILED",
        };
        println!(
            "{:<32} {:<6} attempts={} observations={} inserted={} replaced={} unchanged={} elapsed_ms={}",
            source.source,
            status,
            source.attempts,
            source.observations,
            source.inserted,
            source.replaced,
            source.unchanged,
            source.elapsed_ms
        );
        for error in &source.errors {
            println!("    error: {error}");
        }
    }
    println!("run {} finished {}", report.run_id, report.finished_at);
}

fn run_export(args: &ExportArgs, catalog: &Catalog, store: &SqliteRecordStore) -> Result<()> {
    let document = export::build_export(catalog, store)?;
    let serialized = serde_json::to_string_pretty(&document)?;

    match &args.output {
        Some(path) => {
            std::fs::write(path, format!("{serialized}\n"))
                .with_context(|| format!("failed to write export to {}", path.display()))?;
        }
        None => println!("{serialized}"),
    }
    Ok(())
}

fn parse_collection(raw: &str) -> Result<CollectionId> {
    CollectionId::parse(raw).map_err(|err| anyhow!(err.to_string()))
}

fn parse_date(raw: &str) -> Result<time::Date> {
    parse_day(raw).map_err(|err| anyhow!(err.to_string()))
}
