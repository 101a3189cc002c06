//! pricetape CLI: collection cycles, pool management, store inspection.
//!
//! Commands:
//! - `run`: run collection cycles from a TOML config
//! - `pool list` / `pool add`: inspect or grow the instrument pool file
//! - `store status`: list partitions with record counts and sizes
//! - `store show`: print one instrument's anchors for a year
//! - `init-config`: write a config file with every default filled in

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pricetape_core::model::Instrument;
use pricetape_core::pool::{InstrumentPool, TomlPool};
use pricetape_core::store::PartitionStore;
use pricetape_runner::{Collector, CollectorConfig};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const STOP_FILE_POLL: Duration = Duration::from_millis(250);

#[derive(Parser)]
#[command(
    name = "pricetape",
    about = "pricetape: deadband price sampling into partitioned Parquet"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run collection cycles from a TOML config file.
    Run {
        /// Path to the collector config.
        #[arg(long)]
        config: PathBuf,

        /// Run a single cycle and exit.
        #[arg(long, default_value_t = false)]
        once: bool,

        /// Stop after this many cycles (overrides schedule.max_cycles).
        #[arg(long)]
        max_cycles: Option<u64>,

        /// Stop gracefully once this file exists.
        #[arg(long)]
        stop_file: Option<PathBuf>,
    },
    /// Instrument pool commands.
    Pool {
        #[command(subcommand)]
        action: PoolAction,
    },
    /// Partition store commands.
    Store {
        #[command(subcommand)]
        action: StoreAction,
    },
    /// Write a config file containing every default.
    InitConfig {
        /// Destination path.
        path: PathBuf,

        /// Overwrite an existing file.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum PoolAction {
    /// List pool groups and the deduplicated instrument set.
    List {
        #[arg(long, default_value = "pool.toml")]
        pool: PathBuf,
    },
    /// Add instruments to the `discovered` group.
    Add {
        #[arg(required = true)]
        instruments: Vec<String>,

        #[arg(long, default_value = "pool.toml")]
        pool: PathBuf,
    },
}

#[derive(Subcommand)]
enum StoreAction {
    /// Report partitions, record counts and file sizes.
    Status {
        #[arg(long, default_value = "data/anchors")]
        root: PathBuf,
    },
    /// Print one instrument's anchors for a calendar year.
    Show {
        instrument: String,

        #[arg(long)]
        year: i32,

        #[arg(long, default_value = "data/anchors")]
        root: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            once,
            max_cycles,
            stop_file,
        } => run_collector(&config, once, max_cycles, stop_file),
        Commands::Pool { action } => match action {
            PoolAction::List { pool } => run_pool_list(&pool),
            PoolAction::Add { instruments, pool } => run_pool_add(&pool, &instruments),
        },
        Commands::Store { action } => match action {
            StoreAction::Status { root } => run_store_status(&root),
            StoreAction::Show {
                instrument,
                year,
                root,
            } => run_store_show(&root, &instrument, year),
        },
        Commands::InitConfig { path, force } => run_init_config(&path, force),
    }
}

fn run_collector(
    config_path: &Path,
    once: bool,
    max_cycles: Option<u64>,
    stop_file: Option<PathBuf>,
) -> Result<()> {
    let config = CollectorConfig::from_file(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let mut collector = Collector::from_config(&config).context("starting collector")?;

    let stop = Arc::new(AtomicBool::new(false));
    if let Some(path) = stop_file {
        watch_stop_file(path, Arc::clone(&stop))?;
    }

    if once {
        let report = collector.run_cycle(Some(&stop))?;
        print_cycle(&report);
        if report.fetch.succeeded == 0 && report.fetch.failed > 0 {
            bail!("every instrument failed this cycle");
        }
        return Ok(());
    }

    let max_cycles = max_cycles.or(config.schedule.max_cycles);
    let summary = collector.run(&stop, config.interval(), max_cycles);
    println!(
        "Ran {} cycle(s), {} fatal, {} anchor(s) written.",
        summary.cycles, summary.fatal_errors, summary.anchors_written
    );
    stop.store(true, Ordering::Relaxed);
    Ok(())
}

/// Raise `stop` once `path` exists. The watcher exits when `stop` is set.
fn watch_stop_file(path: PathBuf, stop: Arc<AtomicBool>) -> Result<()> {
    if path.exists() {
        bail!(
            "stop file {} already exists; remove it before starting",
            path.display()
        );
    }
    thread::Builder::new()
        .name("stop-file-watcher".into())
        .spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                if path.exists() {
                    tracing::info!(path = %path.display(), "stop file found");
                    stop.store(true, Ordering::Relaxed);
                    break;
                }
                thread::sleep(STOP_FILE_POLL);
            }
        })
        .context("spawning stop-file watcher")?;
    Ok(())
}

fn print_cycle(report: &pricetape_runner::CycleReport) {
    let fetch = &report.fetch;
    println!();
    println!("=== Cycle {} ===", report.cycle);
    println!("Pool:           {}", report.pool_size);
    println!("Attempted:      {}", fetch.attempted);
    println!("Succeeded:      {}", fetch.succeeded);
    println!("Failed:         {}", fetch.failed);
    println!("Skipped:        {}", fetch.skipped);
    println!("Rate limited:   {}", fetch.rate_limited);
    println!("Samples:        {}", fetch.samples);
    println!("Anchors:        {}", fetch.anchors);
    println!("Records added:  {}", report.merge.records_added);
    println!(
        "Partitions:     {} written, {} unchanged, {} failed",
        report.merge.partitions_written,
        report.merge.partitions_unchanged,
        report.merge.failures.len()
    );
    println!("Elapsed:        {:.2}s", report.elapsed.as_secs_f64());
    for failure in &report.failures {
        println!("  FAILED {}: {}", failure.instrument, failure.error);
    }
    for failure in &report.merge.failures {
        println!("  PARTITION {}: {}", failure.key, failure.error);
    }
    if !report.snapshot_saved {
        println!("WARNING: compressor snapshot was not saved");
    }
    println!();
}

fn run_pool_list(path: &Path) -> Result<()> {
    let pool = TomlPool::open(path).with_context(|| format!("opening {}", path.display()))?;
    for group in pool.group_names() {
        let members = pool.group(group).unwrap_or_default();
        println!("[{group}] {}", members.join(" "));
    }
    let set = pool.load()?;
    println!("{} unique instrument(s)", set.len());
    Ok(())
}

fn run_pool_add(path: &Path, raw: &[String]) -> Result<()> {
    let mut pool = TomlPool::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut added = 0;
    for s in raw {
        let instrument = Instrument::new(s).with_context(|| format!("invalid instrument '{s}'"))?;
        if pool.add(instrument.clone()) {
            println!("Added: {instrument}");
            added += 1;
        } else {
            println!("Already present: {instrument}");
        }
    }
    if added > 0 {
        pool.save()?;
    }
    Ok(())
}

fn run_store_status(root: &Path) -> Result<()> {
    let store = PartitionStore::open_existing(root)
        .with_context(|| format!("opening store at {}", root.display()))?;
    let status = store.status()?;
    if status.is_empty() {
        println!("No partitions under {}", root.display());
        return Ok(());
    }

    println!("{:<10} {:>10} {:>8} {:>10}  LAST", "PARTITION", "RECORDS", "INSTR", "SIZE");
    let mut total_records = 0;
    let mut total_bytes = 0;
    for entry in &status {
        total_bytes += entry.size_bytes;
        match &entry.meta {
            Some(meta) => {
                total_records += meta.record_count;
                let last = meta
                    .last_timestamp
                    .map(|ts| ts.to_rfc3339())
                    .unwrap_or_else(|| "-".into());
                println!(
                    "{:<10} {:>10} {:>8} {:>10}  {last}",
                    entry.key.to_string(),
                    meta.record_count,
                    meta.instrument_count,
                    format_size(entry.size_bytes)
                );
            }
            None => println!(
                "{:<10} {:>10} {:>8} {:>10}  (no metadata)",
                entry.key.to_string(),
                "?",
                "?",
                format_size(entry.size_bytes)
            ),
        }
    }
    println!();
    println!(
        "{} partition(s), {total_records} record(s), {}",
        status.len(),
        format_size(total_bytes)
    );
    Ok(())
}

fn run_store_show(root: &Path, raw: &str, year: i32) -> Result<()> {
    let instrument = Instrument::new(raw).with_context(|| format!("invalid instrument '{raw}'"))?;
    let store = PartitionStore::open_existing(root)
        .with_context(|| format!("opening store at {}", root.display()))?;
    let records = store.read_instrument(&instrument, year..=year)?;
    if records.is_empty() {
        println!("No anchors for {instrument} in {year}");
        return Ok(());
    }
    for r in &records {
        println!("{}  {:>14.6}  {}", r.timestamp.to_rfc3339(), r.price, r.source);
    }
    println!("{} anchor(s)", records.len());
    Ok(())
}

fn run_init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} exists; pass --force to overwrite", path.display());
    }
    let text = CollectorConfig::default().to_toml()?;
    std::fs::write(path, text).with_context(|| format!("writing {}", path.display()))?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
