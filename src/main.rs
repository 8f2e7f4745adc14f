//! hashdb - Forensic Block-Hash Database
//!
//! Entry point for the CLI application.

use anyhow::{Context, Result};
use clap::Parser;
use hashdb::config::{CliArgs, Command, DbSettings, ScanConfig, ScanMode};
use hashdb::db::{export_ordered, import_sources_tab, import_tab, HashDatabase};
use hashdb::error::ConfigError;
use hashdb::progress::{print_db_stats, print_scan_summary, ProgressTracker};
use hashdb::scan::{MatchDecoder, RequestBatch, ScanPipeline};
use hashdb::types::{BlockHash, OpenMode};
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Call `$func::<W>(args...)` for the runtime hash size
macro_rules! with_hash_size {
    ($size:expr, $func:ident($($arg:expr),* $(,)?)) => {
        match $size {
            16 => $func::<16>($($arg),*),
            20 => $func::<20>($($arg),*),
            32 => $func::<32>($($arg),*),
            64 => $func::<64>($($arg),*),
            other => Err(ConfigError::UnsupportedHashSize(other).into()),
        }
    };
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let args = CliArgs::parse();
    setup_logging(args.verbose)?;
    let show_progress = !args.quiet;

    match args.command {
        Command::Create {
            db,
            hash_size,
            initial_size,
            max_size,
        } => {
            let settings = DbSettings {
                initial_map_size: initial_size,
                max_map_size: max_size,
                ..DbSettings::new(hash_size)
            };
            with_hash_size!(hash_size, create_db(&db, settings))
        }
        Command::Import {
            db,
            file,
            sources,
            progress,
        } => {
            let hash_size = stored_hash_size(&db)?;
            with_hash_size!(
                hash_size,
                run_import(&db, &file, sources.as_deref(), progress && show_progress)
            )
        }
        Command::Scan {
            db,
            file,
            workers,
            queue_depth,
            batch_size,
            mode,
        } => {
            let config = ScanConfig::from_args(workers, queue_depth, batch_size)
                .context("Invalid scan configuration")?;
            let hash_size = stored_hash_size(&db)?;
            with_hash_size!(hash_size, run_scan(&db, &file, config, mode, show_progress))
        }
        Command::Export { db, output } => {
            let hash_size = stored_hash_size(&db)?;
            with_hash_size!(hash_size, run_export(&db, output.as_deref()))
        }
        Command::Stats { db } => {
            let hash_size = stored_hash_size(&db)?;
            with_hash_size!(hash_size, run_stats(&db))
        }
    }
}

fn stored_hash_size(db: &Path) -> Result<usize> {
    let settings = DbSettings::read(db)
        .with_context(|| format!("Failed to read settings of '{}'", db.display()))?;
    Ok(settings.hash_size)
}

fn create_db<const W: usize>(db: &Path, settings: DbSettings) -> Result<()> {
    HashDatabase::<W>::create(db, settings)
        .with_context(|| format!("Failed to create '{}'", db.display()))?
        .close()
        .context("Failed to close database")?;
    println!("Created {} ({}-byte hashes)", db.display(), W);
    Ok(())
}

fn run_import<const W: usize>(
    db: &Path,
    file: &Path,
    sources: Option<&Path>,
    show_progress: bool,
) -> Result<()> {
    let mut database = HashDatabase::<W>::open(db, OpenMode::OpenExisting)
        .with_context(|| format!("Failed to open '{}'", db.display()))?;

    if let Some(sources) = sources {
        let reader = BufReader::new(
            File::open(sources)
                .with_context(|| format!("Failed to open '{}'", sources.display()))?,
        );
        let mut progress = ProgressTracker::new("sources", show_progress);
        let stats = import_sources_tab(&mut database, reader, &mut progress)
            .context("Source import failed")?;
        progress.finish();
        println!(
            "Imported {}: {} sources described, {} names added, {} malformed",
            sources.display(),
            stats.updated,
            stats.names_added,
            stats.malformed
        );
    }

    let reader = BufReader::new(
        File::open(file).with_context(|| format!("Failed to open '{}'", file.display()))?,
    );

    let mut progress = ProgressTracker::new("lines", show_progress);
    let stats = import_tab(&mut database, reader, &mut progress).context("Import failed")?;
    progress.finish();
    database.close().context("Failed to close database")?;

    println!(
        "Imported {}: {} inserted, {} duplicates, {} malformed, {} with metadata",
        file.display(),
        stats.inserted,
        stats.duplicates,
        stats.malformed,
        stats.metadata
    );
    Ok(())
}

fn run_export<const W: usize>(db: &Path, output: Option<&Path>) -> Result<()> {
    let database = HashDatabase::<W>::open(db, OpenMode::ReadOnly)
        .with_context(|| format!("Failed to open '{}'", db.display()))?;
    let mut progress = ProgressTracker::hidden("pairs");

    let written = match output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create '{}'", path.display()))?;
            export_ordered(&database, BufWriter::new(file), &mut progress)?
        }
        None => export_ordered(&database, BufWriter::new(io::stdout().lock()), &mut progress)?,
    };

    info!(lines = written, "Export finished");
    Ok(())
}

fn run_stats<const W: usize>(db: &Path) -> Result<()> {
    let database = HashDatabase::<W>::open(db, OpenMode::ReadOnly)
        .with_context(|| format!("Failed to open '{}'", db.display()))?;
    print_db_stats(&database.stats()?);
    Ok(())
}

fn run_scan<const W: usize>(
    db: &Path,
    file: &Path,
    config: ScanConfig,
    mode: ScanMode,
    show_progress: bool,
) -> Result<()> {
    let manager = HashDatabase::<W>::open(db, OpenMode::ReadOnly)
        .with_context(|| format!("Failed to open '{}'", db.display()))?
        .into_scan_manager(mode)?;
    let reader = BufReader::new(
        File::open(file).with_context(|| format!("Failed to open '{}'", file.display()))?,
    );

    let batch_size = config.batch_size;
    let workers = config.worker_count;
    let pipeline = ScanPipeline::new(Arc::new(manager), config).context("Failed to start scan")?;

    // Setup signal handler: stop feeding, drain what is in flight
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupt received, shutting down...");
        flag.store(true, Ordering::SeqCst);
    })
    .context("Failed to set signal handler")?;

    let started = Instant::now();
    let producing = AtomicBool::new(true);

    std::thread::scope(|scope| -> Result<()> {
        let consumer = scope.spawn(|| write_results::<W>(&pipeline, &producing));

        let produced = feed_pipeline::<W>(&pipeline, reader, batch_size, &interrupted, show_progress);
        producing.store(false, Ordering::Release);

        let written = consumer
            .join()
            .map_err(|_| anyhow::anyhow!("Result writer panicked"))??;
        let hashes = produced?;
        info!(hashes, matches = written, "Scan input exhausted");
        Ok(())
    })?;

    let stats = pipeline.shutdown().context("Scan workers failed")?;
    if show_progress {
        print_scan_summary(&stats, workers, started.elapsed());
    }
    if interrupted.load(Ordering::SeqCst) {
        warn!("Scan was interrupted before completion");
    }
    Ok(())
}

/// Read hashes from `reader` and submit them in batches.
///
/// Input lines are `hex_hash` or `hex_hash<TAB>label`; the label defaults to
/// the line number.
fn feed_pipeline<const W: usize>(
    pipeline: &ScanPipeline,
    reader: impl BufRead,
    batch_size: usize,
    interrupted: &AtomicBool,
    show_progress: bool,
) -> Result<u64> {
    let mut progress = ProgressTracker::new("hashes", show_progress);
    let mut batch = RequestBatch::new(W);

    for (index, line) in reader.lines().enumerate() {
        if interrupted.load(Ordering::SeqCst) {
            break;
        }
        let line = line?;
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }

        let (hex, label) = match line.split_once('\t') {
            Some((hex, label)) => (hex, label.to_string()),
            None => (line, (index + 1).to_string()),
        };
        let Some(hash) = BlockHash::<W>::from_hex(hex) else {
            warn!(line = index + 1, "Skipping line without a valid {}-byte hash", W);
            continue;
        };

        batch.push(hash.as_bytes(), label.as_bytes())?;
        progress.track();
        if batch.len() >= batch_size {
            submit(pipeline, batch.take(), interrupted)?;
        }
    }

    if !batch.is_empty() {
        submit(pipeline, batch.take(), interrupted)?;
    }
    progress.finish();
    Ok(progress.count())
}

/// Submit one batch, retrying while the input queue is full
fn submit(pipeline: &ScanPipeline, mut batch: Vec<u8>, interrupted: &AtomicBool) -> Result<()> {
    loop {
        match pipeline.put(batch) {
            Ok(()) => return Ok(()),
            Err(e) => match e.into_batch() {
                Some(returned) if !interrupted.load(Ordering::SeqCst) => batch = returned,
                Some(_) => return Ok(()),
                None => return Err(anyhow::anyhow!("Scan pipeline stopped accepting batches")),
            },
        }
    }
}

/// Print matches until the producer is done and every batch is back
fn write_results<const W: usize>(pipeline: &ScanPipeline, producing: &AtomicBool) -> Result<u64> {
    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    let mut written = 0u64;

    loop {
        match pipeline.get_timeout(Duration::from_millis(100)) {
            Some(batch) => {
                for element in MatchDecoder::new(&batch, W) {
                    let element = element?;
                    writeln!(
                        out,
                        "{}\t{}\t{}",
                        hex::encode(element.hash),
                        element.label_str(),
                        element.description_str()
                    )?;
                    written += 1;
                }
            }
            None if !producing.load(Ordering::Acquire) && pipeline.is_empty() => break,
            None => {}
        }
    }

    out.flush()?;
    Ok(written)
}

fn setup_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("hashdb=debug,warn")
    } else {
        EnvFilter::new("hashdb=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    Ok(())
}
