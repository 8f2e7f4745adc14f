//! Progress reporting for long-running imports, scans and exports
//!
//! Provides a spinner using indicatif and plain summaries using console.

use crate::scan::ScanStatsSnapshot;
use console::style;
use humansize::{format_size, BINARY};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::{Duration, Instant};
use tracing::info;

/// Items between progress messages
pub const REPORT_INTERVAL: u64 = 100_000;

/// Counts processed items and reports every [`REPORT_INTERVAL`]
pub struct ProgressTracker {
    /// Spinner (absent in quiet mode)
    bar: Option<ProgressBar>,

    /// What is being counted ("hashes", "lines", ...)
    label: &'static str,

    count: u64,
    started: Instant,
}

impl ProgressTracker {
    /// Create a tracker; `visible` controls the spinner
    pub fn new(label: &'static str, visible: bool) -> Self {
        let bar = visible.then(|| {
            let bar = ProgressBar::new_spinner();
            if let Ok(spinner) = ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
            {
                bar.set_style(spinner.tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"));
            }
            bar.enable_steady_tick(Duration::from_millis(100));
            bar
        });

        Self {
            bar,
            label,
            count: 0,
            started: Instant::now(),
        }
    }

    /// Tracker that only logs
    pub fn hidden(label: &'static str) -> Self {
        Self::new(label, false)
    }

    /// Count one item
    pub fn track(&mut self) {
        self.track_count(1);
    }

    /// Count `n` items
    pub fn track_count(&mut self, n: u64) {
        let before = self.count / REPORT_INTERVAL;
        self.count += n;
        if self.count / REPORT_INTERVAL != before {
            self.report();
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    fn report(&self) {
        let rate = rate(self.count, self.started.elapsed());
        info!(label = self.label, count = self.count, rate = rate as u64, "Progress");

        if let Some(bar) = &self.bar {
            bar.set_message(format!(
                "{} {} ({:.0}/s)",
                format_number(self.count),
                self.label,
                rate
            ));
        }
    }

    /// Stop the spinner and log the total
    pub fn finish(&self) {
        let elapsed = self.started.elapsed();
        info!(
            label = self.label,
            count = self.count,
            secs = elapsed.as_secs_f64(),
            "Finished"
        );
        if let Some(bar) = &self.bar {
            bar.finish_and_clear();
        }
    }
}

fn rate(count: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        count as f64 / secs
    } else {
        0.0
    }
}

/// Format a number with thousands separators
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let bytes: Vec<_> = s.bytes().rev().collect();

    let chunks: Vec<String> = bytes
        .chunks(3)
        .map(|chunk| chunk.iter().rev().map(|&b| b as char).collect::<String>())
        .collect();

    chunks.into_iter().rev().collect::<Vec<_>>().join(",")
}

/// Print a summary of a finished scan
pub fn print_scan_summary(stats: &ScanStatsSnapshot, workers: usize, duration: Duration) {
    let secs = duration.as_secs_f64();

    eprintln!();
    eprintln!("{}", style("Scan Complete").green().bold());
    eprintln!("{}", style("─".repeat(50)).dim());
    eprintln!("  {} {}", style("Hashes:").bold(), format_number(stats.elements));
    eprintln!("  {} {}", style("Matches:").bold(), format_number(stats.matches));
    eprintln!(
        "  {} {}",
        style("Batches:").bold(),
        format_number(stats.batches_scanned)
    );
    eprintln!("  {} {}", style("Workers:").bold(), workers);
    eprintln!(
        "  {} {:.1}s ({:.0} hashes/sec)",
        style("Duration:").bold(),
        secs,
        rate(stats.elements, duration)
    );
    if stats.malformed > 0 {
        eprintln!(
            "  {} {}",
            style("Malformed batches:").yellow().bold(),
            format_number(stats.malformed)
        );
    }
    if stats.dropped > 0 {
        eprintln!(
            "  {} {}",
            style("Dropped batches:").yellow().bold(),
            format_number(stats.dropped)
        );
    }
    eprintln!();
}

/// Print database statistics
pub fn print_db_stats(stats: &crate::db::DbStats) {
    println!();
    println!("{}", style("Hash Database").cyan().bold());
    println!("{}", style("─".repeat(50)).dim());
    println!("  {} {}", style("Path:").bold(), stats.path.display());
    println!("  {} {} bytes", style("Hash size:").bold(), stats.hash_size);
    println!(
        "  {} {}",
        style("Entries:").bold(),
        format_number(stats.entries)
    );
    println!(
        "  {} {}",
        style("Distinct hashes:").bold(),
        format_number(stats.distinct_hashes)
    );
    println!(
        "  {} {}",
        style("Sources:").bold(),
        format_number(stats.sources as u64)
    );
    println!(
        "  {} {} ({} slots)",
        style("Map file:").bold(),
        format_size(stats.map_bytes, BINARY),
        format_number(stats.map_slots)
    );
    println!("  {} {}", style("Created:").bold(), stats.created_at.to_rfc3339());
    println!();
}
