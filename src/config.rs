//! Configuration types for hashdb
//!
//! This module defines:
//! - CLI argument parsing using clap derive macros
//! - Scan pipeline configuration with validation
//! - The persisted per-database settings file

use crate::error::ConfigError;
use crate::multimap::DEFAULT_INITIAL_SIZE;
use chrono::{DateTime, Utc};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Maximum reasonable worker count
pub const MAX_WORKERS: usize = 512;

/// Minimum scan queue depth
pub const MIN_QUEUE_DEPTH: usize = 1;

/// Elements-per-batch limits for the scan front end
pub const MIN_BATCH_SIZE: usize = 1;
pub const MAX_BATCH_SIZE: usize = 100_000;

/// Hash widths wired through the CLI
pub const SUPPORTED_HASH_SIZES: [usize; 4] = [16, 20, 32, 64];

/// Settings file names inside a database directory
pub const SETTINGS_FILE: &str = "settings.json";
pub const OLD_SETTINGS_FILE: &str = "_old_settings.json";

/// Current settings format version
pub const SETTINGS_VERSION: u32 = 1;

/// Forensic block-hash database
#[derive(Parser, Debug, Clone)]
#[command(
    name = "hashdb",
    version,
    about = "Forensic block-hash database",
    long_about = "Stores block hashes with their source occurrences and scans hash \
                  lists against the database using a pool of worker threads.",
    after_help = "EXAMPLES:\n    \
        hashdb create my.hdb --hash-size 16\n    \
        hashdb import my.hdb blocks.tab -p\n    \
        hashdb scan my.hdb hashes.txt -w 8 --mode expanded\n    \
        hashdb export my.hdb -o ordered.tab\n    \
        hashdb stats my.hdb"
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Verbose output (debug logging)
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    /// Quiet mode - suppress progress output
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,
}

/// Subcommands
#[derive(clap::Subcommand, Debug, Clone)]
pub enum Command {
    /// Create a new, empty hash database
    Create {
        /// Database directory (must not exist)
        #[arg(value_name = "DB")]
        db: PathBuf,

        /// Hash width in bytes (16, 20, 32 or 64)
        #[arg(long, default_value_t = 16, value_name = "BYTES")]
        hash_size: usize,

        /// Initial size of the hash map file
        #[arg(long, default_value_t = DEFAULT_INITIAL_SIZE, value_name = "BYTES")]
        initial_size: u64,

        /// Upper bound on the hash map file size (unbounded if not set)
        #[arg(long, value_name = "BYTES")]
        max_size: Option<u64>,
    },

    /// Import a tab-delimited hash file
    Import {
        /// Database directory
        #[arg(value_name = "DB")]
        db: PathBuf,

        /// Lines of `hash<TAB>source<TAB>offset`, optionally followed by
        /// entropy, block label and low entropy label columns
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Source descriptions: `name<TAB>filesize[<TAB>type[<TAB>low entropy
        /// count[<TAB>repository<TAB>filename]]]`
        #[arg(short = 's', long, value_name = "FILE")]
        sources: Option<PathBuf>,

        /// Show import progress
        #[arg(short = 'p', long)]
        progress: bool,
    },

    /// Scan a list of hex hashes against the database
    Scan {
        /// Database directory
        #[arg(value_name = "DB")]
        db: PathBuf,

        /// One hex hash per line, optionally followed by a tab and a label
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Number of scan worker threads
        #[arg(short = 'w', long, default_value_t = num_cpus::get(), value_name = "NUM")]
        workers: usize,

        /// Depth of each scan queue, in batches
        #[arg(long, default_value_t = DEFAULT_QUEUE_DEPTH, value_name = "NUM")]
        queue_depth: usize,

        /// Hashes per batch
        #[arg(short = 'b', long, default_value_t = DEFAULT_BATCH_SIZE, value_name = "NUM")]
        batch_size: usize,

        /// Match description style
        #[arg(long, value_enum, default_value_t = ScanMode::Count)]
        mode: ScanMode,
    },

    /// Export every (hash, occurrence) pair in ascending hash order
    Export {
        /// Database directory
        #[arg(value_name = "DB")]
        db: PathBuf,

        /// Output file (stdout if not set)
        #[arg(short = 'o', long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Show database statistics
    Stats {
        /// Database directory
        #[arg(value_name = "DB")]
        db: PathBuf,
    },
}

/// How matches are described in scan output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    /// Occurrence count only
    #[default]
    Count,
    /// Count plus every occurrence
    Expanded,
}

const DEFAULT_QUEUE_DEPTH: usize = 64;
const DEFAULT_BATCH_SIZE: usize = 1_000;

/// Validated scan pipeline configuration
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Number of worker threads
    pub worker_count: usize,

    /// Capacity of each queue, in batches
    pub queue_depth: usize,

    /// Hashes per batch (used by batch producers)
    pub batch_size: usize,

    /// Longest `put()` waits for queue space
    pub put_timeout: Duration,

    /// Bounded wait used by workers between `done` checks
    pub poll_interval: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get(),
            queue_depth: DEFAULT_QUEUE_DEPTH,
            batch_size: DEFAULT_BATCH_SIZE,
            put_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl ScanConfig {
    /// Build and validate from CLI values
    pub fn from_args(
        workers: usize,
        queue_depth: usize,
        batch_size: usize,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            worker_count: workers,
            queue_depth,
            batch_size,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 || self.worker_count > MAX_WORKERS {
            return Err(ConfigError::InvalidWorkerCount {
                count: self.worker_count,
                max: MAX_WORKERS,
            });
        }

        if self.queue_depth < MIN_QUEUE_DEPTH {
            return Err(ConfigError::InvalidQueueDepth {
                depth: self.queue_depth,
                min: MIN_QUEUE_DEPTH,
            });
        }

        if self.batch_size < MIN_BATCH_SIZE || self.batch_size > MAX_BATCH_SIZE {
            return Err(ConfigError::InvalidBatchSize {
                size: self.batch_size,
                min: MIN_BATCH_SIZE,
                max: MAX_BATCH_SIZE,
            });
        }

        Ok(())
    }
}

/// Per-database settings, persisted as `settings.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbSettings {
    /// Format version of this file
    pub settings_version: u32,

    /// Block hash width in bytes
    pub hash_size: usize,

    /// Initial hash map file size
    pub initial_map_size: u64,

    /// Hash map file size cap
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_map_size: Option<u64>,

    /// When the database was created
    pub created_at: DateTime<Utc>,
}

impl DbSettings {
    pub fn new(hash_size: usize) -> Self {
        Self {
            settings_version: SETTINGS_VERSION,
            hash_size,
            initial_map_size: DEFAULT_INITIAL_SIZE,
            max_map_size: None,
            created_at: Utc::now(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !SUPPORTED_HASH_SIZES.contains(&self.hash_size) {
            return Err(ConfigError::UnsupportedHashSize(self.hash_size));
        }
        Ok(())
    }

    /// Read `settings.json` from a database directory
    pub fn read(dir: &Path) -> Result<Self, ConfigError> {
        let path = dir.join(SETTINGS_FILE);
        let invalid = |reason: String| ConfigError::InvalidSettings {
            path: path.clone(),
            reason,
        };

        let text = fs::read_to_string(&path).map_err(|e| invalid(e.to_string()))?;
        let settings: Self = serde_json::from_str(&text).map_err(|e| invalid(e.to_string()))?;

        if settings.settings_version > SETTINGS_VERSION {
            return Err(invalid(format!(
                "settings version {} is newer than supported version {}",
                settings.settings_version, SETTINGS_VERSION
            )));
        }
        settings.validate()?;

        debug!(path = %path.display(), hash_size = settings.hash_size, "Read settings");
        Ok(settings)
    }

    /// Write `settings.json`, first moving any existing file to
    /// `_old_settings.json`
    pub fn write(&self, dir: &Path) -> Result<(), ConfigError> {
        let path = dir.join(SETTINGS_FILE);
        let invalid = |reason: String| ConfigError::InvalidSettings {
            path: path.clone(),
            reason,
        };

        if path.exists() {
            let backup = dir.join(OLD_SETTINGS_FILE);
            fs::rename(&path, &backup).map_err(|e| invalid(e.to_string()))?;
            info!(backup = %backup.display(), "Backed up previous settings");
        }

        let text = serde_json::to_string_pretty(self).map_err(|e| invalid(e.to_string()))?;
        fs::write(&path, text).map_err(|e| invalid(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_scan_config_defaults_are_valid() {
        let config = ScanConfig::default();
        assert!(config.worker_count >= 1);
        config.validate().unwrap();
    }

    #[test]
    fn test_scan_config_rejects_bad_values() {
        assert!(matches!(
            ScanConfig::from_args(0, 4, 100),
            Err(ConfigError::InvalidWorkerCount { count: 0, .. })
        ));
        assert!(matches!(
            ScanConfig::from_args(MAX_WORKERS + 1, 4, 100),
            Err(ConfigError::InvalidWorkerCount { .. })
        ));
        assert!(matches!(
            ScanConfig::from_args(2, 0, 100),
            Err(ConfigError::InvalidQueueDepth { depth: 0, .. })
        ));
        assert!(matches!(
            ScanConfig::from_args(2, 4, MAX_BATCH_SIZE + 1),
            Err(ConfigError::InvalidBatchSize { .. })
        ));
        assert!(ScanConfig::from_args(2, 4, 100).is_ok());
    }

    #[test]
    fn test_settings_round_trip_and_backup() {
        let dir = tempdir().unwrap();

        let settings = DbSettings::new(20);
        settings.write(dir.path()).unwrap();
        assert_eq!(DbSettings::read(dir.path()).unwrap(), settings);
        assert!(!dir.path().join(OLD_SETTINGS_FILE).exists());

        let mut updated = settings.clone();
        updated.max_map_size = Some(1 << 30);
        updated.write(dir.path()).unwrap();

        assert_eq!(DbSettings::read(dir.path()).unwrap(), updated);
        let old = fs::read_to_string(dir.path().join(OLD_SETTINGS_FILE)).unwrap();
        let old: DbSettings = serde_json::from_str(&old).unwrap();
        assert_eq!(old, settings);
    }

    #[test]
    fn test_settings_reject_unsupported_hash_size() {
        let dir = tempdir().unwrap();
        DbSettings::new(17).write(dir.path()).unwrap();
        assert!(matches!(
            DbSettings::read(dir.path()),
            Err(ConfigError::UnsupportedHashSize(17))
        ));
    }

    #[test]
    fn test_missing_settings() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            DbSettings::read(dir.path()),
            Err(ConfigError::InvalidSettings { .. })
        ));
    }

    #[test]
    fn test_cli_parses_scan() {
        let args = CliArgs::parse_from([
            "hashdb", "scan", "my.hdb", "hashes.txt", "-w", "3", "--mode", "expanded",
        ]);
        match args.command {
            Command::Scan {
                workers, mode, db, ..
            } => {
                assert_eq!(workers, 3);
                assert_eq!(mode, ScanMode::Expanded);
                assert_eq!(db, PathBuf::from("my.hdb"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_cli_parses_import_sources() {
        let args = CliArgs::parse_from([
            "hashdb", "import", "my.hdb", "blocks.tab", "--sources", "sources.tab", "-p",
        ]);
        match args.command {
            Command::Import {
                sources, progress, ..
            } => {
                assert_eq!(sources, Some(PathBuf::from("sources.tab")));
                assert!(progress);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
