//! Tab-delimited hash and source import
//!
//! Hash files hold one occurrence per line, optionally followed by the
//! block's metadata:
//!
//! ```text
//! <block hash hex> TAB <source name> TAB <file offset>
//!     [TAB <entropy> [TAB <block label> [TAB <low entropy label>]]]
//! ```
//!
//! Source files describe the sources named by hash files:
//!
//! ```text
//! <source name> TAB <filesize> [TAB <file type> [TAB <low entropy count>
//!     [TAB <repository name> TAB <filename>]]]
//! ```
//!
//! Blank lines and lines starting with `#` are skipped. Malformed lines are
//! logged with their line number, counted and skipped.

use crate::db::{HashDatabase, SourceName};
use crate::error::Result;
use crate::progress::ProgressTracker;
use crate::types::{BlockHash, HashMetadata, Occurrence};
use serde::Serialize;
use std::io::BufRead;
use tracing::{info, warn};

/// Counters for one import run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportStats {
    /// Lines read, including skipped ones
    pub lines: u64,

    /// New pairs stored
    pub inserted: u64,

    /// Pairs that were already present
    pub duplicates: u64,

    /// Malformed lines
    pub malformed: u64,

    /// Lines that carried block metadata
    pub metadata: u64,
}

/// Counters for one source import run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SourceImportStats {
    pub lines: u64,

    /// Sources whose data was recorded
    pub updated: u64,

    /// Repository/filename pairs added
    pub names_added: u64,

    pub malformed: u64,
}

/// A parsed import line
#[derive(Debug, PartialEq, Eq)]
struct TabLine<'a, const W: usize> {
    hash: BlockHash<W>,
    source: &'a str,
    offset: u64,
    metadata: Option<HashMetadata>,
}

fn parse_line<const W: usize>(line: &str) -> std::result::Result<TabLine<'_, W>, String> {
    let fields: Vec<&str> = line.split('\t').collect();
    let [hash, source, offset, extra @ ..] = fields.as_slice() else {
        return Err("expected at least 3 tab-separated fields".into());
    };
    if extra.len() > 3 {
        return Err(format!("expected at most 6 fields, found {}", fields.len()));
    }
    let (hash, source, offset) = (*hash, *source, *offset);

    let hash = BlockHash::<W>::from_hex(hash)
        .ok_or_else(|| format!("invalid {}-byte hex hash '{}'", W, hash))?;
    if source.is_empty() {
        return Err("empty source name".into());
    }
    let offset = offset
        .trim()
        .parse()
        .map_err(|e| format!("invalid file offset '{}': {}", offset, e))?;

    let metadata = match extra {
        [] => None,
        [entropy, labels @ ..] => Some(HashMetadata {
            entropy: parse_count("entropy", entropy)?,
            block_label: labels.first().map(|l| l.to_string()).unwrap_or_default(),
            low_entropy_label: labels.get(1).map(|l| l.to_string()).unwrap_or_default(),
        }),
    };

    Ok(TabLine {
        hash,
        source,
        offset,
        metadata,
    })
}

fn parse_count(field: &str, text: &str) -> std::result::Result<u64, String> {
    text.trim()
        .parse()
        .map_err(|e| format!("invalid {} '{}': {}", field, text, e))
}

/// A parsed source line
#[derive(Debug, PartialEq, Eq)]
struct SourceLine<'a> {
    name: &'a str,
    filesize: u64,
    file_type: &'a str,
    low_entropy_count: u64,
    location: Option<SourceName>,
}

fn parse_source_line(line: &str) -> std::result::Result<SourceLine<'_>, String> {
    let fields: Vec<&str> = line.split('\t').collect();
    let (name, filesize, rest) = match fields.as_slice() {
        [name, filesize, rest @ ..] => (*name, *filesize, rest),
        _ => return Err("expected at least 2 tab-separated fields".into()),
    };
    if name.is_empty() {
        return Err("empty source name".into());
    }

    let (file_type, low_entropy_count, location) = match rest {
        [] => ("", 0, None),
        [file_type] => (*file_type, 0, None),
        [file_type, count] => (*file_type, parse_count("low entropy count", count)?, None),
        [file_type, count, repository, filename] => (
            *file_type,
            parse_count("low entropy count", count)?,
            Some(SourceName {
                repository_name: repository.to_string(),
                filename: filename.to_string(),
            }),
        ),
        _ => return Err("repository name and filename must come together".into()),
    };

    Ok(SourceLine {
        name,
        filesize: parse_count("filesize", filesize)?,
        file_type,
        low_entropy_count,
        location,
    })
}

/// Import every line of `reader` into `db`
pub fn import_tab<const W: usize, R: BufRead>(
    db: &mut HashDatabase<W>,
    reader: R,
    progress: &mut ProgressTracker,
) -> Result<ImportStats> {
    let mut stats = ImportStats::default();

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        stats.lines += 1;
        progress.track();

        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }

        let parsed = match parse_line::<W>(line) {
            Ok(parsed) => parsed,
            Err(reason) => {
                warn!(line = index + 1, reason = %reason, "Skipping malformed import line");
                stats.malformed += 1;
                continue;
            }
        };

        let source_id = db.source_id(parsed.source);
        if db.insert(parsed.hash, Occurrence::new(source_id, parsed.offset))? {
            stats.inserted += 1;
        } else {
            stats.duplicates += 1;
        }
        // All-default columns carry nothing worth storing
        if let Some(metadata) = parsed.metadata.as_ref().filter(|m| !m.is_empty()) {
            db.set_hash_metadata(&parsed.hash, metadata)?;
            stats.metadata += 1;
        }
    }

    info!(
        lines = stats.lines,
        inserted = stats.inserted,
        duplicates = stats.duplicates,
        malformed = stats.malformed,
        metadata = stats.metadata,
        "Import complete"
    );
    Ok(stats)
}

/// Record source data from every line of `reader` into `db`.
///
/// Unknown source names are registered, so sources can be described before
/// their hashes are imported.
pub fn import_sources_tab<const W: usize, R: BufRead>(
    db: &mut HashDatabase<W>,
    reader: R,
    progress: &mut ProgressTracker,
) -> Result<SourceImportStats> {
    let mut stats = SourceImportStats::default();

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        stats.lines += 1;
        progress.track();

        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }

        let parsed = match parse_source_line(line) {
            Ok(parsed) => parsed,
            Err(reason) => {
                warn!(line = index + 1, reason = %reason, "Skipping malformed source line");
                stats.malformed += 1;
                continue;
            }
        };

        let sources = db.sources_mut();
        let id = sources.get_or_insert(parsed.name);
        if sources.set_data(id, parsed.filesize, parsed.file_type, parsed.low_entropy_count) {
            stats.updated += 1;
        }
        if let Some(location) = parsed.location {
            if sources.add_name(id, location) {
                stats.names_added += 1;
            }
        }
    }

    info!(
        lines = stats.lines,
        updated = stats.updated,
        names_added = stats.names_added,
        malformed = stats.malformed,
        "Source import complete"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbSettings;
    use std::io::Cursor;
    use tempfile::tempdir;

    const HASH_A: &str = "00112233445566778899aabbccddeeff";
    const HASH_B: &str = "ffeeddccbbaa99887766554433221100";

    #[test]
    fn test_parse_line() {
        let line = format!("{HASH_A}\tdisk.img\t4096");
        let parsed = parse_line::<16>(&line).unwrap();
        assert_eq!(parsed.source, "disk.img");
        assert_eq!(parsed.offset, 4096);
        assert_eq!(parsed.hash.to_hex(), HASH_A);

        assert!(parse_line::<16>("abc\tx\t1").is_err());
        assert!(parse_line::<16>(&format!("{HASH_A}\tdisk.img")).is_err());
        assert!(parse_line::<16>(&format!("{HASH_A}\t\t1")).is_err());
        assert!(parse_line::<16>(&format!("{HASH_A}\tdisk.img\tnope")).is_err());
        assert_eq!(parsed.metadata, None);
    }

    #[test]
    fn test_parse_line_metadata_columns() {
        let line = format!("{HASH_A}\tdisk.img\t0\t8");
        let parsed = parse_line::<16>(&line).unwrap();
        let metadata = parsed.metadata.unwrap();
        assert_eq!(metadata.entropy, 8);
        assert!(metadata.block_label.is_empty());

        let line = format!("{HASH_A}\tdisk.img\t0\t2\ttxt\tW");
        let parsed = parse_line::<16>(&line).unwrap();
        assert_eq!(
            parsed.metadata,
            Some(HashMetadata {
                entropy: 2,
                block_label: "txt".into(),
                low_entropy_label: "W".into(),
            })
        );

        assert!(parse_line::<16>(&format!("{HASH_A}\tdisk.img\t0\thigh")).is_err());
        assert!(parse_line::<16>(&format!("{HASH_A}\tdisk.img\t0\t1\ta\tb\tc")).is_err());
    }

    #[test]
    fn test_parse_source_line() {
        let parsed = parse_source_line("disk.img\t8000").unwrap();
        assert_eq!(parsed.filesize, 8000);
        assert_eq!(parsed.file_type, "");
        assert_eq!(parsed.location, None);

        let parsed = parse_source_line("disk.img\t8000\texe\t4\trepo1\tC:/a.exe").unwrap();
        assert_eq!(parsed.file_type, "exe");
        assert_eq!(parsed.low_entropy_count, 4);
        assert_eq!(parsed.location.unwrap().filename, "C:/a.exe");

        assert!(parse_source_line("disk.img").is_err());
        assert!(parse_source_line("\t1").is_err());
        assert!(parse_source_line("disk.img\tbig").is_err());
        assert!(parse_source_line("disk.img\t1\texe\t0\trepo1").is_err());
    }

    #[test]
    fn test_import_counts_and_skips() {
        let dir = tempdir().unwrap();
        let mut db = HashDatabase::<16>::create(&dir.path().join("db"), DbSettings::new(16)).unwrap();

        let input = format!(
            "# header comment\n\
             {HASH_A}\tdisk.img\t0\n\
             {HASH_A}\tdisk.img\t512\n\
             \n\
             {HASH_B}\tusb.raw\t0\n\
             {HASH_A}\tdisk.img\t0\n\
             not-a-hash\tdisk.img\t0\n"
        );

        let mut progress = ProgressTracker::hidden("lines");
        let stats = import_tab(&mut db, Cursor::new(input), &mut progress).unwrap();

        assert_eq!(stats.lines, 7);
        assert_eq!(stats.inserted, 3);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.malformed, 1);
        assert_eq!(db.sources().len(), 2);

        let hash_a = BlockHash::<16>::from_hex(HASH_A).unwrap();
        assert_eq!(db.map().count(&hash_a), 2);
        assert_eq!(stats.metadata, 0);
        assert_eq!(db.hash_metadata(&hash_a).unwrap(), None);
    }

    #[test]
    fn test_import_records_metadata_and_sources() {
        let dir = tempdir().unwrap();
        let mut db = HashDatabase::<16>::create(&dir.path().join("db"), DbSettings::new(16)).unwrap();

        let hashes = format!(
            "{HASH_A}\tdisk.img\t0\t6\thtml\n\
             {HASH_B}\tusb.raw\t0\n\
             {HASH_B}\tusb.raw\t512\t0\n"
        );
        let stats = import_tab(&mut db, Cursor::new(hashes), &mut ProgressTracker::hidden("lines")).unwrap();
        assert_eq!(stats.inserted, 3);
        assert_eq!(stats.metadata, 1);
        let hash_b = BlockHash::<16>::from_hex(HASH_B).unwrap();
        assert_eq!(db.hash_metadata(&hash_b).unwrap(), None);

        let hash_a = BlockHash::<16>::from_hex(HASH_A).unwrap();
        let metadata = db.hash_metadata(&hash_a).unwrap().unwrap();
        assert_eq!(metadata.entropy, 6);
        assert_eq!(metadata.block_label, "html");

        let sources = "# name\tsize\n\
                       disk.img\t4096\traw\t1\tcase-7\timages/disk.img\n\
                       disk.img\t4096\traw\t1\tcase-7\timages/disk.img\n\
                       new.bin\t10\n\
                       broken\n";
        let stats = import_sources_tab(&mut db, Cursor::new(sources), &mut ProgressTracker::hidden("lines"))
            .unwrap();
        assert_eq!(stats.lines, 5);
        assert_eq!(stats.updated, 3);
        assert_eq!(stats.names_added, 1);
        assert_eq!(stats.malformed, 1);

        let disk = db.sources().id("disk.img").unwrap();
        let data = db.sources().data(disk).unwrap();
        assert_eq!(data.filesize, 4096);
        assert_eq!(data.file_type, "raw");
        assert_eq!(data.names.len(), 1);
        assert_eq!(db.sources().id("new.bin"), Some(3));
    }
}
