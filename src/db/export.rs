//! Ordered export
//!
//! Walks the ordered store from begin to end and writes one line per pair:
//!
//! ```text
//! <block hash hex> TAB <source id> TAB <file offset>
//! ```

use crate::cursor::Position;
use crate::db::{decode_occurrence, HashDatabase};
use crate::error::Result;
use crate::progress::ProgressTracker;
use std::io::Write;
use tracing::info;

/// Write every pair of `db` to `writer` in ascending hash order.
///
/// Returns the number of lines written.
pub fn export_ordered<const W: usize, Wr: Write>(
    db: &HashDatabase<W>,
    mut writer: Wr,
    progress: &mut ProgressTracker,
) -> Result<u64> {
    let snapshot = db.store().snapshot()?;
    let mut written = 0u64;

    for pair in snapshot.cursor(Position::Begin)? {
        let (key, value) = pair?;
        let occurrence = decode_occurrence(&value)?;
        writeln!(
            writer,
            "{}\t{}\t{}",
            hex::encode(&key),
            occurrence.source_id,
            occurrence.file_offset
        )?;
        written += 1;
        progress.track();
    }
    writer.flush()?;

    info!(lines = written, path = %db.dir().display(), "Export complete");
    Ok(written)
}
