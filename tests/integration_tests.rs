//! Integration tests for hashdb
//!
//! These run the full create → import → scan → export flow against
//! temporary database directories.

use hashdb::config::{DbSettings, ScanConfig, ScanMode};
use hashdb::cursor::{OrderedCursorStore, Position};
use hashdb::db::{export_ordered, import_tab, HashDatabase};
use hashdb::multimap::GrowableMultiMap;
use hashdb::progress::ProgressTracker;
use hashdb::scan::{MatchDecoder, RequestBatch, ScanManager, ScanPipeline};
use hashdb::types::{BlockHash, OpenMode, Occurrence};
use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::Arc;
use tempfile::tempdir;

fn hash_hex(n: u32) -> String {
    let mut bytes = [0u8; 16];
    bytes[..4].copy_from_slice(&n.to_be_bytes());
    bytes[15] = 0x5A;
    hex::encode(bytes)
}

fn import_text(entries: u32) -> String {
    let mut text = String::from("# hash\tsource\toffset\n");
    for n in 0..entries {
        let source = if n % 3 == 0 { "usb.raw" } else { "disk.img" };
        text.push_str(&format!("{}\t{}\t{}\n", hash_hex(n), source, u64::from(n) * 512));
    }
    text
}

#[test]
fn test_create_import_export_roundtrip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("case.hdb");

    HashDatabase::<16>::create(&path, DbSettings::new(16))
        .unwrap()
        .close()
        .unwrap();

    let mut db = HashDatabase::<16>::open(&path, OpenMode::OpenExisting).unwrap();
    let mut progress = ProgressTracker::hidden("lines");
    let stats = import_tab(&mut db, Cursor::new(import_text(500)), &mut progress).unwrap();
    assert_eq!(stats.inserted, 500);
    assert_eq!(stats.malformed, 0);
    db.close().unwrap();

    let db = HashDatabase::<16>::open(&path, OpenMode::ReadOnly).unwrap();
    let mut out = Vec::new();
    let written = export_ordered(&db, &mut out, &mut ProgressTracker::hidden("pairs")).unwrap();
    assert_eq!(written, 500);

    // Export order is ascending by hash bytes
    let text = String::from_utf8(out).unwrap();
    let hashes: Vec<&str> = text.lines().map(|l| l.split('\t').next().unwrap()).collect();
    let mut sorted = hashes.clone();
    sorted.sort();
    assert_eq!(hashes, sorted);

    let db_stats = db.stats().unwrap();
    assert_eq!(db_stats.entries, 500);
    assert_eq!(db_stats.distinct_hashes, 500);
    assert_eq!(db_stats.sources, 2);
}

#[test]
fn test_scan_pipeline_over_database() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("scan.hdb");

    let mut db = HashDatabase::<16>::create(&path, DbSettings::new(16)).unwrap();
    import_tab(
        &mut db,
        Cursor::new(import_text(200)),
        &mut ProgressTracker::hidden("lines"),
    )
    .unwrap();
    db.close().unwrap();

    let manager = HashDatabase::<16>::open(&path, OpenMode::ReadOnly)
        .unwrap()
        .into_scan_manager(ScanMode::Count)
        .unwrap();
    let config = ScanConfig::from_args(4, 8, 50).unwrap();
    let pipeline = ScanPipeline::new(Arc::new(manager), config).unwrap();

    // Even numbers are in the database, odd ones above 200 are not
    let mut batch = RequestBatch::new(16);
    let mut expected = BTreeMap::new();
    for n in (0..400u32).step_by(2) {
        let hash = BlockHash::<16>::from_hex(&hash_hex(n)).unwrap();
        let label = format!("query-{n}");
        batch.push(hash.as_bytes(), label.as_bytes()).unwrap();
        if n < 200 {
            expected.insert(label, hash_hex(n));
        }
        if batch.len() == 50 {
            pipeline.put(batch.take()).unwrap();
        }
    }
    if !batch.is_empty() {
        pipeline.put(batch.take()).unwrap();
    }

    let mut found = BTreeMap::new();
    while !pipeline.is_empty() || pipeline.ready() > 0 {
        if let Some(output) = pipeline.get_timeout(std::time::Duration::from_millis(50)) {
            for element in MatchDecoder::new(&output, 16) {
                let element = element.unwrap();
                assert_eq!(element.description_str(), r#"{"count":1}"#);
                found.insert(element.label_str().into_owned(), hex::encode(element.hash));
            }
        }
    }

    assert_eq!(found, expected);
    let stats = pipeline.shutdown().unwrap();
    assert_eq!(stats.elements, 200);
    assert_eq!(stats.matches, 100);
    assert_eq!(stats.dropped, 0);
}

#[test]
fn test_expanded_mode_lists_sources() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("expanded.hdb");
    let hash = BlockHash::<20>([0x42; 20]);

    let mut db = HashDatabase::<20>::create(&path, DbSettings::new(20)).unwrap();
    let disk = db.source_id("disk.img");
    let usb = db.source_id("usb.raw");
    db.insert(hash, Occurrence::new(disk, 0)).unwrap();
    db.insert(hash, Occurrence::new(disk, 4096)).unwrap();
    db.insert(hash, Occurrence::new(usb, 512)).unwrap();

    let manager = db.into_scan_manager(ScanMode::Expanded).unwrap();
    let info = manager.hash_info(hash.as_bytes()).unwrap();
    assert_eq!(info.count, 3);
    assert_eq!(info.sources.get(&disk), Some(&2));
    assert_eq!(info.sources.get(&usb), Some(&1));

    let description = manager.lookup(hash.as_bytes()).unwrap();
    let json: serde_json::Value = serde_json::from_str(&description).unwrap();
    assert_eq!(json["count"], 3);
    assert_eq!(json["truncated"], false);
    assert!(manager.lookup(&[0u8; 20]).is_none());
}

#[test]
fn test_multimap_survives_reopen_after_growth() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("map.mmap");

    {
        let mut map: GrowableMultiMap<u64, u64> =
            GrowableMultiMap::open(&path, OpenMode::CreateNew).unwrap();
        for key in 0..2_000u64 {
            for payload in 0..(key % 4) {
                map.insert(key, payload).unwrap();
            }
        }
        map.close().unwrap();
    }

    let map: GrowableMultiMap<u64, u64> = GrowableMultiMap::open(&path, OpenMode::ReadOnly).unwrap();
    assert_eq!(map.size(), (0..2_000u64).map(|k| k % 4).sum::<u64>());
    assert_eq!(map.count(&7), 3);
    assert!(!map.has_any(&4));
    let mut payloads: Vec<u64> = map.range(&3).collect();
    payloads.sort_unstable();
    assert_eq!(payloads, vec![0, 1, 2]);
}

#[test]
fn test_cursor_store_duplicates_in_order() {
    let dir = tempdir().unwrap();
    let store = OrderedCursorStore::open(dir.path().join("store"), OpenMode::CreateNew, 4).unwrap();

    store.insert(b"bbbb", b"2").unwrap();
    store.insert(b"aaaa", b"9").unwrap();
    store.insert(b"bbbb", b"1").unwrap();
    store.insert(b"cccc", b"0").unwrap();

    let snapshot = store.snapshot().unwrap();
    let pairs: Vec<(Vec<u8>, Vec<u8>)> = snapshot
        .cursor(Position::LowerBound(b"bbbb"))
        .unwrap()
        .map(|p| p.unwrap())
        .collect();
    assert_eq!(
        pairs,
        vec![
            (b"bbbb".to_vec(), b"1".to_vec()),
            (b"bbbb".to_vec(), b"2".to_vec()),
            (b"cccc".to_vec(), b"0".to_vec()),
        ]
    );
}
