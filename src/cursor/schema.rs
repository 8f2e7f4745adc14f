//! RocksDB schema for the ordered store
//!
//! Defines the column families, composite key encoding and the open helpers.
//! `hash_data` holds at most one opaque attribute value per key, outside the
//! ordered multiset.
//! RocksDB keys are unique, so a duplicate-key multiset is stored as
//! `key ‖ value` composite keys with an empty RocksDB value. Bytewise key
//! order then gives key order with value order inside each duplicate group.

use rocksdb::{ColumnFamilyDescriptor, Options, DB};
use std::path::Path;

/// Column family names
pub const CF_HASH_STORE: &str = "hash_store";
pub const CF_METADATA: &str = "metadata";
pub const CF_HASH_DATA: &str = "hash_data";

/// Metadata keys
pub mod meta_keys {
    pub const KEY_WIDTH: &str = "key_width";
    pub const CREATED_AT: &str = "created_at";
}

/// Join a key and value into one composite RocksDB key
pub fn encode_composite(key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut composite = Vec::with_capacity(key.len() + value.len());
    composite.extend_from_slice(key);
    composite.extend_from_slice(value);
    composite
}

/// Split a composite key back into `(key, value)`
pub fn split_composite(composite: &[u8], key_width: usize) -> Option<(&[u8], &[u8])> {
    if composite.len() < key_width {
        return None;
    }
    Some(composite.split_at(key_width))
}

/// Column family options for the hash store (read-mostly, point + range)
fn hash_store_cf_options() -> Options {
    let mut opts = Options::default();

    opts.set_write_buffer_size(32 * 1024 * 1024);
    opts.set_max_write_buffer_number(2);
    opts.set_level_compaction_dynamic_level_bytes(true);

    // Bloom filter for contains() point lookups (10 bits/key)
    let mut block_opts = rocksdb::BlockBasedOptions::default();
    block_opts.set_bloom_filter(10.0, false);
    block_opts.set_cache_index_and_filter_blocks(true);
    opts.set_block_based_table_factory(&block_opts);

    opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

    opts
}

/// Column family options for metadata (tiny, written once)
fn metadata_cf_options() -> Options {
    let mut opts = Options::default();
    opts.set_write_buffer_size(4 * 1024 * 1024);
    opts.set_max_write_buffer_number(2);
    opts
}

/// Column family options for per-key attributes (point lookups only)
fn hash_data_cf_options() -> Options {
    let mut opts = Options::default();
    opts.set_write_buffer_size(16 * 1024 * 1024);
    opts.set_max_write_buffer_number(2);

    let mut block_opts = rocksdb::BlockBasedOptions::default();
    block_opts.set_bloom_filter(10.0, false);
    opts.set_block_based_table_factory(&block_opts);

    opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
    opts
}

/// Database-wide options
pub fn get_db_options() -> Options {
    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts.create_missing_column_families(true);

    opts.increase_parallelism(num_cpus::get() as i32);
    opts.set_max_background_jobs(4);

    opts
}

/// Open or create a store with all column families
pub fn open_rocks_db<P: AsRef<Path>>(path: P) -> Result<DB, rocksdb::Error> {
    let db_opts = get_db_options();

    let cf_descriptors = vec![
        ColumnFamilyDescriptor::new(CF_HASH_STORE, hash_store_cf_options()),
        ColumnFamilyDescriptor::new(CF_METADATA, metadata_cf_options()),
        ColumnFamilyDescriptor::new(CF_HASH_DATA, hash_data_cf_options()),
    ];

    DB::open_cf_descriptors(&db_opts, path, cf_descriptors)
}

/// Open an existing store for reading
pub fn open_rocks_db_readonly<P: AsRef<Path>>(path: P) -> Result<DB, rocksdb::Error> {
    let mut db_opts = get_db_options();
    db_opts.create_if_missing(false);

    DB::open_cf_for_read_only(&db_opts, path, [CF_HASH_STORE, CF_METADATA, CF_HASH_DATA], false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_composite_key_split() {
        let composite = encode_composite(&[0xAA; 4], &[1, 2, 3]);
        assert_eq!(composite.len(), 7);

        let (key, value) = split_composite(&composite, 4).unwrap();
        assert_eq!(key, &[0xAA; 4]);
        assert_eq!(value, &[1, 2, 3]);

        assert!(split_composite(&composite, 8).is_none());
    }

    #[test]
    fn test_composite_order_groups_duplicates() {
        // Same key, values ordered; next key after the whole group
        let a = encode_composite(&[1, 1], &[0, 9]);
        let b = encode_composite(&[1, 1], &[1, 0]);
        let c = encode_composite(&[1, 2], &[0, 0]);
        assert!(a < b);
        assert!(b < c);
    }
}
