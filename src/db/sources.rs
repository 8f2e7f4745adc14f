//! Source file registry
//!
//! Maps source file names to dense [`SourceId`]s, assigned on first sight
//! starting at 1, and keeps descriptive [`SourceData`] for each source.
//! Persisted as `sources.json` next to the stores.

use crate::error::{HashDbError, Result};
use crate::types::SourceId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Where a source file was found
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceName {
    pub repository_name: String,
    pub filename: String,
}

/// Descriptive data for one source file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceData {
    /// File size in bytes (0 when unknown)
    #[serde(default)]
    pub filesize: u64,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub file_type: String,

    /// Blocks classified as low entropy
    #[serde(default)]
    pub low_entropy_count: u64,

    /// Repository/filename pairs, without duplicates
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<SourceName>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SourceRecord {
    id: SourceId,
    name: String,
    #[serde(flatten)]
    data: SourceData,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SourceFile {
    sources: Vec<SourceRecord>,
}

/// Dense name → id table
#[derive(Debug)]
pub struct SourceRegistry {
    path: PathBuf,
    /// Index `i` holds the name of source `i + 1`
    names: Vec<String>,
    data: Vec<SourceData>,
    ids: HashMap<String, SourceId>,
    dirty: bool,
}

impl SourceRegistry {
    /// Empty registry that will be saved to `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            names: Vec::new(),
            data: Vec::new(),
            ids: HashMap::new(),
            dirty: true,
        }
    }

    /// Load the registry at `path`; a missing file is an empty registry
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            return Ok(Self::new(path));
        }

        let invalid = |reason: String| HashDbError::Sources {
            path: path.clone(),
            reason,
        };
        let text = fs::read_to_string(&path)?;
        let file: SourceFile = serde_json::from_str(&text).map_err(|e| invalid(e.to_string()))?;

        let mut names = Vec::with_capacity(file.sources.len());
        let mut data = Vec::with_capacity(file.sources.len());
        let mut ids = HashMap::with_capacity(file.sources.len());
        for (index, record) in file.sources.into_iter().enumerate() {
            let expected = index as SourceId + 1;
            if record.id != expected {
                return Err(invalid(format!(
                    "source '{}' has id {}, expected {}",
                    record.name, record.id, expected
                )));
            }
            ids.insert(record.name.clone(), record.id);
            names.push(record.name);
            data.push(record.data);
        }

        debug!(path = %path.display(), sources = names.len(), "Loaded source registry");
        Ok(Self {
            path,
            names,
            data,
            ids,
            dirty: false,
        })
    }

    /// Id for `name`, allocating the next one if unseen
    pub fn get_or_insert(&mut self, name: &str) -> SourceId {
        if let Some(id) = self.ids.get(name) {
            return *id;
        }
        self.names.push(name.to_string());
        self.data.push(SourceData::default());
        let id = self.names.len() as SourceId;
        self.ids.insert(name.to_string(), id);
        self.dirty = true;
        id
    }

    pub fn id(&self, name: &str) -> Option<SourceId> {
        self.ids.get(name).copied()
    }

    pub fn name(&self, id: SourceId) -> Option<&str> {
        self.names.get(Self::index(id)?).map(String::as_str)
    }

    pub fn data(&self, id: SourceId) -> Option<&SourceData> {
        self.data.get(Self::index(id)?)
    }

    /// Record size, type and low-entropy count for source `id`, keeping
    /// its names. Returns false for an unknown id.
    pub fn set_data(&mut self, id: SourceId, filesize: u64, file_type: &str, low_entropy_count: u64) -> bool {
        let Some(data) = Self::index(id).and_then(|i| self.data.get_mut(i)) else {
            return false;
        };
        data.filesize = filesize;
        data.file_type = file_type.to_string();
        data.low_entropy_count = low_entropy_count;
        self.dirty = true;
        true
    }

    /// Add a repository/filename pair to source `id`.
    /// Returns false for an unknown id or a pair already present.
    pub fn add_name(&mut self, id: SourceId, name: SourceName) -> bool {
        let Some(data) = Self::index(id).and_then(|i| self.data.get_mut(i)) else {
            return false;
        };
        if data.names.contains(&name) {
            return false;
        }
        data.names.push(name);
        self.dirty = true;
        true
    }

    fn index(id: SourceId) -> Option<usize> {
        usize::try_from(id).ok()?.checked_sub(1)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// `(id, name)` pairs in id order
    pub fn iter(&self) -> impl Iterator<Item = (SourceId, &str)> {
        self.names
            .iter()
            .enumerate()
            .map(|(index, name)| (index as SourceId + 1, name.as_str()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the registry if anything changed since the last save
    pub fn save(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }

        let file = SourceFile {
            sources: self
                .iter()
                .zip(&self.data)
                .map(|((id, name), data)| SourceRecord {
                    id,
                    name: name.to_string(),
                    data: data.clone(),
                })
                .collect(),
        };
        let text = serde_json::to_string_pretty(&file).map_err(|e| HashDbError::Sources {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        fs::write(&self.path, text)?;

        self.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_ids_are_dense_and_stable() {
        let dir = tempdir().unwrap();
        let mut registry = SourceRegistry::new(dir.path().join("sources.json"));

        assert_eq!(registry.get_or_insert("disk.img"), 1);
        assert_eq!(registry.get_or_insert("usb.raw"), 2);
        assert_eq!(registry.get_or_insert("disk.img"), 1);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.name(2), Some("usb.raw"));
        assert_eq!(registry.name(0), None);
        assert_eq!(registry.name(3), None);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sources.json");

        let mut registry = SourceRegistry::new(&path);
        registry.get_or_insert("a");
        registry.get_or_insert("b");
        registry.save().unwrap();

        let mut loaded = SourceRegistry::load(&path).unwrap();
        assert_eq!(loaded.id("b"), Some(2));
        assert_eq!(loaded.get_or_insert("c"), 3);
        assert_eq!(
            loaded.iter().collect::<Vec<_>>(),
            vec![(1, "a"), (2, "b"), (3, "c")]
        );
    }

    #[test]
    fn test_source_data_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sources.json");

        let mut registry = SourceRegistry::new(&path);
        let id = registry.get_or_insert("b9e7");
        assert!(registry.set_data(id, 8000, "exe", 4));
        let name = SourceName {
            repository_name: "repository1".into(),
            filename: "filename1.dat".into(),
        };
        assert!(registry.add_name(id, name.clone()));
        assert!(!registry.add_name(id, name.clone()));
        assert!(!registry.set_data(9, 1, "", 0));
        registry.save().unwrap();

        let loaded = SourceRegistry::load(&path).unwrap();
        let data = loaded.data(id).unwrap();
        assert_eq!(data.filesize, 8000);
        assert_eq!(data.file_type, "exe");
        assert_eq!(data.low_entropy_count, 4);
        assert_eq!(data.names, vec![name]);
    }

    #[test]
    fn test_load_missing_is_empty() {
        let dir = tempdir().unwrap();
        let registry = SourceRegistry::load(dir.path().join("nope.json")).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_load_rejects_gaps() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sources.json");
        fs::write(&path, r#"{"sources":[{"id":2,"name":"x"}]}"#).unwrap();
        assert!(matches!(
            SourceRegistry::load(&path),
            Err(HashDbError::Sources { .. })
        ));
    }
}
