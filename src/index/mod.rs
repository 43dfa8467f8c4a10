// Persistent metadata cache: relative path -> last-known document identity.

use crate::atomic;
use crate::error::Result;
use crate::value::Map;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

const INDEX_VERSION: u32 = 1;

/// Last-known state of one document file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: String,
    pub metadata: Map,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexData {
    version: u32,
    entries: BTreeMap<String, IndexEntry>,
}

impl Default for IndexData {
    fn default() -> Self {
        IndexData {
            version: INDEX_VERSION,
            entries: BTreeMap::new(),
        }
    }
}

struct IndexState {
    data: IndexData,
    dirty: bool,
}

/// The whole index sits behind one reader/writer lock; each call holds it
/// only for its own duration, never across a directory walk.
pub struct Index {
    path: PathBuf,
    state: RwLock<IndexState>,
}

impl Index {
    /// Load the index from disk. A missing file starts empty; malformed
    /// content is discarded and the index self-heals from an empty state.
    pub fn load(path: &Path) -> Index {
        let data = match std::fs::read(path) {
            Ok(bytes) => match serde_json::from_slice::<IndexData>(&bytes) {
                Ok(data) => data,
                Err(e) => {
                    log::warn!("discarding malformed index {}: {e}", path.display());
                    IndexData::default()
                }
            },
            Err(_) => IndexData::default(),
        };
        Index {
            path: path.to_path_buf(),
            state: RwLock::new(IndexState { data, dirty: false }),
        }
    }

    /// A hit requires exact equality on the modification time. Anything
    /// else, including a close-but-older value, is a miss.
    pub fn get(&self, rel_path: &str, mtime: DateTime<Utc>) -> Option<IndexEntry> {
        let state = self.state.read().expect("index lock poisoned");
        state
            .data
            .entries
            .get(rel_path)
            .filter(|entry| entry.last_modified == mtime)
            .cloned()
    }

    /// Look up an entry regardless of modification time.
    pub fn peek(&self, rel_path: &str) -> Option<IndexEntry> {
        let state = self.state.read().expect("index lock poisoned");
        state.data.entries.get(rel_path).cloned()
    }

    pub fn set(&self, rel_path: &str, entry: IndexEntry) {
        let mut state = self.state.write().expect("index lock poisoned");
        state.data.entries.insert(rel_path.to_string(), entry);
        state.dirty = true;
    }

    pub fn remove(&self, rel_path: &str) -> Option<IndexEntry> {
        let mut state = self.state.write().expect("index lock poisoned");
        let removed = state.data.entries.remove(rel_path);
        if removed.is_some() {
            state.dirty = true;
        }
        removed
    }

    /// Drop every entry whose path is absent from `keep`; returns what was
    /// removed so callers can report deletions under the stored IDs.
    pub fn prune(&self, keep: &HashSet<String>) -> Vec<(String, IndexEntry)> {
        let mut state = self.state.write().expect("index lock poisoned");
        let stale: Vec<String> = state
            .data
            .entries
            .keys()
            .filter(|path| !keep.contains(*path))
            .cloned()
            .collect();
        let mut removed = Vec::with_capacity(stale.len());
        for path in stale {
            if let Some(entry) = state.data.entries.remove(&path) {
                removed.push((path, entry));
            }
        }
        if !removed.is_empty() {
            state.dirty = true;
        }
        removed
    }

    pub fn paths(&self) -> Vec<String> {
        let state = self.state.read().expect("index lock poisoned");
        state.data.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        let state = self.state.read().expect("index lock poisoned");
        state.data.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persist through the atomic writer. No-op while clean.
    pub fn save(&self) -> Result<()> {
        let mut state = self.state.write().expect("index lock poisoned");
        if !state.dirty {
            return Ok(());
        }
        let bytes = serde_json::to_vec_pretty(&state.data)?;
        atomic::write(&self.path, &bytes, 0o644)?;
        state.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn entry(id: &str, mtime: DateTime<Utc>) -> IndexEntry {
        IndexEntry {
            id: id.to_string(),
            metadata: Map::new(),
            last_modified: mtime,
        }
    }

    #[test]
    fn test_missing_file_starts_empty() {
        let tmp = TempDir::new().unwrap();
        let index = Index::load(&tmp.path().join("index.json"));
        assert!(index.is_empty());
    }

    #[test]
    fn test_malformed_file_self_heals() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("index.json");
        std::fs::write(&path, b"{{{ not json").unwrap();
        let index = Index::load(&path);
        assert!(index.is_empty());
    }

    #[test]
    fn test_hit_requires_exact_mtime() {
        let tmp = TempDir::new().unwrap();
        let index = Index::load(&tmp.path().join("index.json"));
        let t = Utc::now();
        index.set("a.md", entry("a", t));

        assert!(index.get("a.md", t).is_some());
        assert!(index.get("a.md", t + chrono::Duration::nanoseconds(1)).is_none());
        assert!(index.get("a.md", t - chrono::Duration::seconds(1)).is_none());
    }

    #[test]
    fn test_save_is_noop_when_clean() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("index.json");
        let index = Index::load(&path);
        index.save().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_save_and_reload() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("index.json");
        let index = Index::load(&path);
        let t = Utc::now();
        index.set("notes/a.md", entry("notes/a", t));
        index.save().unwrap();

        let reloaded = Index::load(&path);
        assert_eq!(reloaded.get("notes/a.md", t).unwrap().id, "notes/a");
    }

    #[test]
    fn test_prune_removes_unlisted_paths() {
        let tmp = TempDir::new().unwrap();
        let index = Index::load(&tmp.path().join("index.json"));
        let t = Utc::now();
        index.set("a.md", entry("a", t));
        index.set("b.md", entry("b", t));

        let keep: HashSet<String> = ["a.md".to_string()].into_iter().collect();
        let removed = index.prune(&keep);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].0, "b.md");
        assert_eq!(index.paths(), vec!["a.md".to_string()]);
    }
}
