//! Durable subscriber state: the etag table and the root table.
//!
//! Both are small JSON documents rewritten in full on every change. Writes go
//! to a temporary file that is renamed over the previous version, so a crash
//! leaves either the old or the new table, never a partial one.

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{Error, Result};
use crate::model::Root;

type RootEtags = BTreeMap<String, String>;

#[derive(Debug, Default, Serialize, Deserialize)]
struct EtagFile {
    /// Unix seconds of the last save
    saved_at: i64,
    roots: BTreeMap<String, RootEtags>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RootFile {
    saved_at: i64,
    roots: BTreeMap<String, Root>,
}

fn load_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let data = fs::read(path)?;
    serde_json::from_slice(&data).map_err(|e| Error::Corrupt {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("tmp");
    let data = serde_json::to_vec_pretty(value)?;
    fs::write(&tmp_path, &data)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Persistent `(root, relative path) -> etag` mapping
pub struct EtagTable {
    file: PathBuf,
    entries: Mutex<BTreeMap<String, RootEtags>>,
}

impl EtagTable {
    /// Load the table stored at `file` (empty if it does not exist yet)
    pub fn load(file: impl Into<PathBuf>) -> Result<Self> {
        let file = file.into();
        let stored: EtagFile = load_json(&file)?;
        Ok(Self {
            file,
            entries: Mutex::new(stored.roots),
        })
    }

    pub fn get(&self, root: &str, path: &str) -> Option<String> {
        lock(&self.entries).get(root).and_then(|r| r.get(path)).cloned()
    }

    /// Paths with a recorded etag under `root`, sorted
    pub fn paths(&self, root: &str) -> Vec<String> {
        lock(&self.entries)
            .get(root)
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of every etag recorded for `root`
    pub fn root_entries(&self, root: &str) -> BTreeMap<String, String> {
        lock(&self.entries).get(root).cloned().unwrap_or_default()
    }

    pub fn record(&self, root: &str, path: &str, etag: &str) -> Result<()> {
        self.update(|entries| {
            let root_entries = entries.entry(root.to_string()).or_default();
            if root_entries.get(path).map(String::as_str) == Some(etag) {
                return false;
            }
            root_entries.insert(path.to_string(), etag.to_string());
            true
        })
    }

    /// Drop the etag for `path`; returns whether one was recorded
    pub fn forget(&self, root: &str, path: &str) -> Result<bool> {
        let mut removed = false;
        self.update(|entries| {
            if let Some(root_entries) = entries.get_mut(root) {
                removed = root_entries.remove(path).is_some();
                if root_entries.is_empty() {
                    entries.remove(root);
                }
            }
            removed
        })?;
        Ok(removed)
    }

    /// Apply `f` to a copy of the table and persist it if `f` reports a change
    ///
    /// The in-memory table only changes once the new version is on disk.
    fn update(&self, f: impl FnOnce(&mut BTreeMap<String, RootEtags>) -> bool) -> Result<()> {
        let mut entries = lock(&self.entries);
        let mut next = entries.clone();
        if !f(&mut next) {
            return Ok(());
        }
        save_json(
            &self.file,
            &EtagFile {
                saved_at: chrono::Utc::now().timestamp(),
                roots: next.clone(),
            },
        )?;
        *entries = next;
        Ok(())
    }
}

/// Persistent table of known roots and their publishers
pub struct RootTable {
    file: PathBuf,
    roots: Mutex<BTreeMap<String, Root>>,
}

impl RootTable {
    pub fn load(file: impl Into<PathBuf>) -> Result<Self> {
        let file = file.into();
        let stored: RootFile = load_json(&file)?;
        Ok(Self {
            file,
            roots: Mutex::new(stored.roots),
        })
    }

    pub fn get(&self, name: &str) -> Option<Root> {
        lock(&self.roots).get(name).cloned()
    }

    pub fn all(&self) -> Vec<Root> {
        lock(&self.roots).values().cloned().collect()
    }

    pub fn subscribed(&self) -> Vec<Root> {
        lock(&self.roots)
            .values()
            .filter(|r| r.subscribed)
            .cloned()
            .collect()
    }

    /// Add a root or update its endpoint, keeping its subscription flag
    ///
    /// Returns whether anything changed.
    pub fn upsert(&self, name: &str, endpoint: &str) -> Result<bool> {
        self.update(|roots| match roots.get_mut(name) {
            Some(root) if root.endpoint == endpoint => false,
            Some(root) => {
                root.endpoint = endpoint.to_string();
                true
            }
            None => {
                roots.insert(
                    name.to_string(),
                    Root {
                        name: name.to_string(),
                        endpoint: endpoint.to_string(),
                        subscribed: false,
                    },
                );
                true
            }
        })
    }

    /// Mark a known root (un)subscribed; roots are never deleted
    pub fn set_subscribed(&self, name: &str, subscribed: bool) -> Result<()> {
        let mut known = true;
        self.update(|roots| match roots.get_mut(name) {
            Some(root) if root.subscribed == subscribed => false,
            Some(root) => {
                root.subscribed = subscribed;
                true
            }
            None => {
                known = false;
                false
            }
        })?;
        if known {
            Ok(())
        } else {
            Err(Error::NotFound(name.to_string()))
        }
    }

    fn update(&self, f: impl FnOnce(&mut BTreeMap<String, Root>) -> bool) -> Result<bool> {
        let mut roots = lock(&self.roots);
        let mut next = roots.clone();
        if !f(&mut next) {
            return Ok(false);
        }
        save_json(
            &self.file,
            &RootFile {
                saved_at: chrono::Utc::now().timestamp(),
                roots: next.clone(),
            },
        )?;
        *roots = next;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_etag_record_and_reload() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("state").join("etags.json");

        let table = EtagTable::load(&file).unwrap();
        assert!(table.get("foo", "a.dsc").is_none());
        table.record("foo", "a.dsc", "100:20").unwrap();
        table.record("foo", "dir/b.dsc", "200:40").unwrap();
        table.record("bar", "c.dsc", "1:1").unwrap();
        drop(table);

        let table = EtagTable::load(&file).unwrap();
        assert_eq!(table.get("foo", "a.dsc").as_deref(), Some("100:20"));
        assert_eq!(table.paths("foo"), vec!["a.dsc", "dir/b.dsc"]);
        assert!(!file.with_extension("tmp").exists());
    }

    #[test]
    fn test_etag_forget() {
        let tmp = TempDir::new().unwrap();
        let table = EtagTable::load(tmp.path().join("etags.json")).unwrap();
        table.record("foo", "a.dsc", "1:1").unwrap();

        assert!(table.forget("foo", "a.dsc").unwrap());
        assert!(!table.forget("foo", "a.dsc").unwrap());
        assert!(table.paths("foo").is_empty());
    }

    #[test]
    fn test_etag_corrupt_file() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("etags.json");
        fs::write(&file, b"{not json").unwrap();
        assert!(matches!(EtagTable::load(&file), Err(Error::Corrupt { .. })));
    }

    #[test]
    fn test_root_table_lifecycle() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("roots.json");
        let table = RootTable::load(&file).unwrap();

        assert!(table.upsert("foo", "http://localhost:8001").unwrap());
        assert!(!table.upsert("foo", "http://localhost:8001").unwrap());
        table.set_subscribed("foo", true).unwrap();
        assert!(table.upsert("foo", "http://localhost:9001").unwrap());
        assert!(matches!(table.set_subscribed("nope", true), Err(Error::NotFound(_))));

        let table = RootTable::load(&file).unwrap();
        let foo = table.get("foo").unwrap();
        assert_eq!(foo.endpoint, "http://localhost:9001");
        assert!(foo.subscribed);
        assert_eq!(table.subscribed().len(), 1);

        table.set_subscribed("foo", false).unwrap();
        assert!(table.subscribed().is_empty());
        assert_eq!(table.all().len(), 1);
    }
}
