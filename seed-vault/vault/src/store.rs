//! Durable `name -> transport string` mapping.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{ErrorKind, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::backend::owner_only;

/// Persistent store for seed records.
///
/// Each call is atomic for its key. Callers serialise operations on the
/// same name.
pub trait SeedStore: Send + Sync {
    fn get(&self, name: &str) -> Result<Option<String>>;

    /// Store `record` under `name` unless the name is taken.
    ///
    /// Returns `false` and leaves the existing record alone when it is.
    fn insert_new(&self, name: &str, record: &str) -> Result<bool>;

    /// Remove `name`. Returns whether a record was present.
    fn remove(&self, name: &str) -> Result<bool>;

    fn names(&self) -> Result<BTreeSet<String>>;

    fn clear(&self) -> Result<()>;

    fn contains(&self, name: &str) -> Result<bool> {
        Ok(self.get(name)?.is_some())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Overwrite a record in place. Test hook for corruption scenarios.
    pub fn replace(&self, name: &str, record: &str) {
        self.records().insert(name.to_string(), record.to_string());
    }
}

impl SeedStore for MemoryStore {
    fn get(&self, name: &str) -> Result<Option<String>> {
        Ok(self.records().get(name).cloned())
    }

    fn insert_new(&self, name: &str, record: &str) -> Result<bool> {
        let mut records = self.records();
        if records.contains_key(name) {
            return Ok(false);
        }
        records.insert(name.to_string(), record.to_string());
        Ok(true)
    }

    fn remove(&self, name: &str) -> Result<bool> {
        Ok(self.records().remove(name).is_some())
    }

    fn names(&self) -> Result<BTreeSet<String>> {
        Ok(self.records().keys().cloned().collect())
    }

    fn clear(&self) -> Result<()> {
        self.records().clear();
        Ok(())
    }
}

#[derive(Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    seeds: BTreeMap<String, String>,
}

/// TOML-backed store. Every mutation rewrites the file through a temporary
/// sibling and an atomic rename, so a crash leaves either the old or the
/// new document.
pub struct FileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<StoreFile> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(StoreFile::default()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read store {}", self.path.display()));
            }
        };
        toml::from_str(&text)
            .with_context(|| format!("failed to parse store {}", self.path.display()))
    }

    fn save(&self, doc: &StoreFile) -> Result<()> {
        let text = toml::to_string(doc).context("failed to serialise store")?;

        let dir = store_dir(&self.path);
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create store directory {}", dir.display()))?;

        let tmp = self.path.with_extension("tmp");
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(owner_only())
            .open(&tmp)
            .with_context(|| format!("failed to open {}", tmp.display()))?;
        file.write_all(text.as_bytes())
            .and_then(|()| file.sync_all())
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        drop(file);

        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace store {}", self.path.display()))?;
        // The rename is only durable once the directory entry is on disk.
        fsync_dir(dir).with_context(|| format!("failed to sync {}", dir.display()))
    }

    fn modify<T>(&self, f: impl FnOnce(&mut StoreFile) -> (T, bool)) -> Result<T> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut doc = self.load()?;
        let (result, changed) = f(&mut doc);
        if changed {
            self.save(&doc)?;
        }
        Ok(result)
    }
}

impl SeedStore for FileStore {
    fn get(&self, name: &str) -> Result<Option<String>> {
        Ok(self.load()?.seeds.remove(name))
    }

    fn insert_new(&self, name: &str, record: &str) -> Result<bool> {
        self.modify(|doc| {
            if doc.seeds.contains_key(name) {
                return (false, false);
            }
            doc.seeds.insert(name.to_string(), record.to_string());
            (true, true)
        })
    }

    fn remove(&self, name: &str) -> Result<bool> {
        self.modify(|doc| {
            let removed = doc.seeds.remove(name).is_some();
            (removed, removed)
        })
    }

    fn names(&self) -> Result<BTreeSet<String>> {
        Ok(self.load()?.seeds.into_keys().collect())
    }

    fn clear(&self) -> Result<()> {
        self.modify(|doc| {
            let changed = !doc.seeds.is_empty();
            doc.seeds.clear();
            ((), changed)
        })
    }
}

/// Directory holding `path`; a bare file name lives in the working directory.
fn store_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

fn fsync_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir)?.sync_all()
}
