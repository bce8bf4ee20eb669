use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

const GUARD_FILE: &str = "startup-guards.json";

/// Source of the startup entry ids that must stay disabled.
pub trait GuardStore: Send + Sync {
    fn get_all(&self) -> Result<HashSet<String>>;
}

/// Guard ids persisted as a JSON array of strings.
pub struct JsonGuardStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonGuardStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Store in the application data directory.
    pub fn open_default() -> Result<Self> {
        let dir = crate::config::get_data_directory()?;
        Ok(Self::new(dir.join(GUARD_FILE)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn add(&self, id: &str) -> Result<bool> {
        let _guard = self.write_lock.lock();
        let mut ids = self.read()?;
        let added = ids.insert(id.to_string());
        if added {
            self.write(&ids)?;
        }
        Ok(added)
    }

    pub fn remove(&self, id: &str) -> Result<bool> {
        let _guard = self.write_lock.lock();
        let mut ids = self.read()?;
        let removed = ids.remove(id);
        if removed {
            self.write(&ids)?;
        }
        Ok(removed)
    }

    pub fn replace<I, S>(&self, ids: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let _guard = self.write_lock.lock();
        let ids: HashSet<String> = ids.into_iter().map(Into::into).collect();
        self.write(&ids)
    }

    fn read(&self) -> Result<HashSet<String>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashSet::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", self.path.display()))
            }
        };
        if contents.trim().is_empty() {
            return Ok(HashSet::new());
        }
        let ids: Vec<String> = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", self.path.display()))?;
        Ok(ids
            .into_iter()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .collect())
    }

    fn write(&self, ids: &HashSet<String>) -> Result<()> {
        // Sorted so the file diffs cleanly.
        let sorted: BTreeSet<&String> = ids.iter().collect();
        let json = serde_json::to_string_pretty(&sorted).context("Failed to serialize guard ids")?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

impl GuardStore for JsonGuardStore {
    fn get_all(&self) -> Result<HashSet<String>> {
        self.read()
    }
}
