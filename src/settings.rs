//! Runtime key→value settings shared with other processes (UI, watchdog).
//!
//! Every read-modify-write holds an exclusive lock on a sidecar `.lock`
//! file so concurrent writers cannot lose each other's updates.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::Result;

pub const BUDGET_CEILING: &str = "budget_ceiling";
pub const PAUSED_KINDS: &str = "paused_kinds";
pub const NO_AUTO_RESUME: &str = "no_auto_resume";

/// File-backed settings store
#[derive(Debug, Clone)]
pub struct Settings {
    path: PathBuf,
    lock_path: PathBuf,
}

struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(error = %e, "failed to release settings lock");
        }
    }
}

impl Settings {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_name = path.as_os_str().to_owned();
        lock_name.push(".lock");
        Self {
            path,
            lock_path: PathBuf::from(lock_name),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<LockGuard> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)?;
        file.lock_exclusive()?;
        Ok(LockGuard { file })
    }

    fn read_unlocked(&self) -> Map<String, Value> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => match serde_json::from_str::<Map<String, Value>>(&contents) {
                Ok(map) => map,
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "corrupt settings file, using empty settings");
                    Map::new()
                }
            },
            Err(_) => Map::new(),
        }
    }

    fn write_unlocked(&self, map: &Map<String, Value>) -> Result<()> {
        let mut buf = serde_json::to_string_pretty(map)?;
        buf.push('\n');
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, buf)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// All settings as a JSON object.
    pub fn load(&self) -> Result<Map<String, Value>> {
        let _guard = self.lock()?;
        Ok(self.read_unlocked())
    }

    /// Typed read of one key. Missing or mistyped keys read as `None`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let map = self.load()?;
        Ok(map
            .get(key)
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok()))
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.update(|map| {
            map.insert(key.to_string(), value);
        })
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        self.update(|map| {
            map.remove(key);
        })
    }

    /// Locked read-modify-write.
    pub fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Map<String, Value>),
    {
        let _guard = self.lock()?;
        let mut map = self.read_unlocked();
        f(&mut map);
        self.write_unlocked(&map)?;
        debug!(path = %self.path.display(), keys = map.len(), "settings written");
        Ok(())
    }
}
