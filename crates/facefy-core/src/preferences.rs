//! Key/value persistence for user preferences.
//!
//! [`PreferenceStore`] is the narrow port the aggregator persists the server
//! endpoint through. Two adapters ship with the crate: an in-process
//! [`MemoryPreferenceStore`] and a JSON-file backed [`FilePreferenceStore`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::error::{FacefyError, Result};

/// Scope name the client stores its preferences under.
pub const PREFERENCE_SCOPE: &str = "facefy_prefs";

/// Key of the persisted server host.
pub const KEY_SERVER_HOST: &str = "server_host";

/// Key of the persisted server port.
pub const KEY_SERVER_PORT: &str = "server_port";

// ── Port ──────────────────────────────────────────────────────────────────────

/// Get/set access to named scalar preferences.
///
/// Setters must be durable when they return `Ok`.
pub trait PreferenceStore: Send + Sync {
    fn get_string(&self, key: &str) -> Option<String>;
    fn get_int(&self, key: &str) -> Option<i64>;
    fn set_string(&self, key: &str, value: &str) -> Result<()>;
    fn set_int(&self, key: &str, value: i64) -> Result<()>;
}

/// A single stored preference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PreferenceValue {
    Int(i64),
    String(String),
}

type Entries = BTreeMap<String, PreferenceValue>;

fn lock(entries: &Mutex<Entries>) -> MutexGuard<'_, Entries> {
    entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn string_of(entries: &Entries, key: &str) -> Option<String> {
    match entries.get(key) {
        Some(PreferenceValue::String(s)) => Some(s.clone()),
        _ => None,
    }
}

fn int_of(entries: &Entries, key: &str) -> Option<i64> {
    match entries.get(key) {
        Some(PreferenceValue::Int(i)) => Some(*i),
        _ => None,
    }
}

// ── MemoryPreferenceStore ─────────────────────────────────────────────────────

/// Preferences held in memory for the lifetime of the value.
#[derive(Debug, Default)]
pub struct MemoryPreferenceStore {
    entries: Mutex<Entries>,
}

impl MemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreferenceStore for MemoryPreferenceStore {
    fn get_string(&self, key: &str) -> Option<String> {
        string_of(&lock(&self.entries), key)
    }

    fn get_int(&self, key: &str) -> Option<i64> {
        int_of(&lock(&self.entries), key)
    }

    fn set_string(&self, key: &str, value: &str) -> Result<()> {
        lock(&self.entries).insert(key.to_string(), PreferenceValue::String(value.to_string()));
        Ok(())
    }

    fn set_int(&self, key: &str, value: i64) -> Result<()> {
        lock(&self.entries).insert(key.to_string(), PreferenceValue::Int(value));
        Ok(())
    }
}

// ── FilePreferenceStore ───────────────────────────────────────────────────────

/// Preferences persisted as a JSON object in `<dir>/<scope>.json`.
///
/// Every setter rewrites the file atomically before updating the in-memory
/// copy, so a failed write leaves both unchanged.
#[derive(Debug)]
pub struct FilePreferenceStore {
    path: PathBuf,
    entries: Mutex<Entries>,
}

impl FilePreferenceStore {
    /// Default preference directory: `~/.facefy`.
    pub fn default_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".facefy")
    }

    /// Path of the file backing `scope` inside `dir`.
    pub fn path_in(dir: &Path, scope: &str) -> PathBuf {
        dir.join(format!("{scope}.json"))
    }

    /// Open the store for `scope` in `dir`.
    ///
    /// A missing file yields an empty store; an unreadable or corrupt one is
    /// logged and treated as empty.
    pub fn open(dir: &Path, scope: &str) -> Self {
        let path = Self::path_in(dir, scope);
        let entries = Self::load_from(&path);
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the backing file if it exists and forget all entries.
    pub fn clear(&self) -> Result<()> {
        let mut entries = lock(&self.entries);
        Self::clear_at(&self.path)?;
        entries.clear();
        Ok(())
    }

    /// Delete a preference file at an explicit path if it exists.
    fn clear_at(path: &Path) -> Result<()> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    fn load_from(path: &Path) -> Entries {
        let Ok(content) = std::fs::read_to_string(path) else {
            return Entries::new();
        };
        match serde_json::from_str(&content) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring corrupt preference file");
                Entries::new()
            }
        }
    }

    fn save_to(path: &Path, entries: &Entries) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(entries)?;

        // Write to a temp file then rename for atomicity.
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &json)?;
        std::fs::rename(&tmp, path)?;

        Ok(())
    }

    fn set(&self, key: &str, value: PreferenceValue) -> Result<()> {
        let mut entries = lock(&self.entries);
        let mut next = entries.clone();
        next.insert(key.to_string(), value);

        Self::save_to(&self.path, &next).map_err(|e| FacefyError::Persistence {
            key: key.to_string(),
            reason: e.to_string(),
        })?;

        *entries = next;
        tracing::debug!(key, path = %self.path.display(), "preference saved");
        Ok(())
    }
}

impl PreferenceStore for FilePreferenceStore {
    fn get_string(&self, key: &str) -> Option<String> {
        string_of(&lock(&self.entries), key)
    }

    fn get_int(&self, key: &str) -> Option<i64> {
        int_of(&lock(&self.entries), key)
    }

    fn set_string(&self, key: &str, value: &str) -> Result<()> {
        self.set(key, PreferenceValue::String(value.to_string()))
    }

    fn set_int(&self, key: &str, value: i64) -> Result<()> {
        self.set(key, PreferenceValue::Int(value))
    }
}
