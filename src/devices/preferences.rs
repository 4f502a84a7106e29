// Preference list maintenance and key/value persistence
//
// Preference lists are kept stable-sorted ascending by priority with one
// entry per device id. Persistence is a key/value contract with a file
// backend (one JSON document per key) and an in-memory backend with the
// identical contract for environments without durable storage.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use super::types::{DeviceDescriptor, DevicePreference, PreferenceUpdate, StorageError};

/// Re-sort a preference list in place
///
/// Stable sort, so entries sharing a priority keep insertion order.
pub fn sort_preferences(list: &mut [DevicePreference]) {
    list.sort_by(|a, b| a.priority.cmp(&b.priority));
}

/// Insert or update a preference entry for the given device
///
/// An existing entry keeps its priority unless the update supplies a new
/// one; a new entry without an explicit priority lands at the end of the
/// list. Returns a clone of the stored entry.
pub fn upsert_preference(
    list: &mut Vec<DevicePreference>,
    descriptor: &DeviceDescriptor,
    update: PreferenceUpdate,
) -> DevicePreference {
    let stored = match list.iter().position(|p| p.device_id == descriptor.id) {
        Some(index) => {
            let existing = &mut list[index];
            if let Some(priority) = update.priority {
                existing.priority = priority;
            }
            existing.label = descriptor.label.clone();
            existing.is_fallback = update.is_fallback;
            existing.metadata = update.metadata;
            existing.clone()
        }
        None => {
            let next_priority = list.iter().map(|p| p.priority).max().unwrap_or(0) + 1;
            let preference = DevicePreference {
                device_id: descriptor.id.clone(),
                label: descriptor.label.clone(),
                priority: update.priority.unwrap_or(next_priority),
                is_fallback: update.is_fallback,
                metadata: update.metadata,
            };
            list.push(preference.clone());
            preference
        }
    };

    sort_preferences(list);
    stored
}

/// Key/value persistence of ordered preference lists
#[async_trait]
pub trait PreferenceStore: Send + Sync {
    async fn save(&self, key: &str, list: &[DevicePreference]) -> Result<(), StorageError>;
    async fn load(&self, key: &str) -> Result<Option<Vec<DevicePreference>>, StorageError>;
    async fn clear(&self, key: &str) -> Result<(), StorageError>;
    fn is_available(&self) -> bool;
}

/// File-backed store: one JSON document per key under a base directory
///
/// Writes land in a temp file first and are renamed into place, so a save
/// is all-or-nothing and saves to different keys never interleave bytes.
pub struct FilePreferenceStore {
    base_dir: PathBuf,
}

impl FilePreferenceStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Platform data directory for this crate, if the platform has one
    pub fn default_dir() -> Option<PathBuf> {
        dirs::data_dir().map(|dir| dir.join("rtc-devices"))
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let sanitized: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.base_dir.join(format!("{}.json", sanitized))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

#[async_trait]
impl PreferenceStore for FilePreferenceStore {
    async fn save(&self, key: &str, list: &[DevicePreference]) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.base_dir)
            .await
            .map_err(|source| StorageError::Io {
                key: key.to_string(),
                source,
            })?;

        let bytes = serde_json::to_vec_pretty(list).map_err(|source| StorageError::Serialize {
            key: key.to_string(),
            source,
        })?;

        let path = self.path_for(key);
        let tmp_path = path.with_extension(format!("json.tmp-{}", Uuid::new_v4().simple()));

        tokio::fs::write(&tmp_path, &bytes)
            .await
            .map_err(|source| StorageError::Io {
                key: key.to_string(),
                source,
            })?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|source| StorageError::Io {
                key: key.to_string(),
                source,
            })?;

        crate::device_debug!("Saved {} preference(s) under key {}", list.len(), key);
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<Vec<DevicePreference>>, StorageError> {
        let path = self.path_for(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StorageError::Io {
                    key: key.to_string(),
                    source,
                })
            }
        };

        let list = serde_json::from_slice(&bytes).map_err(|source| StorageError::Deserialize {
            key: key.to_string(),
            source,
        })?;
        Ok(Some(list))
    }

    async fn clear(&self, key: &str) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }

    fn is_available(&self) -> bool {
        std::fs::create_dir_all(&self.base_dir).is_ok()
    }
}

/// In-memory store with the identical contract
pub struct MemoryPreferenceStore {
    entries: Mutex<HashMap<String, Vec<DevicePreference>>>,
}

impl MemoryPreferenceStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryPreferenceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PreferenceStore for MemoryPreferenceStore {
    async fn save(&self, key: &str, list: &[DevicePreference]) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), list.to_vec());
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<Vec<DevicePreference>>, StorageError> {
        let entries = self.entries.lock().await;
        Ok(entries.get(key).cloned())
    }

    async fn clear(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().await;
        entries.remove(key);
        Ok(())
    }

    fn is_available(&self) -> bool {
        true
    }
}

/// Build the best available preference store
///
/// Prefers the file backend under `base_dir` (or the platform data dir)
/// and falls back to the in-memory store when no writable location exists.
pub fn preference_store(base_dir: Option<PathBuf>) -> Arc<dyn PreferenceStore> {
    let dir = base_dir.or_else(FilePreferenceStore::default_dir);

    if let Some(dir) = dir {
        let store = FilePreferenceStore::new(&dir);
        if store.is_available() {
            info!("Using file preference store at {}", dir.display());
            return Arc::new(store);
        }
        warn!(
            "Preference directory {} not writable, falling back to in-memory store",
            dir.display()
        );
    } else {
        warn!("No platform data directory, falling back to in-memory preference store");
    }

    Arc::new(MemoryPreferenceStore::new())
}
