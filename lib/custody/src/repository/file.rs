//! File-based key repository

use async_trait::async_trait;
use chrono::Utc;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::KeyRepository;
use crate::error::CustodyError;
use crate::model::Key;

/// One JSON document per key under a directory.
pub struct FileKeyRepository {
    key_dir: PathBuf,
    // Serializes read-modify-write in soft_delete
    write_lock: Mutex<()>,
}

impl FileKeyRepository {
    pub fn new(key_dir: impl Into<PathBuf>) -> Result<Self, CustodyError> {
        let key_dir = key_dir.into();
        std::fs::create_dir_all(&key_dir)?;
        Ok(Self {
            key_dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn key_dir(&self) -> &Path {
        &self.key_dir
    }

    /// Path for a record, or None when `id` is not a UUID (and so cannot exist).
    fn key_path(&self, id: &str) -> Option<PathBuf> {
        let id = uuid::Uuid::parse_str(id).ok()?;
        Some(self.key_dir.join(format!("{}.key.json", id.hyphenated())))
    }

    fn read(&self, path: &Path) -> Result<Option<Key>, CustodyError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    fn write(file: &mut std::fs::File, key: &Key) -> Result<(), CustodyError> {
        let contents = serde_json::to_string_pretty(key)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }
}

#[async_trait]
impl KeyRepository for FileKeyRepository {
    async fn create(&self, key: &Key) -> Result<(), CustodyError> {
        let path = self
            .key_path(&key.id)
            .ok_or_else(|| CustodyError::Storage(format!("Invalid key id: {}", key.id)))?;

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        Self::write(&mut file, key)
    }

    async fn get(&self, id: &str) -> Result<Option<Key>, CustodyError> {
        let Some(path) = self.key_path(id) else {
            return Ok(None);
        };
        Ok(self.read(&path)?.filter(|key| !key.is_deleted()))
    }

    async fn soft_delete(&self, id: &str) -> Result<bool, CustodyError> {
        let Some(path) = self.key_path(id) else {
            return Ok(false);
        };
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| CustodyError::Internal("Key store lock poisoned".into()))?;

        let Some(mut key) = self.read(&path)?.filter(|key| !key.is_deleted()) else {
            return Ok(false);
        };
        let now = Utc::now();
        key.deleted_at = Some(now);
        key.updated_at = now;

        let mut file = std::fs::File::create(&path)?;
        Self::write(&mut file, &key)?;
        Ok(true)
    }
}
