//! In-memory key repository

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::RwLock;

use super::KeyRepository;
use crate::error::CustodyError;
use crate::model::Key;

/// Process-local store, lost on restart.
#[derive(Default)]
pub struct MemoryKeyRepository {
    keys: RwLock<HashMap<String, Key>>,
}

impl MemoryKeyRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> CustodyError {
    CustodyError::Internal("Key store lock poisoned".into())
}

#[async_trait]
impl KeyRepository for MemoryKeyRepository {
    async fn create(&self, key: &Key) -> Result<(), CustodyError> {
        let mut keys = self.keys.write().map_err(poisoned)?;
        if keys.contains_key(&key.id) {
            return Err(CustodyError::Storage(format!("Key {} already exists", key.id)));
        }
        keys.insert(key.id.clone(), key.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Key>, CustodyError> {
        let keys = self.keys.read().map_err(poisoned)?;
        Ok(keys.get(id).filter(|key| !key.is_deleted()).cloned())
    }

    async fn soft_delete(&self, id: &str) -> Result<bool, CustodyError> {
        let mut keys = self.keys.write().map_err(poisoned)?;
        match keys.get_mut(id) {
            Some(key) if !key.is_deleted() => {
                let now = Utc::now();
                key.deleted_at = Some(now);
                key.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
