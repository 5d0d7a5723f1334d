//! Persisted key record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::CustodyError;
use crate::signing::KeyType;

/// A custodied key pair. The private half is only ever held here in its
/// chunked-cipher wire form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    pub id: String,
    /// PEM-encoded public key.
    pub public_key: String,
    pub private_key_encrypted: String,
    /// Stored algorithm tag (`ECDSA` or `RSA`). Kept as the raw tag so that
    /// records written by other tooling can still be loaded and rejected at
    /// signing time.
    #[serde(rename = "type")]
    pub key_type: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Key {
    pub fn new(public_key: String, private_key_encrypted: String, key_type: KeyType) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            public_key,
            private_key_encrypted,
            key_type: key_type.to_string(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    /// Parsed algorithm tag.
    pub fn key_type(&self) -> Result<KeyType, CustodyError> {
        KeyType::from_str(&self.key_type)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}
