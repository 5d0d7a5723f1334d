//! Key persistence
//!
//! The custody service only needs create, read by id, and soft delete. A read
//! distinguishes "no such record" (`Ok(None)`) from storage faults
//! (`Err(CustodyError::Storage)`).

pub mod file;
pub mod memory;

pub use file::FileKeyRepository;
pub use memory::MemoryKeyRepository;

use async_trait::async_trait;

use crate::error::CustodyError;
use crate::model::Key;

#[async_trait]
pub trait KeyRepository: Send + Sync {
    /// Insert a new record. Fails if the id is already taken.
    async fn create(&self, key: &Key) -> Result<(), CustodyError>;

    /// Load a record by id. Soft-deleted records are not returned.
    async fn get(&self, id: &str) -> Result<Option<Key>, CustodyError>;

    /// Mark a record deleted. Returns false if no live record has this id.
    async fn soft_delete(&self, id: &str) -> Result<bool, CustodyError>;
}
