//! HSM-backed key custody
//!
//! Private keys are wrapped with an RSA key pair that never leaves the HSM
//! and stored alongside their public halves. Signing unwraps the private key
//! in memory only for the duration of the operation.

#![cfg_attr(
    test,
    allow(clippy::unwrap_used, clippy::expect_used, clippy::unwrap_in_result)
)]

pub mod cipher;
pub mod device;
pub mod error;
pub mod model;
pub mod repository;
pub mod service;
pub mod session;
pub mod signing;

pub use cipher::{CHUNK_SEPARATOR, CHUNK_SIZE, ChunkedCipher, KeyCipher};
pub use device::{HsmDevice, HsmSession, KeyClass, Pkcs11Device, SoftwareDevice};
pub use error::CustodyError;
pub use model::Key;
pub use repository::{FileKeyRepository, KeyRepository, MemoryKeyRepository};
pub use service::KeyService;
pub use session::{Clock, DEFAULT_KEEP_ALIVE_INTERVAL, RetryPolicy, SessionManager, SystemClock};
pub use signing::{KeyAlgorithm, KeyPair, KeyType, SigningKey};
