//! HSM device boundary
//!
//! A device opens authenticated sessions against one slot. A session exposes
//! key lookup by object class and the RSA-OAEP mechanism (SHA-256 digest,
//! MGF1-SHA256, no label) used for envelope encryption.
//!
//! Two devices are provided:
//! - [`Pkcs11Device`]: a PKCS#11 module loaded through cryptoki
//! - [`SoftwareDevice`]: an in-process RSA-2048 key pair for local use

pub mod pkcs11;
pub mod software;

pub use pkcs11::{Pkcs11Device, Pkcs11Session};
pub use software::{SoftwareDevice, SoftwareSession};

use std::fmt;

use crate::error::CustodyError;

/// Object class used to filter key lookups on a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyClass {
    Public,
    Private,
}

impl fmt::Display for KeyClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyClass::Public => write!(f, "public"),
            KeyClass::Private => write!(f, "private"),
        }
    }
}

/// An authenticated session on one HSM slot.
pub trait HsmSession: Send + Sync {
    /// Handle to a key object found on this session.
    type Key: Copy + Send;

    /// Locate the wrapping key of the given class. Fails with
    /// [`CustodyError::Object`] when no such object is visible.
    fn find_key(&self, class: KeyClass) -> Result<Self::Key, CustodyError>;

    /// Encrypt one block with RSA-OAEP-SHA256.
    fn encrypt(&self, key: Self::Key, plaintext: &[u8]) -> Result<Vec<u8>, CustodyError>;

    /// Decrypt one block with RSA-OAEP-SHA256.
    fn decrypt(&self, key: Self::Key, ciphertext: &[u8]) -> Result<Vec<u8>, CustodyError>;

    /// Log the session out.
    fn logout(&self) -> Result<(), CustodyError> {
        Ok(())
    }
}

/// A device able to open sessions on its slots.
pub trait HsmDevice: Send + Sync + 'static {
    type Session: HsmSession + 'static;

    /// Open a fresh session on the slot at `slot_index` and log in with `pin`.
    ///
    /// Any sessions previously open on the slot are closed first.
    fn open_session(&self, slot_index: usize, pin: &str) -> Result<Self::Session, CustodyError>;
}
