//! In-process software device
//!
//! Holds an RSA-2048 wrapping key pair in memory and honours the same
//! slot/PIN contract as a hardware module. Intended for local development.

use rand::rngs::OsRng;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::sync::Arc;
use zeroize::Zeroizing;

use super::{HsmDevice, HsmSession, KeyClass};
use crate::error::CustodyError;

const WRAPPING_KEY_BITS: usize = 2048;

/// Software stand-in for an HSM with a single wrapping key pair.
#[derive(Clone)]
pub struct SoftwareDevice {
    slot_count: usize,
    pin: Arc<Zeroizing<String>>,
    private_key: Arc<RsaPrivateKey>,
    public_key: Arc<RsaPublicKey>,
}

impl SoftwareDevice {
    /// Generate a fresh RSA-2048 wrapping key pair.
    pub fn generate(pin: impl Into<String>) -> Result<Self, CustodyError> {
        let private_key = RsaPrivateKey::new(&mut OsRng, WRAPPING_KEY_BITS)
            .map_err(|e| CustodyError::Initialize(format!("Failed to generate wrapping key: {}", e)))?;
        Ok(Self::from_private_key(private_key, pin))
    }

    pub fn from_private_key(private_key: RsaPrivateKey, pin: impl Into<String>) -> Self {
        let public_key = private_key.to_public_key();
        Self {
            slot_count: 1,
            pin: Arc::new(Zeroizing::new(pin.into())),
            private_key: Arc::new(private_key),
            public_key: Arc::new(public_key),
        }
    }

    /// Number of slots reported by the device (default 1).
    pub fn with_slot_count(mut self, slot_count: usize) -> Self {
        self.slot_count = slot_count;
        self
    }
}

impl HsmDevice for SoftwareDevice {
    type Session = SoftwareSession;

    fn open_session(&self, slot_index: usize, pin: &str) -> Result<SoftwareSession, CustodyError> {
        if slot_index >= self.slot_count {
            return Err(CustodyError::Slot(format!(
                "slot {} not found ({} available)",
                slot_index, self.slot_count
            )));
        }
        if pin != self.pin.as_str() {
            return Err(CustodyError::Login("incorrect PIN".into()));
        }

        Ok(SoftwareSession {
            private_key: self.private_key.clone(),
            public_key: self.public_key.clone(),
        })
    }
}

/// Session on a [`SoftwareDevice`]. Keys are addressed by class.
pub struct SoftwareSession {
    private_key: Arc<RsaPrivateKey>,
    public_key: Arc<RsaPublicKey>,
}

impl HsmSession for SoftwareSession {
    type Key = KeyClass;

    fn find_key(&self, class: KeyClass) -> Result<KeyClass, CustodyError> {
        Ok(class)
    }

    fn encrypt(&self, key: KeyClass, plaintext: &[u8]) -> Result<Vec<u8>, CustodyError> {
        if key != KeyClass::Public {
            return Err(CustodyError::Cryptography(format!(
                "{} key cannot encrypt",
                key
            )));
        }
        self.public_key
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), plaintext)
            .map_err(|e| CustodyError::Cryptography(e.to_string()))
    }

    fn decrypt(&self, key: KeyClass, ciphertext: &[u8]) -> Result<Vec<u8>, CustodyError> {
        if key != KeyClass::Private {
            return Err(CustodyError::Cryptography(format!(
                "{} key cannot decrypt",
                key
            )));
        }
        self.private_key
            .decrypt(Oaep::new::<Sha256>(), ciphertext)
            .map_err(|e| CustodyError::Cryptography(e.to_string()))
    }
}
