//! Chunked envelope cipher
//!
//! RSA-2048 with OAEP-SHA256 can encrypt at most 190 bytes per operation, so
//! private key material is split into 190-byte blocks, each encrypted on its
//! own. The wire format is the ordered list of ciphertext blocks, each
//! standard-base64 encoded, joined with `.`.
//!
//! The final block is right-padded with zero bytes and decryption strips
//! trailing zeros from every block. Plaintexts whose blocks legitimately end
//! in NUL bytes (never the case for PEM text) do not round-trip.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use std::sync::Arc;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::device::{HsmDevice, HsmSession, KeyClass};
use crate::error::CustodyError;
use crate::session::SessionManager;

/// Largest plaintext block accepted by RSA-2048 OAEP-SHA256.
pub const CHUNK_SIZE: usize = 190;

/// Separator between encoded ciphertext blocks.
pub const CHUNK_SEPARATOR: char = '.';

/// Encrypts private key material for storage and recovers it for signing.
pub trait KeyCipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<String, CustodyError>;

    fn decrypt(&self, ciphertext: &str) -> Result<Zeroizing<Vec<u8>>, CustodyError>;
}

/// Split `plaintext` into zero-padded blocks of [`CHUNK_SIZE`] bytes.
///
/// Empty input yields one all-zero block. An exact multiple of the block size
/// yields no trailing padding block.
pub fn pad_chunks(plaintext: &[u8]) -> Vec<Zeroizing<Vec<u8>>> {
    if plaintext.is_empty() {
        return vec![Zeroizing::new(vec![0u8; CHUNK_SIZE])];
    }

    plaintext
        .chunks(CHUNK_SIZE)
        .map(|chunk| {
            let mut block = Zeroizing::new(vec![0u8; CHUNK_SIZE]);
            block[..chunk.len()].copy_from_slice(chunk);
            block
        })
        .collect()
}

/// `block` without its trailing zero bytes.
pub fn trim_trailing_zeros(block: &[u8]) -> &[u8] {
    let end = block
        .iter()
        .rposition(|&b| b != 0)
        .map_or(0, |last| last + 1);
    &block[..end]
}

/// [`KeyCipher`] backed by the wrapping key pair on an HSM slot.
pub struct ChunkedCipher<D: HsmDevice> {
    sessions: Arc<SessionManager<D>>,
}

impl<D: HsmDevice> ChunkedCipher<D> {
    pub fn new(sessions: Arc<SessionManager<D>>) -> Self {
        Self { sessions }
    }

    /// Current session and the key of `class` on it. A failed lookup gets
    /// exactly one reconnect and one more lookup.
    fn locate(
        &self,
        class: KeyClass,
    ) -> Result<(Arc<D::Session>, <D::Session as HsmSession>::Key), CustodyError> {
        let session = self.sessions.current()?;
        match session.find_key(class) {
            Ok(key) => Ok((session, key)),
            Err(e) => {
                warn!(class = %class, error = %e, "Key lookup failed, reconnecting to HSM");
                let session = self.sessions.reconnect(&session)?;
                let key = session.find_key(class).map_err(|e| match e {
                    CustodyError::Object(_) => e,
                    other => CustodyError::Object(other.to_string()),
                })?;
                Ok((session, key))
            }
        }
    }

    fn encrypt_block(&self, block: &[u8]) -> Result<Vec<u8>, CustodyError> {
        let (session, key) = self.locate(KeyClass::Public)?;
        session.encrypt(key, block)
    }

    fn decrypt_block(&self, block: &[u8]) -> Result<Zeroizing<Vec<u8>>, CustodyError> {
        let (session, key) = self.locate(KeyClass::Private)?;
        session.decrypt(key, block).map(Zeroizing::new)
    }
}

impl<D: HsmDevice> KeyCipher for ChunkedCipher<D> {
    fn encrypt(&self, plaintext: &[u8]) -> Result<String, CustodyError> {
        let blocks = pad_chunks(plaintext);

        let mut encoded = Vec::with_capacity(blocks.len());
        for block in &blocks {
            let ciphertext = self.encrypt_block(block)?;
            encoded.push(BASE64.encode(ciphertext));
        }

        debug!(chunks = encoded.len(), "Encrypted key material");
        Ok(encoded.join(&CHUNK_SEPARATOR.to_string()))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<Zeroizing<Vec<u8>>, CustodyError> {
        let mut plaintext = Zeroizing::new(Vec::new());

        for (index, part) in ciphertext.split(CHUNK_SEPARATOR).enumerate() {
            let block = BASE64.decode(part).map_err(|e| {
                CustodyError::Cryptography(format!("invalid ciphertext block {}: {}", index, e))
            })?;
            let decrypted = self.decrypt_block(&block)?;
            plaintext.extend_from_slice(trim_trailing_zeros(&decrypted));
        }

        debug!("Decrypted key material");
        Ok(plaintext)
    }
}
