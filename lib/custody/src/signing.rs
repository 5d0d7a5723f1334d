//! Key generation and algorithm-dispatched signing
//!
//! - ECDSA: P-256, ECDSA-SHA256, DER signature
//! - RSA: PKCS#1 v1.5 with SHA-256
//!
//! Signatures are returned hex encoded.

use p256::ecdsa::signature::Signer;
use pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rand::rngs::OsRng;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use zeroize::Zeroizing;

use crate::error::CustodyError;

/// Declared algorithm of a stored key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyType {
    #[serde(rename = "ECDSA")]
    Ecdsa,
    #[serde(rename = "RSA")]
    Rsa,
}

impl KeyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::Ecdsa => "ECDSA",
            KeyType::Rsa => "RSA",
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyType {
    type Err = CustodyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ECDSA" => Ok(KeyType::Ecdsa),
            "RSA" => Ok(KeyType::Rsa),
            other => Err(CustodyError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// Algorithm and parameters for generating a key pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    /// ECDSA over P-256.
    Ecdsa,
    Rsa { bits: usize },
}

impl KeyAlgorithm {
    pub const RSA_2048: KeyAlgorithm = KeyAlgorithm::Rsa { bits: 2048 };

    pub fn key_type(&self) -> KeyType {
        match self {
            KeyAlgorithm::Ecdsa => KeyType::Ecdsa,
            KeyAlgorithm::Rsa { .. } => KeyType::Rsa,
        }
    }

    /// Generate a fresh key pair as PEM (PKCS#8 private, SPKI public).
    pub fn generate(&self) -> Result<KeyPair, CustodyError> {
        let (public_key_pem, private_key_pem) = match self {
            KeyAlgorithm::Ecdsa => {
                let signing_key = p256::ecdsa::SigningKey::random(&mut OsRng);
                let private_pem = signing_key
                    .to_pkcs8_pem(LineEnding::LF)
                    .map_err(generate_error)?;
                let public_pem = signing_key
                    .verifying_key()
                    .to_public_key_pem(LineEnding::LF)
                    .map_err(generate_error)?;
                (public_pem, private_pem)
            }
            KeyAlgorithm::Rsa { bits } => {
                let private_key =
                    RsaPrivateKey::new(&mut OsRng, *bits).map_err(generate_error)?;
                let private_pem = private_key
                    .to_pkcs8_pem(LineEnding::LF)
                    .map_err(generate_error)?;
                let public_pem = private_key
                    .to_public_key()
                    .to_public_key_pem(LineEnding::LF)
                    .map_err(generate_error)?;
                (public_pem, private_pem)
            }
        };

        Ok(KeyPair {
            key_type: self.key_type(),
            public_key_pem,
            private_key_pem,
        })
    }
}

fn generate_error(e: impl fmt::Display) -> CustodyError {
    CustodyError::GenerateKey(e.to_string())
}

/// Freshly generated key pair. The private half is wiped on drop.
pub struct KeyPair {
    pub key_type: KeyType,
    pub public_key_pem: String,
    pub private_key_pem: Zeroizing<String>,
}

/// A decrypted private key ready to sign, one variant per supported algorithm.
pub enum SigningKey {
    Ecdsa(p256::ecdsa::SigningKey),
    Rsa(Box<RsaPrivateKey>),
}

impl SigningKey {
    /// Parse a PEM private key of the given type.
    ///
    /// ECDSA accepts PKCS#8 or SEC1, RSA accepts PKCS#8 or PKCS#1.
    pub fn from_pem(key_type: KeyType, pem: &str) -> Result<Self, CustodyError> {
        match key_type {
            KeyType::Ecdsa => {
                if let Ok(key) = p256::ecdsa::SigningKey::from_pkcs8_pem(pem) {
                    return Ok(SigningKey::Ecdsa(key));
                }
                p256::SecretKey::from_sec1_pem(pem)
                    .map(|secret| SigningKey::Ecdsa(secret.into()))
                    .map_err(|e| {
                        CustodyError::Cryptography(format!("Invalid ECDSA private key: {}", e))
                    })
            }
            KeyType::Rsa => {
                if let Ok(key) = RsaPrivateKey::from_pkcs8_pem(pem) {
                    return Ok(SigningKey::Rsa(Box::new(key)));
                }
                RsaPrivateKey::from_pkcs1_pem(pem)
                    .map(|key| SigningKey::Rsa(Box::new(key)))
                    .map_err(|e| {
                        CustodyError::Cryptography(format!("Invalid RSA private key: {}", e))
                    })
            }
        }
    }

    pub fn key_type(&self) -> KeyType {
        match self {
            SigningKey::Ecdsa(_) => KeyType::Ecdsa,
            SigningKey::Rsa(_) => KeyType::Rsa,
        }
    }

    /// Sign `message`, returning the raw signature bytes.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, CustodyError> {
        match self {
            SigningKey::Ecdsa(key) => {
                let signature: p256::ecdsa::Signature = key
                    .try_sign(message)
                    .map_err(|e| CustodyError::Cryptography(e.to_string()))?;
                Ok(signature.to_der().as_bytes().to_vec())
            }
            SigningKey::Rsa(key) => {
                let hashed = Sha256::digest(message);
                RsaPrivateKey::sign(key, Pkcs1v15Sign::new::<Sha256>(), &hashed)
                    .map_err(|e| CustodyError::Cryptography(e.to_string()))
            }
        }
    }
}

/// Dispatch on the stored key type tag and sign `message` with the PEM
/// private key. Unknown tags fail before any key is parsed.
pub fn sign(key_type: &str, private_key_pem: &[u8], message: &[u8]) -> Result<String, CustodyError> {
    let key_type = KeyType::from_str(key_type)?;
    let pem = std::str::from_utf8(private_key_pem)
        .map_err(|_| CustodyError::Cryptography("Private key is not valid UTF-8".into()))?;

    let key = SigningKey::from_pem(key_type, pem)?;
    let signature = key.sign(message)?;
    Ok(hex::encode(signature))
}
