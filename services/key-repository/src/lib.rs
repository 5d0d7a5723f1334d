//! Key Repository Service
//!
//! Stores key pairs with their private halves wrapped by an HSM-held RSA key
//! and signs messages with them on request.
//!
//! Endpoints:
//! - `POST /key/store`: wrap and store a supplied key pair
//! - `POST /key/generate`, `POST /key/generate/rsa`: generate and store
//! - `POST /key/sign`: sign with a stored key

#![cfg_attr(
    test,
    allow(clippy::unwrap_used, clippy::expect_used, clippy::unwrap_in_result)
)]

pub mod config;
pub mod handlers;
pub mod server;

pub use config::{Config, ConfigError, HsmBackend};
