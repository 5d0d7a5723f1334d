//! Environment configuration

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use custody::{DEFAULT_KEEP_ALIVE_INTERVAL, RetryPolicy};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{name} must be a valid number: {reason}")]
    InvalidNumber { name: &'static str, reason: String },

    #[error("HSM_BACKEND must be 'pkcs11' or 'software', got '{0}'")]
    InvalidBackend(String),

    #[error("HSM_RECONNECT_ATTEMPTS must be at least 1")]
    NoReconnectAttempts,

    #[error("HSM_KEEP_ALIVE_SECS must be greater than 0")]
    ZeroKeepAlive,
}

/// Where the wrapping key pair lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HsmBackend {
    /// PKCS#11 module loaded from the given path.
    Pkcs11 { library_path: PathBuf },
    /// In-process key pair generated at start-up. Wrapped keys do not
    /// survive a restart.
    Software,
}

#[derive(Clone)]
pub struct Config {
    pub port: u16,
    pub backend: HsmBackend,
    pub slot_index: usize,
    pub pin: String,
    pub keep_alive_interval: Duration,
    pub retry_policy: RetryPolicy,
    /// Directory for the file store; in-memory when unset.
    pub key_store_dir: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str, default: &str| lookup(name).unwrap_or_else(|| default.to_string());

        let backend = match var("HSM_BACKEND", "pkcs11").as_str() {
            "pkcs11" => HsmBackend::Pkcs11 {
                library_path: var("PKCS11_LIBRARY", "/usr/lib/softhsm/libsofthsm2.so").into(),
            },
            "software" => HsmBackend::Software,
            other => return Err(ConfigError::InvalidBackend(other.to_string())),
        };

        let keep_alive_secs: u64 = parse(
            "HSM_KEEP_ALIVE_SECS",
            &var(
                "HSM_KEEP_ALIVE_SECS",
                &DEFAULT_KEEP_ALIVE_INTERVAL.as_secs().to_string(),
            ),
        )?;
        if keep_alive_secs == 0 {
            return Err(ConfigError::ZeroKeepAlive);
        }

        let default_policy = RetryPolicy::default();
        let max_attempts: u32 = parse(
            "HSM_RECONNECT_ATTEMPTS",
            &var(
                "HSM_RECONNECT_ATTEMPTS",
                &default_policy.max_attempts.to_string(),
            ),
        )?;
        if max_attempts == 0 {
            return Err(ConfigError::NoReconnectAttempts);
        }
        let delay_ms: u64 = parse(
            "HSM_RECONNECT_DELAY_MS",
            &var(
                "HSM_RECONNECT_DELAY_MS",
                &default_policy.delay.as_millis().to_string(),
            ),
        )?;

        Ok(Self {
            port: parse("PORT", &var("PORT", "80"))?,
            backend,
            slot_index: parse("HSM_SLOT", &var("HSM_SLOT", "0"))?,
            pin: var("HSM_PIN", "1234"),
            keep_alive_interval: Duration::from_secs(keep_alive_secs),
            retry_policy: RetryPolicy::new(max_attempts, Duration::from_millis(delay_ms)),
            key_store_dir: lookup("KEY_STORE_DIR")
                .filter(|dir| !dir.is_empty())
                .map(PathBuf::from),
        })
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("port", &self.port)
            .field("backend", &self.backend)
            .field("slot_index", &self.slot_index)
            .field("pin", &"<redacted>")
            .field("keep_alive_interval", &self.keep_alive_interval)
            .field("retry_policy", &self.retry_policy)
            .field("key_store_dir", &self.key_store_dir)
            .finish()
    }
}

fn parse<T>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::InvalidNumber {
        name,
        reason: e.to_string(),
    })
}
