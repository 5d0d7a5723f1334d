//! Custody Error Types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CustodyError {
    #[error("HSM initialize error: {0}")]
    Initialize(String),

    #[error("HSM slot error: {0}")]
    Slot(String),

    #[error("HSM session error: {0}")]
    Session(String),

    #[error("HSM login error: {0}")]
    Login(String),

    #[error("HSM logout error: {0}")]
    Logout(String),

    #[error("HSM object error: {0}")]
    Object(String),

    #[error("Cryptography error: {0}")]
    Cryptography(String),

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Key generation failed: {0}")]
    GenerateKey(String),

    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CustodyError {
    /// Stable machine-readable code for the transport layer.
    pub fn code(&self) -> &'static str {
        match self {
            CustodyError::Initialize(_) => "HSM_INITIALIZE_ERROR",
            CustodyError::Slot(_) => "HSM_SLOT_ERROR",
            CustodyError::Session(_) => "HSM_SESSION_ERROR",
            CustodyError::Login(_) => "HSM_LOGIN_ERROR",
            CustodyError::Logout(_) => "HSM_LOGOUT_ERROR",
            CustodyError::Object(_) => "HSM_OBJECT_ERROR",
            CustodyError::Cryptography(_) => "HSM_RSA_CRYPTOGRAPHY_ERROR",
            CustodyError::KeyNotFound(_) => "KEY_NOT_FOUND",
            CustodyError::Storage(_) => "DB_ERROR",
            CustodyError::GenerateKey(_) => "GENERATE_KEY_ERROR",
            CustodyError::UnsupportedAlgorithm(_) => "UNSUPPORTED_ALGORITHM",
            CustodyError::Internal(_) => "INTERNAL_SERVER_ERROR",
        }
    }
}

impl From<serde_json::Error> for CustodyError {
    fn from(e: serde_json::Error) -> Self {
        CustodyError::Storage(e.to_string())
    }
}

impl From<std::io::Error> for CustodyError {
    fn from(e: std::io::Error) -> Self {
        CustodyError::Storage(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_error_display() {
        let err = CustodyError::Session("CKR_SESSION_HANDLE_INVALID".to_string());
        assert_eq!(
            err.to_string(),
            "HSM session error: CKR_SESSION_HANDLE_INVALID"
        );
    }

    #[test]
    fn test_key_not_found_display() {
        let err = CustodyError::KeyNotFound("abc".to_string());
        assert_eq!(err.to_string(), "Key not found: abc");
    }

    #[test]
    fn test_codes_are_distinct_for_storage_faults() {
        assert_eq!(CustodyError::KeyNotFound("x".into()).code(), "KEY_NOT_FOUND");
        assert_eq!(CustodyError::Storage("x".into()).code(), "DB_ERROR");
    }

    #[test]
    fn test_io_error_maps_to_storage() {
        let err: CustodyError = std::io::Error::other("disk full").into();
        assert!(matches!(err, CustodyError::Storage(_)));
    }
}
