//! Key Repository REST API Handlers

use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use custody::{CustodyError, Key, KeyService, KeyType};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;

pub struct AppState {
    pub keys: KeyService,
}

/// Request to store an externally generated key pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreKeyRequest {
    #[serde(default)]
    pub public_key: String,
    #[serde(default)]
    pub private_key: String,
    /// `ECDSA` or `RSA`
    #[serde(default)]
    pub key_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignRequest {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignResponse {
    /// Hex-encoded signature
    pub signature: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub error: String,
}

// ==================== Error Handling ====================

pub struct ApiError(pub StatusCode, pub Json<ErrorResponse>);

impl ApiError {
    fn new(status: StatusCode, code: &str, msg: impl Into<String>) -> Self {
        ApiError(
            status,
            Json(ErrorResponse {
                code: code.to_string(),
                error: msg.into(),
            }),
        )
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        ApiError::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", msg)
    }
}

impl From<CustodyError> for ApiError {
    fn from(e: CustodyError) -> Self {
        let status = match &e {
            CustodyError::KeyNotFound(_) => StatusCode::NOT_FOUND,
            CustodyError::UnsupportedAlgorithm(_) => StatusCode::BAD_REQUEST,
            _ => {
                error!(code = e.code(), "Request failed: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        ApiError::new(status, e.code(), e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, self.1).into_response()
    }
}

fn require(value: &str, field: &str) -> Result<(), ApiError> {
    if value.is_empty() {
        return Err(ApiError::bad_request(format!("{} is required", field)));
    }
    Ok(())
}

// ==================== Handlers ====================

pub async fn home() -> Json<MessageResponse> {
    Json(MessageResponse {
        message: "Hello, I'm Home API".to_string(),
    })
}

/// Health check
pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// Wrap and store a caller-supplied key pair
pub async fn store_key(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StoreKeyRequest>,
) -> Result<(StatusCode, Json<Key>), ApiError> {
    require(&request.public_key, "public_key")?;
    require(&request.private_key, "private_key")?;
    require(&request.key_type, "key_type")?;

    let key_type: KeyType = request.key_type.parse()?;
    let key = state
        .keys
        .store(&request.public_key, &request.private_key, key_type)
        .await?;

    Ok((StatusCode::CREATED, Json(key)))
}

/// Generate and store an ECDSA P-256 key
pub async fn generate_key(
    State(state): State<Arc<AppState>>,
) -> Result<(StatusCode, Json<Key>), ApiError> {
    let key = state.keys.generate().await?;
    Ok((StatusCode::CREATED, Json(key)))
}

/// Generate and store an RSA-2048 key
pub async fn generate_rsa_key(
    State(state): State<Arc<AppState>>,
) -> Result<(StatusCode, Json<Key>), ApiError> {
    let key = state.keys.generate_rsa().await?;
    Ok((StatusCode::CREATED, Json(key)))
}

/// Sign a message with a stored key
pub async fn sign(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SignRequest>,
) -> Result<Json<SignResponse>, ApiError> {
    require(&request.id, "id")?;
    require(&request.message, "message")?;

    let signature = state
        .keys
        .sign(&request.id, request.message.as_bytes())
        .await?;

    Ok(Json(SignResponse {
        signature,
        message: request.message,
    }))
}
