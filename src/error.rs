//! Error types for the bucket cache
//!
//! Provides unified error handling using thiserror.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::models::ErrorResponse;

// == Cache Error Enum ==
/// Unified error type for the cache core, the collector and the HTTP surface.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Bad key or bucket argument shape. Always surfaced to the caller.
    #[error("Invalid argument: {0}")]
    Validation(String),

    /// Key not found in cache (HTTP surface only; the engine reports misses as `None`)
    #[error("Key not found: {0}")]
    NotFound(String),

    /// The backing store cannot be reached
    #[error("Backend unavailable")]
    BackendUnavailable,

    /// A single atomic step failed
    #[error("Operation failed: {0}")]
    Operation(String),

    /// Another token now owns the lease
    #[error("Lease lost: {0}")]
    LeaseLost(String),

    /// A garbage collection pass failed
    #[error("Sweep failed: {0}")]
    Sweep(String),

    /// Value could not be serialized or a stored record could not be decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CacheError {
    /// Returns true for argument-shape errors, the only errors callers must see.
    pub fn is_validation(&self) -> bool {
        matches!(self, CacheError::Validation(_))
    }
}

// == IntoResponse Implementation ==
impl IntoResponse for CacheError {
    fn into_response(self) -> Response {
        let status = match &self {
            CacheError::Validation(_) => StatusCode::BAD_REQUEST,
            CacheError::NotFound(_) => StatusCode::NOT_FOUND,
            CacheError::BackendUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            CacheError::Operation(_)
            | CacheError::LeaseLost(_)
            | CacheError::Sweep(_)
            | CacheError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(ErrorResponse::new(self.to_string()));

        (status, body).into_response()
    }
}

// == Result Type Alias ==
/// Convenience Result type for the bucket cache.
pub type Result<T> = std::result::Result<T, CacheError>;
