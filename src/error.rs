use axum::{
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// The application's error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// The identity provider's token was malformed, forged, expired or meant for another client.
    #[error("Invalid identity assertion: {0}")]
    InvalidAssertion(String),

    /// A required setting (client id, signing secret) is missing.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Neither a session token nor an anonymous session accompanied the request.
    #[error("Missing token or anonymous session")]
    MissingIdentity,

    /// The operation requires a valid session token.
    #[error("Missing token")]
    MissingCredential,

    /// The anonymous session already used its free generations.
    #[error("Free usage quota exceeded")]
    QuotaExceeded,

    /// The history database could not be written.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// The captioning backend failed.
    #[error("Caption generation failed: {0}")]
    Generation(String),

    /// A remote image could not be downloaded.
    #[error("Image fetch failed: {0}")]
    ImageFetch(String),

    /// A validation error.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A multipart error.
    #[error("Multipart error: {0}")]
    Multipart(String),

    /// A resource not found error.
    #[error("Resource not found")]
    NotFound,

    /// An internal server error.
    #[error("Internal server error: {0}")]
    Internal(String),
}

/// A `Result` type that uses `AppError` as the error type.
pub type Result<T> = std::result::Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::InvalidAssertion(ref msg) => {
                tracing::warn!("Sign-in rejected: {}", msg);
                (StatusCode::UNAUTHORIZED, "Sign-in failed".to_string())
            }

            AppError::Configuration(ref msg) => {
                tracing::error!("Configuration error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Service is not configured".to_string())
            }

            AppError::MissingIdentity => {
                tracing::debug!("Request without token or anonymous session");
                (StatusCode::UNAUTHORIZED, "Missing token or anon cookie".to_string())
            }

            AppError::MissingCredential => {
                tracing::debug!("Request without valid session token");
                (StatusCode::UNAUTHORIZED, "Missing token".to_string())
            }

            AppError::QuotaExceeded => {
                tracing::info!("Anonymous quota exhausted");
                (
                    StatusCode::FORBIDDEN,
                    "Free generation used - please sign in to continue".to_string(),
                )
            }

            AppError::Persistence(ref msg) => {
                tracing::error!("Persistence error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "History could not be saved".to_string())
            }

            AppError::Generation(ref msg) => {
                tracing::error!("Caption generation failed: {}", msg);
                (StatusCode::BAD_GATEWAY, format!("Caption generation failed: {}", msg))
            }

            AppError::ImageFetch(ref msg) => {
                tracing::warn!("Image fetch failed: {}", msg);
                (StatusCode::BAD_REQUEST, format!("Failed to download image: {}", msg))
            }

            AppError::Validation(ref msg) => {
                tracing::debug!("Validation error: {}", msg);
                (StatusCode::BAD_REQUEST, msg.clone())
            }

            AppError::Multipart(ref msg) => {
                tracing::warn!("Multipart error: {}", msg);
                (StatusCode::BAD_REQUEST, msg.clone())
            }

            AppError::NotFound => {
                tracing::debug!("Resource not found");
                (StatusCode::NOT_FOUND, "Resource not found".to_string())
            }

            AppError::Internal(ref msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = sonic_rs::to_string(&sonic_rs::json!({
            "error": message
        }))
        .unwrap_or_else(|_| r#"{"error":"Internal server error"}"#.to_string());

        (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
    }
}
