//! Error types for every gateway component and their HTTP mapping.
//!
//! Component errors stay precise; `GatewayError` is what callers see. The
//! mapping never turns one kind into another: each kind keeps a stable
//! `error_type()` string and status code.

use crate::language::{LanguageError, LanguagePair};
use crate::limiter::{QuotaRejection, QuotaResource};
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Model catalog failures.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to fetch model index: {0}")]
    Fetch(String),
    #[error("invalid model index: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("model index IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Model lifecycle failures. Operational: logged, fatal only at startup.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("model {0} is not in the catalog")]
    UnknownModel(LanguagePair),
    #[error("download of {pair} failed: {message}")]
    Download { pair: LanguagePair, message: String },
    #[error("checksum mismatch for {pair}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        pair: LanguagePair,
        expected: String,
        actual: String,
    },
    #[error("not enough disk space to install {0}")]
    DiskFull(LanguagePair),
    #[error("not enough memory to load {pair}: {message}")]
    OutOfMemory { pair: LanguagePair, message: String },
    #[error("model {0} is not installed")]
    NotInstalled(LanguagePair),
    #[error("model {0} is not loaded")]
    NotLoaded(LanguagePair),
    #[error("backend failed to load {pair}: {message}")]
    Backend { pair: LanguagePair, message: String },
    #[error("model storage error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

impl RegistryError {
    /// Stable identifier for the failure kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownModel(_) => "unknown_model",
            Self::Download { .. } => "download_error",
            Self::ChecksumMismatch { .. } => "checksum_mismatch",
            Self::DiskFull(_) => "disk_full",
            Self::OutOfMemory { .. } => "out_of_memory",
            Self::NotInstalled(_) => "not_installed",
            Self::NotLoaded(_) => "not_loaded",
            Self::Backend { .. } => "backend_error",
            Self::Io(_) => "storage_error",
            Self::Catalog(_) => "catalog_error",
        }
    }
}

/// Failures reported by an inference backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InferenceError {
    #[error("inference failed: {0}")]
    Failed(String),
    #[error("language detection failed: {0}")]
    Detection(String),
    #[error("out of memory: {0}")]
    OutOfMemory(String),
}

/// Routing and execution failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("no translation route from {from} to {to}")]
    NoRouteAvailable { from: String, to: String },
    #[error("{0}")]
    InferenceFailure(String),
    #[error("translation did not finish within {0:?}")]
    Timeout(Duration),
    #[error("{0} is not a supported language")]
    UnsupportedLanguage(String),
}

/// Key store failures.
#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("key store error: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("key store lock poisoned")]
    Poisoned,
    #[error("key store directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("key store task failed: {0}")]
    Task(String),
}

/// Authentication failures.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Please provide an API key")]
    MissingKey,
    #[error("Invalid API key")]
    InvalidKey,
    #[error("API key has been revoked")]
    RevokedKey,
    #[error("API key has expired")]
    ExpiredKey,
    #[error(transparent)]
    Store(#[from] KeyStoreError),
}

/// Error returned to gateway callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("Invalid request: {0}")]
    InvalidInput(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{message}")]
    QuotaExceeded {
        message: String,
        retry_after_secs: Option<u64>,
        permanent: bool,
    },
    #[error("{0}")]
    UnsupportedLanguage(String),
    #[error("{0}")]
    NoRouteAvailable(String),
    #[error("Cannot translate text: {0}")]
    InferenceFailure(String),
    #[error("{0}")]
    Timeout(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{message}")]
    Model { kind: &'static str, message: String },
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::FORBIDDEN,
            Self::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::UnsupportedLanguage(_) => StatusCode::BAD_REQUEST,
            Self::NoRouteAvailable(_) => StatusCode::BAD_REQUEST,
            Self::InferenceFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Model { kind, .. } => match *kind {
                "unknown_model" => StatusCode::NOT_FOUND,
                "not_installed" | "not_loaded" => StatusCode::CONFLICT,
                "disk_full" | "out_of_memory" => StatusCode::INSUFFICIENT_STORAGE,
                "download_error" | "checksum_mismatch" | "catalog_error" => StatusCode::BAD_GATEWAY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error type string.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::Unauthorized(_) => "unauthorized",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::UnsupportedLanguage(_) => "unsupported_language",
            Self::NoRouteAvailable(_) => "no_route_available",
            Self::InferenceFailure(_) => "inference_failure",
            Self::Timeout(_) => "timeout",
            Self::NotFound(_) => "not_found",
            Self::Model { kind, .. } => *kind,
            Self::Internal(_) => "internal_error",
        }
    }

    /// Whether the same request may succeed if sent again later.
    pub fn retryable(&self) -> bool {
        match self {
            Self::QuotaExceeded { permanent, .. } => !permanent,
            Self::Timeout(_) | Self::InferenceFailure(_) | Self::Internal(_) => true,
            _ => false,
        }
    }
}

impl From<LanguageError> for GatewayError {
    fn from(err: LanguageError) -> Self {
        match err {
            LanguageError::Unsupported(_) => Self::UnsupportedLanguage(err.to_string()),
            LanguageError::Malformed(_) => Self::InvalidInput(err.to_string()),
        }
    }
}

impl From<RouteError> for GatewayError {
    fn from(err: RouteError) -> Self {
        match err {
            RouteError::NoRouteAvailable { .. } => Self::NoRouteAvailable(err.to_string()),
            RouteError::InferenceFailure(msg) => Self::InferenceFailure(msg),
            RouteError::Timeout(_) => Self::Timeout(err.to_string()),
            RouteError::UnsupportedLanguage(_) => Self::UnsupportedLanguage(err.to_string()),
        }
    }
}

impl From<InferenceError> for GatewayError {
    fn from(err: InferenceError) -> Self {
        match err {
            // Best-effort identification: a failure means we cannot name the language.
            InferenceError::Detection(msg) => {
                Self::UnsupportedLanguage(format!("Could not detect source language: {}", msg))
            }
            other => Self::InferenceFailure(other.to_string()),
        }
    }
}

impl From<AuthError> for GatewayError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Store(inner) => Self::Internal(inner.to_string()),
            other => Self::Unauthorized(other.to_string()),
        }
    }
}

impl From<KeyStoreError> for GatewayError {
    fn from(err: KeyStoreError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<QuotaRejection> for GatewayError {
    fn from(rejection: QuotaRejection) -> Self {
        let resource = match rejection.resource {
            QuotaResource::Requests => "request",
            QuotaResource::Characters => "character",
        };
        let message = if rejection.permanent {
            format!(
                "Slowdown: request needs {} characters but the limit is {} per {}s",
                rejection.requested, rejection.limit, rejection.window.as_secs()
            )
        } else {
            format!(
                "Slowdown: {} limit of {} per {}s reached",
                resource,
                rejection.limit,
                rejection.window.as_secs()
            )
        };
        Self::QuotaExceeded {
            message,
            // Round up so clients never retry before the window rolls.
            retry_after_secs: rejection
                .retry_after
                .map(|d| d.as_secs() + u64::from(d.subsec_nanos() > 0)),
            permanent: rejection.permanent,
        }
    }
}

impl From<RegistryError> for GatewayError {
    fn from(err: RegistryError) -> Self {
        Self::Model {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Error response structure for JSON serialization.
#[derive(Serialize)]
struct ErrorResponseBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    message: String,
    r#type: &'static str,
    retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let retry_after = match &self {
            Self::QuotaExceeded {
                retry_after_secs, ..
            } => *retry_after_secs,
            _ => None,
        };
        let body = ErrorResponseBody {
            error: ErrorDetail {
                message: self.to_string(),
                r#type: self.error_type(),
                retryable: self.retryable(),
                retry_after,
            },
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}
