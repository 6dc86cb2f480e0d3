//! Unified application error model and mapping helpers.
//! Every fallible operation in the identity, migration and answer paths returns one of these
//! variants.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::directory::ResourceKind;

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppError {
    #[error("authorization code is invalid or expired")]
    InvalidOrExpiredCode,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("registration rejected by identity service")]
    RegistrationRejected,
    #[error("no active session")]
    NotSignedIn,
    #[error("{kind:?} {id} not found")]
    ResourceNotFound { kind: ResourceKind, id: String },
    #[error("{message}")]
    TransportOrServiceError { message: String },
    #[error("ownership migration incomplete ({migrated} moved, failed: {failed_kinds:?}): {message}")]
    MigrationPartialFailure { migrated: u64, failed_kinds: Vec<ResourceKind>, message: String },
    #[error("upstream answered with status {status}")]
    UpstreamError { status: u16 },
    #[error("answer stream already exhausted")]
    StreamExhausted,
    #[error("configuration error: {message}")]
    Config { message: String },
}

impl AppError {
    pub fn transport<S: Into<String>>(msg: S) -> Self { AppError::TransportOrServiceError { message: msg.into() } }
    pub fn config<S: Into<String>>(msg: S) -> Self { AppError::Config { message: msg.into() } }

    pub fn code_str(&self) -> &'static str {
        match self {
            AppError::InvalidOrExpiredCode => "invalid_or_expired_code",
            AppError::InvalidCredentials => "invalid_credentials",
            AppError::RegistrationRejected => "registration_rejected",
            AppError::NotSignedIn => "not_signed_in",
            AppError::ResourceNotFound { .. } => "not_found",
            AppError::TransportOrServiceError { .. } => "transport_error",
            AppError::MigrationPartialFailure { .. } => "migration_partial_failure",
            AppError::UpstreamError { .. } => "upstream_error",
            AppError::StreamExhausted => "stream_exhausted",
            AppError::Config { .. } => "config_error",
        }
    }

    /// Map to HTTP status code. Upstream statuses are passed through unchanged.
    pub fn http_status(&self) -> u16 {
        match self {
            AppError::InvalidOrExpiredCode => 400,
            AppError::InvalidCredentials => 401,
            AppError::NotSignedIn => 401,
            AppError::RegistrationRejected => 409,
            AppError::ResourceNotFound { .. } => 404,
            AppError::TransportOrServiceError { .. } => 502,
            AppError::UpstreamError { status } => *status,
            AppError::MigrationPartialFailure { .. }
            | AppError::StreamExhausted
            | AppError::Config { .. } => 500,
        }
    }

    /// Text safe to show an end user. Credential failures never reveal whether the
    /// account exists; transport failures are surfaced verbatim.
    pub fn public_message(&self) -> String {
        match self {
            AppError::InvalidCredentials => "Invalid credentials.".to_string(),
            AppError::RegistrationRejected => "E-mail already registered.".to_string(),
            AppError::InvalidOrExpiredCode => "The sign-in link is invalid or has expired.".to_string(),
            AppError::NotSignedIn => "You are not signed in.".to_string(),
            AppError::ResourceNotFound { .. } => "Not found.".to_string(),
            AppError::TransportOrServiceError { message } => message.clone(),
            AppError::UpstreamError { status } => format!("The answer service failed with status {}.", status),
            AppError::MigrationPartialFailure { .. }
            | AppError::StreamExhausted
            | AppError::Config { .. } => "Internal error.".to_string(),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::TransportOrServiceError { message: err.to_string() }
    }
}
