//! Error types for the IAP gateway

use std::io;

use thiserror::Error;

use crate::jwt::{AudienceError, KeyStoreError};

/// Result type alias for the IAP gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway errors.
///
/// Everything here is a startup or serving failure. Per-request token
/// rejections are [`crate::jwt::AuthError`] and never surface as an `Error`.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Audience specification could not be compiled
    #[error("Configuration error: {0}")]
    Audience(#[from] AudienceError),

    /// Initial key population failed or produced no keys
    #[error("Failed to load public keys: {0}")]
    KeyFetch(#[from] KeyStoreError),

    /// TLS setup error
    #[error("TLS error: {0}")]
    Tls(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
