//! Cloud IAP auth gateway
//!
//! Verifies the signed assertions Google Cloud Identity-Aware Proxy attaches
//! to requests (`x-goog-iap-jwt-assertion`) and either answers auth
//! subrequests on `/auth` or reverse-proxies verified traffic to a backend
//! with the user's email in a trusted header.
//!
//! # Components
//!
//! - [`jwt::KeyStore`]: IAP public keys by key ID, refreshed on unknown IDs
//!   with throttling and on a schedule
//! - [`jwt::AudiencePolicy`]: compiled, anchored audience matcher
//! - [`jwt::Verifier`]: ordered ES256 verification pipeline
//! - [`gateway::Gateway`]: HTTP(S) server, `/auth`, `/healthz`, proxy mode

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod jwt;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` takes precedence over `level`. `format` of `json` selects
/// structured output.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| Error::Config(format!("Invalid log level {level:?}: {e}")))?;

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string()))?,
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string()))?,
    }

    Ok(())
}
