//! Configuration management
//!
//! Layers, lowest precedence first: built-in defaults, the YAML file given
//! with `--config`, nested environment variables (`GCP_IAP_AUTH_AUTH__ISSUER`,
//! `GCP_IAP_AUTH_SERVER__PORT`, ...), then command-line flags and their flat
//! `GCP_IAP_AUTH_*` environment fallbacks (see [`crate::cli`]).

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::gateway::proxy::DEFAULT_EMAIL_HEADER;
use crate::jwt::key_store::{
    DEFAULT_FETCH_TIMEOUT, DEFAULT_MIN_REFRESH_INTERVAL, DEFAULT_PUBLIC_KEYS_URL,
};
use crate::jwt::{AudiencePolicy, IAP_ISSUER};
use crate::{Error, Result};

/// Prefix for nested environment overrides.
pub const ENV_PREFIX: &str = "GCP_IAP_AUTH_";

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener configuration
    pub server: ServerConfig,
    /// Token verification configuration
    pub auth: AuthConfig,
    /// Proxy mode configuration
    pub proxy: ProxyConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to bind to. Defaults to 443 with TLS, 80 without.
    pub port: Option<u16>,
    /// PEM certificate chain
    pub tls_cert: Option<PathBuf>,
    /// PEM private key
    pub tls_key: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl ServerConfig {
    /// Whether the listener serves HTTPS.
    #[must_use]
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() || self.tls_key.is_some()
    }

    /// Effective port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
            .unwrap_or(if self.tls_enabled() { 443 } else { 80 })
    }
}

/// Token verification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Audience specs: literal resource identifiers or `/regex/`.
    /// Accepts a list or a comma-separated string.
    #[serde(with = "string_or_list")]
    pub audiences: Vec<String>,
    /// Static public keys file. Takes precedence over `public_keys_url`.
    pub public_keys: Option<PathBuf>,
    /// Public keys endpoint
    pub public_keys_url: String,
    /// Expected `iss`
    pub issuer: String,
    /// Scheduled key refresh period for URL sources; zero disables it
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,
    /// Minimum spacing between miss-triggered refreshes
    #[serde(with = "humantime_serde")]
    pub min_refresh_interval: Duration,
    /// Key fetch timeout
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            audiences: Vec::new(),
            public_keys: None,
            public_keys_url: DEFAULT_PUBLIC_KEYS_URL.to_string(),
            issuer: IAP_ISSUER.to_string(),
            refresh_interval: Duration::from_secs(3600),
            min_refresh_interval: DEFAULT_MIN_REFRESH_INTERVAL,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }
}

/// Proxy mode configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Backend base URL; proxy mode is off when unset
    pub backend: Option<String>,
    /// Skip upstream TLS certificate verification
    pub insecure: bool,
    /// Header carrying the verified email to the backend
    pub email_header: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            backend: None,
            insecure: false,
            email_header: DEFAULT_EMAIL_HEADER.to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))
    }

    /// Check the configuration before anything is started.
    pub fn validate(&self) -> Result<()> {
        if self.auth.audiences.iter().all(|a| a.trim().is_empty()) {
            return Err(Error::Config("you must specify --audiences".to_string()));
        }

        if self.server.tls_cert.is_some() != self.server.tls_key.is_some() {
            return Err(Error::Config(
                "TLS requires both --tls-cert and --tls-key".to_string(),
            ));
        }

        if self.auth.public_keys.is_none() {
            Url::parse(&self.auth.public_keys_url).map_err(|e| {
                Error::Config(format!(
                    "Invalid public keys URL {:?}: {e}",
                    self.auth.public_keys_url
                ))
            })?;
        }

        if let Some(backend) = &self.proxy.backend {
            let url = Url::parse(backend)
                .map_err(|e| Error::Config(format!("Invalid backend URL {backend:?}: {e}")))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(Error::Config(format!(
                    "Backend URL {backend:?} must use http or https"
                )));
            }
        }

        axum::http::HeaderName::from_bytes(self.proxy.email_header.as_bytes()).map_err(|_| {
            Error::Config(format!(
                "Invalid email header name {:?}",
                self.proxy.email_header
            ))
        })?;

        Ok(())
    }

    /// Compile the audience specs.
    pub fn audience_policy(&self) -> Result<AudiencePolicy> {
        Ok(AudiencePolicy::compile(&self.auth.audiences)?)
    }
}

/// Parse `30s`, `5m`, `100ms`, or bare seconds.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    let scaled = |n: u64, unit: u64| {
        n.checked_mul(unit)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration {s:?} is too large"))
    };
    let parse = |n: &str| {
        n.trim()
            .parse::<u64>()
            .map_err(|e| format!("invalid duration {s:?}: {e}"))
    };

    if let Some(ms) = s.strip_suffix("ms") {
        parse(ms).map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        parse(secs).map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        scaled(parse(mins)?, 60)
    } else if let Some(hours) = s.strip_suffix('h') {
        scaled(parse(hours)?, 3600)
    } else {
        parse(s).map(Duration::from_secs)
    }
}

/// Humantime-style serde helpers for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_nanos() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration (e.g., "30s", "5m", "100ms", 30)
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Secs(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(s) => super::parse_duration(&s).map_err(serde::de::Error::custom),
        }
    }
}

/// Accept a list of strings or one comma-separated string.
mod string_or_list {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(items: &[String], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        items.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            One(String),
            Many(Vec<String>),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::One(s) => s.split(',').map(str::to_string).collect(),
            Raw::Many(v) => v,
        })
    }
}
