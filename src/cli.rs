//! Command-line interface

use std::path::PathBuf;
use std::time::Duration;

use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser};

use crate::config::{Config, parse_duration};

/// Cloud IAP auth server and reverse proxy
#[derive(Parser, Debug, Default)]
#[command(name = "gcp-iap-auth")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "GCP_IAP_AUTH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Listen address
    #[arg(long, env = "GCP_IAP_AUTH_LISTEN_ADDR")]
    pub listen_addr: Option<String>,

    /// Listen port (default: 80 for HTTP or 443 for HTTPS)
    #[arg(long, env = "GCP_IAP_AUTH_LISTEN_PORT")]
    pub listen_port: Option<u16>,

    /// Path to TLS server's, intermediate's and CA's PEM certificate
    #[arg(long, env = "GCP_IAP_AUTH_TLS_CERT")]
    pub tls_cert: Option<PathBuf>,

    /// Path to TLS server's PEM key file
    #[arg(long, env = "GCP_IAP_AUTH_TLS_KEY")]
    pub tls_key: Option<PathBuf>,

    /// Comma-separated list of JWT audiences (literal or /regex/)
    #[arg(long, env = "GCP_IAP_AUTH_AUDIENCES")]
    pub audiences: Option<String>,

    /// Path to public keys file
    #[arg(long, env = "GCP_IAP_AUTH_PUBLIC_KEYS")]
    pub public_keys: Option<PathBuf>,

    /// URL to fetch public keys from
    #[arg(long, env = "GCP_IAP_AUTH_PUBLIC_KEYS_URL")]
    pub public_keys_url: Option<String>,

    /// Scheduled key refresh interval (e.g. 1h, 30m; 0 disables)
    #[arg(long, env = "GCP_IAP_AUTH_KEY_REFRESH_INTERVAL", value_parser = parse_duration)]
    pub key_refresh_interval: Option<Duration>,

    /// Minimum interval between refreshes triggered by unknown key IDs
    #[arg(long, env = "GCP_IAP_AUTH_MIN_REFRESH_INTERVAL", value_parser = parse_duration)]
    pub min_refresh_interval: Option<Duration>,

    /// Proxy authenticated requests to the specified URL
    #[arg(long, env = "GCP_IAP_AUTH_BACKEND")]
    pub backend: Option<String>,

    /// Skip verification of the backend's TLS certificate
    #[arg(
        long,
        env = "GCP_IAP_AUTH_BACKEND_INSECURE",
        action = ArgAction::Set,
        num_args = 0..=1,
        require_equals = true,
        default_value_t = false,
        default_missing_value = "true",
        value_parser = BoolishValueParser::new()
    )]
    pub backend_insecure: bool,

    /// In proxy mode, set the authenticated email address in this header
    #[arg(long, env = "GCP_IAP_AUTH_EMAIL_HEADER")]
    pub email_header: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "GCP_IAP_AUTH_LOG_LEVEL")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "GCP_IAP_AUTH_LOG_FORMAT")]
    pub log_format: Option<String>,
}

impl Cli {
    /// Apply flags on top of a loaded configuration.
    pub fn apply(&self, config: &mut Config) {
        if let Some(host) = &self.listen_addr {
            config.server.host.clone_from(host);
        }
        if let Some(port) = self.listen_port {
            config.server.port = Some(port);
        }
        if let Some(cert) = &self.tls_cert {
            config.server.tls_cert = Some(cert.clone());
        }
        if let Some(key) = &self.tls_key {
            config.server.tls_key = Some(key.clone());
        }
        if let Some(audiences) = &self.audiences {
            config.auth.audiences = audiences.split(',').map(str::to_string).collect();
        }
        if let Some(path) = &self.public_keys {
            config.auth.public_keys = Some(path.clone());
        }
        if let Some(url) = &self.public_keys_url {
            config.auth.public_keys_url.clone_from(url);
        }
        if let Some(interval) = self.key_refresh_interval {
            config.auth.refresh_interval = interval;
        }
        if let Some(interval) = self.min_refresh_interval {
            config.auth.min_refresh_interval = interval;
        }
        if let Some(backend) = &self.backend {
            config.proxy.backend = Some(backend.clone());
        }
        if self.backend_insecure {
            config.proxy.insecure = true;
        }
        if let Some(header) = &self.email_header {
            config.proxy.email_header.clone_from(header);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("gcp-iap-auth").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn flags_override_config() {
        let cli = parse(&[
            "--listen-addr",
            "127.0.0.1",
            "--listen-port",
            "8080",
            "--audiences",
            "/projects/1/apps/a,/projects/2/apps/b",
            "--public-keys",
            "/tmp/keys.json",
            "--key-refresh-interval",
            "30m",
            "--min-refresh-interval",
            "250ms",
            "--backend",
            "http://localhost:3000",
            "--backend-insecure",
            "--email-header",
            "X-Email",
        ]);
        let mut config = Config::default();
        cli.apply(&mut config);

        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port(), 8080);
        assert_eq!(config.auth.audiences, vec!["/projects/1/apps/a", "/projects/2/apps/b"]);
        assert_eq!(config.auth.public_keys, Some(PathBuf::from("/tmp/keys.json")));
        assert_eq!(config.auth.refresh_interval, Duration::from_secs(1800));
        assert_eq!(config.auth.min_refresh_interval, Duration::from_millis(250));
        assert_eq!(config.proxy.backend.as_deref(), Some("http://localhost:3000"));
        assert!(config.proxy.insecure);
        assert_eq!(config.proxy.email_header, "X-Email");
    }

    #[test]
    fn absent_flags_leave_config_alone() {
        let mut config = Config::default();
        config.server.host = "10.0.0.1".to_string();
        Cli::default().apply(&mut config);

        assert_eq!(config.server.host, "10.0.0.1");
        assert!(!config.proxy.insecure);
        assert_eq!(config.proxy.email_header, "X-WEBAUTH-USER");
    }

    #[test]
    fn insecure_accepts_boolish_values() {
        assert!(!parse(&[]).backend_insecure);
        assert!(parse(&["--backend-insecure"]).backend_insecure);
        for value in ["1", "true", "yes", "on"] {
            assert!(parse(&[format!("--backend-insecure={value}").as_str()]).backend_insecure);
        }
        for value in ["0", "false", "no", "off"] {
            assert!(!parse(&[format!("--backend-insecure={value}").as_str()]).backend_insecure);
        }
        assert!(Cli::try_parse_from(["gcp-iap-auth", "--backend-insecure=maybe"]).is_err());
    }

    #[test]
    fn rejects_bad_durations() {
        let result = Cli::try_parse_from(["gcp-iap-auth", "--key-refresh-interval", "often"]);
        assert!(result.is_err());
    }
}
