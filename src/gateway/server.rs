//! Gateway server

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::proxy::ProxyForwarder;
use super::router::{AppState, create_router};
use crate::config::{AuthConfig, Config};
use crate::jwt::{FileKeySource, KeySource, KeyStore, UrlKeySource, Verifier};
use crate::{Error, Result};

/// Time in-flight requests get to finish once shutdown starts.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// IAP auth gateway
pub struct Gateway {
    /// Configuration
    config: Config,
    /// Shared request state
    state: Arc<AppState>,
    /// Shutdown fan-out for background tasks
    shutdown_tx: broadcast::Sender<()>,
}

impl Gateway {
    /// Create a new gateway.
    ///
    /// Validates the configuration and loads the initial key set. Starting
    /// without trust material is refused: an empty or failed initial load
    /// is [`Error::KeyFetch`].
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let audiences = config.audience_policy()?;
        info!(pattern = %audiences.as_str(), "Matching audiences");

        let keys = Arc::new(build_key_store(&config.auth)?);
        let count = keys.refresh().await?;
        info!(
            keys = count,
            source = %keys.source_description(),
            "Loaded public keys"
        );

        let verifier = Verifier::new(keys, audiences).with_issuer(config.auth.issuer.clone());

        let proxy = match &config.proxy.backend {
            Some(backend) => {
                let proxy = ProxyForwarder::new(
                    backend,
                    &config.proxy.email_header,
                    config.proxy.insecure,
                )?
                .with_tls(config.server.tls_enabled());
                info!(backend = %backend, header = %proxy.email_header(), "Proxying authenticated requests");
                Some(proxy)
            }
            None => None,
        };

        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            config,
            state: Arc::new(AppState {
                verifier: Arc::new(verifier),
                proxy,
            }),
            shutdown_tx,
        })
    }

    /// Shared request state
    #[must_use]
    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Router serving this gateway
    #[must_use]
    pub fn router(&self) -> Router {
        create_router(Arc::clone(&self.state))
    }

    /// Bind the listener. Port `0` picks an ephemeral port.
    pub async fn bind(self) -> Result<BoundGateway> {
        let host: std::net::IpAddr = self
            .config
            .server
            .host
            .parse()
            .map_err(|e| Error::Config(format!("Invalid host: {e}")))?;
        let addr = SocketAddr::new(host, self.config.server.port());

        let tls = match (&self.config.server.tls_cert, &self.config.server.tls_key) {
            (Some(cert), Some(key)) => {
                let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
                let tls = RustlsConfig::from_pem_file(cert, key).await.map_err(|e| {
                    Error::Tls(format!(
                        "Failed to load {} / {}: {e}",
                        cert.display(),
                        key.display()
                    ))
                })?;
                Some(tls)
            }
            _ => None,
        };

        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        Ok(BoundGateway {
            gateway: self,
            listener,
            local_addr,
            tls,
        })
    }

    /// Run until Ctrl+C or SIGTERM.
    pub async fn run(self) -> Result<()> {
        self.bind().await?.serve().await
    }
}

/// A gateway with its listener bound
pub struct BoundGateway {
    gateway: Gateway,
    listener: TcpListener,
    local_addr: SocketAddr,
    tls: Option<RustlsConfig>,
}

impl BoundGateway {
    /// Address actually bound.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until Ctrl+C or SIGTERM.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(shutdown_signal()).await
    }

    /// Serve until `signal` completes.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Self {
            gateway,
            listener,
            local_addr,
            tls,
        } = self;

        let shutdown_tx = gateway.shutdown_tx.clone();
        let refresh_task = spawn_key_refresh(
            Arc::clone(gateway.state.verifier.key_store()),
            gateway.config.auth.refresh_interval,
            shutdown_tx.subscribe(),
        );
        let shutdown = async move {
            signal.await;
            let _ = shutdown_tx.send(());
        };

        let app = gateway.router();

        info!("============================================================");
        info!("CLOUD IAP AUTH v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");

        match tls {
            Some(tls) => {
                info!("Listening on https://{local_addr}");
                let server = axum_server::from_tcp_rustls(listener.into_std()?, tls)?;
                let handle = axum_server::Handle::new();
                let shutdown_handle = handle.clone();
                tokio::spawn(async move {
                    shutdown.await;
                    shutdown_handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
                });
                server
                    .handle(handle)
                    .serve(app.into_make_service())
                    .await?;
            }
            None => {
                info!("Listening on http://{local_addr}");
                axum::serve(listener, app)
                    .with_graceful_shutdown(shutdown)
                    .await
                    .map_err(|e| Error::Internal(e.to_string()))?;
            }
        }

        if let Some(task) = refresh_task {
            let _ = task.await;
        }
        info!("Server stopped");
        Ok(())
    }
}

/// File sources win over URL sources.
fn build_key_store(auth: &AuthConfig) -> Result<KeyStore> {
    let source: Arc<dyn KeySource> = match &auth.public_keys {
        Some(path) => Arc::new(FileKeySource::new(path)),
        None => {
            let url = url::Url::parse(&auth.public_keys_url)
                .map_err(|e| Error::Config(format!("Invalid public keys URL: {e}")))?;
            Arc::new(UrlKeySource::new(url, auth.fetch_timeout)?)
        }
    };
    Ok(KeyStore::new(source, auth.min_refresh_interval))
}

/// Periodically refresh dynamic key sources until shutdown.
fn spawn_key_refresh(
    keys: Arc<KeyStore>,
    period: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Option<JoinHandle<()>> {
    if period.is_zero() || !keys.is_dynamic() {
        debug!("Scheduled key refresh disabled");
        return None;
    }

    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; keys were just loaded.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match keys.refresh().await {
                        Ok(count) => debug!(keys = count, "Scheduled key refresh complete"),
                        Err(e) => warn!(error = %e, "Scheduled key refresh failed, keeping current keys"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    break;
                }
            }
        }
    }))
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn config_with_keys(json: &str) -> (Config, tempfile::NamedTempFile) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();

        let mut config = Config::default();
        config.server.host = "127.0.0.1".to_string();
        config.server.port = Some(0);
        config.auth.audiences = vec!["/projects/1/apps/test".to_string()];
        config.auth.public_keys = Some(file.path().to_path_buf());
        (config, file)
    }

    #[tokio::test]
    async fn refuses_to_start_without_keys() {
        let (config, _file) = config_with_keys("{}");
        let err = Gateway::new(config).await.err().unwrap();
        assert!(matches!(err, Error::KeyFetch(_)));
    }

    #[tokio::test]
    async fn refuses_to_start_with_unreadable_keys() {
        let (mut config, _file) = config_with_keys("{}");
        config.auth.public_keys = Some("/nonexistent/keys.json".into());
        let err = Gateway::new(config).await.err().unwrap();
        assert!(matches!(err, Error::KeyFetch(_)));
    }

    #[tokio::test]
    async fn refuses_to_start_with_bad_audience() {
        let (mut config, _file) = config_with_keys(r#"{"k": "pem"}"#);
        config.auth.audiences = vec!["/projects/x/apps/y".to_string()];
        let err = Gateway::new(config).await.err().unwrap();
        assert!(matches!(err, Error::Audience(_)));
    }

    #[tokio::test]
    async fn binds_ephemeral_port_and_stops_on_signal() {
        let (config, _file) = config_with_keys(r#"{"k": "pem"}"#);
        let gateway = Gateway::new(config).await.unwrap();
        let bound = gateway.bind().await.unwrap();
        assert_ne!(bound.local_addr().port(), 0);

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(bound.serve_with_shutdown(async move {
            let _ = rx.await;
        }));
        tx.send(()).unwrap();

        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn serves_tls_on_the_bound_port() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        std::fs::write(&cert_path, cert.cert.pem()).unwrap();
        std::fs::write(&key_path, cert.signing_key.serialize_pem()).unwrap();

        let (mut config, _file) = config_with_keys(r#"{"k": "pem"}"#);
        config.server.tls_cert = Some(cert_path);
        config.server.tls_key = Some(key_path);
        let bound = Gateway::new(config).await.unwrap().bind().await.unwrap();
        let addr = bound.local_addr();

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(bound.serve_with_shutdown(async move {
            let _ = rx.await;
        }));

        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .no_proxy()
            .build()
            .unwrap();
        let body = client
            .get(format!("https://{addr}/healthz"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "ok");
        drop(client);

        tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn file_sources_get_no_refresh_task() {
        let (config, _file) = config_with_keys(r#"{"k": "pem"}"#);
        let keys = Arc::new(build_key_store(&config.auth).unwrap());
        let (_tx, rx) = broadcast::channel(1);
        assert!(spawn_key_refresh(keys, Duration::from_secs(1), rx).is_none());
    }
}
