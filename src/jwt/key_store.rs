//! Public key cache for IAP signing keys.
//!
//! # Locking
//!
//! Two independent synchronization domains:
//!
//! - `keys`: a `parking_lot::RwLock` over the key map. Readers hold it only
//!   for a lookup and a cheap `Bytes` clone. Writers swap the whole map in
//!   one assignment, so a reader sees either the old or the new key set.
//! - `refresh_gate`: a `tokio::sync::Mutex` holding the time of the last
//!   refresh attempt. It is held across the fetch, so exactly one refresh
//!   is in flight. Miss-triggered refreshes only `try_lock` it: a miss that
//!   finds a fetch running reads the current map and returns at once.
//!   Startup and scheduled refreshes wait their turn.
//!
//! # Unknown `kid` handling
//!
//! A miss against a dynamic source triggers at most one fetch per
//! `min_refresh_interval`, no matter how many requests present unknown key
//! IDs. The attempt is stamped before fetching so failures are throttled
//! too.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use reqwest::StatusCode;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

/// Google's published IAP signing keys.
pub const DEFAULT_PUBLIC_KEYS_URL: &str = "https://www.gstatic.com/iap/verify/public_key";

/// Minimum spacing between miss-triggered refreshes.
pub const DEFAULT_MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// Timeout for a remote key fetch (connect + response).
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors raised while loading a key set.
#[derive(Debug, thiserror::Error)]
pub enum KeyStoreError {
    /// The key file could not be read.
    #[error("failed to read key file {}: {source}", .path.display())]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Network error (including timeouts) while fetching keys.
    #[error("key fetch failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The key endpoint answered with something other than `200 OK`.
    #[error("key source returned HTTP {0}")]
    Status(StatusCode),

    /// The payload is not a JSON object of key ID to PEM string.
    #[error("invalid key set: {0}")]
    Decode(#[from] serde_json::Error),

    /// The source was readable but contained no usable keys.
    #[error("no public keys found in {0}")]
    Empty(String),
}

/// PEM-encoded public key material, parsed on demand by the verifier.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey(Bytes);

impl PublicKey {
    /// Wrap PEM bytes.
    pub fn new(pem: impl Into<Bytes>) -> Self {
        Self(pem.into())
    }

    /// Raw PEM bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({} bytes)", self.0.len())
    }
}

impl From<String> for PublicKey {
    fn from(pem: String) -> Self {
        Self(Bytes::from(pem))
    }
}

impl From<&str> for PublicKey {
    fn from(pem: &str) -> Self {
        Self(Bytes::copy_from_slice(pem.as_bytes()))
    }
}

/// Key ID → public key.
pub type KeySet = HashMap<String, PublicKey>;

/// Decode a key set document: a JSON object mapping key IDs to PEM strings.
///
/// Entries with an empty value are dropped.
pub fn decode_public_keys(data: &[u8]) -> Result<KeySet, KeyStoreError> {
    let raw: HashMap<String, String> = serde_json::from_slice(data)?;
    Ok(raw
        .into_iter()
        .filter(|(_, pem)| !pem.is_empty())
        .map(|(kid, pem)| (kid, PublicKey::from(pem)))
        .collect())
}

/// Where a [`KeyStore`] gets its keys from.
#[async_trait]
pub trait KeySource: Send + Sync + 'static {
    /// Load the complete key set.
    async fn fetch(&self) -> Result<KeySet, KeyStoreError>;

    /// Whether a lookup miss may trigger a refetch.
    fn is_dynamic(&self) -> bool;

    /// Human-readable location, for logs.
    fn describe(&self) -> String;
}

/// Keys read from a local JSON file. Static: never re-read on a miss.
#[derive(Debug, Clone)]
pub struct FileKeySource {
    path: PathBuf,
}

impl FileKeySource {
    /// Read keys from `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl KeySource for FileKeySource {
    async fn fetch(&self) -> Result<KeySet, KeyStoreError> {
        let data = tokio::fs::read(&self.path)
            .await
            .map_err(|source| KeyStoreError::Io {
                path: self.path.clone(),
                source,
            })?;
        decode_public_keys(&data)
    }

    fn is_dynamic(&self) -> bool {
        false
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Keys fetched over HTTP(S) with a bounded timeout.
#[derive(Debug, Clone)]
pub struct UrlKeySource {
    url: Url,
    http: reqwest::Client,
}

impl UrlKeySource {
    /// Fetch keys from `url`, giving up after `timeout`.
    pub fn new(url: Url, timeout: Duration) -> Result<Self, KeyStoreError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(5)))
            .build()?;
        Ok(Self { url, http })
    }
}

#[async_trait]
impl KeySource for UrlKeySource {
    async fn fetch(&self) -> Result<KeySet, KeyStoreError> {
        debug!(url = %self.url, "Fetching IAP public keys");
        let response = self.http.get(self.url.clone()).send().await?;
        if response.status() != StatusCode::OK {
            return Err(KeyStoreError::Status(response.status()));
        }
        let body = response.bytes().await?;
        decode_public_keys(&body)
    }

    fn is_dynamic(&self) -> bool {
        true
    }

    fn describe(&self) -> String {
        self.url.to_string()
    }
}

/// A fixed, in-memory key set.
#[derive(Debug, Clone, Default)]
pub struct StaticKeySource {
    keys: KeySet,
}

impl StaticKeySource {
    /// Serve exactly `keys`.
    #[must_use]
    pub fn new(keys: KeySet) -> Self {
        Self { keys }
    }
}

#[async_trait]
impl KeySource for StaticKeySource {
    async fn fetch(&self) -> Result<KeySet, KeyStoreError> {
        Ok(self.keys.clone())
    }

    fn is_dynamic(&self) -> bool {
        false
    }

    fn describe(&self) -> String {
        "static key set".to_string()
    }
}

/// Result of a throttled refresh attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A fetch ran and installed this many keys.
    Updated(usize),
    /// A fetch ran and failed; the previous keys remain.
    Failed,
    /// Another refresh is in flight or the last attempt is younger than the
    /// minimum interval; nothing ran.
    Throttled,
}

/// Concurrency-safe key ID → public key cache with throttled refresh.
pub struct KeyStore {
    source: Arc<dyn KeySource>,
    keys: RwLock<KeySet>,
    /// Time of the last refresh attempt. Held for the duration of a fetch.
    refresh_gate: Mutex<Option<Instant>>,
    min_refresh_interval: Duration,
}

impl KeyStore {
    /// Create an empty store over `source`. Call [`refresh`](Self::refresh)
    /// before serving traffic.
    pub fn new(source: Arc<dyn KeySource>, min_refresh_interval: Duration) -> Self {
        Self {
            source,
            keys: RwLock::new(KeySet::new()),
            refresh_gate: Mutex::new(None),
            min_refresh_interval,
        }
    }

    /// A populated store that never refreshes.
    #[must_use]
    pub fn from_keys(keys: KeySet) -> Self {
        let store = Self::new(
            Arc::new(StaticKeySource::new(keys.clone())),
            DEFAULT_MIN_REFRESH_INTERVAL,
        );
        *store.keys.write() = keys;
        store
    }

    /// Source location, for logs.
    #[must_use]
    pub fn source_description(&self) -> String {
        self.source.describe()
    }

    /// Whether the source supports refetching.
    #[must_use]
    pub fn is_dynamic(&self) -> bool {
        self.source.is_dynamic()
    }

    /// Look up `kid` in the cached set only.
    #[must_use]
    pub fn get_cached(&self, kid: &str) -> Option<PublicKey> {
        self.keys.read().get(kid).cloned()
    }

    /// Look up `kid`, refreshing a dynamic source once on a miss.
    ///
    /// The retry happens after the (possibly throttled) refresh attempt
    /// completes. `None` means the key is unknown, not that something broke.
    pub async fn get(&self, kid: &str) -> Option<PublicKey> {
        if let Some(key) = self.get_cached(kid) {
            return Some(key);
        }
        if !self.source.is_dynamic() {
            return None;
        }

        debug!(kid = %kid, "Unknown key ID, attempting refresh");
        self.try_refresh().await;
        self.get_cached(kid)
    }

    /// Fetch and install the full key set, ignoring the throttle.
    ///
    /// Still waits for any in-flight refresh. On failure the current keys
    /// are left untouched and the error is returned for logging.
    pub async fn refresh(&self) -> Result<usize, KeyStoreError> {
        let mut last_attempt = self.refresh_gate.lock().await;
        *last_attempt = Some(Instant::now());
        self.fetch_and_replace().await
    }

    /// Refresh unless an attempt is in flight or ran within
    /// `min_refresh_interval`.
    ///
    /// Never waits for another refresh: callers that lose the race see
    /// [`RefreshOutcome::Throttled`] and the current key set.
    pub async fn try_refresh(&self) -> RefreshOutcome {
        let Ok(mut last_attempt) = self.refresh_gate.try_lock() else {
            debug!(
                source = %self.source.describe(),
                "Key refresh already in flight"
            );
            return RefreshOutcome::Throttled;
        };
        if let Some(at) = *last_attempt
            && at.elapsed() < self.min_refresh_interval
        {
            debug!(
                source = %self.source.describe(),
                "Key refresh throttled"
            );
            return RefreshOutcome::Throttled;
        }
        *last_attempt = Some(Instant::now());

        match self.fetch_and_replace().await {
            Ok(count) => RefreshOutcome::Updated(count),
            Err(e) => {
                warn!(
                    source = %self.source.describe(),
                    error = %e,
                    "Public key refresh failed, keeping existing keys"
                );
                RefreshOutcome::Failed
            }
        }
    }

    /// Whether no keys are loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }

    /// Number of loaded keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    /// Loaded key IDs, sorted.
    #[must_use]
    pub fn key_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.keys.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Caller must hold `refresh_gate`.
    async fn fetch_and_replace(&self) -> Result<usize, KeyStoreError> {
        let fresh = self.source.fetch().await?;
        if fresh.is_empty() {
            return Err(KeyStoreError::Empty(self.source.describe()));
        }

        let count = fresh.len();
        let changed = {
            let mut keys = self.keys.write();
            let changed = *keys != fresh;
            *keys = fresh;
            changed
        };

        if changed {
            info!(
                source = %self.source.describe(),
                keys = count,
                "Loaded IAP public keys"
            );
        }
        Ok(count)
    }
}

impl fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyStore")
            .field("source", &self.source.describe())
            .field("keys", &self.key_ids())
            .field("min_refresh_interval", &self.min_refresh_interval)
            .finish_non_exhaustive()
    }
}
