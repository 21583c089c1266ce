//! Shared fixtures: P-256 keys, signed assertions, mock HTTP servers

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    Router,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use serde_json::{Value, json};

use gcp_iap_auth::jwt::{AudiencePolicy, IAP_ISSUER, KeyStore, PublicKey, Verifier};

/// Audience used across tests
pub const AUDIENCE: &str = "/projects/1/locations/global/backendServices/1";

/// Email carried by [`valid_claims`]
pub const EMAIL: &str = "user@example.com";

/// Subject carried by [`valid_claims`]
pub const SUBJECT: &str = "accounts.google.com:3318417895";

/// A P-256 signing key registered under a key ID
pub struct TestKey {
    pub kid: String,
    pub public_pem: String,
    encoding: EncodingKey,
}

impl TestKey {
    pub fn generate(kid: &str) -> Self {
        let pair = rcgen::KeyPair::generate().unwrap();
        let encoding = EncodingKey::from_ec_pem(pair.serialize_pem().as_bytes()).unwrap();
        Self {
            kid: kid.to_string(),
            public_pem: pair.public_key_pem(),
            encoding,
        }
    }

    /// ES256 token with this key's ID
    pub fn sign(&self, claims: &Value) -> String {
        self.sign_as(&self.kid, claims)
    }

    /// ES256 token signed by this key but claiming another key ID
    pub fn sign_as(&self, kid: &str, claims: &Value) -> String {
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(kid.to_string());
        jsonwebtoken::encode(&header, claims, &self.encoding).unwrap()
    }
}

pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Claims that pass every check for [`AUDIENCE`]
pub fn valid_claims() -> Value {
    json!({
        "iss": IAP_ISSUER,
        "aud": AUDIENCE,
        "iat": now(),
        "exp": now() + 3600,
        "sub": SUBJECT,
        "email": EMAIL,
    })
}

/// `valid_claims` with `overrides` merged in
pub fn claims_with(overrides: Value) -> Value {
    let mut claims = valid_claims();
    if let (Some(base), Some(extra)) = (claims.as_object_mut(), overrides.as_object()) {
        for (k, v) in extra {
            base.insert(k.clone(), v.clone());
        }
    }
    claims
}

/// Public keys document in the IAP endpoint format
pub fn key_document(keys: &[&TestKey]) -> String {
    let map: HashMap<&str, &str> = keys
        .iter()
        .map(|k| (k.kid.as_str(), k.public_pem.as_str()))
        .collect();
    serde_json::to_string(&map).unwrap()
}

/// Verifier over a fixed key set accepting [`AUDIENCE`]
pub fn verifier_with(keys: &[&TestKey]) -> Verifier {
    let set = keys
        .iter()
        .map(|k| (k.kid.clone(), PublicKey::from(k.public_pem.as_str())))
        .collect();
    Verifier::new(
        Arc::new(KeyStore::from_keys(set)),
        AudiencePolicy::parse(AUDIENCE).unwrap(),
    )
}

/// Public keys endpoint whose response can be swapped mid-test
pub struct MockKeyServer {
    pub url: String,
    response: Arc<Mutex<(StatusCode, String)>>,
    delay: Arc<Mutex<Duration>>,
    hits: Arc<AtomicUsize>,
}

impl MockKeyServer {
    pub async fn start(body: String) -> Self {
        let response = Arc::new(Mutex::new((StatusCode::OK, body)));
        let delay = Arc::new(Mutex::new(Duration::ZERO));
        let hits = Arc::new(AtomicUsize::new(0));

        let app = {
            let response = Arc::clone(&response);
            let delay = Arc::clone(&delay);
            let hits = Arc::clone(&hits);
            Router::new().route(
                "/iap/verify/public_key",
                get(move || {
                    let response = Arc::clone(&response);
                    let delay = *delay.lock();
                    let hits = Arc::clone(&hits);
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(delay).await;
                        let (status, body) = response.lock().clone();
                        (status, [(header::CONTENT_TYPE, "application/json")], body)
                            .into_response()
                    }
                }),
            )
        };

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            url: format!("http://{addr}/iap/verify/public_key"),
            response,
            delay,
            hits,
        }
    }

    pub fn set_body(&self, body: String) {
        *self.response.lock() = (StatusCode::OK, body);
    }

    pub fn fail_with(&self, status: StatusCode) {
        self.response.lock().0 = status;
    }

    /// Hold each response for `delay` before answering
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

/// Serve `app` on an ephemeral local port and return its base URL
pub async fn spawn_app(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}
