//! IAP JWT verification.
//!
//! # Verification order
//!
//! Checks run strictly in this order and stop at the first failure, so a
//! given token always fails with the same [`AuthError`]:
//!
//! 1. presence
//! 2. structure: three base64url segments, a JSON header with `alg` and `kid`
//! 3. key resolution (ES256 only; any other algorithm looks like an unknown key)
//! 4. ES256 signature
//! 5. `exp` (rejected at or before now) and `iat` (rejected after now), no leeway
//! 6. `iss`
//! 7. `aud` against the [`AudiencePolicy`]
//!
//! Claims are not deserialized until the signature has been checked.

use std::str::FromStr;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::audience::AudiencePolicy;
use super::key_store::{KeyStore, PublicKey};

/// Issuer of every IAP assertion.
pub const IAP_ISSUER: &str = "https://cloud.google.com/iap";

/// The only accepted signature algorithm. Whatever the token header claims,
/// nothing else is ever used to verify it.
pub const IAP_ALGORITHM: Algorithm = Algorithm::ES256;

/// Why a token was rejected.
///
/// Every variant maps to the same `401` for the client; the distinction is
/// for server logs only. Variants raised after the claims were decoded carry
/// the token's email.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// No token was presented.
    #[error("missing token")]
    MissingToken,

    /// Not a well-formed JWT.
    #[error("malformed token: {0}")]
    MalformedToken(&'static str),

    /// The key ID is not in the store, or the algorithm is not ES256.
    #[error("unknown key ID {0:?}")]
    UnknownKeyId(String),

    /// The signature does not verify against the resolved key.
    #[error("invalid signature")]
    SignatureInvalid,

    /// `exp` is at or before the current time.
    #[error("token expired at {expires_at}")]
    Expired {
        /// Email claim, if present.
        email: Option<String>,
        /// `exp` claim (Unix seconds).
        expires_at: i64,
    },

    /// `iat` is after the current time.
    #[error("token issued in the future at {issued_at}")]
    NotYetValid {
        /// Email claim, if present.
        email: Option<String>,
        /// `iat` claim (Unix seconds).
        issued_at: i64,
    },

    /// `iss` is not the IAP issuer.
    #[error("unexpected issuer {issuer:?}")]
    IssuerMismatch {
        /// Email claim, if present.
        email: Option<String>,
        /// Issuer found in the token.
        issuer: String,
    },

    /// `aud` matches no configured audience.
    #[error("audience {audience:?} not allowed")]
    AudienceMismatch {
        /// Email claim, if present.
        email: Option<String>,
        /// Audience(s) found in the token, comma-joined.
        audience: String,
    },
}

impl AuthError {
    /// Email from the token, when claims were decoded before the failure.
    #[must_use]
    pub fn email(&self) -> Option<&str> {
        match self {
            Self::Expired { email, .. }
            | Self::NotYetValid { email, .. }
            | Self::IssuerMismatch { email, .. }
            | Self::AudienceMismatch { email, .. } => email.as_deref(),
            _ => None,
        }
    }

    /// Stable label for structured logs.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::MissingToken => "missing_token",
            Self::MalformedToken(_) => "malformed_token",
            Self::UnknownKeyId(_) => "unknown_key_id",
            Self::SignatureInvalid => "signature_invalid",
            Self::Expired { .. } => "expired",
            Self::NotYetValid { .. } => "not_yet_valid",
            Self::IssuerMismatch { .. } => "issuer_mismatch",
            Self::AudienceMismatch { .. } => "audience_mismatch",
        }
    }
}

/// Claims of a verified token. Lives only as long as the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    /// `kid` header value.
    pub key_id: String,
    /// `sub`; empty when absent.
    pub subject: String,
    /// `email`; empty when absent.
    pub email: String,
    /// `iss`
    pub issuer: String,
    /// `aud`, normalized to a list.
    pub audience: Vec<String>,
    /// `iat` (Unix seconds).
    pub issued_at: i64,
    /// `exp` (Unix seconds).
    pub expires_at: i64,
}

impl Claims {
    fn email(&self) -> Option<String> {
        (!self.email.is_empty()).then(|| self.email.clone())
    }
}

/// The verified identity: the only claim data that leaves the gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Opaque user ID (`sub`).
    #[serde(rename = "sub", default, skip_serializing_if = "String::is_empty")]
    pub subject: String,
    /// User email.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub email: String,
}

impl From<&Claims> for Identity {
    fn from(claims: &Claims) -> Self {
        Self {
            subject: claims.subject.clone(),
            email: claims.email.clone(),
        }
    }
}

/// Header fields we need. Parsed by hand so numeric `kid`s are accepted.
#[derive(Debug, Deserialize)]
struct RawHeader {
    alg: String,
    #[serde(default)]
    kid: Option<KeyId>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum KeyId {
    Text(String),
    Number(serde_json::Number),
}

impl KeyId {
    fn into_string(self) -> String {
        match self {
            Self::Text(s) => s,
            Self::Number(n) => n.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawAudience {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize)]
struct RawClaims {
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    iss: Option<String>,
    #[serde(default)]
    aud: Option<RawAudience>,
    iat: i64,
    exp: i64,
}

/// A token split into its segments.
#[derive(Debug)]
struct TokenParts<'a> {
    /// `header.payload`, the signed message.
    message: &'a str,
    header: Vec<u8>,
    payload: Vec<u8>,
    signature: &'a str,
}

impl<'a> TokenParts<'a> {
    fn split(token: &'a str) -> Result<Self, AuthError> {
        let (message, signature) = token
            .rsplit_once('.')
            .ok_or(AuthError::MalformedToken("expected three segments"))?;
        let (header, payload) = message
            .split_once('.')
            .ok_or(AuthError::MalformedToken("expected three segments"))?;
        if payload.contains('.') {
            return Err(AuthError::MalformedToken("expected three segments"));
        }
        if header.is_empty() || payload.is_empty() || signature.is_empty() {
            return Err(AuthError::MalformedToken("empty segment"));
        }

        let decode = |segment: &str| {
            URL_SAFE_NO_PAD
                .decode(segment)
                .map_err(|_| AuthError::MalformedToken("segment is not base64url"))
        };
        let header = decode(header)?;
        let payload = decode(payload)?;
        decode(signature)?;

        Ok(Self {
            message,
            header,
            payload,
            signature,
        })
    }

    fn header(&self) -> Result<RawHeader, AuthError> {
        serde_json::from_slice(&self.header)
            .map_err(|_| AuthError::MalformedToken("header is not a JWT header"))
    }

    fn claims(&self) -> Result<RawClaims, AuthError> {
        serde_json::from_slice(&self.payload)
            .map_err(|_| AuthError::MalformedToken("payload is not a valid claim set"))
    }
}

/// Verifies IAP assertions against a key store and an audience policy.
#[derive(Debug)]
pub struct Verifier {
    keys: Arc<KeyStore>,
    audiences: AudiencePolicy,
    issuer: String,
}

impl Verifier {
    /// Verifier expecting the IAP issuer.
    #[must_use]
    pub fn new(keys: Arc<KeyStore>, audiences: AudiencePolicy) -> Self {
        Self {
            keys,
            audiences,
            issuer: IAP_ISSUER.to_string(),
        }
    }

    /// Expect a different `iss`.
    #[must_use]
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = issuer.into();
        self
    }

    /// Backing key store.
    #[must_use]
    pub fn key_store(&self) -> &Arc<KeyStore> {
        &self.keys
    }

    /// Audience policy in force.
    #[must_use]
    pub fn audiences(&self) -> &AudiencePolicy {
        &self.audiences
    }

    /// Verify `token` now and return the identity.
    pub async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        self.verify_claims(token).await.map(|c| Identity::from(&c))
    }

    /// Verify `token` now and return all claims.
    pub async fn verify_claims(&self, token: &str) -> Result<Claims, AuthError> {
        self.verify_claims_at(token, Utc::now().timestamp()).await
    }

    /// Verify `token` as of `now` (Unix seconds).
    pub async fn verify_claims_at(&self, token: &str, now: i64) -> Result<Claims, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }

        let parts = TokenParts::split(token)?;
        let header = parts.header()?;
        let algorithm = Algorithm::from_str(&header.alg)
            .map_err(|_| AuthError::MalformedToken("unsupported algorithm"))?;
        let key_id = header
            .kid
            .ok_or(AuthError::MalformedToken("missing kid"))?
            .into_string();

        if algorithm != IAP_ALGORITHM {
            debug!(kid = %key_id, alg = ?algorithm, "Rejecting token with non-ES256 algorithm");
            return Err(AuthError::UnknownKeyId(key_id));
        }
        let key = self
            .keys
            .get(&key_id)
            .await
            .ok_or_else(|| AuthError::UnknownKeyId(key_id.clone()))?;

        verify_signature(&parts, &key)?;

        let raw = parts.claims()?;
        let claims = Claims {
            key_id,
            subject: raw.sub.unwrap_or_default(),
            email: raw.email.unwrap_or_default(),
            issuer: raw.iss.unwrap_or_default(),
            audience: match raw.aud {
                Some(RawAudience::One(aud)) => vec![aud],
                Some(RawAudience::Many(auds)) => auds,
                None => Vec::new(),
            },
            issued_at: raw.iat,
            expires_at: raw.exp,
        };

        if claims.expires_at <= now {
            return Err(AuthError::Expired {
                email: claims.email(),
                expires_at: claims.expires_at,
            });
        }
        if claims.issued_at > now {
            return Err(AuthError::NotYetValid {
                email: claims.email(),
                issued_at: claims.issued_at,
            });
        }
        if claims.issuer != self.issuer {
            return Err(AuthError::IssuerMismatch {
                email: claims.email(),
                issuer: claims.issuer,
            });
        }
        if !claims.audience.iter().any(|aud| self.audiences.matches(aud)) {
            return Err(AuthError::AudienceMismatch {
                email: claims.email(),
                audience: claims.audience.join(","),
            });
        }

        Ok(claims)
    }
}

fn verify_signature(parts: &TokenParts<'_>, key: &PublicKey) -> Result<(), AuthError> {
    let decoding_key = DecodingKey::from_ec_pem(key.as_bytes()).map_err(|e| {
        debug!(error = %e, "Stored public key is not a usable EC key");
        AuthError::SignatureInvalid
    })?;
    match jsonwebtoken::crypto::verify(
        parts.signature,
        parts.message.as_bytes(),
        &decoding_key,
        IAP_ALGORITHM,
    ) {
        Ok(true) => Ok(()),
        Ok(false) | Err(_) => Err(AuthError::SignatureInvalid),
    }
}
