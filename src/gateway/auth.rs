//! IAP assertion handling for inbound requests
//!
//! `/auth` answers with the verified identity; the identity middleware
//! guards proxied routes. Every rejection is a bare `401`: the reason only
//! ever reaches the server log.

use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, SecondsFormat};
use tracing::{info, warn};

use super::router::AppState;
use crate::jwt::{AuthError, Claims, Identity, Verifier};

/// Header IAP puts the signed assertion in.
pub const ASSERTION_HEADER: &str = "x-goog-iap-jwt-assertion";

/// Response header carrying the verified subject.
pub const SUBJECT_HEADER: &str = "x-authenticated-subject";

/// Response header carrying the verified email.
pub const EMAIL_HEADER: &str = "x-authenticated-email";

/// Verify the assertion carried by `headers`.
pub async fn authenticate(verifier: &Verifier, headers: &HeaderMap) -> Result<Claims, AuthError> {
    let token = match headers.get(ASSERTION_HEADER) {
        None => "",
        Some(value) => value
            .to_str()
            .map_err(|_| AuthError::MalformedToken("assertion header is not visible ASCII"))?,
    };
    verifier.verify_claims(token).await
}

/// `/auth` handler
pub async fn auth_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    match authenticate(&state.verifier, &headers).await {
        Ok(claims) => {
            log_authenticated(&claims);
            (
                StatusCode::OK,
                [
                    (SUBJECT_HEADER, header_value(&claims.subject)),
                    (EMAIL_HEADER, header_value(&claims.email)),
                ],
                Json(Identity::from(&claims)),
            )
                .into_response()
        }
        Err(e) => {
            log_rejected(&e, "/auth");
            StatusCode::UNAUTHORIZED.into_response()
        }
    }
}

/// Identity middleware for proxied routes.
///
/// Inserts the verified [`Identity`] into request extensions.
pub async fn identity_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    match authenticate(&state.verifier, request.headers()).await {
        Ok(claims) => {
            log_authenticated(&claims);
            request.extensions_mut().insert(Identity::from(&claims));
            next.run(request).await
        }
        Err(e) => {
            log_rejected(&e, request.uri().path());
            StatusCode::UNAUTHORIZED.into_response()
        }
    }
}

/// Header value for an identity field. Values that cannot be represented
/// in a header are sent empty.
pub(crate) fn header_value(value: &str) -> HeaderValue {
    HeaderValue::from_str(value).unwrap_or_else(|_| {
        warn!(value = %value, "Identity value is not a valid header value");
        HeaderValue::from_static("")
    })
}

fn log_authenticated(claims: &Claims) {
    let expires_at = DateTime::from_timestamp(claims.expires_at, 0)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_else(|| claims.expires_at.to_string());
    info!(
        email = %claims.email,
        subject = %claims.subject,
        expires_at = %expires_at,
        "Authenticated"
    );
}

fn log_rejected(err: &AuthError, path: &str) {
    match err.email() {
        Some(email) => warn!(
            reason = err.reason(),
            email = %email,
            path = %path,
            error = %err,
            "Failed to authenticate"
        ),
        None => warn!(reason = err.reason(), path = %path, error = %err, "Failed to authenticate"),
    }
}
