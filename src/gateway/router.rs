//! HTTP router and handlers

use std::sync::Arc;

use axum::{
    Extension, Router,
    body::Body,
    extract::State,
    handler::Handler,
    http::{Request, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{any, get},
};
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};

use super::auth::{auth_handler, identity_middleware};
use super::proxy::ProxyForwarder;
use crate::jwt::{Identity, Verifier};

/// Shared application state
#[derive(Debug)]
pub struct AppState {
    /// Token verifier
    pub verifier: Arc<Verifier>,
    /// Backend forwarder; `None` serves `/auth` and `/healthz` only
    pub proxy: Option<ProxyForwarder>,
}

/// Create the router
///
/// `/healthz` is never verified. With a backend configured, every other
/// path passes the identity middleware and is proxied; otherwise it is `404`.
pub fn create_router(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route("/healthz", get(health_handler))
        .route("/auth", any(auth_handler));

    if state.proxy.is_some() {
        let guarded = proxy_handler.layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            identity_middleware,
        ));
        router = router.fallback(guarded);
    }

    router
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Liveness probe
async fn health_handler() -> &'static str {
    "ok"
}

/// Fallback handler forwarding verified requests to the backend
async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    request: Request<Body>,
) -> Response {
    match &state.proxy {
        Some(proxy) => proxy.forward(request, &identity).await,
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use axum::http::Method;
    use tower::ServiceExt;

    use super::*;
    use crate::gateway::auth::ASSERTION_HEADER;
    use crate::jwt::{AudiencePolicy, KeyStore};

    fn state(proxy: Option<ProxyForwarder>) -> Arc<AppState> {
        let verifier = Verifier::new(
            Arc::new(KeyStore::from_keys(HashMap::new())),
            AudiencePolicy::parse("/projects/1/apps/test").unwrap(),
        );
        Arc::new(AppState {
            verifier: Arc::new(verifier),
            proxy,
        })
    }

    async fn status(app: Router, method: Method, uri: &str) -> StatusCode {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        app.oneshot(request).await.unwrap().status()
    }

    #[tokio::test]
    async fn healthz_needs_no_token() {
        let app = create_router(state(None));
        assert_eq!(status(app, Method::GET, "/healthz").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn auth_accepts_any_method() {
        for method in [Method::GET, Method::POST, Method::HEAD, Method::PUT] {
            let app = create_router(state(None));
            assert_eq!(
                status(app, method, "/auth").await,
                StatusCode::UNAUTHORIZED
            );
        }
    }

    #[tokio::test]
    async fn unknown_paths_are_not_found_without_backend() {
        let app = create_router(state(None));
        assert_eq!(status(app, Method::GET, "/app").await, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn proxied_paths_require_a_token() {
        let proxy = ProxyForwarder::new("http://127.0.0.1:9", "X-WEBAUTH-USER", false).unwrap();
        let app = create_router(state(Some(proxy)));

        let request = Request::builder()
            .uri("/app")
            .header(ASSERTION_HEADER, "not-a-jwt")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        assert_eq!(
            status(app, Method::GET, "/app").await,
            StatusCode::UNAUTHORIZED
        );
    }
}
