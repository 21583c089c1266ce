//! Reverse proxy to the protected backend.
//!
//! Requests reach the backend only after the identity middleware verified
//! their assertion. The backend trusts the identity header solely because
//! this proxy is the only path to it: it must never be reachable from the
//! public network directly.

use axum::body::{Body, HttpBody};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode, header};
use axum::response::{IntoResponse, Response};
use reqwest::redirect::Policy;
use tracing::{debug, warn};
use url::Url;

use super::auth::header_value;
use crate::jwt::Identity;
use crate::{Error, Result};

/// Identity header set on proxied requests unless configured otherwise.
pub const DEFAULT_EMAIL_HEADER: &str = "X-WEBAUTH-USER";

/// Headers scoped to a single connection. Never forwarded.
fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Copy `headers` without hop-by-hop entries, `host`, or anything named in
/// a `Connection` header.
fn end_to_end_headers(headers: &HeaderMap) -> HeaderMap {
    let connection_scoped: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if is_hop_by_hop(name)
            || name == header::HOST
            || connection_scoped.iter().any(|c| c == name.as_str())
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Forwards verified requests to one backend.
#[derive(Debug, Clone)]
pub struct ProxyForwarder {
    client: reqwest::Client,
    backend: Url,
    email_header: HeaderName,
    forwarded_proto: &'static str,
}

impl ProxyForwarder {
    /// Create a forwarder for `backend`.
    ///
    /// `insecure` disables upstream certificate verification and must be an
    /// explicit operator choice.
    pub fn new(backend: &str, email_header: &str, insecure: bool) -> Result<Self> {
        let backend_url = Url::parse(backend)
            .map_err(|e| Error::Config(format!("Invalid backend URL {backend:?}: {e}")))?;
        if !matches!(backend_url.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "Backend URL {backend:?} must use http or https"
            )));
        }
        let email_header = HeaderName::from_bytes(email_header.as_bytes())
            .map_err(|_| Error::Config(format!("Invalid email header name {email_header:?}")))?;

        if insecure {
            warn!(backend = %backend_url, "Upstream TLS certificate verification is DISABLED");
        }

        let client = reqwest::Client::builder()
            .redirect(Policy::none())
            .no_proxy()
            .no_gzip()
            .no_brotli()
            .no_deflate()
            .danger_accept_invalid_certs(insecure)
            .build()?;

        Ok(Self {
            client,
            backend: backend_url,
            email_header,
            forwarded_proto: "http",
        })
    }

    /// Scheme reported in `X-Forwarded-Proto`.
    #[must_use]
    pub fn with_tls(mut self, tls: bool) -> Self {
        self.forwarded_proto = if tls { "https" } else { "http" };
        self
    }

    /// Backend base URL.
    #[must_use]
    pub fn backend(&self) -> &Url {
        &self.backend
    }

    /// Header carrying the verified email.
    #[must_use]
    pub fn email_header(&self) -> &HeaderName {
        &self.email_header
    }

    /// Backend URL for an inbound path and query.
    #[must_use]
    pub fn target_url(&self, path: &str, query: Option<&str>) -> Url {
        let mut url = self.backend.clone();

        let base = self.backend.path().trim_end_matches('/');
        url.set_path(&format!("{base}/{}", path.trim_start_matches('/')));

        let query = query.filter(|q| !q.is_empty());
        let query = match (self.backend.query(), query) {
            (Some(a), Some(b)) if !a.is_empty() && !b.is_empty() => Some(format!("{a}&{b}")),
            (Some(a), None) => Some(a.to_string()),
            (_, b) => b.map(str::to_string),
        };
        url.set_query(query.as_deref());
        url
    }

    /// Forward `request` on behalf of `identity`.
    ///
    /// Upstream failures become `502 Bad Gateway`.
    pub async fn forward(&self, request: Request<Body>, identity: &Identity) -> Response {
        let (parts, body) = request.into_parts();
        let url = self.target_url(parts.uri.path(), parts.uri.query());

        let mut headers = end_to_end_headers(&parts.headers);
        headers.remove(&self.email_header);
        headers.insert(self.email_header.clone(), header_value(&identity.email));

        let forwarded_host = parts
            .headers
            .get(header::HOST)
            .cloned()
            .or_else(|| parts.uri.authority().map(|a| header_value(a.as_str())));
        if let Some(host) = forwarded_host {
            headers.insert(HeaderName::from_static("x-forwarded-host"), host);
        }
        headers.insert(
            HeaderName::from_static("x-forwarded-proto"),
            HeaderValue::from_static(self.forwarded_proto),
        );

        debug!(method = %parts.method, url = %url, email = %identity.email, "Proxying request");

        let mut upstream = self.client.request(parts.method, url).headers(headers);
        if body.size_hint().exact() != Some(0) {
            upstream = upstream.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }

        match upstream.send().await {
            Ok(resp) => {
                let status = resp.status();
                let headers = end_to_end_headers(resp.headers());
                let mut response = Response::new(Body::from_stream(resp.bytes_stream()));
                *response.status_mut() = status;
                *response.headers_mut() = headers;
                response
            }
            Err(e) => {
                warn!(backend = %self.backend, error = %e, "Upstream request failed");
                StatusCode::BAD_GATEWAY.into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forwarder(backend: &str) -> ProxyForwarder {
        ProxyForwarder::new(backend, DEFAULT_EMAIL_HEADER, false).unwrap()
    }

    #[test]
    fn target_url_joins_paths_with_single_slash() {
        let p = forwarder("http://backend:8080");
        assert_eq!(p.target_url("/a/b", None).as_str(), "http://backend:8080/a/b");

        let p = forwarder("http://backend:8080/base/");
        assert_eq!(p.target_url("/a", None).as_str(), "http://backend:8080/base/a");
        assert_eq!(p.target_url("/", None).as_str(), "http://backend:8080/base/");
    }

    #[test]
    fn target_url_preserves_and_merges_queries() {
        let p = forwarder("http://backend/x");
        assert_eq!(
            p.target_url("/y", Some("a=1")).as_str(),
            "http://backend/x/y?a=1"
        );

        let p = forwarder("http://backend/x?fixed=1");
        assert_eq!(
            p.target_url("/y", Some("a=1")).as_str(),
            "http://backend/x/y?fixed=1&a=1"
        );
        assert_eq!(p.target_url("/y", None).as_str(), "http://backend/x/y?fixed=1");
        assert_eq!(p.target_url("/y", Some("")).as_str(), "http://backend/x/y?fixed=1");
    }

    #[test]
    fn rejects_bad_backends_and_header_names() {
        assert!(ProxyForwarder::new("not a url", DEFAULT_EMAIL_HEADER, false).is_err());
        assert!(ProxyForwarder::new("ftp://backend", DEFAULT_EMAIL_HEADER, false).is_err());
        assert!(ProxyForwarder::new("http://backend", "bad header", false).is_err());
    }

    #[test]
    fn strips_hop_by_hop_and_connection_scoped_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("public.example.com"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("close, x-private"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert("x-private", HeaderValue::from_static("1"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("text/html"));
        headers.append("x-multi", HeaderValue::from_static("a"));
        headers.append("x-multi", HeaderValue::from_static("b"));

        let out = end_to_end_headers(&headers);

        assert!(out.get(header::HOST).is_none());
        assert!(out.get(header::CONNECTION).is_none());
        assert!(out.get(header::TRANSFER_ENCODING).is_none());
        assert!(out.get("x-private").is_none());
        assert_eq!(out.get(header::ACCEPT).unwrap(), "text/html");
        assert_eq!(out.get_all("x-multi").iter().count(), 2);
    }

    #[test]
    fn tls_sets_forwarded_proto() {
        assert_eq!(forwarder("http://b").forwarded_proto, "http");
        assert_eq!(forwarder("http://b").with_tls(true).forwarded_proto, "https");
    }
}
