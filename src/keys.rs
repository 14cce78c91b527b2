//! Stable key derivation for the response cache and the rate limiter.
//!
//! Both functions are pure: the same request always yields the same key.

use axum::http::header::{ACCEPT, ACCEPT_LANGUAGE, AUTHORIZATION, COOKIE};
use axum::http::{Method, Request};

use crate::middleware::ip::{TrustedProxyConfig, client_ip};

/// Cache key: method, path, query with parameters sorted, and the content
/// negotiation headers that select a representation.
///
/// `Accept-Encoding` is left out: the cache stores uncompressed
/// bodies and compression runs outside it.
pub fn cache_key<B>(req: &Request<B>) -> String {
    let mut key = format!("{} {}", req.method(), req.uri().path());

    if let Some(query) = req.uri().query().filter(|q| !q.is_empty()) {
        let mut params: Vec<&str> = query.split('&').filter(|p| !p.is_empty()).collect();
        params.sort_unstable();
        key.push('?');
        key.push_str(&params.join("&"));
    }

    for (label, name) in [("accept", ACCEPT), ("accept-language", ACCEPT_LANGUAGE)] {
        if let Some(value) = req.headers().get(&name).and_then(|v| v.to_str().ok()) {
            key.push('|');
            key.push_str(label);
            key.push('=');
            key.push_str(value.trim());
        }
    }

    key
}

/// Default rate-limit key: `ip:<client address>`.
pub fn rate_limit_key<B>(req: &Request<B>, trusted_proxies: &TrustedProxyConfig) -> String {
    format!("ip:{}", client_ip(req, trusted_proxies))
}

/// Namespace a key under a route scope so per-route policies keep separate counters.
pub fn scoped_key(scope: &str, key: &str) -> String {
    format!("{scope}|{key}")
}

/// Whether a request may be answered from, or stored into, the shared cache.
///
/// Only `GET`/`HEAD` qualify, and never when the request carries credentials.
pub fn is_cacheable_request<B>(req: &Request<B>) -> bool {
    matches!(*req.method(), Method::GET | Method::HEAD)
        && !req.headers().contains_key(AUTHORIZATION)
        && !req.headers().contains_key(COOKIE)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[test]
    fn test_cache_key_sorts_query() {
        assert_eq!(
            cache_key(&get("/api/products?b=2&a=1")),
            cache_key(&get("/api/products?a=1&b=2"))
        );
        assert_eq!(cache_key(&get("/api/products?b=2&a=1")), "GET /api/products?a=1&b=2");
    }

    #[test]
    fn test_cache_key_distinguishes_method_and_accept() {
        let head = Request::builder()
            .method(Method::HEAD)
            .uri("/x")
            .body(Body::empty())
            .unwrap();
        assert_ne!(cache_key(&head), cache_key(&get("/x")));

        let json = Request::builder()
            .uri("/x")
            .header(ACCEPT, "application/json")
            .body(Body::empty())
            .unwrap();
        assert_eq!(cache_key(&json), "GET /x|accept=application/json");
    }

    #[test]
    fn test_cache_key_empty_query_ignored() {
        assert_eq!(cache_key(&get("/x?")), "GET /x");
    }

    #[test]
    fn test_rate_limit_key_format() {
        let req = Request::builder()
            .header("x-forwarded-for", "1.2.3.4")
            .body(Body::empty())
            .unwrap();
        assert_eq!(
            rate_limit_key(&req, &TrustedProxyConfig::default()),
            "ip:1.2.3.4"
        );
        assert_eq!(
            rate_limit_key(&get("/"), &TrustedProxyConfig::default()),
            "ip:unknown"
        );
    }

    #[test]
    fn test_scoped_key() {
        assert_eq!(scoped_key("/api/login", "ip:1.2.3.4"), "/api/login|ip:1.2.3.4");
    }

    #[test]
    fn test_cacheable_request() {
        assert!(is_cacheable_request(&get("/x")));

        let post = Request::builder()
            .method(Method::POST)
            .uri("/x")
            .body(Body::empty())
            .unwrap();
        assert!(!is_cacheable_request(&post));

        let authed = Request::builder()
            .uri("/x")
            .header(AUTHORIZATION, "Bearer abc")
            .body(Body::empty())
            .unwrap();
        assert!(!is_cacheable_request(&authed));
    }
}
