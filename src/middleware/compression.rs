//! Response compression.
//!
//! Negotiates a coding (gzip, br, deflate) from `Accept-Encoding` using
//! `tower-http`, which also sets `Content-Encoding` and `Vary`. Small bodies,
//! images, gRPC and event streams are left uncompressed. The compressed body
//! is boxed back into [`axum::body::Body`] so every stage shares one
//! response type.

use axum::body::Body;
use axum::http::Response;
use tower::Layer;
use tower::util::MapResponse;
use tower_http::compression::{
    Compression, CompressionBody, CompressionLayer as HttpCompressionLayer,
};

type IntoBody = fn(Response<CompressionBody<Body>>) -> Response<Body>;

/// Service produced by [`CompressionLayer`].
pub type CompressionService<S> = MapResponse<Compression<S>, IntoBody>;

fn into_body(response: Response<CompressionBody<Body>>) -> Response<Body> {
    response.map(Body::new)
}

/// Compression layer.
#[derive(Clone, Default)]
pub struct CompressionLayer {
    negotiate: HttpCompressionLayer,
}

impl CompressionLayer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<S> Layer<S> for CompressionLayer {
    type Service = CompressionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MapResponse::new(self.negotiate.layer(inner), into_body as IntoBody)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::http::Request;
    use axum::http::header::{ACCEPT_ENCODING, CONTENT_ENCODING};
    use std::convert::Infallible;
    use tower::ServiceExt;

    fn large_text() -> String {
        "pipeline ".repeat(200)
    }

    #[tokio::test]
    async fn test_gzip_negotiated() {
        let handler = tower::service_fn(|_req: Request<Body>| async {
            Ok::<_, Infallible>(Response::new(Body::from(large_text())))
        });
        let request = Request::builder()
            .header(ACCEPT_ENCODING, "gzip")
            .body(Body::empty())
            .unwrap();

        let response = CompressionLayer::new()
            .layer(handler)
            .oneshot(request)
            .await
            .unwrap();

        assert_eq!(response.headers()[CONTENT_ENCODING], "gzip");
    }

    #[tokio::test]
    async fn test_identity_without_accept_encoding() {
        let handler = tower::service_fn(|_req: Request<Body>| async {
            Ok::<_, Infallible>(Response::new(Body::from(large_text())))
        });

        let response = CompressionLayer::new()
            .layer(handler)
            .oneshot(Request::new(Body::empty()))
            .await
            .unwrap();

        assert!(!response.headers().contains_key(CONTENT_ENCODING));
    }
}
