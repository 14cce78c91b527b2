//! Demo handlers served through the pipeline.
//!
//! - `GET /api/products` - catalog listing (cacheable)
//! - `GET /api/products/{id}` - single product, 404 when unknown
//! - `GET /api/slow?delay_ms=` - sleeps, honouring the request deadline
//! - `GET /api/fail?panic=` - fails, or panics, on purpose

use std::io;
use std::time::Duration;

use axum::Json;
use axum::extract::{Extension, Path, Query};
use serde_json::{Value, json};
use tracing::{debug, instrument};

use crate::error::{HandlerError, HandlerResult};
use crate::middleware::RequestDeadline;
use crate::models::{FailQuery, ListProductsQuery, Product, SlowQuery};

fn catalog() -> Vec<Product> {
    [
        (1, "Mechanical keyboard", 8_900, true),
        (2, "Trackball mouse", 5_400, true),
        (3, "27\" monitor", 32_900, false),
        (4, "USB-C dock", 14_500, true),
        (5, "Desk lamp", 3_900, false),
    ]
    .into_iter()
    .map(|(id, name, price_cents, in_stock)| Product {
        id,
        name: name.to_string(),
        price_cents,
        in_stock,
    })
    .collect()
}

#[instrument]
pub async fn list_products(Query(query): Query<ListProductsQuery>) -> Json<Vec<Product>> {
    let products = catalog()
        .into_iter()
        .filter(|p| !query.in_stock || p.in_stock)
        .take(query.limit.unwrap_or(usize::MAX))
        .collect();

    Json(products)
}

#[instrument]
pub async fn get_product(Path(id): Path<u32>) -> HandlerResult<Json<Product>> {
    catalog()
        .into_iter()
        .find(|p| p.id == id)
        .map(Json)
        .ok_or_else(|| HandlerError::not_found(format!("Product {id} not found")))
}

/// Sleeps for `delay_ms`, stopping early once the request deadline passes.
#[instrument(skip(deadline))]
pub async fn slow(
    Query(query): Query<SlowQuery>,
    deadline: Option<Extension<RequestDeadline>>,
) -> Json<Value> {
    let delay = Duration::from_millis(query.delay_ms);

    if let Some(Extension(deadline)) = deadline {
        tokio::select! {
            _ = deadline.cancellation.cancelled() => {
                debug!(delay_ms = query.delay_ms, "Deadline passed, abandoning work");
            }
            _ = tokio::time::sleep(delay) => {}
        }
    } else {
        tokio::time::sleep(delay).await;
    }

    Json(json!({ "slept_ms": query.delay_ms }))
}

#[instrument]
pub async fn fail(Query(query): Query<FailQuery>) -> HandlerResult<Json<Value>> {
    if query.panic {
        panic!("inventory invariant violated");
    }

    let cause = io::Error::new(
        io::ErrorKind::ConnectionRefused,
        "inventory backend refused connection",
    );
    Err(HandlerError::from_source("Failed to load inventory", cause))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_products_filters() {
        let Json(all) = list_products(Query(ListProductsQuery::default())).await;
        assert_eq!(all.len(), 5);

        let Json(stocked) = list_products(Query(ListProductsQuery {
            limit: Some(2),
            in_stock: true,
        }))
        .await;
        assert_eq!(stocked.len(), 2);
        assert!(stocked.iter().all(|p| p.in_stock));
    }

    #[tokio::test]
    async fn test_unknown_product_is_404() {
        let err = get_product(Path(99)).await.unwrap_err();
        assert_eq!(err.status(), Some(axum::http::StatusCode::NOT_FOUND));
        assert_eq!(err.message(), "Product 99 not found");
    }

    #[tokio::test]
    async fn test_fail_keeps_source() {
        let err = fail(Query(FailQuery::default())).await.unwrap_err();
        assert!(err.status().is_none());
        assert!(std::error::Error::source(&err).is_some());
    }
}
