mod api;

pub use api::{
    CacheHealth, FailQuery, HealthResponse, ListProductsQuery, Product, RateLimiterHealth,
    SlowQuery,
};
