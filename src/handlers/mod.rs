mod health;
pub mod sample;

pub use health::health_check;
pub use sample::{fail, get_product, list_products, slow};
