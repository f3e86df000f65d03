use diesel_async::pooled_connection::PoolError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PricingError {
    #[error("no price model coefficients have been stored yet")]
    NoCoefficients,

    #[error("product {0} not found")]
    ProductNotFound(i32),

    #[error("not enough observations to train: need {required}, have {available}")]
    InsufficientObservations { required: usize, available: usize },

    #[error("degenerate model fit: {0}")]
    DegenerateFit(String),

    #[error("model produced an unusable price {price} for product {product_id}")]
    InvalidPrice { product_id: i32, price: f64 },

    #[error("broadcast manager has shut down")]
    BroadcastClosed,

    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] bb8::RunError<PoolError>),
}

pub type PricingResult<T> = std::result::Result<T, PricingError>;
