use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel_async::pooled_connection::PoolError;
use thiserror::Error;

/// Name of the partial unique index that allows one pending order per customer.
pub const ONE_PENDING_ORDER_INDEX: &str = "orders_one_pending_per_customer";

#[derive(Error, Debug)]
pub enum CheckoutError {
    #[error("customer {0} has no active cart")]
    NoActiveCart(i32),

    #[error("cart of customer {0} has no unprocessed items")]
    EmptyCart(i32),

    #[error("customer {0} already has a pending order")]
    DuplicatePendingOrder(i32),

    #[error("customer {0} has no pending order")]
    NoPendingOrder(i32),

    #[error("insufficient stock for product {product_id}: have {available}, requested {requested}")]
    InsufficientStock {
        product_id: i32,
        available: i32,
        requested: i32,
    },

    #[error("product {0} has no price or stock record")]
    ProductUnavailable(i32),

    #[error("database error: {0}")]
    Database(#[from] DieselError),

    #[error("connection pool error: {0}")]
    Pool(#[from] bb8::RunError<PoolError>),
}

impl CheckoutError {
    /// Turns a violation of the single-pending-order index into the typed
    /// error for `customer_id`; anything else passes through.
    pub fn from_order_insert(customer_id: i32, err: DieselError) -> Self {
        match &err {
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info)
                if info.constraint_name() == Some(ONE_PENDING_ORDER_INDEX) =>
            {
                CheckoutError::DuplicatePendingOrder(customer_id)
            }
            _ => CheckoutError::Database(err),
        }
    }
}

pub type CheckoutResult<T> = std::result::Result<T, CheckoutError>;
