use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use shared::models::Order;

use crate::coordinator::{CheckoutCoordinator, OrderWithItems, PaymentReceipt};
use crate::error::CheckoutError;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: CheckoutCoordinator,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/customers/:customer_id/orders", post(generate_order))
        .route("/customers/:customer_id/orders/pending", get(pending_order))
        .route("/customers/:customer_id/orders/pending/cancel", post(cancel_order))
        .route("/customers/:customer_id/payments", post(process_payment))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

pub fn error_response(err: CheckoutError) -> ApiError {
    let status = match &err {
        CheckoutError::NoActiveCart(_)
        | CheckoutError::NoPendingOrder(_)
        | CheckoutError::ProductUnavailable(_) => StatusCode::NOT_FOUND,
        CheckoutError::DuplicatePendingOrder(_) => StatusCode::CONFLICT,
        CheckoutError::EmptyCart(_) | CheckoutError::InsufficientStock { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        CheckoutError::Database(_) | CheckoutError::Pool(_) => {
            tracing::error!("Checkout request failed: {}", err);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

pub async fn generate_order(
    State(state): State<AppState>,
    Path(customer_id): Path<i32>,
) -> Result<(StatusCode, Json<OrderWithItems>), ApiError> {
    let order = state
        .coordinator
        .generate_order(customer_id)
        .await
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(order)))
}

pub async fn pending_order(
    State(state): State<AppState>,
    Path(customer_id): Path<i32>,
) -> Result<Json<OrderWithItems>, ApiError> {
    let order = state
        .coordinator
        .get_order_with_items(customer_id)
        .await
        .map_err(error_response)?;
    Ok(Json(order))
}

pub async fn cancel_order(
    State(state): State<AppState>,
    Path(customer_id): Path<i32>,
) -> Result<Json<Order>, ApiError> {
    let order = state
        .coordinator
        .cancel_order(customer_id)
        .await
        .map_err(error_response)?;
    Ok(Json(order))
}

pub async fn process_payment(
    State(state): State<AppState>,
    Path(customer_id): Path<i32>,
) -> Result<Json<PaymentReceipt>, ApiError> {
    let receipt = state
        .coordinator
        .process_payment(customer_id)
        .await
        .map_err(error_response)?;
    Ok(Json(receipt))
}

pub async fn health_check() -> &'static str {
    "OK"
}
