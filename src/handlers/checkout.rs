use axum::{
    extract::{Json, Path, State},
    response::IntoResponse,
    routing::post,
    Router,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::handlers::common::{created_response, success_response};
use crate::{
    errors::ServiceError,
    services::checkout::{BeginCheckoutInput, PaymentConfirmation},
    AppState,
};

/// Creates the router for the two-step checkout endpoints
pub fn checkout_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/:customer_id", post(begin_checkout))
        .route("/:customer_id/confirm", post(confirm_checkout))
}

/// Lock the cart, quote it, and create a payment intent (or commit
/// immediately for cash on delivery)
async fn begin_checkout(
    State(state): State<Arc<AppState>>,
    Path(customer_id): Path<Uuid>,
    Json(payload): Json<BeginCheckoutInput>,
) -> Result<impl IntoResponse, ServiceError> {
    let outcome = state
        .services
        .checkout
        .begin_checkout(customer_id, payload)
        .await?;
    Ok(success_response(outcome))
}

/// Verify the signed payment confirmation and commit the order
async fn confirm_checkout(
    State(state): State<Arc<AppState>>,
    Path(customer_id): Path<Uuid>,
    Json(payload): Json<PaymentConfirmation>,
) -> Result<impl IntoResponse, ServiceError> {
    let order = state
        .services
        .checkout
        .confirm_checkout(customer_id, payload)
        .await?;
    Ok(created_response(order))
}
