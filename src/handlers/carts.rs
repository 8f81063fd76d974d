use axum::{
    extract::{Json, Path, State},
    response::IntoResponse,
    routing::{delete, get, post, put},
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use crate::handlers::common::{success_response, validate_input};
use crate::{errors::ServiceError, AppState};

/// Creates the router for cart endpoints
pub fn carts_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/:customer_id", get(get_cart))
        .route("/:customer_id/items", post(add_to_cart))
        .route("/:customer_id/items/:variant_id", put(update_cart_item))
        .route("/:customer_id/items/:variant_id", delete(remove_cart_item))
        .route("/:customer_id/clear", post(clear_cart))
}

/// Get the price-enriched cart for a customer
async fn get_cart(
    State(state): State<Arc<AppState>>,
    Path(customer_id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let cart = state.services.carts.get_cart(customer_id).await?;
    Ok(success_response(cart))
}

/// Add an item to the cart (merges quantity for an existing variant)
async fn add_to_cart(
    State(state): State<Arc<AppState>>,
    Path(customer_id): Path<Uuid>,
    Json(payload): Json<AddItemRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;

    state
        .services
        .carts
        .add_item(customer_id, payload.variant_id, payload.quantity)
        .await?;

    let cart = state.services.carts.get_cart(customer_id).await?;
    Ok(success_response(cart))
}

/// Set a cart line's quantity (0 removes the line)
async fn update_cart_item(
    State(state): State<Arc<AppState>>,
    Path((customer_id, variant_id)): Path<(Uuid, Uuid)>,
    Json(payload): Json<UpdateQuantityRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;

    state
        .services
        .carts
        .update_item_quantity(customer_id, variant_id, payload.quantity)
        .await?;

    let cart = state.services.carts.get_cart(customer_id).await?;
    Ok(success_response(cart))
}

/// Remove a variant's line from the cart
async fn remove_cart_item(
    State(state): State<Arc<AppState>>,
    Path((customer_id, variant_id)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, ServiceError> {
    state
        .services
        .carts
        .remove_item(customer_id, variant_id)
        .await?;

    let cart = state.services.carts.get_cart(customer_id).await?;
    Ok(success_response(cart))
}

/// Empty the cart
async fn clear_cart(
    State(state): State<Arc<AppState>>,
    Path(customer_id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    state.services.carts.clear(customer_id).await?;
    let cart = state.services.carts.get_cart(customer_id).await?;
    Ok(success_response(cart))
}

// Request DTOs

#[derive(Debug, Deserialize, Validate)]
pub struct AddItemRequest {
    pub variant_id: Uuid,
    #[validate(range(min = 1, max = 10))]
    pub quantity: i32,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateQuantityRequest {
    #[validate(range(min = 0, max = 10))]
    pub quantity: i32,
}
