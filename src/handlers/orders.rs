use axum::{
    extract::{Json, Path, State},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::handlers::common::success_response;
use crate::{entities::order::OrderStatus, errors::ServiceError, AppState};

/// Creates the router for order endpoints
pub fn orders_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/:id", get(get_order))
        .route("/number/:order_number", get(get_order_by_number))
        .route("/:id/items", get(get_order_items))
        .route("/:id/history", get(get_status_history))
        .route("/:id/status", post(update_status))
        .route("/:id/cancel", post(cancel_order))
}

async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let order = state.services.orders.get_order(id).await?;
    Ok(success_response(order))
}

async fn get_order_by_number(
    State(state): State<Arc<AppState>>,
    Path(order_number): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let order = state
        .services
        .orders
        .get_by_order_number(&order_number)
        .await?;
    Ok(success_response(order))
}

async fn get_order_items(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let items = state.services.orders.order_items(id).await?;
    Ok(success_response(items))
}

async fn get_status_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let history = state.services.orders.status_history(id).await?;
    Ok(success_response(history))
}

/// Apply a state-machine transition to the order
async fn update_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateStatusRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let order = state
        .services
        .orders
        .transition(
            id,
            payload.status,
            payload.actor.as_deref().unwrap_or("admin"),
            payload.note,
        )
        .await?;
    Ok(success_response(order))
}

/// Cancel the order (restocks pre-shipment lines, initiates refund if paid)
async fn cancel_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CancelRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let order = state
        .services
        .orders
        .cancel(
            id,
            payload.actor.as_deref().unwrap_or("customer"),
            payload.note,
        )
        .await?;
    Ok(success_response(order))
}

// Request DTOs

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: OrderStatus,
    pub actor: Option<String>,
    pub note: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct CancelRequest {
    pub actor: Option<String>,
    pub note: Option<String>,
}
