//! Storefront API Library
//!
//! Order-fulfillment backend for an online storefront. The core is the
//! checkout consistency engine: cart locking, server-side price derivation,
//! atomic stock reservation, two-phase payment-then-order commit, and the
//! order status state machine with its compensating actions.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod services;

use axum::Router;
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::services::payment_gateway::PaymentGateway;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: Arc<config::AppConfig>,
    pub event_sender: Arc<events::EventSender>,
    pub services: handlers::AppServices,
}

impl AppState {
    /// Wires every service against one database pool, event channel, and
    /// payment gateway.
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: Arc<config::AppConfig>,
        event_sender: Arc<events::EventSender>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        let stock = services::StockLedger::new(db.clone(), event_sender.clone());
        let carts = services::CartService::new(db.clone(), event_sender.clone(), config.clone());
        let validator = services::CartValidator::new(db.clone());
        let orders = Arc::new(services::OrderService::new(
            db.clone(),
            event_sender.clone(),
            stock.clone(),
            gateway.clone(),
            config.currency.clone(),
        ));
        let checkout = services::CheckoutService::new(
            db.clone(),
            config.clone(),
            event_sender.clone(),
            carts.clone(),
            validator,
            stock.clone(),
            orders.clone(),
            gateway,
        );

        Self {
            db,
            config,
            event_sender,
            services: handlers::AppServices {
                carts,
                checkout,
                orders,
                stock,
            },
        }
    }
}

/// Assembles the HTTP router over the application state.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api/v1/carts", handlers::carts::carts_routes())
        .nest("/api/v1/checkout", handlers::checkout::checkout_routes())
        .nest("/api/v1/orders", handlers::orders::orders_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
