pub mod carts;
pub mod checkout;
pub mod common;
pub mod orders;

use std::sync::Arc;

use crate::services::{CartService, CheckoutService, OrderService, StockLedger};

/// Service container threaded through handler state.
#[derive(Clone)]
pub struct AppServices {
    pub carts: CartService,
    pub checkout: CheckoutService,
    pub orders: Arc<OrderService>,
    pub stock: StockLedger,
}
