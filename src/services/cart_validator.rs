//! Cart Validator: reconciles cart contents against live catalog state.
//!
//! Non-destructive for routine display; destructive (auto-remove) immediately
//! before checkout so the customer is shown exactly what will be purchased.

use chrono::Utc;
use sea_orm::{
    sea_query::Expr, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::{
    entities::{cart, cart_item, product_variant, Cart, CartItem, ProductVariant},
    errors::ServiceError,
};

/// Why a cart line failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum InvalidReason {
    VariantMissing,
    VariantInactive,
    InsufficientStock { available: i32 },
}

/// A cart line that cannot be purchased as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidCartItem {
    pub variant_id: Uuid,
    pub quantity: i32,
    #[serde(flatten)]
    pub reason: InvalidReason,
}

/// Outcome of validating a cart against live variant state.
#[derive(Debug)]
pub struct CartValidation {
    pub is_valid: bool,
    pub invalid_items: Vec<InvalidCartItem>,
    /// Lines that survived, each paired with the variant they were checked
    /// against so downstream pricing uses the same snapshot.
    pub valid_items: Vec<(cart_item::Model, product_variant::Model)>,
}

#[derive(Clone)]
pub struct CartValidator {
    db: Arc<DatabaseConnection>,
}

impl CartValidator {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Checks every line of the cart: variant exists, is active, and has
    /// stock for the requested quantity. With `auto_remove`, invalid lines
    /// are stripped from the persisted cart (and the version bumped).
    #[instrument(skip(self))]
    pub async fn validate(
        &self,
        cart_id: Uuid,
        auto_remove: bool,
    ) -> Result<CartValidation, ServiceError> {
        let items = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .all(&*self.db)
            .await?;

        let variant_ids: Vec<Uuid> = items.iter().map(|i| i.variant_id).collect();
        let variants = ProductVariant::find()
            .filter(product_variant::Column::Id.is_in(variant_ids))
            .all(&*self.db)
            .await?;

        let mut invalid_items = Vec::new();
        let mut valid_items = Vec::new();

        for item in items {
            match variants.iter().find(|v| v.id == item.variant_id) {
                None => invalid_items.push(InvalidCartItem {
                    variant_id: item.variant_id,
                    quantity: item.quantity,
                    reason: InvalidReason::VariantMissing,
                }),
                Some(v) if !v.is_active => invalid_items.push(InvalidCartItem {
                    variant_id: item.variant_id,
                    quantity: item.quantity,
                    reason: InvalidReason::VariantInactive,
                }),
                Some(v) if v.stock < item.quantity => invalid_items.push(InvalidCartItem {
                    variant_id: item.variant_id,
                    quantity: item.quantity,
                    reason: InvalidReason::InsufficientStock { available: v.stock },
                }),
                Some(v) => valid_items.push((item, v.clone())),
            }
        }

        if auto_remove && !invalid_items.is_empty() {
            let remove_ids: Vec<Uuid> = invalid_items.iter().map(|i| i.variant_id).collect();
            let txn = self.db.begin().await?;
            CartItem::delete_many()
                .filter(cart_item::Column::CartId.eq(cart_id))
                .filter(cart_item::Column::VariantId.is_in(remove_ids))
                .exec(&txn)
                .await?;
            Cart::update_many()
                .col_expr(
                    cart::Column::Version,
                    Expr::col(cart::Column::Version).add(1),
                )
                .col_expr(cart::Column::UpdatedAt, Expr::value(Utc::now()))
                .filter(cart::Column::Id.eq(cart_id))
                .exec(&txn)
                .await?;
            txn.commit().await?;

            info!(
                %cart_id,
                removed = invalid_items.len(),
                "stripped invalid items from cart"
            );
        }

        Ok(CartValidation {
            is_valid: invalid_items.is_empty(),
            invalid_items,
            valid_items,
        })
    }
}
