//! Stock Ledger: the oversell-prevention primitive.
//!
//! Every stock mutation goes through the atomic conditional update here;
//! application code never read-modify-writes a variant's stock count. Each
//! applied delta appends an inventory movement row for audit.

use chrono::Utc;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::{
    entities::{
        inventory_movement::{self, MovementType},
        product_variant, InventoryMovement, ProductVariant,
    },
    errors::ServiceError,
    events::{Event, EventSender},
};

/// A (variant, quantity) pair to reserve or release.
#[derive(Debug, Clone, Copy)]
pub struct StockLine {
    pub variant_id: Uuid,
    pub quantity: i32,
}

/// A line that cannot currently be fulfilled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shortfall {
    pub variant_id: Uuid,
    pub requested: i32,
    pub available: i32,
}

#[derive(Clone)]
pub struct StockLedger {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

impl StockLedger {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self { db, event_sender }
    }

    /// Attempts to reserve `quantity` units of a variant.
    ///
    /// The check and the decrement are one conditional UPDATE
    /// (`stock = stock - qty WHERE id = ? AND stock >= qty`), so concurrent
    /// reservations can never drive stock negative. Returns `Ok(false)` when
    /// stock is insufficient; that is a business outcome, not an error.
    #[instrument(skip(self))]
    pub async fn reserve(
        &self,
        variant_id: Uuid,
        quantity: i32,
        order_id: Option<Uuid>,
    ) -> Result<bool, ServiceError> {
        if quantity <= 0 {
            return Err(ServiceError::ValidationError(
                "reservation quantity must be positive".to_string(),
            ));
        }

        let result = ProductVariant::update_many()
            .col_expr(
                product_variant::Column::Stock,
                Expr::col(product_variant::Column::Stock).sub(quantity),
            )
            .col_expr(product_variant::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(product_variant::Column::Id.eq(variant_id))
            .filter(product_variant::Column::Stock.gte(quantity))
            .exec(&*self.db)
            .await?;

        if result.rows_affected == 0 {
            return Ok(false);
        }

        let variant = ProductVariant::find_by_id(variant_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Variant {} not found", variant_id))
            })?;

        self.record_movement(
            variant_id,
            MovementType::Sale,
            quantity,
            variant.stock + quantity,
            variant.stock,
            order_id,
        )
        .await?;

        self.event_sender
            .send_or_log(Event::StockReserved {
                variant_id,
                quantity,
            })
            .await;

        if variant.stock <= variant.low_stock_threshold {
            self.event_sender
                .send_or_log(Event::LowStock {
                    variant_id,
                    remaining: variant.stock,
                })
                .await;
        }

        info!(%variant_id, quantity, remaining = variant.stock, "stock reserved");
        Ok(true)
    }

    /// Returns `quantity` units of a variant to the pool (cancellation,
    /// return, or saga compensation). Unconditional increment.
    #[instrument(skip(self))]
    pub async fn release(
        &self,
        variant_id: Uuid,
        quantity: i32,
        order_id: Option<Uuid>,
        movement_type: MovementType,
    ) -> Result<(), ServiceError> {
        if quantity <= 0 {
            return Err(ServiceError::ValidationError(
                "release quantity must be positive".to_string(),
            ));
        }

        let result = ProductVariant::update_many()
            .col_expr(
                product_variant::Column::Stock,
                Expr::col(product_variant::Column::Stock).add(quantity),
            )
            .col_expr(product_variant::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(product_variant::Column::Id.eq(variant_id))
            .exec(&*self.db)
            .await?;

        if result.rows_affected == 0 {
            return Err(ServiceError::NotFound(format!(
                "Variant {} not found",
                variant_id
            )));
        }

        let variant = ProductVariant::find_by_id(variant_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Variant {} not found", variant_id))
            })?;

        self.record_movement(
            variant_id,
            movement_type,
            quantity,
            variant.stock - quantity,
            variant.stock,
            order_id,
        )
        .await?;

        self.event_sender
            .send_or_log(Event::StockReleased {
                variant_id,
                quantity,
            })
            .await;

        info!(%variant_id, quantity, stock = variant.stock, "stock released");
        Ok(())
    }

    /// All-or-nothing reservation across a batch of lines.
    ///
    /// Reservations are applied one at a time; on the first failure every
    /// already-applied reservation is released before the error returns, so a
    /// partially fulfillable cart never holds stock.
    #[instrument(skip(self, lines), fields(line_count = lines.len()))]
    pub async fn reserve_all(
        &self,
        lines: &[StockLine],
        order_id: Option<Uuid>,
    ) -> Result<(), ServiceError> {
        let mut applied: Vec<StockLine> = Vec::with_capacity(lines.len());

        for line in lines {
            let outcome = self.reserve(line.variant_id, line.quantity, order_id).await;
            match outcome {
                Ok(true) => applied.push(*line),
                Ok(false) => {
                    self.compensate(&applied, order_id).await;
                    return Err(ServiceError::InsufficientStock(format!(
                        "variant {}: requested {} exceeds available stock",
                        line.variant_id, line.quantity
                    )));
                }
                Err(err) => {
                    self.compensate(&applied, order_id).await;
                    return Err(err);
                }
            }
        }

        Ok(())
    }

    /// Releases every reservation applied so far in a failed batch.
    async fn compensate(&self, applied: &[StockLine], order_id: Option<Uuid>) {
        for line in applied {
            if let Err(err) = self
                .release(
                    line.variant_id,
                    line.quantity,
                    order_id,
                    MovementType::Adjustment,
                )
                .await
            {
                // Leaves stock under-counted; surfaced loudly for operators.
                error!(
                    variant_id = %line.variant_id,
                    quantity = line.quantity,
                    error = %err,
                    "failed to compensate reservation"
                );
            }
        }
    }

    /// Non-mutating pre-check: which of these lines cannot be fulfilled right
    /// now? Advisory only — the mutating reservation re-checks atomically.
    #[instrument(skip(self, lines), fields(line_count = lines.len()))]
    pub async fn check_available(
        &self,
        lines: &[StockLine],
    ) -> Result<Vec<Shortfall>, ServiceError> {
        let ids: Vec<Uuid> = lines.iter().map(|l| l.variant_id).collect();
        let variants = ProductVariant::find()
            .filter(product_variant::Column::Id.is_in(ids))
            .all(&*self.db)
            .await?;

        let mut shortfalls = Vec::new();
        for line in lines {
            let available = variants
                .iter()
                .find(|v| v.id == line.variant_id)
                .map(|v| v.stock)
                .unwrap_or(0);
            if available < line.quantity {
                shortfalls.push(Shortfall {
                    variant_id: line.variant_id,
                    requested: line.quantity,
                    available,
                });
            }
        }
        Ok(shortfalls)
    }

    /// Movement history for a variant, newest first. Consumed by analytics.
    pub async fn movements_for_variant(
        &self,
        variant_id: Uuid,
        limit: u64,
    ) -> Result<Vec<inventory_movement::Model>, ServiceError> {
        use sea_orm::QuerySelect;

        let movements = InventoryMovement::find()
            .filter(inventory_movement::Column::VariantId.eq(variant_id))
            .order_by_desc(inventory_movement::Column::CreatedAt)
            .limit(limit)
            .all(&*self.db)
            .await?;
        Ok(movements)
    }

    async fn record_movement(
        &self,
        variant_id: Uuid,
        movement_type: MovementType,
        quantity: i32,
        stock_before: i32,
        stock_after: i32,
        order_id: Option<Uuid>,
    ) -> Result<(), ServiceError> {
        let movement = inventory_movement::ActiveModel {
            id: Set(Uuid::new_v4()),
            variant_id: Set(variant_id),
            movement_type: Set(movement_type),
            quantity: Set(quantity),
            stock_before: Set(stock_before),
            stock_after: Set(stock_after),
            order_id: Set(order_id),
            created_at: Set(Utc::now()),
        };
        movement.insert(&*self.db).await?;
        Ok(())
    }
}
