//! Cart Store: one mutable cart per customer, priced on read.
//!
//! No price is ever persisted on a cart. Reads enrich each line through the
//! Pricing Oracle from the current variant row, so two reads at different
//! times may legitimately return different totals. The lock flag serializes
//! checkout attempts; mutual exclusion is expressed as conditional UPDATEs
//! because multiple server processes share the store.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait,
    DatabaseConnection, EntityTrait, ModelTrait, QueryFilter, Set, TransactionTrait,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::{
    config::AppConfig,
    entities::{cart, cart_item, product_variant, Cart, CartItem, ProductVariant},
    errors::ServiceError,
    events::{Event, EventSender},
    services::pricing::{self, PricingBreakdown},
};

/// Cart line enriched with prices derived from the current variant.
#[derive(Debug, Clone, Serialize)]
pub struct EnrichedCartItem {
    pub variant_id: Uuid,
    pub sku: Option<String>,
    pub name: Option<String>,
    pub quantity: i32,
    /// False when the variant has vanished or been deactivated since it was
    /// added; such lines carry zero prices and are excluded from totals.
    pub available: bool,
    pub unit_price: Decimal,
    pub discount_amount: Decimal,
    pub final_price: Decimal,
    pub line_total: Decimal,
}

/// Price-enriched cart view returned to callers.
#[derive(Debug, Clone, Serialize)]
pub struct EnrichedCart {
    pub cart_id: Uuid,
    pub customer_id: Uuid,
    pub version: i64,
    pub locked: bool,
    pub items: Vec<EnrichedCartItem>,
    pub pricing: PricingBreakdown,
}

#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    config: Arc<AppConfig>,
}

impl CartService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            db,
            event_sender,
            config,
        }
    }

    fn stale_cutoff(&self) -> DateTime<Utc> {
        Utc::now() - Duration::seconds(self.config.cart_lock_staleness_secs as i64)
    }

    /// Returns the customer's cart, creating it lazily on first use.
    #[instrument(skip(self))]
    pub async fn get_or_create(&self, customer_id: Uuid) -> Result<cart::Model, ServiceError> {
        if let Some(existing) = Cart::find()
            .filter(cart::Column::CustomerId.eq(customer_id))
            .one(&*self.db)
            .await?
        {
            return Ok(existing);
        }

        let cart_id = Uuid::new_v4();
        let now = Utc::now();
        let new_cart = cart::ActiveModel {
            id: Set(cart_id),
            customer_id: Set(customer_id),
            version: Set(0),
            locked: Set(false),
            locked_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };

        match new_cart.insert(&*self.db).await {
            Ok(created) => {
                self.event_sender.send_or_log(Event::CartCreated(cart_id)).await;
                info!(%customer_id, %cart_id, "created cart");
                Ok(created)
            }
            // Another process created the cart between our read and insert;
            // the unique customer_id constraint makes the loser re-read.
            Err(_) => Cart::find()
                .filter(cart::Column::CustomerId.eq(customer_id))
                .one(&*self.db)
                .await?
                .ok_or_else(|| {
                    ServiceError::InternalError(format!(
                        "cart for customer {} neither inserted nor found",
                        customer_id
                    ))
                }),
        }
    }

    /// Looks up the customer's cart without creating one.
    pub async fn find_by_customer(&self, customer_id: Uuid) -> Result<cart::Model, ServiceError> {
        Cart::find()
            .filter(cart::Column::CustomerId.eq(customer_id))
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Cart for customer {} not found", customer_id))
            })
    }

    /// Adds a variant to the cart, merging quantities if the variant is
    /// already present. Exceeding the per-line cap is an error, not a clamp.
    #[instrument(skip(self))]
    pub async fn add_item(
        &self,
        customer_id: Uuid,
        variant_id: Uuid,
        quantity: i32,
    ) -> Result<cart::Model, ServiceError> {
        let cap = self.config.cart_line_quantity_cap;
        if quantity < 1 || quantity > cap {
            return Err(ServiceError::ValidationError(format!(
                "quantity must be between 1 and {}",
                cap
            )));
        }

        let cart = self.get_or_create(customer_id).await?;

        let variant = ProductVariant::find_by_id(variant_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Variant {} not found", variant_id)))?;
        if !variant.is_active {
            return Err(ServiceError::ValidationError(format!(
                "Variant {} is no longer available",
                variant_id
            )));
        }

        let txn = self.db.begin().await?;

        let existing = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .filter(cart_item::Column::VariantId.eq(variant_id))
            .one(&txn)
            .await?;

        match existing {
            Some(item) => {
                let merged = item.quantity + quantity;
                if merged > cap {
                    return Err(ServiceError::ValidationError(format!(
                        "quantity {} exceeds the per-item limit of {}",
                        merged, cap
                    )));
                }
                let mut item: cart_item::ActiveModel = item.into();
                item.quantity = Set(merged);
                item.updated_at = Set(Utc::now());
                item.update(&txn).await?;
            }
            None => {
                let item = cart_item::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    cart_id: Set(cart.id),
                    variant_id: Set(variant_id),
                    quantity: Set(quantity),
                    created_at: Set(Utc::now()),
                    updated_at: Set(Utc::now()),
                };
                item.insert(&txn).await?;
            }
        }

        self.bump_version_unlocked(&txn, cart.id).await?;
        let updated = self.fetch_cart(&txn, cart.id).await?;
        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::CartItemAdded {
                cart_id: cart.id,
                variant_id,
            })
            .await;

        info!(%customer_id, %variant_id, quantity, "added item to cart");
        Ok(updated)
    }

    /// Sets the quantity of an existing cart line. Quantity 0 removes it.
    #[instrument(skip(self))]
    pub async fn update_item_quantity(
        &self,
        customer_id: Uuid,
        variant_id: Uuid,
        quantity: i32,
    ) -> Result<cart::Model, ServiceError> {
        if quantity == 0 {
            return self.remove_item(customer_id, variant_id).await;
        }
        let cap = self.config.cart_line_quantity_cap;
        if quantity < 0 || quantity > cap {
            return Err(ServiceError::ValidationError(format!(
                "quantity must be between 0 and {}",
                cap
            )));
        }

        let cart = self.find_by_customer(customer_id).await?;
        let txn = self.db.begin().await?;

        let item = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .filter(cart_item::Column::VariantId.eq(variant_id))
            .one(&txn)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Variant {} is not in the cart", variant_id))
            })?;

        let mut item: cart_item::ActiveModel = item.into();
        item.quantity = Set(quantity);
        item.updated_at = Set(Utc::now());
        item.update(&txn).await?;

        self.bump_version_unlocked(&txn, cart.id).await?;
        let updated = self.fetch_cart(&txn, cart.id).await?;
        txn.commit().await?;

        self.event_sender.send_or_log(Event::CartUpdated(cart.id)).await;
        Ok(updated)
    }

    /// Removes a variant's line from the cart.
    #[instrument(skip(self))]
    pub async fn remove_item(
        &self,
        customer_id: Uuid,
        variant_id: Uuid,
    ) -> Result<cart::Model, ServiceError> {
        let cart = self.find_by_customer(customer_id).await?;
        let txn = self.db.begin().await?;

        let deleted = CartItem::delete_many()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .filter(cart_item::Column::VariantId.eq(variant_id))
            .exec(&txn)
            .await?;
        if deleted.rows_affected == 0 {
            return Err(ServiceError::NotFound(format!(
                "Variant {} is not in the cart",
                variant_id
            )));
        }

        self.bump_version_unlocked(&txn, cart.id).await?;
        let updated = self.fetch_cart(&txn, cart.id).await?;
        txn.commit().await?;

        self.event_sender.send_or_log(Event::CartUpdated(cart.id)).await;
        Ok(updated)
    }

    /// Empties the customer's cart.
    #[instrument(skip(self))]
    pub async fn clear(&self, customer_id: Uuid) -> Result<cart::Model, ServiceError> {
        let cart = self.find_by_customer(customer_id).await?;
        let txn = self.db.begin().await?;

        CartItem::delete_many()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .exec(&txn)
            .await?;

        self.bump_version_unlocked(&txn, cart.id).await?;
        let updated = self.fetch_cart(&txn, cart.id).await?;
        txn.commit().await?;

        self.event_sender.send_or_log(Event::CartCleared(cart.id)).await;
        Ok(updated)
    }

    /// Empties a cart whose lock the caller already holds (checkout commit).
    pub(crate) async fn clear_locked(&self, cart_id: Uuid) -> Result<(), ServiceError> {
        let txn = self.db.begin().await?;

        CartItem::delete_many()
            .filter(cart_item::Column::CartId.eq(cart_id))
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
        self.event_sender.send_or_log(Event::CartCleared(cart_id)).await;
        Ok(())
    }

    /// Acquires the checkout lock: one conditional UPDATE that succeeds only
    /// when the cart is unlocked or the existing lock has gone stale. Two
    /// concurrent checkouts can therefore never both believe they won.
    #[instrument(skip(self))]
    pub async fn lock(&self, cart_id: Uuid) -> Result<(), ServiceError> {
        let now = Utc::now();
        let result = Cart::update_many()
            .col_expr(cart::Column::Locked, Expr::value(true))
            .col_expr(cart::Column::LockedAt, Expr::value(now))
            .col_expr(
                cart::Column::Version,
                Expr::col(cart::Column::Version).add(1),
            )
            .col_expr(cart::Column::UpdatedAt, Expr::value(now))
            .filter(cart::Column::Id.eq(cart_id))
            .filter(
                Condition::any()
                    .add(cart::Column::Locked.eq(false))
                    .add(cart::Column::LockedAt.lt(self.stale_cutoff())),
            )
            .exec(&*self.db)
            .await?;

        if result.rows_affected == 0 {
            return Err(ServiceError::Conflict(
                "cart is locked by a checkout in progress; retry shortly".to_string(),
            ));
        }
        info!(%cart_id, "cart locked for checkout");
        Ok(())
    }

    /// Releases the checkout lock unconditionally.
    #[instrument(skip(self))]
    pub async fn unlock(&self, cart_id: Uuid) -> Result<(), ServiceError> {
        Cart::update_many()
            .col_expr(cart::Column::Locked, Expr::value(false))
            .col_expr(
                cart::Column::LockedAt,
                Expr::value(None::<DateTime<Utc>>),
            )
            .col_expr(
                cart::Column::Version,
                Expr::col(cart::Column::Version).add(1),
            )
            .col_expr(cart::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(cart::Column::Id.eq(cart_id))
            .exec(&*self.db)
            .await?;
        info!(%cart_id, "cart unlocked");
        Ok(())
    }

    /// Price-enriched read. Prices come from the Pricing Oracle against the
    /// current variant rows; a stale lock encountered here is cleared.
    #[instrument(skip(self))]
    pub async fn get_cart(&self, customer_id: Uuid) -> Result<EnrichedCart, ServiceError> {
        let mut cart = self.get_or_create(customer_id).await?;

        // Any read may clear an abandoned lock.
        if cart.locked {
            let cleared = Cart::update_many()
                .col_expr(cart::Column::Locked, Expr::value(false))
                .col_expr(
                    cart::Column::LockedAt,
                    Expr::value(None::<DateTime<Utc>>),
                )
                .filter(cart::Column::Id.eq(cart.id))
                .filter(cart::Column::LockedAt.lt(self.stale_cutoff()))
                .exec(&*self.db)
                .await?;
            if cleared.rows_affected > 0 {
                cart.locked = false;
                cart.locked_at = None;
            }
        }

        let items = cart.find_related(CartItem).all(&*self.db).await?;
        let variant_ids: Vec<Uuid> = items.iter().map(|i| i.variant_id).collect();
        let variants = ProductVariant::find()
            .filter(product_variant::Column::Id.is_in(variant_ids))
            .all(&*self.db)
            .await?;

        let mut enriched = Vec::with_capacity(items.len());
        let mut subtotal = Decimal::ZERO;
        let mut discount_total = Decimal::ZERO;

        for item in &items {
            let variant = variants.iter().find(|v| v.id == item.variant_id);
            match variant {
                Some(v) if v.is_active => {
                    let quote = pricing::quote(v);
                    let qty = Decimal::from(item.quantity);
                    let line_total = quote.final_price * qty;
                    subtotal += line_total;
                    discount_total += quote.discount_amount * qty;
                    enriched.push(EnrichedCartItem {
                        variant_id: item.variant_id,
                        sku: Some(v.sku.clone()),
                        name: Some(v.name.clone()),
                        quantity: item.quantity,
                        available: true,
                        unit_price: quote.unit_price,
                        discount_amount: quote.discount_amount,
                        final_price: quote.final_price,
                        line_total,
                    });
                }
                _ => enriched.push(EnrichedCartItem {
                    variant_id: item.variant_id,
                    sku: variant.map(|v| v.sku.clone()),
                    name: variant.map(|v| v.name.clone()),
                    quantity: item.quantity,
                    available: false,
                    unit_price: Decimal::ZERO,
                    discount_amount: Decimal::ZERO,
                    final_price: Decimal::ZERO,
                    line_total: Decimal::ZERO,
                }),
            }
        }

        Ok(EnrichedCart {
            cart_id: cart.id,
            customer_id: cart.customer_id,
            version: cart.version,
            locked: cart.locked,
            items: enriched,
            pricing: pricing::totals(subtotal, discount_total, &self.config),
        })
    }

    /// Bumps the version counter, guarded by "not locked (or lock stale)" in
    /// the UPDATE predicate itself. Runs inside the caller's transaction so a
    /// rejected bump rolls the whole item mutation back.
    async fn bump_version_unlocked<C: ConnectionTrait>(
        &self,
        conn: &C,
        cart_id: Uuid,
    ) -> Result<(), ServiceError> {
        let result = Cart::update_many()
            .col_expr(
                cart::Column::Version,
                Expr::col(cart::Column::Version).add(1),
            )
            .col_expr(cart::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(cart::Column::Id.eq(cart_id))
            .filter(
                Condition::any()
                    .add(cart::Column::Locked.eq(false))
                    .add(cart::Column::LockedAt.lt(self.stale_cutoff())),
            )
            .exec(conn)
            .await?;

        if result.rows_affected == 0 {
            return Err(ServiceError::Conflict(
                "cart is locked by a checkout in progress".to_string(),
            ));
        }
        Ok(())
    }

    async fn fetch_cart<C: ConnectionTrait>(
        &self,
        conn: &C,
        cart_id: Uuid,
    ) -> Result<cart::Model, ServiceError> {
        Cart::find_by_id(cart_id)
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", cart_id)))
    }
}
