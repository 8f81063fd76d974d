//! Checkout Orchestrator: lock → validate → reserve → quote → pay → commit.
//!
//! The cart lock serializes checkout attempts per cart; stock and payment
//! claims are conditional single-row UPDATEs, so the sequence stays correct
//! across concurrent server processes without a distributed transaction.
//! Every failure path after a successful lock releases the lock before the
//! error reaches the caller.

use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveEnum, ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait,
    QueryFilter, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    config::AppConfig,
    entities::{
        cart, cart_item,
        inventory_movement::MovementType,
        order,
        order::PaymentMethod,
        payment::{self, PaymentState},
        product_variant, Payment,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        cart::CartService,
        cart_validator::{CartValidator, InvalidCartItem, InvalidReason},
        orders::{Address, OrderDraft, OrderService},
        payment_gateway::{self, PaymentGateway, PaymentIntent},
        pricing::{self, PricingBreakdown},
        stock::{StockLedger, StockLine},
    },
};

/// Input for starting a checkout.
#[derive(Debug, Deserialize)]
pub struct BeginCheckoutInput {
    pub payment_method: PaymentMethod,
    pub shipping_address: Address,
    /// Defaults to the shipping address when absent.
    pub billing_address: Option<Address>,
    pub notes: Option<String>,
}

/// Signed proof of payment posted back by the customer's client.
#[derive(Debug, Deserialize)]
pub struct PaymentConfirmation {
    pub intent_id: String,
    pub payment_id: String,
    pub signature: String,
}

/// Result of the begin step. For prepaid checkouts the payment intent is
/// returned and the cart stays locked for the payment window; for
/// cash-on-delivery the order is committed immediately.
#[derive(Debug, Serialize)]
pub struct CheckoutOutcome {
    pub cart_id: Uuid,
    /// Items stripped by validation; surfaced so checkout never silently
    /// proceeds with a different item set than the customer last saw.
    pub removed_items: Vec<InvalidCartItem>,
    pub pricing: PricingBreakdown,
    pub payment_intent: Option<PaymentIntent>,
    pub order: Option<order::Model>,
}

#[derive(Clone)]
pub struct CheckoutService {
    db: Arc<DatabaseConnection>,
    config: Arc<AppConfig>,
    event_sender: Arc<EventSender>,
    carts: CartService,
    validator: CartValidator,
    stock: StockLedger,
    orders: Arc<OrderService>,
    gateway: Arc<dyn PaymentGateway>,
}

impl CheckoutService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: Arc<AppConfig>,
        event_sender: Arc<EventSender>,
        carts: CartService,
        validator: CartValidator,
        stock: StockLedger,
        orders: Arc<OrderService>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        Self {
            db,
            config,
            event_sender,
            carts,
            validator,
            stock,
            orders,
            gateway,
        }
    }

    /// Step one of checkout: acquire the cart lock, validate, pre-check
    /// stock, snapshot prices, and either create a payment intent (prepaid)
    /// or commit immediately (cash on delivery).
    #[instrument(skip(self, input))]
    pub async fn begin_checkout(
        &self,
        customer_id: Uuid,
        input: BeginCheckoutInput,
    ) -> Result<CheckoutOutcome, ServiceError> {
        let cart = self.carts.find_by_customer(customer_id).await?;

        // A lock conflict means another checkout for this cart is live;
        // nothing was acquired, so there is nothing to release.
        self.carts.lock(cart.id).await?;

        // On success the lock either survives into the payment window
        // (prepaid, bounded by the staleness timeout) or was released by the
        // commit (cash on delivery). On any failure it must come off here.
        let result = self.begin_locked(&cart, input).await;
        if result.is_err() {
            self.release_lock(cart.id).await;
        }
        result
    }

    async fn begin_locked(
        &self,
        cart: &cart::Model,
        input: BeginCheckoutInput,
    ) -> Result<CheckoutOutcome, ServiceError> {
        let validation = self.validator.validate(cart.id, true).await?;
        if validation.valid_items.is_empty() {
            return Err(empty_cart_error(&validation.invalid_items));
        }

        let lines = stock_lines(&validation.valid_items);
        let shortfalls = self.stock.check_available(&lines).await?;
        if !shortfalls.is_empty() {
            return Err(insufficient_stock_error(&shortfalls));
        }

        let breakdown = self.price_snapshot(&validation.valid_items);

        let billing = input
            .billing_address
            .clone()
            .unwrap_or_else(|| input.shipping_address.clone());

        match input.payment_method {
            PaymentMethod::Prepaid => {
                let intent = self
                    .gateway
                    .create_intent(
                        breakdown.total,
                        &self.config.currency,
                        &cart.id.to_string(),
                    )
                    .await?;

                let now = Utc::now();
                let record = payment::ActiveModel {
                    intent_id: Set(intent.intent_id.clone()),
                    gateway_payment_id: Set(None),
                    order_id: Set(None),
                    amount: Set(intent.amount),
                    currency: Set(intent.currency.clone()),
                    status: Set(PaymentState::Pending),
                    shipping_address: Set(Some(address_json(&input.shipping_address)?)),
                    billing_address: Set(Some(address_json(&billing)?)),
                    notes: Set(input.notes.clone()),
                    created_at: Set(now),
                    updated_at: Set(now),
                };
                record.insert(&*self.db).await?;

                self.event_sender
                    .send_or_log(Event::CheckoutStarted {
                        cart_id: cart.id,
                        intent_id: intent.intent_id.clone(),
                    })
                    .await;

                info!(cart_id = %cart.id, intent_id = %intent.intent_id, total = %breakdown.total, "checkout started");
                Ok(CheckoutOutcome {
                    cart_id: cart.id,
                    removed_items: validation.invalid_items,
                    pricing: breakdown,
                    payment_intent: Some(intent),
                    order: None,
                })
            }
            PaymentMethod::CashOnDelivery => {
                let order = self
                    .commit_order(
                        cart,
                        validation.valid_items,
                        breakdown,
                        PaymentMethod::CashOnDelivery,
                        PaymentState::Pending,
                        input.shipping_address,
                        billing,
                        input.notes,
                    )
                    .await?;

                Ok(CheckoutOutcome {
                    cart_id: cart.id,
                    removed_items: validation.invalid_items,
                    pricing: breakdown,
                    payment_intent: None,
                    order: Some(order),
                })
            }
        }
    }

    /// Step two of checkout: verify the signed confirmation, check the
    /// authoritative gateway status, and commit the order.
    ///
    /// Idempotent per payment intent: a retry after a successful commit
    /// returns the already-created order instead of creating a second one.
    #[instrument(skip(self, confirmation), fields(intent_id = %confirmation.intent_id))]
    pub async fn confirm_checkout(
        &self,
        customer_id: Uuid,
        confirmation: PaymentConfirmation,
    ) -> Result<order::Model, ServiceError> {
        // Security boundary first: recompute the signature locally and
        // compare before trusting anything else in the payload.
        if !payment_gateway::verify_confirmation(
            &self.config.payment_signature_secret,
            &confirmation.intent_id,
            &confirmation.payment_id,
            &confirmation.signature,
        ) {
            warn!(
                intent_id = %confirmation.intent_id,
                "payment confirmation signature mismatch; possible tampering"
            );
            if let Ok(cart) = self.carts.find_by_customer(customer_id).await {
                self.release_lock(cart.id).await;
            }
            return Err(ServiceError::Unauthorized(
                "payment confirmation signature mismatch".to_string(),
            ));
        }

        let record = Payment::find_by_id(confirmation.intent_id.clone())
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "Payment intent {} not found",
                    confirmation.intent_id
                ))
            })?;

        // Reconciliation path: an order already referencing this intent means
        // a previous confirm won; return it without touching cart or stock.
        if let Some(order_id) = record.order_id {
            info!(%order_id, "confirm retry for already-committed payment");
            return self.orders.get_order(order_id).await;
        }

        let cart = self.carts.find_by_customer(customer_id).await?;
        let result = self.confirm_unclaimed(&cart, &confirmation, record).await;
        if result.is_err() {
            self.release_lock(cart.id).await;
        }
        result
    }

    async fn confirm_unclaimed(
        &self,
        cart: &cart::Model,
        confirmation: &PaymentConfirmation,
        record: payment::Model,
    ) -> Result<order::Model, ServiceError> {
        let gateway_payment = self.gateway.fetch_payment(&confirmation.payment_id).await?;
        if gateway_payment.intent_id != confirmation.intent_id {
            return Err(ServiceError::Unauthorized(
                "payment does not belong to this intent".to_string(),
            ));
        }
        if !gateway_payment.status.is_settled() {
            self.mark_payment_failed(&confirmation.intent_id).await?;
            return Err(ServiceError::PaymentFailed(format!(
                "payment {} is not captured",
                confirmation.payment_id
            )));
        }

        // Re-validate right before commit; the catalog may have moved during
        // the payment window.
        let validation = self.validator.validate(cart.id, true).await?;
        if validation.valid_items.is_empty() {
            return Err(empty_cart_error(&validation.invalid_items));
        }

        let lines = stock_lines(&validation.valid_items);
        let breakdown = self.price_snapshot(&validation.valid_items);
        let order_id = Uuid::new_v4();

        // The real, mutating reservation. All-or-nothing.
        self.stock.reserve_all(&lines, Some(order_id)).await?;

        // Claim the payment for this order id. The conditional UPDATE on
        // `order_id IS NULL` is what makes the commit at-most-once per
        // intent under concurrent confirms.
        let claim = Payment::update_many()
            .col_expr(payment::Column::OrderId, Expr::value(Some(order_id)))
            .col_expr(
                payment::Column::GatewayPaymentId,
                Expr::value(Some(confirmation.payment_id.clone())),
            )
            .col_expr(
                payment::Column::Status,
                Expr::value(PaymentState::Paid.into_value()),
            )
            .col_expr(payment::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(payment::Column::IntentId.eq(confirmation.intent_id.clone()))
            .filter(payment::Column::OrderId.is_null())
            .exec(&*self.db)
            .await?;

        if claim.rows_affected == 0 {
            // A concurrent confirm committed first; hand back its order.
            self.release_lines(&lines, order_id).await;
            let record = Payment::find_by_id(confirmation.intent_id.clone())
                .one(&*self.db)
                .await?
                .ok_or_else(|| {
                    ServiceError::NotFound(format!(
                        "Payment intent {} not found",
                        confirmation.intent_id
                    ))
                })?;
            let winner = record.order_id.ok_or_else(|| {
                ServiceError::InternalError(
                    "payment claim lost but no order linked".to_string(),
                )
            })?;
            return self.orders.get_order(winner).await;
        }

        let shipping_address = address_from_json(record.shipping_address.clone())?;
        let billing_address = address_from_json(record.billing_address.clone())?;

        let order = match self
            .orders
            .create_order(OrderDraft {
                order_id,
                customer_id: cart.customer_id,
                lines: validation.valid_items,
                pricing: breakdown,
                payment_method: PaymentMethod::Prepaid,
                payment_status: PaymentState::Paid,
                shipping_address,
                billing_address,
                notes: record.notes.clone(),
            })
            .await
        {
            Ok(order) => order,
            Err(err) => {
                // Paid but orderless: release the stock, unlink the payment,
                // and let the reconciliation sweep pick the payment up.
                error!(
                    intent_id = %confirmation.intent_id,
                    error = %err,
                    "order creation failed after payment capture"
                );
                self.release_lines(&lines, order_id).await;
                self.unclaim_payment(&confirmation.intent_id).await;
                return Err(err);
            }
        };

        self.carts.clear_locked(cart.id).await?;
        self.carts.unlock(cart.id).await?;

        self.event_sender
            .send_or_log(Event::CheckoutCompleted {
                cart_id: cart.id,
                order_id: order.id,
            })
            .await;

        info!(order_id = %order.id, order_number = %order.order_number, "checkout committed");
        Ok(order)
    }

    /// Commits an order directly from a locked, validated cart (the
    /// cash-on-delivery path, which never touches the gateway).
    #[allow(clippy::too_many_arguments)]
    async fn commit_order(
        &self,
        cart: &cart::Model,
        lines_with_variants: Vec<(cart_item::Model, product_variant::Model)>,
        breakdown: PricingBreakdown,
        payment_method: PaymentMethod,
        payment_status: PaymentState,
        shipping_address: Address,
        billing_address: Address,
        notes: Option<String>,
    ) -> Result<order::Model, ServiceError> {
        let lines = stock_lines(&lines_with_variants);
        let order_id = Uuid::new_v4();

        self.stock.reserve_all(&lines, Some(order_id)).await?;

        let order = match self
            .orders
            .create_order(OrderDraft {
                order_id,
                customer_id: cart.customer_id,
                lines: lines_with_variants,
                pricing: breakdown,
                payment_method,
                payment_status,
                shipping_address,
                billing_address,
                notes,
            })
            .await
        {
            Ok(order) => order,
            Err(err) => {
                self.release_lines(&lines, order_id).await;
                return Err(err);
            }
        };

        self.carts.clear_locked(cart.id).await?;
        self.carts.unlock(cart.id).await?;

        self.event_sender
            .send_or_log(Event::CheckoutCompleted {
                cart_id: cart.id,
                order_id: order.id,
            })
            .await;

        Ok(order)
    }

    /// Price snapshot from the locked cart contents, via the Pricing Oracle.
    fn price_snapshot(
        &self,
        lines: &[(cart_item::Model, product_variant::Model)],
    ) -> PricingBreakdown {
        let mut subtotal = Decimal::ZERO;
        let mut discount_total = Decimal::ZERO;
        for (item, variant) in lines {
            let quote = pricing::quote(variant);
            let qty = Decimal::from(item.quantity);
            subtotal += quote.final_price * qty;
            discount_total += quote.discount_amount * qty;
        }
        pricing::totals(subtotal, discount_total, &self.config)
    }

    async fn mark_payment_failed(&self, intent_id: &str) -> Result<(), ServiceError> {
        Payment::update_many()
            .col_expr(
                payment::Column::Status,
                Expr::value(PaymentState::Failed.into_value()),
            )
            .col_expr(payment::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(payment::Column::IntentId.eq(intent_id.to_string()))
            .filter(payment::Column::OrderId.is_null())
            .exec(&*self.db)
            .await?;
        Ok(())
    }

    async fn unclaim_payment(&self, intent_id: &str) {
        let result = Payment::update_many()
            .col_expr(payment::Column::OrderId, Expr::value(None::<Uuid>))
            .col_expr(payment::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(payment::Column::IntentId.eq(intent_id.to_string()))
            .exec(&*self.db)
            .await;
        if let Err(err) = result {
            error!(intent_id, error = %err, "failed to unlink payment after commit failure");
        }
    }

    async fn release_lines(&self, lines: &[StockLine], order_id: Uuid) {
        for line in lines {
            if let Err(err) = self
                .stock
                .release(
                    line.variant_id,
                    line.quantity,
                    Some(order_id),
                    MovementType::Adjustment,
                )
                .await
            {
                error!(
                    variant_id = %line.variant_id,
                    error = %err,
                    "failed to release reservation during commit rollback"
                );
            }
        }
    }

    async fn release_lock(&self, cart_id: Uuid) {
        if let Err(err) = self.carts.unlock(cart_id).await {
            error!(%cart_id, error = %err, "failed to release cart lock");
        }
    }
}

fn address_json(address: &Address) -> Result<serde_json::Value, ServiceError> {
    serde_json::to_value(address)
        .map_err(|e| ServiceError::InternalError(format!("address snapshot: {e}")))
}

fn address_from_json(value: Option<serde_json::Value>) -> Result<Address, ServiceError> {
    let value = value.ok_or_else(|| {
        ServiceError::InternalError("payment record carries no address snapshot".to_string())
    })?;
    serde_json::from_value(value)
        .map_err(|e| ServiceError::InternalError(format!("address snapshot: {e}")))
}

fn stock_lines(lines: &[(cart_item::Model, product_variant::Model)]) -> Vec<StockLine> {
    lines
        .iter()
        .map(|(item, _)| StockLine {
            variant_id: item.variant_id,
            quantity: item.quantity,
        })
        .collect()
}

/// Classifies an emptied-by-validation cart: if lines were stripped for lack
/// of stock, the caller should see a stock error (adjust quantities and
/// retry), not a generic validation failure.
fn empty_cart_error(invalid_items: &[InvalidCartItem]) -> ServiceError {
    let shortfalls: Vec<String> = invalid_items
        .iter()
        .filter_map(|item| match &item.reason {
            InvalidReason::InsufficientStock { available } => Some(format!(
                "variant {}: requested {}, available {}",
                item.variant_id, item.quantity, available
            )),
            _ => None,
        })
        .collect();

    if shortfalls.is_empty() {
        ServiceError::ValidationError("cart has no purchasable items".to_string())
    } else {
        ServiceError::InsufficientStock(shortfalls.join("; "))
    }
}

fn insufficient_stock_error(shortfalls: &[crate::services::stock::Shortfall]) -> ServiceError {
    let detail = shortfalls
        .iter()
        .map(|s| {
            format!(
                "variant {}: requested {}, available {}",
                s.variant_id, s.requested, s.available
            )
        })
        .collect::<Vec<_>>()
        .join("; ");
    ServiceError::InsufficientStock(detail)
}
