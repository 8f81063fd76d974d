//! Order assembly and lifecycle.
//!
//! Orders are assembled once, from a validated cart plus confirmed payment,
//! and never re-priced. After creation only the status fields move, and only
//! through the transition table; entering `cancelled` pre-shipment triggers
//! the compensating actions (restock, refund initiation).

use chrono::{Duration, Utc};
use rand::{distributions::Alphanumeric, Rng};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, ModelTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    entities::{
        cart_item,
        inventory_movement::MovementType,
        order::{self, OrderStatus, PaymentMethod},
        order_item, order_status_history,
        payment::{self, PaymentState},
        product_variant, Order, OrderItem, OrderStatusHistory, Payment,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        payment_gateway::PaymentGateway,
        pricing::{self, PricingBreakdown},
        stock::StockLedger,
    },
};

/// Postal address snapshot stored on the order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Address {
    pub first_name: String,
    pub last_name: String,
    pub line1: String,
    #[serde(default)]
    pub line2: Option<String>,
    pub city: String,
    pub province: String,
    pub country_code: String,
    pub postal_code: String,
    #[serde(default)]
    pub phone: Option<String>,
}

/// Everything the assembler needs to freeze an order.
pub struct OrderDraft {
    pub order_id: Uuid,
    pub customer_id: Uuid,
    pub lines: Vec<(cart_item::Model, product_variant::Model)>,
    pub pricing: PricingBreakdown,
    pub payment_method: PaymentMethod,
    pub payment_status: PaymentState,
    pub shipping_address: Address,
    pub billing_address: Address,
    pub notes: Option<String>,
}

#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    stock: StockLedger,
    gateway: Arc<dyn PaymentGateway>,
    currency: String,
}

impl OrderService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        stock: StockLedger,
        gateway: Arc<dyn PaymentGateway>,
        currency: String,
    ) -> Self {
        Self {
            db,
            event_sender,
            stock,
            gateway,
            currency,
        }
    }

    /// Freezes an order from a draft: order row, one immutable item row per
    /// line (priced through the Pricing Oracle at this moment), and the
    /// initial status-history entry, all in one local transaction.
    #[instrument(skip(self, draft), fields(order_id = %draft.order_id, customer_id = %draft.customer_id))]
    pub async fn create_order(&self, draft: OrderDraft) -> Result<order::Model, ServiceError> {
        let now = Utc::now();
        let shipping_address = serde_json::to_value(&draft.shipping_address)
            .map_err(|e| ServiceError::InternalError(format!("address snapshot: {e}")))?;
        let billing_address = serde_json::to_value(&draft.billing_address)
            .map_err(|e| ServiceError::InternalError(format!("address snapshot: {e}")))?;

        let txn = self.db.begin().await?;

        let order = order::ActiveModel {
            id: Set(draft.order_id),
            order_number: Set(generate_order_number()),
            customer_id: Set(draft.customer_id),
            status: Set(OrderStatus::Pending),
            payment_status: Set(draft.payment_status),
            payment_method: Set(draft.payment_method),
            subtotal: Set(draft.pricing.subtotal),
            discount_total: Set(draft.pricing.discount_total),
            tax_total: Set(draft.pricing.tax_total),
            shipping_total: Set(draft.pricing.shipping_total),
            total: Set(draft.pricing.total),
            currency: Set(self.currency.clone()),
            shipping_address: Set(shipping_address),
            billing_address: Set(billing_address),
            notes: Set(draft.notes),
            created_at: Set(now),
            updated_at: Set(now),
        };
        let order = order.insert(&txn).await?;

        for (item, variant) in &draft.lines {
            let quote = pricing::quote(variant);
            let order_item = order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order.id),
                variant_id: Set(variant.id),
                sku: Set(variant.sku.clone()),
                name: Set(variant.name.clone()),
                size: Set(variant.size.clone()),
                color: Set(variant.color.clone()),
                quantity: Set(item.quantity),
                unit_price: Set(quote.unit_price),
                discount_percent: Set(variant.discount_percent),
                discount_amount: Set(quote.discount_amount),
                final_price: Set(quote.final_price),
                line_total: Set(quote.final_price * rust_decimal::Decimal::from(item.quantity)),
                created_at: Set(now),
            };
            order_item.insert(&txn).await?;
        }

        append_history(&txn, order.id, OrderStatus::Pending, "checkout", None).await?;

        txn.commit().await?;

        self.event_sender.send_or_log(Event::OrderCreated(order.id)).await;
        info!(order_number = %order.order_number, "order created");
        Ok(order)
    }

    pub async fn get_order(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        Order::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
    }

    pub async fn get_by_order_number(
        &self,
        order_number: &str,
    ) -> Result<order::Model, ServiceError> {
        Order::find()
            .filter(order::Column::OrderNumber.eq(order_number))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_number)))
    }

    pub async fn order_items(&self, order_id: Uuid) -> Result<Vec<order_item::Model>, ServiceError> {
        let order = self.get_order(order_id).await?;
        Ok(order.find_related(OrderItem).all(&*self.db).await?)
    }

    /// Append-only status history, oldest first.
    pub async fn status_history(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<order_status_history::Model>, ServiceError> {
        let history = OrderStatusHistory::find()
            .filter(order_status_history::Column::OrderId.eq(order_id))
            .order_by_asc(order_status_history::Column::CreatedAt)
            .all(&*self.db)
            .await?;
        Ok(history)
    }

    /// Applies a status transition if the table allows it; otherwise fails
    /// with the order untouched. Every applied transition appends a history
    /// entry. Transitions into `cancelled` trigger compensations.
    #[instrument(skip(self), fields(order_id = %order_id, new_status = ?new_status))]
    pub async fn transition(
        &self,
        order_id: Uuid,
        new_status: OrderStatus,
        actor: &str,
        note: Option<String>,
    ) -> Result<order::Model, ServiceError> {
        let txn = self.db.begin().await?;

        let order = Order::find_by_id(order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        let old_status = order.status;
        if !old_status.can_transition_to(new_status) {
            return Err(ServiceError::ValidationError(format!(
                "cannot transition order from '{}' to '{}'",
                old_status.as_str(),
                new_status.as_str()
            )));
        }

        let mut active: order::ActiveModel = order.into();
        active.status = Set(new_status);
        active.updated_at = Set(Utc::now());
        let updated = active.update(&txn).await?;

        append_history(&txn, order_id, new_status, actor, note).await?;

        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::OrderStatusChanged {
                order_id,
                old_status: old_status.as_str().to_string(),
                new_status: new_status.as_str().to_string(),
            })
            .await;

        info!(
            from = old_status.as_str(),
            to = new_status.as_str(),
            "order status updated"
        );

        if new_status == OrderStatus::Cancelled {
            return self.compensate_cancellation(updated, old_status).await;
        }

        Ok(updated)
    }

    /// Cancels an order (status transition plus compensations).
    pub async fn cancel(
        &self,
        order_id: Uuid,
        actor: &str,
        note: Option<String>,
    ) -> Result<order::Model, ServiceError> {
        self.transition(order_id, OrderStatus::Cancelled, actor, note)
            .await
    }

    /// Restocks every line when the order had not shipped, and initiates a
    /// refund when the order was paid. Refund initiation failures are logged
    /// and left for the payment sweep rather than un-cancelling the order.
    async fn compensate_cancellation(
        &self,
        order: order::Model,
        old_status: OrderStatus,
    ) -> Result<order::Model, ServiceError> {
        if old_status.is_pre_shipment() {
            let items = order.find_related(OrderItem).all(&*self.db).await?;
            for item in &items {
                self.stock
                    .release(
                        item.variant_id,
                        item.quantity,
                        Some(order.id),
                        MovementType::Return,
                    )
                    .await?;
            }
        }

        let mut order = order;
        if order.payment_status == PaymentState::Paid {
            match self.initiate_refund(&order).await {
                Ok(Some(refunded)) => order = refunded,
                Ok(None) => {}
                Err(err) => {
                    warn!(order_id = %order.id, error = %err, "refund initiation failed; leaving payment for sweep");
                }
            }
        }

        self.event_sender.send_or_log(Event::OrderCancelled(order.id)).await;
        Ok(order)
    }

    async fn initiate_refund(
        &self,
        order: &order::Model,
    ) -> Result<Option<order::Model>, ServiceError> {
        let Some(payment) = Payment::find()
            .filter(payment::Column::OrderId.eq(order.id))
            .one(&*self.db)
            .await?
        else {
            // Cash-on-delivery orders have no gateway payment to refund.
            return Ok(None);
        };

        let gateway_payment_id = payment.gateway_payment_id.clone().ok_or_else(|| {
            ServiceError::InternalError(format!(
                "paid payment {} has no gateway payment id",
                payment.intent_id
            ))
        })?;

        let refund = self
            .gateway
            .create_refund(&gateway_payment_id, payment.amount)
            .await?;

        let intent_id = payment.intent_id.clone();
        let mut payment_active: payment::ActiveModel = payment.into();
        payment_active.status = Set(PaymentState::Refunded);
        payment_active.updated_at = Set(Utc::now());
        payment_active.update(&*self.db).await?;

        let mut active: order::ActiveModel = order.clone().into();
        active.payment_status = Set(PaymentState::Refunded);
        active.updated_at = Set(Utc::now());
        let updated = active.update(&*self.db).await?;

        self.event_sender
            .send_or_log(Event::RefundInitiated {
                intent_id,
                refund_id: refund.refund_id,
            })
            .await;

        Ok(Some(updated))
    }

    /// Paid payments with no linked order, older than `age`. A background
    /// sweep reconciles these against carts/orders after a commit step died
    /// between payment confirmation and order creation.
    pub async fn find_orphaned_payments(
        &self,
        age: Duration,
    ) -> Result<Vec<payment::Model>, ServiceError> {
        let cutoff = Utc::now() - age;
        let orphans = Payment::find()
            .filter(payment::Column::Status.eq(PaymentState::Paid))
            .filter(payment::Column::OrderId.is_null())
            .filter(payment::Column::UpdatedAt.lt(cutoff))
            .all(&*self.db)
            .await?;
        Ok(orphans)
    }
}

async fn append_history<C: sea_orm::ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
    status: OrderStatus,
    actor: &str,
    note: Option<String>,
) -> Result<(), ServiceError> {
    let entry = order_status_history::ActiveModel {
        id: Set(Uuid::new_v4()),
        order_id: Set(order_id),
        status: Set(status),
        actor: Set(actor.to_string()),
        note: Set(note),
        created_at: Set(Utc::now()),
    };
    entry.insert(conn).await?;
    Ok(())
}

fn generate_order_number() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(|c| (c as char).to_ascii_uppercase())
        .collect();
    format!("ORD-{}-{}", Utc::now().format("%Y%m%d"), suffix)
}
