use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::payment::PaymentState;

/// Order entity. Immutable once created except for `status`,
/// `payment_status`, and the status history; never deleted (cancellation is a
/// status, not a deletion).
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub order_number: String,
    pub customer_id: Uuid,
    pub status: OrderStatus,
    pub payment_status: PaymentState,
    pub payment_method: PaymentMethod,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub subtotal: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub discount_total: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub tax_total: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub shipping_total: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub total: Decimal,
    pub currency: String,
    #[sea_orm(column_type = "Json")]
    pub shipping_address: Json,
    #[sea_orm(column_type = "Json")]
    pub billing_address: Json,
    #[sea_orm(nullable)]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_item::Entity")]
    OrderItems,
    #[sea_orm(has_many = "super::order_status_history::Entity")]
    StatusHistory,
}

impl Related<super::order_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderItems.def()
    }
}

impl Related<super::order_status_history::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::StatusHistory.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Order lifecycle status.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "confirmed")]
    Confirmed,
    #[sea_orm(string_value = "processing")]
    Processing,
    #[sea_orm(string_value = "packed")]
    Packed,
    #[sea_orm(string_value = "shipped")]
    Shipped,
    #[sea_orm(string_value = "delivered")]
    Delivered,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
    #[sea_orm(string_value = "returned")]
    Returned,
    #[sea_orm(string_value = "refunded")]
    Refunded,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Processing => "processing",
            Self::Packed => "packed",
            Self::Shipped => "shipped",
            Self::Delivered => "delivered",
            Self::Cancelled => "cancelled",
            Self::Returned => "returned",
            Self::Refunded => "refunded",
        }
    }

    /// Whether a transition from `self` to `next` is legal.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed)
                | (Pending, Cancelled)
                | (Confirmed, Processing)
                | (Confirmed, Cancelled)
                | (Processing, Packed)
                | (Processing, Cancelled)
                | (Packed, Shipped)
                | (Packed, Cancelled)
                | (Shipped, Delivered)
                | (Shipped, Cancelled)
                | (Delivered, Returned)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Cancelled | OrderStatus::Returned | OrderStatus::Refunded
        )
    }

    /// Statuses in which the stock for the order has not yet left the
    /// warehouse; cancellation from one of these restocks every line.
    pub fn is_pre_shipment(self) -> bool {
        matches!(
            self,
            OrderStatus::Pending
                | OrderStatus::Confirmed
                | OrderStatus::Processing
                | OrderStatus::Packed
        )
    }
}

/// How the customer pays for an order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    #[sea_orm(string_value = "prepaid")]
    Prepaid,
    #[sea_orm(string_value = "cash_on_delivery")]
    CashOnDelivery,
}

#[cfg(test)]
mod tests {
    use super::OrderStatus::*;
    use super::*;
    use sea_orm::Iterable;

    #[test]
    fn happy_path_is_legal() {
        let path = [Pending, Confirmed, Processing, Packed, Shipped, Delivered];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?}", pair);
        }
        assert!(Delivered.can_transition_to(Returned));
    }

    #[test]
    fn cancellation_is_legal_until_delivery() {
        for from in [Pending, Confirmed, Processing, Packed, Shipped] {
            assert!(from.can_transition_to(Cancelled), "{from:?}");
        }
        assert!(!Delivered.can_transition_to(Cancelled));
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for terminal in [Cancelled, Returned, Refunded] {
            for next in OrderStatus::iter() {
                assert!(!terminal.can_transition_to(next), "{terminal:?} -> {next:?}");
            }
        }
    }

    #[test]
    fn no_skipping_forward() {
        assert!(!Pending.can_transition_to(Shipped));
        assert!(!Confirmed.can_transition_to(Packed));
        assert!(!Processing.can_transition_to(Delivered));
    }

    #[test]
    fn no_moving_backward() {
        assert!(!Shipped.can_transition_to(Processing));
        assert!(!Delivered.can_transition_to(Pending));
        assert!(!Confirmed.can_transition_to(Pending));
    }

    #[test]
    fn self_transition_is_illegal() {
        for status in OrderStatus::iter() {
            assert!(!status.can_transition_to(status), "{status:?}");
        }
    }

    #[test]
    fn pre_shipment_classification() {
        for status in [Pending, Confirmed, Processing, Packed] {
            assert!(status.is_pre_shipment());
        }
        for status in [Shipped, Delivered, Cancelled, Returned, Refunded] {
            assert!(!status.is_pre_shipment());
        }
    }
}
