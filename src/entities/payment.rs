use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Local record of a gateway payment intent, keyed by the gateway-assigned id.
///
/// `order_id` stays NULL between intent creation and order commit (the
/// two-phase window); the conditional claim of this column is what makes the
/// commit step idempotent per intent.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "payments")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub intent_id: String,
    /// Gateway-side payment id, recorded once the customer pays.
    #[sea_orm(nullable)]
    pub gateway_payment_id: Option<String>,
    #[sea_orm(nullable)]
    pub order_id: Option<Uuid>,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub amount: Decimal,
    pub currency: String,
    pub status: PaymentState,
    /// Address snapshots collected at intent creation, applied to the order
    /// at commit.
    #[sea_orm(column_type = "Json", nullable)]
    pub shipping_address: Option<Json>,
    #[sea_orm(column_type = "Json", nullable)]
    pub billing_address: Option<Json>,
    #[sea_orm(nullable)]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

/// Payment settlement state, shared by payment records and orders.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "paid")]
    Paid,
    #[sea_orm(string_value = "failed")]
    Failed,
    #[sea_orm(string_value = "refunded")]
    Refunded,
    #[sea_orm(string_value = "partially_refunded")]
    PartiallyRefunded,
}
