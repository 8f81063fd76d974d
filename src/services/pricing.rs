//! Pricing Oracle: the single source of truth for price derivation.
//!
//! Pure functions only. Both cart enrichment and order-line freezing go
//! through [`quote`], so the computation basis the customer sees at review
//! time is identical to the one used at commit time.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::{config::AppConfig, entities::product_variant};

/// Currency precision in decimal places.
const CURRENCY_DP: u32 = 2;

/// Derived prices for a single unit of a variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub unit_price: Decimal,
    pub discount_amount: Decimal,
    pub final_price: Decimal,
}

/// Order-level pricing breakdown quoted to the payment gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingBreakdown {
    pub subtotal: Decimal,
    pub discount_total: Decimal,
    pub tax_total: Decimal,
    pub shipping_total: Decimal,
    pub total: Decimal,
}

fn round_currency(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(CURRENCY_DP, RoundingStrategy::MidpointAwayFromZero)
}

/// Derives (unit price, discount amount, final price) from the current
/// variant row. `final = unit × (1 − discount_percent/100)`, rounded to
/// currency precision.
pub fn quote(variant: &product_variant::Model) -> PriceQuote {
    let unit_price = variant.price;
    let final_price = round_currency(
        unit_price * (Decimal::ONE_HUNDRED - variant.discount_percent) / Decimal::ONE_HUNDRED,
    );
    PriceQuote {
        unit_price,
        discount_amount: unit_price - final_price,
        final_price,
    }
}

/// Computes the order-level breakdown from an already-summed subtotal and
/// per-line discount total. Tax is a configured flat rate; shipping is a flat
/// fee waived at or above the free-shipping threshold.
pub fn totals(subtotal: Decimal, discount_total: Decimal, config: &AppConfig) -> PricingBreakdown {
    let tax_rate = Decimal::from_f64_retain(config.default_tax_rate).unwrap_or(Decimal::ZERO);
    let tax_total = round_currency(subtotal * tax_rate);

    let free_threshold =
        Decimal::from_f64_retain(config.free_shipping_threshold).unwrap_or(Decimal::ZERO);
    let flat_rate = Decimal::from_f64_retain(config.shipping_flat_rate).unwrap_or(Decimal::ZERO);
    let shipping_total = if subtotal >= free_threshold || subtotal <= Decimal::ZERO {
        Decimal::ZERO
    } else {
        flat_rate
    };

    PricingBreakdown {
        subtotal,
        discount_total,
        tax_total,
        shipping_total,
        total: subtotal + tax_total + shipping_total,
    }
}
