//! Price derivation for a cart.
//!
//! Menu prices are VAT-inclusive. With tax enabled, 12% of the cart total is
//! carved out as VAT and the remainder is the subtotal; the customer still
//! pays the cart total plus service charge minus any voucher discount.

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use super::merchant::{PaymentSettings, TaxSettings};
use super::voucher::VoucherSettings;

pub const VAT_RATE: Decimal = dec!(0.12);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxLine {
    pub amount: Decimal,
    pub percentage: Decimal,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceChargeLine {
    pub amount: Decimal,
    pub percentage: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoucherLine {
    pub code: String,
    pub description: String,
    pub discount_amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pricing {
    pub cart_total: Decimal,
    pub subtotal: Decimal,
    pub tax: TaxLine,
    pub service_charge: ServiceChargeLine,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voucher: Option<VoucherLine>,
    pub total: Decimal,
}

impl Pricing {
    pub fn voucher_discount(&self) -> Decimal {
        self.voucher
            .as_ref()
            .map(|v| v.discount_amount)
            .unwrap_or(Decimal::ZERO)
    }
}

/// Round to centavos, halves away from zero.
pub fn round2(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Peso amount as integer centavos for the gateway.
pub fn to_centavos(amount: Decimal) -> Option<i64> {
    use rust_decimal::prelude::ToPrimitive;
    (amount * dec!(100))
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
}

pub fn tax_rate(tax: &TaxSettings) -> Decimal {
    if tax.enabled {
        VAT_RATE
    } else {
        Decimal::ZERO
    }
}

pub fn calculate(
    cart_total: Decimal,
    tax: &TaxSettings,
    payment: &PaymentSettings,
    voucher: Option<&VoucherSettings>,
) -> Pricing {
    let tax_amount = round2(cart_total * tax_rate(tax));
    let subtotal = cart_total - tax_amount;

    let service_pct = if payment.auto_apply_service_charge {
        payment.service_charge_percentage
    } else {
        Decimal::ZERO
    };
    let service_amount = round2(subtotal * service_pct / dec!(100));

    // Discount never pushes the total below zero
    let voucher = voucher
        .filter(|v| subtotal >= v.minimum_order_amount)
        .map(|v| VoucherLine {
            code: v.code.clone(),
            description: v.description.clone(),
            discount_amount: v
                .discount_amount
                .max(Decimal::ZERO)
                .min(cart_total + service_amount),
        });
    let discount = voucher
        .as_ref()
        .map(|v| v.discount_amount)
        .unwrap_or(Decimal::ZERO);

    Pricing {
        cart_total,
        subtotal,
        tax: TaxLine {
            amount: tax_amount,
            percentage: if tax.enabled {
                tax.percentage
            } else {
                Decimal::ZERO
            },
            label: tax.label.clone(),
        },
        service_charge: ServiceChargeLine {
            amount: service_amount,
            percentage: service_pct,
        },
        voucher,
        total: cart_total + service_amount - discount,
    }
}
