// Persisted order model (collection `orders`)

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use super::cart::{AddOn, CartItem, Identity};
use super::pricing::{Pricing, ServiceChargeLine, TaxLine, VoucherLine};

pub const ORDERS_COLLECTION: &str = "orders";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(String);

impl OrderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Stable id for the order paid through `session_id`, so placing the
    /// same session twice resolves to one order.
    pub fn for_session(session_id: &str) -> Self {
        Self(Uuid::new_v5(&Uuid::NAMESPACE_OID, session_id.as_bytes()).to_string())
    }

    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Processing,
    #[serde(rename = "ready for pickup")]
    ReadyForPickup,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Paid,
    Unpaid,
    Expired,
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PaymentStatus::Paid => "paid",
            PaymentStatus::Unpaid => "unpaid",
            PaymentStatus::Expired => "expired",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Gcash,
    Maya,
    GrabPay,
    Online,
}

impl PaymentMethod {
    pub const ALL: [PaymentMethod; 5] = [
        PaymentMethod::Cash,
        PaymentMethod::Gcash,
        PaymentMethod::Maya,
        PaymentMethod::GrabPay,
        PaymentMethod::Online,
    ];

    pub fn is_online(&self) -> bool {
        !matches!(self, PaymentMethod::Cash)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiningMode {
    #[default]
    Pickup,
    DineIn,
}

/// Frozen copy of a cart line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub product_id: String,
    pub name: String,
    pub quantity: u32,
    pub price: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(default)]
    pub add_ons: BTreeMap<String, AddOn>,
    pub total: Decimal,
}

impl From<&CartItem> for OrderItem {
    fn from(item: &CartItem) -> Self {
        Self {
            product_id: item.product_id.clone(),
            name: item.name.clone(),
            quantity: item.quantity,
            price: item.price,
            size: item.size.clone(),
            add_ons: item.add_ons.clone(),
            total: item.line_total(),
        }
    }
}

/// Loyalty points for an order: one per unit bought.
pub fn points_for(items: &[OrderItem]) -> u32 {
    items
        .iter()
        .fold(0u32, |acc, i| acc.saturating_add(i.quantity))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: OrderId,
    pub items: Vec<OrderItem>,
    pub subtotal: Decimal,
    pub tax: TaxLine,
    pub service_charge: ServiceChargeLine,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voucher: Option<VoucherLine>,
    pub total: Decimal,
    pub status: OrderStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_status: Option<PaymentStatus>,
    pub payment_method: PaymentMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkout_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_expiry_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub points_earned: u32,
    #[serde(default)]
    pub points_credited: bool,
    pub customer_id: String,
    pub customer_name: String,
    pub customer_email: String,
    #[serde(default)]
    pub dining_mode: DiningMode,
    pub created_at: DateTime<Utc>,
}

impl Order {
    /// Orders written before payment tracking carry no status; they were paid.
    pub fn effective_payment_status(&self) -> PaymentStatus {
        self.payment_status.unwrap_or(PaymentStatus::Paid)
    }

    pub fn is_unpaid(&self) -> bool {
        self.effective_payment_status() == PaymentStatus::Unpaid
    }

    pub fn voucher_discount(&self) -> Decimal {
        self.voucher
            .as_ref()
            .map(|v| v.discount_amount)
            .unwrap_or(Decimal::ZERO)
    }
}

/// Order contents captured at checkout, before the store assigns state.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub customer: Identity,
    pub items: Vec<OrderItem>,
    pub pricing: Pricing,
    pub payment_method: PaymentMethod,
    pub dining_mode: DiningMode,
}

impl NewOrder {
    pub fn from_cart(
        customer: Identity,
        items: &[CartItem],
        pricing: Pricing,
        payment_method: PaymentMethod,
        dining_mode: DiningMode,
    ) -> Self {
        Self {
            customer,
            items: items.iter().map(OrderItem::from).collect(),
            pricing,
            payment_method,
            dining_mode,
        }
    }

    pub(crate) fn into_order(self, id: OrderId, payment_status: PaymentStatus, now: DateTime<Utc>) -> Order {
        let points_earned = points_for(&self.items);
        Order {
            id,
            items: self.items,
            subtotal: self.pricing.subtotal,
            tax: self.pricing.tax,
            service_charge: self.pricing.service_charge,
            voucher: self.pricing.voucher,
            total: self.pricing.total,
            status: OrderStatus::Pending,
            payment_status: Some(payment_status),
            payment_method: self.payment_method,
            payment_id: None,
            checkout_session_id: None,
            payment_expiry_time: None,
            points_earned,
            points_credited: false,
            customer_id: self.customer.uid.clone(),
            customer_name: self.customer.name().to_string(),
            customer_email: self.customer.email,
            dining_mode: self.dining_mode,
            created_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_session_ids_map_to_stable_order_ids() {
        assert_eq!(OrderId::for_session("cs_1"), OrderId::for_session("cs_1"));
        assert_ne!(OrderId::for_session("cs_1"), OrderId::for_session("cs_2"));
    }

    #[test]
    fn test_enums_use_stored_spelling() {
        assert_eq!(json!(OrderStatus::ReadyForPickup), json!("ready for pickup"));
        assert_eq!(json!(PaymentMethod::GrabPay), json!("grab_pay"));
        assert_eq!(json!(DiningMode::DineIn), json!("dine-in"));
        assert_eq!(json!(PaymentStatus::Expired), json!("expired"));
    }

    #[test]
    fn test_legacy_order_without_payment_status_counts_as_paid() {
        let doc = json!({
            "id": "legacy-1",
            "items": [{"productId": "p1", "name": "Bagel", "quantity": 2, "price": "90", "total": "180"}],
            "subtotal": "180",
            "tax": {"amount": "0", "percentage": "0", "label": "VAT"},
            "serviceCharge": {"amount": "0", "percentage": "0"},
            "total": "180",
            "status": "completed",
            "paymentMethod": "cash",
            "customerId": "u1",
            "customerName": "Ana",
            "customerEmail": "ana@example.com",
            "createdAt": "2024-05-01T10:00:00Z"
        });

        let order: Order = serde_json::from_value(doc).unwrap();
        assert_eq!(order.effective_payment_status(), PaymentStatus::Paid);
        assert_eq!(order.dining_mode, DiningMode::Pickup);
        assert!(!order.points_credited);
        assert_eq!(points_for(&order.items), 2);
    }

    #[test]
    fn test_points_saturate_instead_of_wrapping() {
        let line = |quantity| OrderItem {
            product_id: "latte".into(),
            name: "Latte".into(),
            quantity,
            price: Decimal::ONE,
            size: None,
            add_ons: BTreeMap::new(),
            total: Decimal::ONE,
        };
        assert_eq!(points_for(&[line(u32::MAX), line(2)]), u32::MAX);
        assert!(PaymentMethod::Gcash.is_online());
        assert!(!PaymentMethod::Cash.is_online());
    }
}
