// PayMongo wire types (JSON:API style `data.attributes` envelopes)

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::checkout::gateway::{IntentSnapshot, PaymentSnapshot, SessionSnapshot};
use crate::checkout::pricing::to_centavos;

pub const CURRENCY: &str = "PHP";
pub const LINE_ITEM_NAME: &str = "Food Order";
pub const PAYMENT_PAID_EVENT: &str = "checkout_session.payment.paid";

/// Positive whole centavos for a peso amount.
pub fn ensure_php_centavos(amount: Decimal) -> Result<i64, &'static str> {
    match to_centavos(amount) {
        Some(c) if c > 0 => Ok(c),
        Some(_) => Err("amount must be positive"),
        None => Err("amount out of range"),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub data: T,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateCheckoutSession {
    pub attributes: CheckoutSessionParams,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckoutSessionParams {
    pub description: String,
    pub line_items: Vec<LineItem>,
    pub payment_method_types: Vec<String>,
    pub success_url: String,
    pub cancel_url: String,
    pub billing: Billing,
    pub send_email_receipt: bool,
    pub show_description: bool,
    pub show_line_items: bool,
    pub reference_number: String,
    pub metadata: SessionMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineItem {
    pub name: String,
    pub quantity: u32,
    /// Centavos.
    pub amount: i64,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Billing {
    pub name: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionMetadata {
    pub order_id: String,
    pub app_scheme: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSessionResource {
    pub id: String,
    #[serde(default)]
    pub attributes: CheckoutSessionAttributes,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CheckoutSessionAttributes {
    #[serde(default)]
    pub checkout_url: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub reference_number: Option<String>,
    #[serde(default)]
    pub payment_intent: Option<PaymentIntentResource>,
    #[serde(default)]
    pub payments: Vec<PaymentResource>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentIntentResource {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub attributes: PaymentIntentAttributes,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PaymentIntentAttributes {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub payments: Vec<PaymentResource>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentResource {
    pub id: String,
    #[serde(default)]
    pub attributes: PaymentAttributes,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PaymentAttributes {
    #[serde(default)]
    pub status: String,
}

impl From<&PaymentResource> for PaymentSnapshot {
    fn from(p: &PaymentResource) -> Self {
        PaymentSnapshot {
            id: p.id.clone(),
            status: p.attributes.status.clone(),
        }
    }
}

impl CheckoutSessionResource {
    pub fn to_snapshot(&self) -> SessionSnapshot {
        let attrs = &self.attributes;
        let payment_intent = attrs.payment_intent.as_ref().map(|intent| {
            // Older sessions only list payments at the session level
            let payments = if intent.attributes.payments.is_empty() {
                &attrs.payments
            } else {
                &intent.attributes.payments
            };
            IntentSnapshot {
                id: intent.id.clone(),
                status: intent.attributes.status.clone(),
                payments: payments.iter().map(PaymentSnapshot::from).collect(),
            }
        });
        SessionSnapshot {
            session_id: self.id.clone(),
            status: attrs.status.clone().unwrap_or_default(),
            checkout_url: attrs.checkout_url.clone(),
            payment_intent,
        }
    }
}

// Webhook event: { data: { id, attributes: { type, livemode, data: { id, .. } } } }
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub data: WebhookEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEventData {
    pub id: String,
    pub attributes: WebhookEventAttributes,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEventAttributes {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub livemode: bool,
    #[serde(default)]
    pub data: Option<WebhookResource>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookResource {
    pub id: String,
    #[serde(rename = "type", default)]
    pub resource_type: Option<String>,
}

impl WebhookEvent {
    pub fn event_type(&self) -> &str {
        &self.data.attributes.event_type
    }

    /// Id of the resource the event is about (the checkout session for
    /// checkout events).
    pub fn resource_id(&self) -> Option<&str> {
        self.data.attributes.data.as_ref().map(|r| r.id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_centavos_guard() {
        assert_eq!(ensure_php_centavos(dec!(362.30)), Ok(36230));
        assert!(ensure_php_centavos(dec!(0)).is_err());
        assert!(ensure_php_centavos(dec!(-5)).is_err());
    }

    #[test]
    fn test_snapshot_falls_back_to_session_payments() {
        let body = serde_json::json!({
            "id": "cs_1",
            "attributes": {
                "status": "active",
                "checkout_url": "https://checkout.paymongo.com/cs_1",
                "payment_intent": {"id": "pi_1", "attributes": {"status": "processing"}},
                "payments": [{"id": "pay_1", "attributes": {"status": "paid"}}]
            }
        });
        let session: CheckoutSessionResource = serde_json::from_value(body).unwrap();
        let snapshot = session.to_snapshot();

        let intent = snapshot.payment_intent.as_ref().unwrap();
        assert_eq!(intent.status, "processing");
        assert_eq!(intent.payments[0].status, "paid");
        assert_eq!(snapshot.payment_ref(), "pay_1");
        assert_eq!(
            snapshot.checkout_url.as_deref(),
            Some("https://checkout.paymongo.com/cs_1")
        );
    }

    #[test]
    fn test_webhook_event_shape() {
        let body = serde_json::json!({
            "data": {
                "id": "evt_1",
                "type": "event",
                "attributes": {
                    "type": "checkout_session.payment.paid",
                    "livemode": false,
                    "data": {"id": "cs_9", "type": "checkout_session", "attributes": {}}
                }
            }
        });
        let event: WebhookEvent = serde_json::from_value(body).unwrap();
        assert_eq!(event.event_type(), PAYMENT_PAID_EVENT);
        assert_eq!(event.resource_id(), Some("cs_9"));
    }
}
