// Hosted checkout session seam between the checkout core and a payment gateway

use async_trait::async_trait;
use rand::Rng;
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

use super::order::PaymentMethod;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("http error: {0}")]
    Http(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("gateway error: status={status:?} code={code:?} detail={detail:?}")]
    Api {
        status: Option<u16>,
        code: Option<String>,
        detail: Option<String>,
    },
    #[error("precondition failed: {0}")]
    Precondition(&'static str),
    #[error("transient error: {0}")]
    Transient(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CustomerInfo {
    pub name: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateSessionRequest {
    /// Pesos; converted to centavos on the wire.
    pub amount: Decimal,
    pub success_url: String,
    pub fail_url: String,
    pub customer: CustomerInfo,
    pub allowed_methods: Vec<String>,
    pub reference: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedSession {
    pub session_id: String,
    pub checkout_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntentSnapshot {
    pub id: Option<String>,
    pub status: String,
    /// Statuses of the intent's payments, newest first.
    pub payments: Vec<PaymentSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentSnapshot {
    pub id: String,
    pub status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub status: String,
    /// Hosted page the customer can reopen while the session is active.
    pub checkout_url: Option<String>,
    pub payment_intent: Option<IntentSnapshot>,
}

impl SessionSnapshot {
    /// Gateway reference to store on a paid order.
    pub fn payment_ref(&self) -> String {
        self.payment_intent
            .as_ref()
            .and_then(|intent| {
                intent
                    .payments
                    .first()
                    .map(|p| p.id.clone())
                    .or_else(|| intent.id.clone())
            })
            .unwrap_or_else(|| self.session_id.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentVerdict {
    Paid,
    /// The session can no longer be paid.
    Failed,
    Pending,
}

/// Collapse a session snapshot into one verdict. The first matching rule
/// wins: session paid, intent succeeded, first payment paid, session expired.
pub fn interpret(snapshot: &SessionSnapshot) -> PaymentVerdict {
    if snapshot.status == "paid" {
        return PaymentVerdict::Paid;
    }
    if let Some(intent) = &snapshot.payment_intent {
        if intent.status == "succeeded" {
            return PaymentVerdict::Paid;
        }
        if intent.payments.first().is_some_and(|p| p.status == "paid") {
            return PaymentVerdict::Paid;
        }
    }
    if snapshot.status == "expired" {
        return PaymentVerdict::Failed;
    }
    PaymentVerdict::Pending
}

/// Gateway method codes offered for a selected payment method.
pub fn allowed_methods(method: PaymentMethod) -> Vec<String> {
    let codes: &[&str] = match method {
        PaymentMethod::Gcash => &["gcash"],
        PaymentMethod::Maya => &["paymaya"],
        PaymentMethod::GrabPay => &["grab_pay"],
        PaymentMethod::Online => &["card", "gcash", "paymaya", "grab_pay"],
        PaymentMethod::Cash => &[],
    };
    codes.iter().map(|c| c.to_string()).collect()
}

/// Merchant reference of the form `order_<unix millis>_<0..999>`.
pub fn new_reference() -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let suffix: u16 = rand::thread_rng().gen_range(0..1000);
    format!("order_{millis}_{suffix}")
}

#[async_trait]
pub trait CheckoutGateway: Send + Sync {
    async fn create_session(&self, req: CreateSessionRequest) -> Result<CreatedSession, GatewayError>;

    async fn retrieve_session(&self, session_id: &str) -> Result<SessionSnapshot, GatewayError>;
}
