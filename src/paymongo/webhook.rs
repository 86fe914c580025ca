// PayMongo webhook handling with signature verification and event dispatch

use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, instrument, warn};

use crate::checkout::order::OrderId;
use crate::checkout::order_store::OrderStore;
use crate::checkout::reconciler::{CheckOutcome, PaymentReconciler};
use crate::checkout_counter_inc;
use crate::paymongo::errors::WebhookError;
use crate::paymongo::types::{WebhookEvent, PAYMENT_PAID_EVENT};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "paymongo-signature";

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub secret: String,
    pub tolerance_seconds: i64,
    /// Live events are signed in `li`, test events in `te`.
    pub live_mode: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Reconciled {
        order_id: OrderId,
        outcome: CheckOutcome,
    },
    /// No order carries the event's checkout session.
    UnknownSession { session_id: String },
    Ignored { event_type: String },
}

/// Verify the signature, then reconcile the order behind a paid checkout
/// session. Events of other types are acknowledged and ignored.
#[instrument(skip(payload, headers, cfg, orders, reconciler))]
pub async fn handle_webhook(
    payload: &[u8],
    headers: &http::HeaderMap,
    cfg: &WebhookConfig,
    orders: &OrderStore,
    reconciler: &PaymentReconciler,
) -> Result<WebhookOutcome, WebhookError> {
    verify_signature(payload, headers, &cfg.secret, cfg.tolerance_seconds, cfg.live_mode)?;

    let event: WebhookEvent = serde_json::from_slice(payload)
        .map_err(|e| WebhookError::MalformedPayload(format!("JSON parse error: {}", e)))?;

    checkout_counter_inc!("paymongo.webhook.received", "event_type" => event.event_type());
    process_event(&event, orders, reconciler).await
}

pub async fn process_event(
    event: &WebhookEvent,
    orders: &OrderStore,
    reconciler: &PaymentReconciler,
) -> Result<WebhookOutcome, WebhookError> {
    let event_type = event.event_type();
    debug!(event_id = %event.data.id, event_type = %event_type, "Processing webhook event");

    if event_type != PAYMENT_PAID_EVENT {
        info!(event_type = %event_type, "Ignoring unsupported event type");
        return Ok(WebhookOutcome::Ignored {
            event_type: event_type.to_string(),
        });
    }

    let session_id = event
        .resource_id()
        .ok_or_else(|| WebhookError::MalformedPayload("event has no checkout session".into()))?;

    let order = orders
        .find_by_session(session_id)
        .await
        .map_err(|e| WebhookError::ProcessingFailed(e.to_string()))?;
    let Some(order) = order else {
        warn!(session_id = %session_id, "Paid event for unknown checkout session");
        return Ok(WebhookOutcome::UnknownSession {
            session_id: session_id.to_string(),
        });
    };

    let outcome = reconciler
        .check_status(&order.id, session_id)
        .await
        .map_err(|e| WebhookError::ProcessingFailed(e.to_string()))?;
    info!(order_id = %order.id, session_id = %session_id, outcome = ?outcome, "Webhook reconciled order");
    checkout_counter_inc!("paymongo.webhook.processed", "event_type" => event_type);

    Ok(WebhookOutcome::Reconciled {
        order_id: order.id,
        outcome,
    })
}

/// Verify a `Paymongo-Signature: t=<ts>,te=<hex>,li=<hex>` header.
pub fn verify_signature(
    payload: &[u8],
    headers: &http::HeaderMap,
    webhook_secret: &str,
    tolerance_seconds: i64,
    live_mode: bool,
) -> Result<(), WebhookError> {
    if webhook_secret.is_empty() {
        return Err(WebhookError::MissingSecret);
    }

    let signature_header = headers
        .get(SIGNATURE_HEADER)
        .ok_or(WebhookError::MissingSignature)?
        .to_str()
        .map_err(|e| WebhookError::InvalidSignature(format!("Invalid header encoding: {}", e)))?;

    let mut timestamp: Option<i64> = None;
    let mut test_sig: Option<&str> = None;
    let mut live_sig: Option<&str> = None;
    for part in signature_header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = value.parse().ok(),
            "te" => test_sig = Some(value).filter(|v| !v.is_empty()),
            "li" => live_sig = Some(value).filter(|v| !v.is_empty()),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        WebhookError::InvalidSignature("Missing timestamp in signature header".to_string())
    })?;
    let provided = (if live_mode { live_sig } else { test_sig }).ok_or_else(|| {
        WebhookError::InvalidSignature(format!(
            "No {} signature found",
            if live_mode { "li" } else { "te" }
        ))
    })?;

    let current_time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| WebhookError::InvalidSignature(format!("System time error: {}", e)))?
        .as_secs() as i64;
    let time_diff = (current_time - timestamp).abs();
    if time_diff > tolerance_seconds {
        return Err(WebhookError::TimestampTolerance(format!(
            "Timestamp {} differs from current time {} by {} seconds (tolerance: {})",
            timestamp, current_time, time_diff, tolerance_seconds
        )));
    }

    let expected = sign(webhook_secret, timestamp, payload)?;
    if !constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
        return Err(WebhookError::InvalidSignature("Signature mismatch".to_string()));
    }

    debug!(timestamp, time_diff, live_mode, "Webhook signature verified");
    Ok(())
}

/// Hex HMAC-SHA256 of `"{timestamp}.{payload}"`.
pub fn sign(webhook_secret: &str, timestamp: i64, payload: &[u8]) -> Result<String, WebhookError> {
    let mut mac = HmacSha256::new_from_slice(webhook_secret.as_bytes())
        .map_err(|e| WebhookError::InvalidSignature(format!("HMAC init error: {}", e)))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
