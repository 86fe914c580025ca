// HTTP surface: checkout, order reconciliation, PayMongo webhook and redirect pages

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::checkout::cart::{CartItem, CustomerSession, Identity};
use crate::checkout::order::{OrderId, PaymentStatus};
use crate::checkout::reconciler::ReconcileError;
use crate::checkout::service::CheckoutRequest;
use crate::checkout::voucher::available_vouchers;
use crate::checkout::{CheckoutError, CheckoutService, OrderStore, PaymentReconciler};
use crate::paymongo::webhook::{self, WebhookConfig};
use crate::store::StoreError;

#[derive(Clone)]
pub struct AppState {
    pub checkout: Arc<CheckoutService>,
    pub orders: Arc<OrderStore>,
    pub reconciler: PaymentReconciler,
    pub webhook: WebhookConfig,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Unprocessable(String),
    BadGateway(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, m),
            ApiError::Unprocessable(m) => (StatusCode::UNPROCESSABLE_ENTITY, m),
            ApiError::BadGateway(m) => (StatusCode::BAD_GATEWAY, m),
            ApiError::Internal(m) => {
                error!(error = %m, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, m)
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(path) => ApiError::NotFound(format!("not found: {}", path.key())),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<CheckoutError> for ApiError {
    fn from(e: CheckoutError) -> Self {
        match e {
            CheckoutError::EmptyCart => ApiError::BadRequest(e.to_string()),
            CheckoutError::PaymentMethodDisabled(_) => ApiError::Unprocessable(e.to_string()),
            CheckoutError::AlreadyInProgress => ApiError::Conflict(e.to_string()),
            CheckoutError::Gateway(_) => ApiError::BadGateway(e.to_string()),
            CheckoutError::Store(inner) => inner.into(),
        }
    }
}

impl From<ReconcileError> for ApiError {
    fn from(e: ReconcileError) -> Self {
        match e {
            ReconcileError::OrderNotFound(_) => ApiError::NotFound(e.to_string()),
            ReconcileError::Store(inner) => inner.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutBody {
    pub identity: Identity,
    pub items: Vec<CartItem>,
    #[serde(default)]
    pub voucher_code: Option<String>,
    #[serde(flatten)]
    pub request: CheckoutRequest,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/checkout", post(checkout))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/verify", post(verify_payment))
        .route("/orders/:id/poll", post(start_polling))
        .route("/orders/:id/resume-payment", post(resume_payment))
        .route("/orders/:id/credit-points", post(credit_points))
        .route("/customers/:uid/orders", get(customer_orders))
        .route("/customers/:uid/vouchers", get(customer_vouchers))
        .route("/payment/success", get(payment_success))
        .route("/payment/failed", get(payment_failed))
        .route("/paymongo/webhook", post(paymongo_webhook))
        .with_state(state)
}

pub async fn run(
    port: u16,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting checkout HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn checkout(
    State(state): State<AppState>,
    Json(body): Json<CheckoutBody>,
) -> Result<impl IntoResponse, ApiError> {
    let mut session = CustomerSession::new(body.identity);
    for item in body.items {
        validate_item(&item)?;
        session.cart.add_item(item);
    }
    if let Some(code) = body.voucher_code {
        session.apply_voucher(code);
    }

    let placed = state.checkout.place_order(&mut session, body.request).await?;
    Ok((StatusCode::CREATED, Json(placed)))
}

/// Largest quantity accepted for one cart line.
pub const MAX_ITEM_QUANTITY: u32 = 999;

fn validate_item(item: &CartItem) -> Result<(), ApiError> {
    if item.quantity == 0 || item.quantity > MAX_ITEM_QUANTITY {
        return Err(ApiError::BadRequest(format!(
            "item {} quantity must be between 1 and {MAX_ITEM_QUANTITY}",
            item.product_id
        )));
    }
    if item.price.is_sign_negative() {
        return Err(ApiError::BadRequest(format!(
            "item {} has a negative price",
            item.product_id
        )));
    }
    if let Some(add_on) = item.add_ons.values().find(|a| a.price.is_sign_negative()) {
        return Err(ApiError::BadRequest(format!(
            "add-on {} of item {} has a negative price",
            add_on.id, item.product_id
        )));
    }
    Ok(())
}

fn order_id(raw: String) -> Result<OrderId, ApiError> {
    if raw.trim().is_empty() {
        return Err(ApiError::BadRequest("order id required".into()));
    }
    Ok(OrderId::new(raw))
}

async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = order_id(id)?;
    let order = state
        .orders
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("order not found: {id}")))?;
    Ok(Json(order))
}

async fn session_for(state: &AppState, id: &OrderId) -> Result<String, ApiError> {
    let order = state
        .orders
        .get(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("order not found: {id}")))?;
    match order.checkout_session_id {
        Some(session_id) => Ok(session_id),
        // Cash orders are paid on creation and never reach the gateway
        None if order.effective_payment_status() != PaymentStatus::Unpaid => Ok(String::new()),
        None => Err(ApiError::Conflict(format!("order {id} has no checkout session"))),
    }
}

/// Reconcile an order against its checkout session.
///
/// Answers 200 with a `CheckOutcome` for a known order. `in_flight` means another check
/// for the order is still running (including its settle delay); callers
/// should retry after a short wait.
async fn verify_payment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = order_id(id)?;
    let session_id = session_for(&state, &id).await?;
    let outcome = state.reconciler.check_status(&id, &session_id).await?;
    Ok(Json(outcome))
}

async fn start_polling(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = order_id(id)?;
    let session_id = session_for(&state, &id).await?;
    let _ = state.reconciler.start_polling(id.clone(), session_id);
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "orderId": id, "polling": true })),
    ))
}

/// Reopen the hosted checkout page of an unpaid order. Answers
/// `{"result": "open", "checkout_url", ..}` while the session can be paid,
/// or `{"result": "settled", "outcome", ..}` once it has settled.
async fn resume_payment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = order_id(id)?;
    let session_id = session_for(&state, &id).await?;
    let outcome = state.reconciler.resume_payment(&id, &session_id).await?;
    Ok(Json(outcome))
}

async fn credit_points(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = order_id(id)?;
    let credit = state.orders.retry_point_credit(&id).await?;
    Ok(Json(credit))
}

async fn customer_orders(
    State(state): State<AppState>,
    Path(uid): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let orders = state.orders.orders_for_customer(&uid).await?;
    let points = state.orders.user_points(&uid).await?;
    Ok(Json(json!({ "orders": orders, "points": points })))
}

async fn customer_vouchers(
    State(state): State<AppState>,
    Path(uid): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let merchant = state.checkout.merchant_settings().await?;
    let usage = match state.checkout.ledger().usage(&uid).await {
        Ok(usage) => usage,
        Err(e) => {
            warn!(uid = %uid, error = %e, "Voucher usage unavailable; listing without counts");
            Default::default()
        }
    };
    Ok(Json(available_vouchers(&merchant.vouchers, &usage)))
}

fn landing_page(title: &str, message: &str) -> impl IntoResponse {
    let body = format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>{title}</title></head>\
         <body><h1>{title}</h1><p>{message}</p>\
         <p>You can close this window and return to the app.</p></body></html>"
    );
    (
        [
            (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
            (header::X_FRAME_OPTIONS, "DENY"),
            (header::X_XSS_PROTECTION, "1; mode=block"),
        ],
        Html(body),
    )
}

async fn payment_success() -> impl IntoResponse {
    landing_page("Payment received", "Thank you! Your order is being confirmed.")
}

async fn payment_failed() -> impl IntoResponse {
    landing_page("Payment not completed", "Your payment was cancelled or failed.")
}

async fn paymongo_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    match webhook::handle_webhook(
        &body,
        &headers,
        &state.webhook,
        &state.orders,
        &state.reconciler,
    )
    .await
    {
        Ok(outcome) => {
            info!(outcome = ?outcome, "Webhook processed successfully");
            (StatusCode::OK, Json(json!({ "received": true })))
        }
        Err(e) => {
            error!("Webhook processing failed: {}", e);
            let status_code =
                StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status_code, Json(json!({ "error": e.to_string() })))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkout::countdown::ExpiryCountdown;
    use crate::checkout::merchant::MerchantSettings;
    use crate::checkout::reconciler::ReconcilerSettings;
    use crate::checkout::service::CheckoutConfig;
    use crate::checkout::testing::{new_order, snapshot, ScriptedGateway};
    use crate::store::{DocumentStore, MemoryStore};
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Utc;
    use std::time::Duration;
    use tower::ServiceExt;

    struct Fixture {
        orders: Arc<OrderStore>,
        gateway: Arc<ScriptedGateway>,
        app: Router,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        store
            .set(
                &MerchantSettings::path(),
                json!({
                    "payment": {"enableMaya": false},
                    "vouchers": [
                        {"code": "NOOK50", "discountAmount": 50, "minimumOrderAmount": 250, "maxUsagePerUser": 1}
                    ]
                }),
            )
            .await
            .unwrap();
        let orders = Arc::new(OrderStore::new(store.clone()));
        let gateway = Arc::new(ScriptedGateway::new());
        let countdown = ExpiryCountdown::new(orders.clone(), Duration::from_secs(1));
        let reconciler = PaymentReconciler::new(
            orders.clone(),
            gateway.clone(),
            countdown.clone(),
            ReconcilerSettings {
                settle_delay: Duration::ZERO,
                poll_interval: Duration::from_millis(20),
                max_poll_attempts: 2,
            },
        );
        let checkout = Arc::new(CheckoutService::new(
            store.clone(),
            orders.clone(),
            gateway.clone(),
            countdown,
            CheckoutConfig {
                payment_expiry: Duration::from_secs(600),
                success_url: "http://localhost:3000/payment/success".into(),
                fail_url: "http://localhost:3000/payment/failed".into(),
            },
        ));
        let state = AppState {
            checkout,
            orders: orders.clone(),
            reconciler,
            webhook: WebhookConfig {
                secret: "whsk_test".into(),
                tolerance_seconds: 300,
                live_mode: false,
            },
        };
        Fixture {
            orders,
            gateway,
            app: router(state),
        }
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn checkout_body(method: &str, quantity: u32) -> serde_json::Value {
        json!({
            "identity": {"uid": "u1", "email": "u1@example.com", "displayName": "Ana"},
            "items": [{"productId": "latte", "name": "Latte", "price": "120", "quantity": quantity}],
            "voucherCode": "NOOK50",
            "paymentMethod": method,
        })
    }

    #[tokio::test]
    async fn test_health_check() {
        let f = fixture().await;
        let resp = f
            .app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_cash_checkout_creates_paid_order() {
        let f = fixture().await;
        let resp = f
            .app
            .clone()
            .oneshot(post_json("/checkout", checkout_body("cash", 3)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let placed = json_body(resp).await;
        let total: rust_decimal::Decimal = placed["pricing"]["total"].as_str().unwrap().parse().unwrap();
        assert_eq!(total, rust_decimal_macros::dec!(310));
        assert!(placed.get("checkoutUrl").is_none());

        let order_id = placed["orderId"].as_str().unwrap().to_string();
        let resp = f
            .app
            .oneshot(
                Request::get(format!("/orders/{order_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let order = json_body(resp).await;
        assert_eq!(order["paymentStatus"], "paid");
        assert_eq!(order["pointsEarned"], 3);
    }

    #[tokio::test]
    async fn test_checkout_error_statuses() {
        let f = fixture().await;
        let resp = f
            .app
            .clone()
            .oneshot(post_json("/checkout", checkout_body("maya", 1)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let mut empty = checkout_body("cash", 1);
        empty["items"] = json!([]);
        let resp = f.app.clone().oneshot(post_json("/checkout", empty)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        f.gateway.fail_create(true);
        let resp = f
            .app
            .oneshot(post_json("/checkout", checkout_body("gcash", 1)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_checkout_rejects_oversized_quantities() {
        let f = fixture().await;
        let mut body = checkout_body("cash", 2);
        body["items"] = json!([
            {"productId": "latte", "name": "Latte", "price": "120", "quantity": u32::MAX},
            {"productId": "latte", "name": "Latte", "price": "120", "quantity": 2}
        ]);

        let resp = f.app.clone().oneshot(post_json("/checkout", body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = f
            .app
            .oneshot(post_json("/checkout", checkout_body("cash", MAX_ITEM_QUANTITY)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn test_checkout_rejects_negative_prices() {
        let f = fixture().await;
        let mut negative = checkout_body("cash", 3);
        negative["voucherCode"] = json!(null);
        negative["items"][0]["price"] = json!("-500");
        let resp = f.app.clone().oneshot(post_json("/checkout", negative)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let mut add_on = checkout_body("cash", 1);
        add_on["items"][0]["addOns"] = json!({"shot": {"id": "shot", "name": "Extra shot", "price": "-200"}});
        let resp = f.app.oneshot(post_json("/checkout", add_on)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        assert!(f.orders.orders_for_customer("u1").await.unwrap().is_empty());
        assert_eq!(f.orders.user_points("u1").await.unwrap().points, 0);
    }

    #[tokio::test]
    async fn test_resume_payment_returns_checkout_url_then_settles() {
        let f = fixture().await;
        let id = f
            .orders
            .create_unpaid_order(new_order("u1", 1), "cs_r", Utc::now() + chrono::Duration::minutes(10))
            .await
            .unwrap();
        f.gateway.push(Ok(snapshot("cs_r", "active")));
        f.gateway.push(Ok(snapshot("cs_r", "paid")));

        let resp = f
            .app
            .clone()
            .oneshot(post_json(&format!("/orders/{id}/resume-payment"), json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let open = json_body(resp).await;
        assert_eq!(open["result"], "open");
        assert_eq!(open["checkout_url"], "https://checkout.example/cs_r");

        let resp = f
            .app
            .oneshot(post_json(&format!("/orders/{id}/resume-payment"), json!({})))
            .await
            .unwrap();
        let settled = json_body(resp).await;
        assert_eq!(settled["result"], "settled");
        assert_eq!(settled["outcome"], "paid");
    }

    #[tokio::test]
    async fn test_verify_marks_online_order_paid() {
        let f = fixture().await;
        let id = f
            .orders
            .create_unpaid_order(new_order("u1", 2), "cs_v", Utc::now() + chrono::Duration::minutes(10))
            .await
            .unwrap();
        f.gateway.push(Ok(snapshot("cs_v", "paid")));

        let resp = f
            .app
            .clone()
            .oneshot(post_json(&format!("/orders/{id}/verify"), json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let outcome = json_body(resp).await;
        assert_eq!(outcome["outcome"], "paid");
        assert_eq!(outcome["points_earned"], 2);

        let resp = f
            .app
            .oneshot(post_json("/orders/missing/verify", json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_customer_vouchers_reflect_usage() {
        let f = fixture().await;
        let resp = f
            .app
            .clone()
            .oneshot(post_json("/checkout", checkout_body("cash", 3)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = f
            .app
            .oneshot(
                Request::get("/customers/u1/vouchers")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let vouchers = json_body(resp).await;
        assert_eq!(vouchers[0]["code"], "NOOK50");
        assert_eq!(vouchers[0]["timesUsed"], 1);
        assert_eq!(vouchers[0]["usedUp"], true);
    }

    #[tokio::test]
    async fn test_landing_pages_send_security_headers() {
        let f = fixture().await;
        let resp = f
            .app
            .oneshot(Request::get("/payment/success").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let headers = resp.headers();
        assert_eq!(headers[header::X_CONTENT_TYPE_OPTIONS], "nosniff");
        assert_eq!(headers[header::X_FRAME_OPTIONS], "DENY");
        assert!(headers.contains_key(header::X_XSS_PROTECTION));
    }

    #[tokio::test]
    async fn test_webhook_without_signature_is_unauthorized() {
        let f = fixture().await;
        let resp = f
            .app
            .oneshot(post_json("/paymongo/webhook", json!({"data": {}})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
