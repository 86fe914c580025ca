// Checkout orchestration: cart -> priced order -> gateway session

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument, warn};

use super::cart::CustomerSession;
use super::countdown::ExpiryCountdown;
use super::gateway::{
    allowed_methods, new_reference, CheckoutGateway, CreateSessionRequest, CustomerInfo,
    GatewayError,
};
use super::merchant::MerchantSettings;
use super::order::{DiningMode, NewOrder, OrderId, PaymentMethod};
use super::order_store::{OrderStore, PointCredit};
use super::pricing::{self, Pricing};
use super::voucher::{find_voucher, validate, VoucherLedger, VoucherSettings, VoucherUsageError};
use super::KeySet;
use crate::checkout_counter_inc;
use crate::store::{DocumentStore, StoreError};

#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error("cart is empty")]
    EmptyCart,
    #[error("payment method {0:?} is not enabled")]
    PaymentMethodDisabled(PaymentMethod),
    #[error("a checkout is already in progress for this customer")]
    AlreadyInProgress,
    #[error("payment gateway error: {0}")]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    pub payment_method: PaymentMethod,
    #[serde(default)]
    pub dining_mode: DiningMode,
    /// Passed to the gateway for billing.
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacedOrder {
    pub order_id: OrderId,
    pub payment_method: PaymentMethod,
    pub pricing: Pricing,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkout_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub point_credit: Option<PointCredit>,
    /// Changes made to the customer's selection, e.g. a dropped voucher.
    pub notices: Vec<String>,
    /// Non-fatal problems that need follow-up.
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CheckoutConfig {
    pub payment_expiry: Duration,
    pub success_url: String,
    pub fail_url: String,
}

struct Settled {
    order_id: OrderId,
    checkout_url: Option<String>,
    session_id: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    point_credit: Option<PointCredit>,
}

pub struct CheckoutService {
    store: Arc<dyn DocumentStore>,
    orders: Arc<OrderStore>,
    ledger: VoucherLedger,
    gateway: Arc<dyn CheckoutGateway>,
    countdown: ExpiryCountdown,
    config: CheckoutConfig,
    in_progress: KeySet<String>,
}

impl CheckoutService {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        orders: Arc<OrderStore>,
        gateway: Arc<dyn CheckoutGateway>,
        countdown: ExpiryCountdown,
        config: CheckoutConfig,
    ) -> Self {
        Self {
            ledger: VoucherLedger::new(store.clone()),
            store,
            orders,
            gateway,
            countdown,
            config,
            in_progress: KeySet::new(),
        }
    }

    pub fn ledger(&self) -> &VoucherLedger {
        &self.ledger
    }

    pub async fn merchant_settings(&self) -> Result<MerchantSettings, StoreError> {
        MerchantSettings::load(self.store.as_ref()).await
    }

    /// Turn the session's cart into an order. On success the cart and the
    /// applied voucher are cleared.
    #[instrument(skip(self, session, request), fields(uid = %session.identity.uid, method = ?request.payment_method))]
    pub async fn place_order(
        &self,
        session: &mut CustomerSession,
        request: CheckoutRequest,
    ) -> Result<PlacedOrder, CheckoutError> {
        let uid = session.identity.uid.clone();
        let Some(_guard) = self.in_progress.try_claim(&uid) else {
            return Err(CheckoutError::AlreadyInProgress);
        };

        if session.cart.is_empty() {
            return Err(CheckoutError::EmptyCart);
        }
        let merchant = self.merchant_settings().await?;
        if !merchant.payment.is_enabled(request.payment_method) {
            return Err(CheckoutError::PaymentMethodDisabled(request.payment_method));
        }

        let mut notices = Vec::new();
        let mut warnings = Vec::new();
        let cart_total = session.cart.total();

        let mut voucher = self
            .revalidate_voucher(session, &merchant, cart_total, &mut notices, &mut warnings)
            .await;

        let mut reserved = None;
        if let Some(v) = voucher.take() {
            match self.ledger.record_use(&uid, &v).await {
                Ok(_) => {
                    reserved = Some(v.code.clone());
                    voucher = Some(v);
                }
                Err(VoucherUsageError::LimitReached { code, .. }) => {
                    notices.push(format!("Voucher {code} reached its usage limit and was removed"));
                    session.clear_voucher();
                }
                Err(VoucherUsageError::Store(e)) => {
                    warn!(error = %e, code = %v.code, "Voucher usage not recorded");
                    warnings.push(format!("Usage of voucher {} could not be recorded", v.code));
                    voucher = Some(v);
                }
            }
        }

        let pricing = pricing::calculate(
            cart_total,
            &merchant.tax,
            &merchant.payment,
            voucher.as_ref(),
        );
        let new = NewOrder::from_cart(
            session.identity.clone(),
            session.cart.items(),
            pricing.clone(),
            request.payment_method,
            request.dining_mode,
        );

        let settled = if !request.payment_method.is_online() {
            self.settle_cash(new).await
        } else {
            self.settle_online(new, request.phone.clone()).await
        };
        let settled = match settled {
            Ok(settled) => settled,
            Err(e) => {
                if let Some(code) = reserved {
                    if let Err(release_err) = self.ledger.release(&uid, &code).await {
                        warn!(error = %release_err, code = %code, "Voucher reservation not released");
                    }
                }
                checkout_counter_inc!("checkout.place_order.failed");
                return Err(e);
            }
        };

        if let Some(PointCredit::Deferred { reason }) = &settled.point_credit {
            warnings.push(format!("Points will be credited later: {reason}"));
        }
        session.cart.clear();
        session.clear_voucher();

        info!(order_id = %settled.order_id, total = %pricing.total, "Order placed");
        checkout_counter_inc!("checkout.place_order.succeeded");
        Ok(PlacedOrder {
            order_id: settled.order_id,
            payment_method: request.payment_method,
            pricing,
            checkout_url: settled.checkout_url,
            session_id: settled.session_id,
            expires_at: settled.expires_at,
            point_credit: settled.point_credit,
            notices,
            warnings,
        })
    }

    /// The applied voucher, if it still applies to this cart. Anything else
    /// clears it from the session with a notice.
    async fn revalidate_voucher(
        &self,
        session: &mut CustomerSession,
        merchant: &MerchantSettings,
        cart_total: rust_decimal::Decimal,
        notices: &mut Vec<String>,
        warnings: &mut Vec<String>,
    ) -> Option<VoucherSettings> {
        let code = session.applied_voucher()?.to_string();
        let Some(voucher) = find_voucher(&merchant.vouchers, &code).cloned() else {
            notices.push(format!("Voucher {code} is no longer available and was removed"));
            session.clear_voucher();
            return None;
        };

        let usage = match self
            .ledger
            .usage_count(&session.identity.uid, &voucher.code)
            .await
        {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "Voucher usage unavailable");
                warnings.push(format!("Usage of voucher {} could not be checked", voucher.code));
                0
            }
        };
        let subtotal = pricing::calculate(cart_total, &merchant.tax, &merchant.payment, None).subtotal;
        let eligibility = validate(&voucher, subtotal, usage);
        if let Some(reason) = eligibility.reason {
            notices.push(format!("Voucher {} was removed: {reason}", voucher.code));
            session.clear_voucher();
            return None;
        }
        Some(voucher)
    }

    async fn settle_cash(&self, new: NewOrder) -> Result<Settled, CheckoutError> {
        let paid = self.orders.create_paid_order(new, None).await?;
        Ok(Settled {
            order_id: paid.order_id,
            checkout_url: None,
            session_id: None,
            expires_at: None,
            point_credit: Some(paid.credit),
        })
    }

    async fn settle_online(&self, new: NewOrder, phone: Option<String>) -> Result<Settled, CheckoutError> {
        let request = CreateSessionRequest {
            amount: new.pricing.total,
            success_url: self.config.success_url.clone(),
            fail_url: self.config.fail_url.clone(),
            customer: CustomerInfo {
                name: new.customer.name().to_string(),
                email: new.customer.email.clone(),
                phone,
            },
            allowed_methods: allowed_methods(new.payment_method),
            reference: new_reference(),
        };
        let created = self.gateway.create_session(request).await?;

        let window = chrono::Duration::from_std(self.config.payment_expiry)
            .unwrap_or_else(|_| chrono::Duration::minutes(10));
        let expires_at = Utc::now() + window;
        let order_id = self
            .orders
            .create_unpaid_order(new, &created.session_id, expires_at)
            .await?;
        self.countdown.start(order_id.clone(), expires_at);

        Ok(Settled {
            order_id,
            checkout_url: Some(created.checkout_url),
            session_id: Some(created.session_id),
            expires_at: Some(expires_at),
            point_credit: None,
        })
    }
}
