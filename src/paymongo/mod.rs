// PayMongo provider module

pub mod errors;
pub mod rest;
pub mod types;
pub mod webhook;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use crate::checkout::gateway::{
    CheckoutGateway, CreateSessionRequest, CreatedSession, GatewayError, SessionSnapshot,
};
use crate::settings::PayMongoSettings;
use self::rest::{line_item_amount, PayMongoRestClient};
use self::types::{Billing, CheckoutSessionParams, LineItem, SessionMetadata, CURRENCY, LINE_ITEM_NAME};

#[derive(Clone)]
pub struct PayMongoGateway {
    pub(crate) cfg: PayMongoSettings,
    pub(crate) rest: PayMongoRestClient,
}

impl PayMongoGateway {
    // Build reqwest client with rustls and timeout from cfg.
    pub fn new(cfg: PayMongoSettings) -> Result<Self, GatewayError> {
        let timeout = std::time::Duration::from_millis(if cfg.timeout_ms > 0 {
            cfg.timeout_ms
        } else {
            15_000
        });
        let http = Client::builder()
            .use_rustls_tls()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Http(e.to_string()))?;

        let rest = PayMongoRestClient::new(http, cfg.secret_key.clone()).with_base(cfg.api_base.clone());
        Ok(Self { cfg, rest })
    }

    pub fn rest(&self) -> &PayMongoRestClient {
        &self.rest
    }

    pub fn is_live_mode(&self) -> bool {
        self.cfg.is_live_mode()
    }

    fn session_params(&self, req: &CreateSessionRequest) -> Result<CheckoutSessionParams, GatewayError> {
        let amount = line_item_amount(req.amount)?;
        Ok(CheckoutSessionParams {
            description: format!("Order {}", req.reference),
            line_items: vec![LineItem {
                name: LINE_ITEM_NAME.to_string(),
                quantity: 1,
                amount,
                currency: CURRENCY.to_string(),
            }],
            payment_method_types: req.allowed_methods.clone(),
            success_url: with_session_param(&req.success_url, &req.reference),
            cancel_url: with_session_param(&req.fail_url, &req.reference),
            billing: Billing {
                name: req.customer.name.clone(),
                email: req.customer.email.clone(),
                phone: req.customer.phone.clone(),
            },
            send_email_receipt: true,
            show_description: true,
            show_line_items: true,
            reference_number: req.reference.clone(),
            metadata: SessionMetadata {
                order_id: req.reference.clone(),
                app_scheme: self.cfg.app_scheme.clone(),
            },
        })
    }
}

/// Append `session=<reference>` to a redirect URL.
pub fn with_session_param(url: &str, reference: &str) -> String {
    let sep = if url.contains('?') { '&' } else { '?' };
    format!("{url}{sep}session={reference}")
}

#[async_trait]
impl CheckoutGateway for PayMongoGateway {
    async fn create_session(&self, req: CreateSessionRequest) -> Result<CreatedSession, GatewayError> {
        if req.allowed_methods.is_empty() {
            return Err(GatewayError::Precondition("at least one payment method required"));
        }
        let params = self.session_params(&req)?;
        let session = self.rest.create_checkout_session(&params).await?;
        let checkout_url = session
            .attributes
            .checkout_url
            .clone()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| GatewayError::Decode("checkout session has no checkout_url".into()))?;
        debug!(session_id = %session.id, reference = %req.reference, "Created PayMongo checkout session");
        Ok(CreatedSession {
            session_id: session.id,
            checkout_url,
        })
    }

    async fn retrieve_session(&self, session_id: &str) -> Result<SessionSnapshot, GatewayError> {
        let session = self.rest.retrieve_checkout_session(session_id).await?;
        Ok(session.to_snapshot())
    }
}
