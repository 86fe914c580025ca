// PayMongo REST client
// Checkout session create/retrieve with PHP/centavo enforcement and transient retries.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Instant;
use tracing::{info, instrument, warn};

use crate::checkout::gateway::GatewayError;
use crate::paymongo::errors::{retry_class, PayMongoErrorEnvelope};
use crate::paymongo::types::{
    ensure_php_centavos, CheckoutSessionParams, CURRENCY, CheckoutSessionResource, CreateCheckoutSession,
    Envelope,
};

pub const PAYMONGO_API_BASE: &str = "https://api.paymongo.com";

const CREATE_RETRIES: u32 = 3;
const RETRIEVE_RETRIES: u32 = 1;

#[derive(Clone)]
pub struct PayMongoRestClient {
    pub(crate) http: Client,
    pub(crate) secret_key: String,
    pub(crate) api_base: String,
    pub(crate) base_delay_ms: u64,
    pub(crate) max_delay_ms: u64,
}

impl PayMongoRestClient {
    pub fn new(http: Client, secret_key: String) -> Self {
        Self {
            http,
            secret_key,
            api_base: PAYMONGO_API_BASE.to_string(),
            base_delay_ms: 200,
            max_delay_ms: 2_000,
        }
    }

    pub fn with_base(mut self, api_base: impl Into<String>) -> Self {
        let base: String = api_base.into();
        if !base.is_empty() {
            self.api_base = base.trim_end_matches('/').to_string();
        }
        self
    }

    pub fn with_backoff(mut self, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms.max(1);
        self.max_delay_ms = max_delay_ms.max(self.base_delay_ms);
        self
    }

    fn authorize(
        &self,
        req: reqwest::RequestBuilder,
        idempotency_key: Option<&str>,
    ) -> reqwest::RequestBuilder {
        let mut req = req
            .basic_auth(&self.secret_key, None::<&str>)
            .header("Accept", "application/json");
        if let Some(k) = idempotency_key {
            req = req.header("Idempotency-Key", k);
        }
        req
    }

    fn map_error(status: StatusCode, body: &str) -> GatewayError {
        match serde_json::from_str::<PayMongoErrorEnvelope>(body) {
            Ok(env) if !env.errors.is_empty() => env.into_gateway_error(Some(status.as_u16())),
            _ => GatewayError::Api {
                status: Some(status.as_u16()),
                code: None,
                detail: Some(body.chars().take(512).collect()),
            },
        }
    }

    async fn send<T: DeserializeOwned>(req: reqwest::RequestBuilder) -> Result<T, GatewayError> {
        let resp = req.send().await.map_err(|e| GatewayError::Http(e.to_string()))?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| GatewayError::Decode(e.to_string()))?;
        if status.is_success() {
            serde_json::from_str::<T>(&text).map_err(|e| GatewayError::Decode(e.to_string()))
        } else {
            Err(Self::map_error(status, &text))
        }
    }

    async fn with_retries<F, Fut, T>(
        &self,
        desc: &str,
        max_retries: u32,
        mut op: F,
    ) -> Result<T, GatewayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let base_delay_ms = self.base_delay_ms;
        let max_delay_ms = self.max_delay_ms;
        let mut attempt: u32 = 0;
        loop {
            let started = Instant::now();
            let result = op().await;
            crate::checkout_histogram_observe_ms!(
                "paymongo.request.ms",
                started.elapsed().as_millis() as u64,
                "op" => desc
            );
            match result {
                Ok(v) => return Ok(v),
                Err(e) => {
                    let (retryable, http_status) = retry_class(&e);
                    if !retryable || attempt >= max_retries {
                        return Err(e);
                    }

                    // Exponential backoff with full jitter
                    let exp = base_delay_ms.saturating_mul(1u64 << attempt.min(20));
                    let cap = exp.min(max_delay_ms);
                    let mut rng = SmallRng::from_entropy();
                    let delay_ms = if cap > base_delay_ms {
                        rng.gen_range(base_delay_ms..=cap)
                    } else {
                        base_delay_ms
                    };

                    warn!(
                        target: "paymongo",
                        desc = %desc,
                        attempt = attempt + 1,
                        max_retries = max_retries,
                        http_status = ?http_status,
                        next_delay_ms = delay_ms,
                        error = %e,
                        "retrying transient PayMongo error"
                    );
                    crate::checkout_counter_inc!("paymongo.request.retry", "op" => desc);

                    tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                    attempt += 1;
                }
            }
        }
    }

    // POST /v1/checkout_sessions
    #[instrument(skip(self, params), fields(method = "POST", path = "/v1/checkout_sessions", reference = %params.reference_number))]
    pub async fn create_checkout_session(
        &self,
        params: &CheckoutSessionParams,
    ) -> Result<CheckoutSessionResource, GatewayError> {
        for item in &params.line_items {
            if item.currency != CURRENCY || item.amount <= 0 {
                return Err(GatewayError::Precondition(
                    "PHP currency and positive centavos required",
                ));
            }
        }

        let body = Envelope {
            data: CreateCheckoutSession {
                attributes: params.clone(),
            },
        };
        let amount: i64 = params.line_items.iter().map(|i| i.amount).sum();

        info!(
            target: "paymongo",
            method = "POST",
            path = "/v1/checkout_sessions",
            amount_centavos = amount,
            methods = ?params.payment_method_types,
            "paymongo request"
        );

        let req_builder = || {
            let url = format!("{}/v1/checkout_sessions", self.api_base);
            // Same key on every attempt
            let req = self
                .authorize(self.http.post(url), Some(&params.reference_number))
                .json(&body);
            async move {
                Self::send::<Envelope<CheckoutSessionResource>>(req)
                    .await
                    .map(|env| env.data)
            }
        };
        self.with_retries("create_checkout_session", CREATE_RETRIES, req_builder)
            .await
    }

    // GET /v1/checkout_sessions/{id}
    #[instrument(skip(self), fields(method = "GET", path = "/v1/checkout_sessions/{id}", session_id = %session_id))]
    pub async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> Result<CheckoutSessionResource, GatewayError> {
        if session_id.is_empty() {
            return Err(GatewayError::Precondition("session id required"));
        }
        info!(
            target: "paymongo",
            method = "GET",
            path = "/v1/checkout_sessions/{id}",
            session_id = %session_id,
            "paymongo request"
        );
        let req_builder = || {
            let url = format!("{}/v1/checkout_sessions/{}", self.api_base, session_id);
            let req = self.authorize(self.http.get(url), None);
            async move {
                Self::send::<Envelope<CheckoutSessionResource>>(req)
                    .await
                    .map(|env| env.data)
            }
        };
        self.with_retries("retrieve_checkout_session", RETRIEVE_RETRIES, req_builder)
            .await
    }
}

/// Validate a peso amount and return it as centavos for a line item.
pub fn line_item_amount(amount: rust_decimal::Decimal) -> Result<i64, GatewayError> {
    ensure_php_centavos(amount).map_err(GatewayError::Precondition)
}
