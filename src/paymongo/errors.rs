// PayMongo error envelope and webhook errors

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::checkout::gateway::GatewayError;

// PayMongo REST error envelope: { errors: [ { code, detail, source } ] }
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayMongoErrorEnvelope {
    #[serde(default)]
    pub errors: Vec<PayMongoErrorDetail>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayMongoErrorDetail {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl PayMongoErrorEnvelope {
    pub fn into_gateway_error(self, status: Option<u16>) -> GatewayError {
        let code = self.errors.first().and_then(|e| e.code.clone());
        let details: Vec<String> = self.errors.into_iter().filter_map(|e| e.detail).collect();
        GatewayError::Api {
            status,
            code,
            detail: if details.is_empty() {
                None
            } else {
                Some(details.join("; "))
            },
        }
    }
}

/// Server errors and rate limiting are worth retrying.
pub fn is_transient(http_status: Option<u16>) -> bool {
    matches!(http_status, Some(s) if (500..600).contains(&s) || s == 429)
}

/// Whether a gateway error should be retried, with the status it carried.
pub(crate) fn retry_class(e: &GatewayError) -> (bool, Option<u16>) {
    match e {
        GatewayError::Api { status, .. } => (is_transient(*status), *status),
        GatewayError::Http(_) | GatewayError::Transient(_) => (true, None),
        GatewayError::Decode(_) | GatewayError::Precondition(_) => (false, None),
    }
}

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
    #[error("timestamp tolerance exceeded: {0}")]
    TimestampTolerance(String),
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("missing webhook secret")]
    MissingSecret,
    #[error("missing signature header")]
    MissingSignature,
    #[error("event processing failed: {0}")]
    ProcessingFailed(String),
}

impl WebhookError {
    pub fn status_code(&self) -> u16 {
        match self {
            WebhookError::InvalidSignature(_) => 401,
            WebhookError::TimestampTolerance(_) => 400,
            WebhookError::MalformedPayload(_) => 400,
            WebhookError::MissingSecret => 500,
            WebhookError::MissingSignature => 401,
            WebhookError::ProcessingFailed(_) => 500,
        }
    }
}
