// Voucher eligibility and per-user usage ledger

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::store::{get_as, txn_get_as, DocPath, DocumentStore, StoreError, TxnContext};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoucherSettings {
    pub code: String,
    #[serde(default)]
    pub description: String,
    pub discount_amount: Decimal,
    #[serde(default)]
    pub minimum_order_amount: Decimal,
    /// Zero means unlimited.
    #[serde(default)]
    pub max_usage_per_user: u32,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IneligibleReason {
    Disabled,
    UsageLimitReached,
    MinimumSpendNotMet,
}

impl fmt::Display for IneligibleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IneligibleReason::Disabled => "voucher disabled",
            IneligibleReason::UsageLimitReached => "usage limit reached",
            IneligibleReason::MinimumSpendNotMet => "minimum spend not met",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Eligibility {
    pub eligible: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<IneligibleReason>,
}

impl Eligibility {
    fn ok() -> Self {
        Self {
            eligible: true,
            reason: None,
        }
    }

    fn rejected(reason: IneligibleReason) -> Self {
        Self {
            eligible: false,
            reason: Some(reason),
        }
    }
}

pub fn validate(voucher: &VoucherSettings, subtotal: Decimal, usage_count: u32) -> Eligibility {
    if !voucher.enabled {
        return Eligibility::rejected(IneligibleReason::Disabled);
    }
    if voucher.max_usage_per_user > 0 && usage_count >= voucher.max_usage_per_user {
        return Eligibility::rejected(IneligibleReason::UsageLimitReached);
    }
    if subtotal < voucher.minimum_order_amount {
        return Eligibility::rejected(IneligibleReason::MinimumSpendNotMet);
    }
    Eligibility::ok()
}

/// Enabled voucher matching `code`, ignoring case and surrounding spaces.
pub fn find_voucher<'a>(vouchers: &'a [VoucherSettings], code: &str) -> Option<&'a VoucherSettings> {
    let code = code.trim();
    vouchers
        .iter()
        .find(|v| v.enabled && v.code.trim().eq_ignore_ascii_case(code))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableVoucher {
    #[serde(flatten)]
    pub voucher: VoucherSettings,
    pub times_used: u32,
    pub used_up: bool,
}

pub fn available_vouchers(
    vouchers: &[VoucherSettings],
    usage: &HashMap<String, u32>,
) -> Vec<AvailableVoucher> {
    vouchers
        .iter()
        .filter(|v| v.enabled)
        .map(|v| {
            let times_used = usage.get(&v.code).copied().unwrap_or(0);
            AvailableVoucher {
                voucher: v.clone(),
                times_used,
                used_up: v.max_usage_per_user > 0 && times_used >= v.max_usage_per_user,
            }
        })
        .collect()
}

#[derive(Debug, Error)]
pub enum VoucherUsageError {
    #[error("voucher {code} already used {limit} time(s)")]
    LimitReached { code: String, limit: u32 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub fn usage_path(uid: &str) -> DocPath {
    DocPath::new(format!("users/{uid}/voucherUsage"), "counts")
}

/// Usage counters stored at `users/{uid}/voucherUsage/counts`.
#[derive(Clone)]
pub struct VoucherLedger {
    store: Arc<dyn DocumentStore>,
}

impl VoucherLedger {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub async fn usage(&self, uid: &str) -> Result<HashMap<String, u32>, StoreError> {
        Ok(get_as(self.store.as_ref(), &usage_path(uid))
            .await?
            .unwrap_or_default())
    }

    pub async fn usage_count(&self, uid: &str, code: &str) -> Result<u32, StoreError> {
        Ok(self.usage(uid).await?.get(code).copied().unwrap_or(0))
    }

    /// Count one use of `voucher`. The cap is re-checked inside the
    /// transaction; returns the new count.
    #[instrument(skip(self, voucher), fields(code = %voucher.code))]
    pub async fn record_use(&self, uid: &str, voucher: &VoucherSettings) -> Result<u32, VoucherUsageError> {
        let path = usage_path(uid);
        let code = voucher.code.clone();
        let limit = voucher.max_usage_per_user;
        let mut recorded: Option<u32> = None;

        self.store
            .transaction(&mut |txn: &mut dyn TxnContext| -> Result<Value, StoreError> {
                let mut counts: HashMap<String, u32> = txn_get_as(txn, &path)?.unwrap_or_default();
                let current = counts.get(&code).copied().unwrap_or(0);
                if limit > 0 && current >= limit {
                    recorded = None;
                    return Ok(Value::Null);
                }
                counts.insert(code.clone(), current + 1);
                txn.set(&path, json!(counts))?;
                recorded = Some(current + 1);
                Ok(Value::Null)
            })
            .await?;

        match recorded {
            Some(count) => {
                debug!(uid = %uid, count, "Recorded voucher use");
                Ok(count)
            }
            None => Err(VoucherUsageError::LimitReached {
                code: voucher.code.clone(),
                limit,
            }),
        }
    }

    /// Give back one use of `code`.
    #[instrument(skip(self))]
    pub async fn release(&self, uid: &str, code: &str) -> Result<(), StoreError> {
        let path = usage_path(uid);
        self.store
            .transaction(&mut |txn: &mut dyn TxnContext| -> Result<Value, StoreError> {
                let mut counts: HashMap<String, u32> = txn_get_as(txn, &path)?.unwrap_or_default();
                if let Some(count) = counts.get_mut(code) {
                    *count = count.saturating_sub(1);
                    txn.set(&path, json!(counts))?;
                }
                Ok(Value::Null)
            })
            .await?;
        Ok(())
    }
}
