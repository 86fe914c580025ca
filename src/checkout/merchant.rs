// Merchant settings document (settings/config)

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use super::order::PaymentMethod;
use super::voucher::VoucherSettings;
use crate::store::{get_as, DocPath, DocumentStore, StoreError};

pub const SETTINGS_COLLECTION: &str = "settings";
pub const SETTINGS_DOC: &str = "config";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaxSettings {
    pub enabled: bool,
    pub percentage: Decimal,
    pub label: String,
}

impl Default for TaxSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            percentage: dec!(12),
            label: "VAT".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PaymentSettings {
    pub enable_cash: bool,
    #[serde(rename = "enableGCash")]
    pub enable_gcash: bool,
    pub enable_maya: bool,
    pub enable_grab_pay: bool,
    pub auto_apply_service_charge: bool,
    pub service_charge_percentage: Decimal,
}

impl Default for PaymentSettings {
    fn default() -> Self {
        Self {
            enable_cash: true,
            enable_gcash: true,
            enable_maya: true,
            enable_grab_pay: true,
            auto_apply_service_charge: false,
            service_charge_percentage: Decimal::ZERO,
        }
    }
}

impl PaymentSettings {
    /// `Online` lets the customer choose at the gateway, so it is offered
    /// while any wallet is enabled.
    pub fn is_enabled(&self, method: PaymentMethod) -> bool {
        match method {
            PaymentMethod::Cash => self.enable_cash,
            PaymentMethod::Gcash => self.enable_gcash,
            PaymentMethod::Maya => self.enable_maya,
            PaymentMethod::GrabPay => self.enable_grab_pay,
            PaymentMethod::Online => self.enable_gcash || self.enable_maya || self.enable_grab_pay,
        }
    }

    pub fn enabled_methods(&self) -> Vec<PaymentMethod> {
        PaymentMethod::ALL
            .into_iter()
            .filter(|m| self.is_enabled(*m))
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MerchantSettings {
    pub tax: TaxSettings,
    pub payment: PaymentSettings,
    pub vouchers: Vec<VoucherSettings>,
}

impl MerchantSettings {
    pub fn path() -> DocPath {
        DocPath::new(SETTINGS_COLLECTION, SETTINGS_DOC)
    }

    /// Read the settings document; a missing document yields defaults.
    pub async fn load(store: &dyn DocumentStore) -> Result<Self, StoreError> {
        Ok(get_as::<Self>(store, &Self::path()).await?.unwrap_or_default())
    }
}
