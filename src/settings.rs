use figment::{
    providers::{Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::checkout::reconciler::ReconcilerSettings;
use crate::checkout::service::CheckoutConfig;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PayMongoSettings {
    #[serde(default)]
    pub secret_key: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_paymongo_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub webhook_secret: String,
    #[serde(default = "default_webhook_tolerance_seconds")]
    pub webhook_tolerance_seconds: i64,
    #[serde(default = "default_success_url")]
    pub success_url: String,
    #[serde(default = "default_cancel_url")]
    pub cancel_url: String,
    #[serde(default = "default_app_scheme")]
    pub app_scheme: String,
}

impl Default for PayMongoSettings {
    fn default() -> Self {
        Self {
            secret_key: String::new(),
            api_base: default_api_base(),
            timeout_ms: default_paymongo_timeout_ms(),
            webhook_secret: String::new(),
            webhook_tolerance_seconds: default_webhook_tolerance_seconds(),
            success_url: default_success_url(),
            cancel_url: default_cancel_url(),
            app_scheme: default_app_scheme(),
        }
    }
}

impl PayMongoSettings {
    /// Live secret keys carry the `sk_live_` prefix.
    pub fn is_live_mode(&self) -> bool {
        self.secret_key.starts_with("sk_live_")
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CheckoutSettings {
    #[serde(default = "default_payment_expiry", with = "humantime_serde")]
    pub payment_expiry: Duration,
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(default = "default_max_poll_attempts")]
    pub max_poll_attempts: u32,
    #[serde(default = "default_status_check_delay", with = "humantime_serde")]
    pub status_check_delay: Duration,
    #[serde(default = "default_countdown_tick", with = "humantime_serde")]
    pub countdown_tick: Duration,
}

impl Default for CheckoutSettings {
    fn default() -> Self {
        Self {
            payment_expiry: default_payment_expiry(),
            poll_interval: default_poll_interval(),
            max_poll_attempts: default_max_poll_attempts(),
            status_check_delay: default_status_check_delay(),
            countdown_tick: default_countdown_tick(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub paymongo: PayMongoSettings,
    #[serde(default)]
    pub checkout: CheckoutSettings,
    pub server_port: u16,
    pub database_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            paymongo: PayMongoSettings::default(),
            checkout: CheckoutSettings::default(),
            server_port: 3000,
            database_path: "data/orders.redb".to_string(),
        }
    }
}

impl Config {
    /// Load from config.toml (if present) and environment variables.
    /// Environment variables override file values.
    /// Supported env keys: PAYMONGO_SECRET_KEY, PAYMONGO_API_BASE,
    /// PAYMONGO_TIMEOUT_MS, PAYMONGO_WEBHOOK_SECRET,
    /// PAYMONGO_WEBHOOK_TOLERANCE_SECONDS, PAYMONGO_SUCCESS_URL,
    /// PAYMONGO_CANCEL_URL, PAYMENT_EXPIRY, POLL_INTERVAL, MAX_POLL_ATTEMPTS,
    /// STATUS_CHECK_DELAY, COUNTDOWN_TICK, SERVER_PORT, DATABASE_PATH
    pub fn load() -> Self {
        let base: Config = Default::default();
        let mut fig = Figment::from(Serialized::defaults(base));
        if std::path::Path::new("config.toml").exists() {
            fig = fig.merge(Toml::file("config.toml"));
        }
        let mut cfg: Config = fig.extract().unwrap_or_default();
        cfg.apply_env(|key| std::env::var(key).ok());
        cfg
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("PAYMONGO_SECRET_KEY") {
            self.paymongo.secret_key = v;
        }
        if let Some(v) = var("PAYMONGO_API_BASE") {
            self.paymongo.api_base = v;
        }
        if let Some(v) = var("PAYMONGO_TIMEOUT_MS") {
            self.paymongo.timeout_ms = v.parse().unwrap_or(self.paymongo.timeout_ms);
        }
        if let Some(v) = var("PAYMONGO_WEBHOOK_SECRET") {
            self.paymongo.webhook_secret = v;
        }
        if let Some(v) = var("PAYMONGO_WEBHOOK_TOLERANCE_SECONDS") {
            self.paymongo.webhook_tolerance_seconds =
                v.parse().unwrap_or(self.paymongo.webhook_tolerance_seconds);
        }
        if let Some(v) = var("PAYMONGO_SUCCESS_URL") {
            self.paymongo.success_url = v;
        }
        if let Some(v) = var("PAYMONGO_CANCEL_URL") {
            self.paymongo.cancel_url = v;
        }
        if let Some(v) = var("PAYMENT_EXPIRY") {
            self.checkout.payment_expiry = parse_duration_env(&v, self.checkout.payment_expiry);
        }
        if let Some(v) = var("POLL_INTERVAL") {
            self.checkout.poll_interval = parse_duration_env(&v, self.checkout.poll_interval);
        }
        if let Some(v) = var("MAX_POLL_ATTEMPTS") {
            self.checkout.max_poll_attempts = v.parse().unwrap_or(self.checkout.max_poll_attempts);
        }
        if let Some(v) = var("STATUS_CHECK_DELAY") {
            self.checkout.status_check_delay =
                parse_duration_env(&v, self.checkout.status_check_delay);
        }
        if let Some(v) = var("COUNTDOWN_TICK") {
            self.checkout.countdown_tick = parse_duration_env(&v, self.checkout.countdown_tick);
        }
        if let Some(v) = var("SERVER_PORT") {
            self.server_port = v.parse().unwrap_or(self.server_port);
        }
        if let Some(v) = var("DATABASE_PATH") {
            self.database_path = v;
        }
    }

    pub fn reconciler_settings(&self) -> ReconcilerSettings {
        ReconcilerSettings {
            settle_delay: self.checkout.status_check_delay,
            poll_interval: self.checkout.poll_interval,
            max_poll_attempts: self.checkout.max_poll_attempts,
        }
    }

    pub fn checkout_config(&self) -> CheckoutConfig {
        CheckoutConfig {
            payment_expiry: self.checkout.payment_expiry,
            success_url: self.paymongo.success_url.clone(),
            fail_url: self.paymongo.cancel_url.clone(),
        }
    }
}

fn parse_duration_env(value: &str, current: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(current)
}

fn default_api_base() -> String {
    "https://api.paymongo.com".to_string()
}

fn default_paymongo_timeout_ms() -> u64 {
    15_000
}

fn default_webhook_tolerance_seconds() -> i64 {
    300 // 5 minutes
}

fn default_success_url() -> String {
    "http://localhost:3000/payment/success".to_string()
}

fn default_cancel_url() -> String {
    "http://localhost:3000/payment/failed".to_string()
}

fn default_app_scheme() -> String {
    "nookapp".to_string()
}

fn default_payment_expiry() -> Duration {
    Duration::from_secs(600) // 10 minutes
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_max_poll_attempts() -> u32 {
    12
}

fn default_status_check_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_countdown_tick() -> Duration {
    Duration::from_secs(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.server_port, 3000);
        assert_eq!(cfg.checkout.payment_expiry, Duration::from_secs(600));
        assert_eq!(cfg.checkout.max_poll_attempts, 12);
        assert_eq!(cfg.paymongo.api_base, "https://api.paymongo.com");
        assert!(!cfg.paymongo.is_live_mode());
    }

    #[test]
    fn test_env_overlay_parses_durations_and_keeps_bad_values_out() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("PAYMONGO_SECRET_KEY", "sk_live_abc"),
            ("PAYMENT_EXPIRY", "15m"),
            ("POLL_INTERVAL", "not-a-duration"),
            ("MAX_POLL_ATTEMPTS", "5"),
            ("SERVER_PORT", "eighty"),
        ]);
        let mut cfg = Config::default();
        cfg.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert!(cfg.paymongo.is_live_mode());
        assert_eq!(cfg.checkout.payment_expiry, Duration::from_secs(900));
        assert_eq!(cfg.checkout.poll_interval, Duration::from_secs(10));
        assert_eq!(cfg.checkout.max_poll_attempts, 5);
        assert_eq!(cfg.server_port, 3000);
    }

    #[test]
    fn test_toml_with_humantime_durations() {
        let toml = r#"
            server_port = 8080
            database_path = "/tmp/nook.redb"

            [checkout]
            payment_expiry = "5m"
            status_check_delay = "500ms"
        "#;
        let cfg: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::string(toml))
            .extract()
            .unwrap();

        assert_eq!(cfg.server_port, 8080);
        assert_eq!(cfg.checkout.payment_expiry, Duration::from_secs(300));
        assert_eq!(cfg.checkout.status_check_delay, Duration::from_millis(500));
        assert_eq!(cfg.checkout.poll_interval, Duration::from_secs(10));
    }
}
