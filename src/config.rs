use std::env;
use std::str::FromStr;

use crate::coupons::DEFAULT_PERCENT_OFF;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database_path: String,
    pub base_url: String,
    pub dev_mode: bool,
    pub stripe_secret_key: Option<String>,
    pub stripe_webhook_secret: Option<String>,
    /// HMAC key for the generic `/callback/checkout` endpoint
    pub callback_secret: Option<String>,
    pub currency: String,
    /// Prefix of every redemption code
    pub code_namespace: String,
    pub default_max_downloads: i32,
    /// Percent off of the thank-you coupon (0 = no coupon)
    pub reward_coupon_percent: u32,
    pub resend_api_key: Option<String>,
    pub email_from: String,
    /// Where product files are served from
    pub asset_base_url: String,
    pub notification_max_attempts: i32,
    pub notification_retry_interval_secs: u64,
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parsed_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let dev_mode = env::var("STOREFRONT_ENV")
            .map(|v| v == "dev" || v == "development")
            .unwrap_or(false);

        let host = env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port: u16 = parsed_or("PORT", 3000);

        let base_url = env::var("BASE_URL")
            .unwrap_or_else(|_| format!("http://{}:{}", host, port))
            .trim_end_matches('/')
            .to_string();

        let asset_base_url =
            env::var("ASSET_BASE_URL").unwrap_or_else(|_| format!("{}/files", base_url));

        Self {
            host,
            port,
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "storefront.db".to_string()),
            base_url,
            dev_mode,
            stripe_secret_key: non_empty("STRIPE_SECRET_KEY"),
            stripe_webhook_secret: non_empty("STRIPE_WEBHOOK_SECRET"),
            callback_secret: non_empty("CALLBACK_SECRET"),
            currency: env::var("SETTLEMENT_CURRENCY")
                .map(|c| c.to_lowercase())
                .unwrap_or_else(|_| "eur".to_string()),
            code_namespace: env::var("CODE_NAMESPACE").unwrap_or_else(|_| "SHOP".to_string()),
            default_max_downloads: parsed_or("DEFAULT_MAX_DOWNLOADS", 5),
            reward_coupon_percent: parsed_or("REWARD_COUPON_PERCENT", DEFAULT_PERCENT_OFF),
            resend_api_key: non_empty("RESEND_API_KEY"),
            email_from: env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "Tienda <tienda@example.com>".to_string()),
            asset_base_url,
            notification_max_attempts: parsed_or("NOTIFICATION_MAX_ATTEMPTS", 5),
            notification_retry_interval_secs: parsed_or("NOTIFICATION_RETRY_INTERVAL_SECS", 60),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// `None` when reward coupons are switched off.
    pub fn reward_percent(&self) -> Option<u32> {
        match self.reward_coupon_percent {
            0 => None,
            p => Some(p.min(100)),
        }
    }
}
