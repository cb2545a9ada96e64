mod stripe;

pub use stripe::*;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::Coupon;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub url: String,
}

/// Everything the provider needs to open a hosted checkout page.
#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    pub product_id: String,
    pub product_title: String,
    pub unit_amount: Decimal,
    pub currency: String,
    pub customer_email: String,
    /// Already-validated coupon to apply as a discount
    pub coupon_code: Option<String>,
    pub newsletter_opt_in: bool,
    pub success_url: String,
    pub cancel_url: String,
}

/// Seam to the payment provider. Provider errors surface as `AppError::Provider`.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_checkout_session(&self, request: &CheckoutRequest) -> Result<CheckoutSession>;

    /// Register a single-use, `once` coupon under `code`.
    async fn create_coupon(&self, code: &str, percent_off: u32) -> Result<Coupon>;

    /// Look up a coupon by code. `Ok(None)` when the provider does not know it.
    async fn retrieve_coupon(&self, code: &str) -> Result<Option<Coupon>>;
}

/// Convert a decimal amount into the provider's minor units.
pub fn to_minor_units(amount: Decimal) -> Result<i64> {
    use rust_decimal::prelude::ToPrimitive;
    (amount * Decimal::ONE_HUNDRED)
        .round()
        .to_i64()
        .ok_or_else(|| crate::error::AppError::BadRequest(format!("Amount out of range: {}", amount)))
}

pub fn from_minor_units(cents: i64) -> Decimal {
    Decimal::new(cents, 2)
}
