//! Single-use percent-off coupons held at the payment provider.
//!
//! Nothing is cached locally: the provider owns redemption counts, so every
//! validation is a round-trip.

use std::sync::Arc;

use crate::error::{AppError, Result};
use crate::models::Coupon;
use crate::payments::PaymentGateway;

/// Reward coupon discount when `REWARD_COUPON_PERCENT` is not set.
pub const DEFAULT_PERCENT_OFF: u32 = 20;

#[derive(Clone)]
pub struct CouponManager {
    gateway: Arc<dyn PaymentGateway>,
}

impl CouponManager {
    pub fn new(gateway: Arc<dyn PaymentGateway>) -> Self {
        Self { gateway }
    }

    /// Register `code` with the provider. Fails if the code already exists;
    /// retrying with the same code will keep failing.
    pub async fn create_coupon(&self, code: &str, percent_off: u32) -> Result<Coupon> {
        if code.trim().is_empty() {
            return Err(AppError::BadRequest("Coupon code cannot be empty".into()));
        }
        if percent_off == 0 || percent_off > 100 {
            return Err(AppError::BadRequest(format!(
                "percent_off must be between 1 and 100, got {}",
                percent_off
            )));
        }

        let coupon = self.gateway.create_coupon(code, percent_off).await?;
        tracing::info!(code = %coupon.code, percent_off, "Coupon created");
        Ok(coupon)
    }

    /// `Ok(None)` when the coupon does not exist or has been used up.
    pub async fn validate_coupon(&self, code: &str) -> Result<Option<Coupon>> {
        let code = code.trim();
        if code.is_empty() {
            return Ok(None);
        }

        match self.gateway.retrieve_coupon(code).await? {
            Some(coupon) if coupon.is_redeemable() => Ok(Some(coupon)),
            Some(coupon) => {
                tracing::debug!(
                    code = %coupon.code,
                    times_redeemed = coupon.times_redeemed,
                    "Coupon no longer redeemable"
                );
                Ok(None)
            }
            None => Ok(None),
        }
    }
}

/// Reward coupon code for a purchase. Derived from the redemption code so a
/// retried send finds the coupon it already created.
pub fn reward_coupon_code(redemption_code: &str) -> String {
    format!("GRACIAS-{}", redemption_code)
}
