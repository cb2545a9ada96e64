use serde::{Deserialize, Serialize};

/// Provider-managed percent-off coupon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coupon {
    /// Provider-side unique id, shown to the customer as the code
    pub code: String,
    pub percent_off: u32,
    pub max_redemptions: Option<i64>,
    pub times_redeemed: i64,
    pub valid: bool,
}

impl Coupon {
    /// Still usable at the provider.
    pub fn is_redeemable(&self) -> bool {
        if !self.valid {
            return false;
        }
        match self.max_redemptions {
            Some(max) => self.times_redeemed < max,
            None => true,
        }
    }
}
