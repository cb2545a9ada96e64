use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::codes::CodeKind;
use crate::split::Split;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Success,
    Failed,
    Refunded,
}

impl TransactionStatus {
    /// Whether a record in `self` may move to `next`.
    ///
    /// Allowed: pending → success, pending → failed, success → refunded.
    pub fn can_transition_to(self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Pending, Success) | (Pending, Failed) | (Success, Refunded)
        )
    }

    /// Code prefix family for statuses that mint a redemption code.
    /// Refunds keep the code issued on success.
    pub fn code_kind(self) -> Option<CodeKind> {
        match self {
            TransactionStatus::Pending => Some(CodeKind::Pending),
            TransactionStatus::Success => Some(CodeKind::Success),
            TransactionStatus::Failed => Some(CodeKind::Failed),
            TransactionStatus::Refunded => None,
        }
    }
}

/// One purchase attempt, keyed externally by the provider's checkout session id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub session_id: String,
    pub redemption_code: Option<String>,
    pub status: TransactionStatus,
    /// Gross charge
    pub amount: Decimal,
    // Financial split, set once on success
    pub stripe_commission: Option<Decimal>,
    pub iva: Option<Decimal>,
    pub irpf: Option<Decimal>,
    pub net_amount: Option<Decimal>,
    pub customer_email: String,
    pub customer_name: Option<String>,
    pub product_id: String,
    pub payment_method: Option<String>,
    pub city: Option<String>,
    /// Coupon applied at checkout
    pub coupon_code: Option<String>,
    /// Coupon issued to the customer in the receipt email
    pub reward_coupon_code: Option<String>,
    pub payment_intent_id: Option<String>,
    pub newsletter_opt_in: bool,
    pub download_count: i32,
    pub max_downloads: i32,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Transaction {
    pub fn split(&self) -> Option<Split> {
        Some(Split {
            commission: self.stripe_commission?,
            vat: self.iva?,
            withholding: self.irpf?,
            net: self.net_amount?,
        })
    }

    pub fn downloads_remaining(&self) -> i32 {
        (self.max_downloads - self.download_count).max(0)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateTransaction {
    pub session_id: String,
    pub amount: Decimal,
    pub customer_email: String,
    #[serde(default)]
    pub customer_name: Option<String>,
    pub product_id: String,
    #[serde(default)]
    pub payment_method: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub coupon_code: Option<String>,
    #[serde(default)]
    pub newsletter_opt_in: bool,
    pub max_downloads: i32,
}

/// Customer and charge details reported by the provider when a session settles.
#[derive(Debug, Clone, Default)]
pub struct SettlementDetails {
    pub amount: Decimal,
    pub customer_email: String,
    pub customer_name: Option<String>,
    pub payment_method: Option<String>,
    pub city: Option<String>,
    pub coupon_code: Option<String>,
    pub payment_intent_id: Option<String>,
}

/// A single status change, applied atomically by the store.
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub from: TransactionStatus,
    pub to: TransactionStatus,
    /// Mint a redemption code of this kind if the record has none yet
    pub mint: Option<CodeKind>,
    pub split: Option<Split>,
    pub details: Option<SettlementDetails>,
    /// Enqueue the purchase email in the same database transaction
    pub enqueue_notification: bool,
}
