use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum NotificationStatus {
    Pending,
    Sending,
    Sent,
    /// Gave up after the maximum number of attempts; needs a manual resend
    Dead,
}

/// Outbox entry for the purchase email of one transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationJob {
    pub id: String,
    pub transaction_id: String,
    pub status: NotificationStatus,
    pub attempts: i32,
    pub next_attempt_at: i64,
    pub last_error: Option<String>,
    pub message_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}
