//! Purchase email delivery from the notification outbox.
//!
//! A job is enqueued in the same database transaction that marks a purchase
//! `success`. The orchestrator makes the first attempt right after the commit;
//! the background worker retries failures with exponential backoff and parks
//! jobs as `dead` once attempts run out. Dead jobs are logged at error level
//! and listed by the `notifications failed` CLI command for a manual resend.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::coupons::{CouponManager, reward_coupon_code};
use crate::db::{DbPool, queries};
use crate::email::{Mailer, PurchaseEmail};
use crate::error::{AppError, Result};
use crate::models::{NotificationJob, Transaction, TransactionStatus};
use crate::util::download_url;

/// Claims older than this are assumed abandoned by a crashed worker.
const STALE_CLAIM_SECS: i64 = 300;
const DUE_BATCH_SIZE: i64 = 50;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: i32,
    pub base_delay_secs: i64,
    pub max_delay_secs: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_secs: 60,
            max_delay_secs: 6 * 3600,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempts` failures.
    pub fn delay_for(&self, attempts: i32) -> i64 {
        let exponent = (attempts.max(1) - 1).min(20) as u32;
        self.base_delay_secs
            .saturating_mul(1i64 << exponent)
            .min(self.max_delay_secs)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSummary {
    pub sent: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Clone)]
pub struct Dispatcher {
    db: DbPool,
    mailer: Arc<dyn Mailer>,
    coupons: CouponManager,
    base_url: String,
    /// Percent off for the thank-you coupon; `None` disables it
    reward_percent: Option<u32>,
    policy: RetryPolicy,
}

impl Dispatcher {
    pub fn new(
        db: DbPool,
        mailer: Arc<dyn Mailer>,
        coupons: CouponManager,
        base_url: String,
        reward_percent: Option<u32>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            db,
            mailer,
            coupons,
            base_url,
            reward_percent,
            policy,
        }
    }

    /// Attempt delivery of one outbox job.
    ///
    /// `Ok(Some(message_id))` when sent, `Ok(None)` when another worker holds
    /// the job or it no longer needs sending. A failed send is recorded on the
    /// job and returned.
    pub async fn dispatch(&self, notification_id: &str) -> Result<Option<String>> {
        let (job, transaction, product_title) = {
            let conn = self.db.get()?;
            if !queries::try_claim_notification(&conn, notification_id)? {
                return Ok(None);
            }
            let job = queries::get_notification_by_id(&conn, notification_id)?
                .ok_or_else(|| AppError::NotFound("Notification not found".into()))?;
            let transaction = queries::get_transaction_by_id(&conn, &job.transaction_id)?
                .ok_or_else(|| AppError::NotFound("Transaction not found".into()))?;
            let product_title = queries::get_product_by_id(&conn, &transaction.product_id)?
                .map(|p| p.title)
                .unwrap_or_else(|| transaction.product_id.clone());
            (job, transaction, product_title)
        };

        if transaction.status != TransactionStatus::Success {
            let conn = self.db.get()?;
            queries::mark_notification_failed(
                &conn,
                &job.id,
                &format!("skipped: transaction is {}", transaction.status),
                None,
            )?;
            tracing::info!(
                transaction_id = %transaction.id,
                status = %transaction.status,
                "Purchase email skipped"
            );
            return Ok(None);
        }

        match self.send(&transaction, &product_title).await {
            Ok(message_id) => {
                let conn = self.db.get()?;
                queries::mark_notification_sent(&conn, &job.id, &message_id)?;
                tracing::info!(
                    transaction_id = %transaction.id,
                    message_id = %message_id,
                    attempt = job.attempts,
                    "Purchase email delivered"
                );
                Ok(Some(message_id))
            }
            Err(e) => {
                self.record_failure(&job, &e)?;
                Err(e)
            }
        }
    }

    async fn send(&self, transaction: &Transaction, product_title: &str) -> Result<String> {
        let code = transaction.redemption_code.as_deref().ok_or_else(|| {
            AppError::Internal("Successful transaction has no redemption code".into())
        })?;

        let coupon_code = self.ensure_reward_coupon(transaction, code).await;

        let email = PurchaseEmail {
            to_email: transaction.customer_email.clone(),
            to_name: transaction.customer_name.clone(),
            redemption_code: code.to_string(),
            product_title: product_title.to_string(),
            coupon_code,
            subscribe_newsletter: transaction.newsletter_opt_in,
            download_url: download_url(&self.base_url, code),
            max_downloads: transaction.max_downloads,
        };

        self.mailer.send_purchase_email(&email).await
    }

    /// Issue (or recover) the thank-you coupon. Never fails the email: a
    /// provider problem just means the email goes out without a coupon.
    async fn ensure_reward_coupon(&self, transaction: &Transaction, redemption_code: &str) -> Option<String> {
        if let Some(ref existing) = transaction.reward_coupon_code {
            return Some(existing.clone());
        }
        let percent = self.reward_percent?;
        let code = reward_coupon_code(redemption_code);

        let issued = match self.coupons.create_coupon(&code, percent).await {
            Ok(coupon) => Some(coupon.code),
            Err(create_err) => {
                // An earlier attempt may have created it and then failed to send
                match self.coupons.validate_coupon(&code).await {
                    Ok(Some(coupon)) => Some(coupon.code),
                    _ => {
                        tracing::warn!(
                            transaction_id = %transaction.id,
                            error = %create_err,
                            "Reward coupon unavailable, sending email without it"
                        );
                        None
                    }
                }
            }
        };

        if let Some(ref coupon) = issued {
            let stored = self
                .db
                .get()
                .map_err(AppError::from)
                .and_then(|conn| queries::set_reward_coupon_code(&conn, &transaction.id, coupon));
            if let Err(e) = stored {
                tracing::warn!(transaction_id = %transaction.id, error = %e, "Failed to record reward coupon");
            }
        }

        issued
    }

    fn record_failure(&self, job: &NotificationJob, error: &AppError) -> Result<()> {
        let conn = self.db.get()?;
        let message = error.to_string();

        if job.attempts >= self.policy.max_attempts {
            queries::mark_notification_failed(&conn, &job.id, &message, None)?;
            tracing::error!(
                notification_id = %job.id,
                transaction_id = %job.transaction_id,
                attempts = job.attempts,
                error = %message,
                "Purchase email undeliverable, manual resend required"
            );
        } else {
            let next_attempt_at = Utc::now().timestamp() + self.policy.delay_for(job.attempts);
            queries::mark_notification_failed(&conn, &job.id, &message, Some(next_attempt_at))?;
            tracing::warn!(
                notification_id = %job.id,
                transaction_id = %job.transaction_id,
                attempts = job.attempts,
                next_attempt_at,
                error = %message,
                "Purchase email failed, will retry"
            );
        }
        Ok(())
    }

    /// Retry every job that is due now.
    pub async fn run_due(&self) -> Result<DispatchSummary> {
        let now = Utc::now().timestamp();
        let due = {
            let conn = self.db.get()?;
            let released = queries::release_stale_notifications(&conn, now - STALE_CLAIM_SECS)?;
            if released > 0 {
                tracing::warn!(released, "Released stale notification claims");
            }
            queries::list_due_notifications(&conn, now, DUE_BATCH_SIZE)?
        };

        let mut summary = DispatchSummary::default();
        for job in due {
            match self.dispatch(&job.id).await {
                Ok(Some(_)) => summary.sent += 1,
                Ok(None) => summary.skipped += 1,
                Err(_) => summary.failed += 1,
            }
        }
        Ok(summary)
    }

    /// Background retry loop.
    pub async fn run_worker(self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match self.run_due().await {
                Ok(summary) if summary.sent + summary.failed > 0 => {
                    tracing::info!(
                        sent = summary.sent,
                        failed = summary.failed,
                        "Notification retry pass finished"
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Notification retry pass failed"),
            }
        }
    }

    /// Manually resend the purchase email of a transaction.
    pub async fn resend(&self, transaction_id: &str) -> Result<Option<String>> {
        let notification_id = {
            let conn = self.db.get()?;
            match queries::requeue_notification(&conn, transaction_id)? {
                Some(id) => id,
                None => {
                    // Pending jobs are already queued; anything else has no email
                    let job = queries::get_notification_for_transaction(&conn, transaction_id)?
                        .ok_or_else(|| {
                            AppError::NotFound("No purchase email for this transaction".into())
                        })?;
                    job.id
                }
            }
        };
        self.dispatch(&notification_id).await
    }

    pub fn list_dead(&self) -> Result<Vec<NotificationJob>> {
        let conn = self.db.get()?;
        queries::list_dead_notifications(&conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_timeout_is_shorter_than_stale_claim_window() {
        let timeout = crate::email::SEND_TIMEOUT.as_secs() as i64;
        assert!(timeout > 0);
        assert!(timeout * 2 <= STALE_CLAIM_SECS);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay_secs: 60,
            max_delay_secs: 600,
        };
        assert_eq!(policy.delay_for(1), 60);
        assert_eq!(policy.delay_for(2), 120);
        assert_eq!(policy.delay_for(3), 240);
        assert_eq!(policy.delay_for(4), 480);
        assert_eq!(policy.delay_for(5), 600);
        assert_eq!(policy.delay_for(50), 600);
    }
}
