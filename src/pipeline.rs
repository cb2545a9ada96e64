//! Checkout completion.
//!
//! Every provider callback, however many times it is delivered, goes through
//! [`Orchestrator::complete`]. The session id is the idempotency key: the
//! first delivery of a status mutates the record, later ones are reported as
//! [`CompletionOutcome::Duplicate`] and touch nothing.
//!
//! ```text
//! [no record] --checkout created--> pending
//! pending --confirmed--> success    mint code, compute split, enqueue email
//! pending --failed/expired--> failed   mint code
//! success --refund--> refunded       keep code, no email
//! ```

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::codes::CodeGenerator;
use crate::db::queries::{self, TransitionResult};
use crate::db::DbPool;
use crate::error::{AppError, Result};
use crate::models::{CreateTransaction, SettlementDetails, StatusChange, Transaction, TransactionStatus};
use crate::notify::Dispatcher;
use crate::split::compute_split;

const MAX_MINT_ATTEMPTS: usize = 3;

/// Normalized completion event, whatever provider sent it.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutCallback {
    pub session_id: String,
    pub status: TransactionStatus,
    #[serde(alias = "amount")]
    pub gross_amount: Decimal,
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
    pub payment_intent_id: Option<String>,
    #[serde(default)]
    pub subscribe_newsletter: bool,
}

impl CheckoutCallback {
    /// Refund event for an already recorded transaction.
    pub fn refund_of(transaction: &Transaction) -> Self {
        Self {
            session_id: transaction.session_id.clone(),
            status: TransactionStatus::Refunded,
            gross_amount: transaction.amount,
            customer_email: transaction.customer_email.clone(),
            customer_name: transaction.customer_name.clone(),
            product_id: transaction.product_id.clone(),
            payment_method: transaction.payment_method.clone(),
            city: transaction.city.clone(),
            coupon_code: transaction.coupon_code.clone(),
            payment_intent_id: transaction.payment_intent_id.clone(),
            subscribe_newsletter: transaction.newsletter_opt_in,
        }
    }

    fn settlement_details(&self) -> SettlementDetails {
        SettlementDetails {
            amount: self.gross_amount,
            customer_email: self.customer_email.clone(),
            customer_name: self.customer_name.clone(),
            payment_method: self.payment_method.clone(),
            city: self.city.clone(),
            coupon_code: self.coupon_code.clone(),
            payment_intent_id: self.payment_intent_id.clone(),
        }
    }
}

/// What happened to the purchase email of a completed transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationOutcome {
    /// Delivered; carries the provider message id
    Sent(String),
    /// First attempt failed; the outbox worker will retry
    Deferred(String),
    /// This transition sends no email
    NotRequired,
}

#[derive(Debug, Clone)]
pub enum CompletionOutcome {
    Applied {
        transaction: Transaction,
        notification: NotificationOutcome,
    },
    /// The status was already recorded; nothing changed and no email was sent
    Duplicate { transaction: Transaction },
}

impl CompletionOutcome {
    pub fn transaction(&self) -> &Transaction {
        match self {
            CompletionOutcome::Applied { transaction, .. } => transaction,
            CompletionOutcome::Duplicate { transaction } => transaction,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, CompletionOutcome::Duplicate { .. })
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    db: DbPool,
    codes: CodeGenerator,
    dispatcher: Dispatcher,
    default_max_downloads: i32,
}

impl Orchestrator {
    pub fn new(db: DbPool, codes: CodeGenerator, dispatcher: Dispatcher, default_max_downloads: i32) -> Self {
        Self {
            db,
            codes,
            dispatcher,
            default_max_downloads,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Record a provider callback.
    ///
    /// Errors with `InvalidTransition` when the stored status may not move to
    /// the reported one (the record is left as is), and `NotFound` for a
    /// refund of a session that was never recorded. Email failures are not
    /// errors: they come back as [`NotificationOutcome::Deferred`].
    pub async fn complete(&self, callback: &CheckoutCallback) -> Result<CompletionOutcome> {
        let target = callback.status;

        let (mut current, created) = {
            let conn = self.db.get()?;
            match queries::get_transaction_by_session_id(&conn, &callback.session_id)? {
                Some(existing) => (existing, false),
                None => {
                    if target == TransactionStatus::Refunded {
                        return Err(AppError::NotFound(format!(
                            "No transaction for session {}",
                            callback.session_id
                        )));
                    }
                    let product = queries::get_product_by_id(&conn, &callback.product_id)?;
                    let max_downloads = product
                        .and_then(|p| p.max_downloads)
                        .unwrap_or(self.default_max_downloads);
                    let (transaction, created) = queries::create_transaction(
                        &conn,
                        &CreateTransaction {
                            session_id: callback.session_id.clone(),
                            amount: callback.gross_amount,
                            customer_email: callback.customer_email.clone(),
                            customer_name: callback.customer_name.clone(),
                            product_id: callback.product_id.clone(),
                            payment_method: callback.payment_method.clone(),
                            city: callback.city.clone(),
                            coupon_code: callback.coupon_code.clone(),
                            newsletter_opt_in: callback.subscribe_newsletter,
                            max_downloads,
                        },
                    )?;
                    if created {
                        tracing::info!(
                            session_id = %callback.session_id,
                            transaction_id = %transaction.id,
                            "Transaction recorded from callback"
                        );
                    }
                    (transaction, created)
                }
            }
        };

        if created && target == TransactionStatus::Pending {
            return Ok(CompletionOutcome::Applied {
                transaction: current,
                notification: NotificationOutcome::NotRequired,
            });
        }

        let mut mint_attempts = 0;
        loop {
            if current.status == target {
                tracing::debug!(
                    session_id = %callback.session_id,
                    status = %target,
                    "Duplicate callback, nothing to do"
                );
                return Ok(CompletionOutcome::Duplicate { transaction: current });
            }

            if !current.status.can_transition_to(target) {
                tracing::warn!(
                    session_id = %callback.session_id,
                    transaction_id = %current.id,
                    from = %current.status,
                    to = %target,
                    "Rejected status regression"
                );
                return Err(AppError::InvalidTransition {
                    from: current.status,
                    to: target,
                });
            }

            let change = self.status_change(current.status, callback);
            let result = {
                let mut conn = self.db.get()?;
                queries::apply_transition(&mut conn, &current.id, &change, |kind, sequence| {
                    self.codes.generate(kind, sequence)
                })
            };

            match result {
                Ok(TransitionResult::Applied {
                    transaction,
                    notification_id,
                }) => {
                    tracing::info!(
                        session_id = %callback.session_id,
                        transaction_id = %transaction.id,
                        from = %change.from,
                        to = %change.to,
                        code = transaction.redemption_code.as_deref().unwrap_or(""),
                        "Transaction status changed"
                    );
                    let notification = match notification_id {
                        Some(id) => self.notify(&id, &transaction).await,
                        None => NotificationOutcome::NotRequired,
                    };
                    return Ok(CompletionOutcome::Applied {
                        transaction,
                        notification,
                    });
                }
                // Another delivery committed first; classify against what it wrote
                Ok(TransitionResult::Conflict(latest)) => current = latest,
                Err(AppError::CodeCollision) if mint_attempts + 1 < MAX_MINT_ATTEMPTS => {
                    mint_attempts += 1;
                    // The rollback returned the slot; burn it so the next mint draws a fresh one
                    let skipped = {
                        let conn = self.db.get()?;
                        queries::next_sequence(&conn, queries::REDEMPTION_CODE_COUNTER)?
                    };
                    tracing::warn!(
                        session_id = %callback.session_id,
                        attempt = mint_attempts,
                        skipped_sequence = skipped,
                        "Redemption code collision, minting again"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn status_change(&self, from: TransactionStatus, callback: &CheckoutCallback) -> StatusChange {
        let to = callback.status;
        match to {
            TransactionStatus::Success => StatusChange {
                from,
                to,
                mint: to.code_kind(),
                split: Some(compute_split(callback.gross_amount)),
                details: Some(callback.settlement_details()),
                enqueue_notification: true,
            },
            TransactionStatus::Failed => StatusChange {
                from,
                to,
                mint: to.code_kind(),
                split: None,
                details: Some(callback.settlement_details()),
                enqueue_notification: false,
            },
            // Nothing moves into pending; refunds keep the code issued on success
            TransactionStatus::Pending | TransactionStatus::Refunded => StatusChange {
                from,
                to,
                mint: None,
                split: None,
                details: None,
                enqueue_notification: false,
            },
        }
    }

    async fn notify(&self, notification_id: &str, transaction: &Transaction) -> NotificationOutcome {
        match self.dispatcher.dispatch(notification_id).await {
            Ok(Some(message_id)) => NotificationOutcome::Sent(message_id),
            // Claimed by the worker in the meantime
            Ok(None) => NotificationOutcome::Deferred("queued for delivery".into()),
            Err(e) => {
                tracing::warn!(
                    transaction_id = %transaction.id,
                    error = %e,
                    "Purchase email deferred to retry worker"
                );
                NotificationOutcome::Deferred(e.to_string())
            }
        }
    }
}
