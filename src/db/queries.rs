use chrono::Utc;
use rusqlite::{Connection, ErrorCode, OptionalExtension, TransactionBehavior, params};
use uuid::Uuid;

use crate::codes::CodeKind;
use crate::error::{AppError, Result};
use crate::models::*;

use super::from_row::{NOTIFICATION_COLS, PRODUCT_COLS, TRANSACTION_COLS, query_all, query_one};

pub const REDEMPTION_CODE_COUNTER: &str = "redemption_code";

fn now() -> i64 {
    Utc::now().timestamp()
}

fn gen_id() -> String {
    Uuid::new_v4().to_string()
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

// ============ Products ============

/// Insert or refresh the local mirror of a CMS product.
pub fn upsert_product(conn: &Connection, product: &Product) -> Result<()> {
    let items = serde_json::to_string(&product.items)?;
    conn.execute(
        "INSERT INTO products (id, title, price, items, category, file_ref, max_downloads, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(id) DO UPDATE SET
            title = excluded.title,
            price = excluded.price,
            items = excluded.items,
            category = excluded.category,
            file_ref = excluded.file_ref,
            max_downloads = excluded.max_downloads,
            updated_at = excluded.updated_at",
        params![
            &product.id,
            &product.title,
            product.price.to_string(),
            items,
            &product.category,
            product.file.as_ref().map(|f| f.0.as_str()),
            product.max_downloads,
            now()
        ],
    )?;
    Ok(())
}

pub fn get_product_by_id(conn: &Connection, id: &str) -> Result<Option<Product>> {
    query_one(
        conn,
        &format!("SELECT {} FROM products WHERE id = ?1", PRODUCT_COLS),
        params![id],
    )
}

// ============ Counters ============

/// Atomically increment a named counter and return the new value.
/// Call inside the write transaction that consumes the value.
pub fn next_sequence(conn: &Connection, name: &str) -> Result<i64> {
    let value = conn.query_row(
        "INSERT INTO counters (name, value) VALUES (?1, 1)
         ON CONFLICT(name) DO UPDATE SET value = value + 1
         RETURNING value",
        params![name],
        |row| row.get(0),
    )?;
    Ok(value)
}

// ============ Transactions ============

/// Create a pending transaction for a provider session.
///
/// The unique index on `session_id` decides between concurrent creators: the
/// loser's insert is ignored and both callers get the same stored row.
/// Returns the stored transaction and whether this call created it.
pub fn create_transaction(conn: &Connection, input: &CreateTransaction) -> Result<(Transaction, bool)> {
    let id = gen_id();
    let now = now();

    let affected = conn.execute(
        "INSERT INTO transactions (id, session_id, status, amount, customer_email, customer_name, product_id, payment_method, city, coupon_code, newsletter_opt_in, download_count, max_downloads, created_at, updated_at)
         VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, ?11, ?12, ?12)
         ON CONFLICT(session_id) DO NOTHING",
        params![
            &id,
            &input.session_id,
            input.amount.to_string(),
            &input.customer_email,
            &input.customer_name,
            &input.product_id,
            &input.payment_method,
            &input.city,
            &input.coupon_code,
            input.newsletter_opt_in,
            input.max_downloads,
            now
        ],
    )?;

    let transaction = get_transaction_by_session_id(conn, &input.session_id)?
        .ok_or_else(|| AppError::Internal("Transaction vanished after insert".into()))?;

    Ok((transaction, affected > 0))
}

pub fn get_transaction_by_id(conn: &Connection, id: &str) -> Result<Option<Transaction>> {
    query_one(
        conn,
        &format!("SELECT {} FROM transactions WHERE id = ?1", TRANSACTION_COLS),
        params![id],
    )
}

pub fn get_transaction_by_session_id(conn: &Connection, session_id: &str) -> Result<Option<Transaction>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM transactions WHERE session_id = ?1",
            TRANSACTION_COLS
        ),
        params![session_id],
    )
}

pub fn get_transaction_by_code(conn: &Connection, code: &str) -> Result<Option<Transaction>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM transactions WHERE redemption_code = ?1",
            TRANSACTION_COLS
        ),
        params![code],
    )
}

pub fn get_transaction_by_payment_intent(
    conn: &Connection,
    payment_intent_id: &str,
) -> Result<Option<Transaction>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM transactions WHERE payment_intent_id = ?1",
            TRANSACTION_COLS
        ),
        params![payment_intent_id],
    )
}

/// Result of attempting a status change.
#[derive(Debug)]
pub enum TransitionResult {
    /// The change was committed
    Applied {
        transaction: Transaction,
        notification_id: Option<String>,
    },
    /// The stored status no longer matched `change.from`; nothing was written
    Conflict(Transaction),
}

/// Apply a status change in one IMMEDIATE transaction.
///
/// Status, redemption code, settlement details, financial split and the
/// notification outbox entry are written together or not at all, so a
/// concurrent duplicate callback never observes a half-finalized record.
/// The code sequence is taken from the `counters` table inside the same
/// transaction.
///
/// Returns `AppError::CodeCollision` if the minted code already exists; the
/// whole transaction is rolled back, counter included, so the caller has to
/// advance the counter before minting again.
pub fn apply_transition<F>(
    conn: &mut Connection,
    id: &str,
    change: &StatusChange,
    mint: F,
) -> Result<TransitionResult>
where
    F: FnOnce(CodeKind, i64) -> String,
{
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let current: Transaction = query_one(
        &tx,
        &format!("SELECT {} FROM transactions WHERE id = ?1", TRANSACTION_COLS),
        params![id],
    )?
    .ok_or_else(|| AppError::NotFound("Transaction not found".into()))?;

    if current.status != change.from {
        // Dropping the transaction rolls back
        return Ok(TransitionResult::Conflict(current));
    }

    let code = match (change.mint, &current.redemption_code) {
        (Some(kind), None) => {
            let sequence = next_sequence(&tx, REDEMPTION_CODE_COUNTER)?;
            Some(mint(kind, sequence))
        }
        _ => None,
    };

    let details = change.details.as_ref();
    let split = change.split.as_ref();
    let now = now();

    let updated = tx
        .execute(
            "UPDATE transactions SET
                status = ?1,
                redemption_code = COALESCE(redemption_code, ?2),
                amount = COALESCE(?3, amount),
                customer_email = COALESCE(?4, customer_email),
                customer_name = COALESCE(?5, customer_name),
                payment_method = COALESCE(?6, payment_method),
                city = COALESCE(?7, city),
                coupon_code = COALESCE(?8, coupon_code),
                payment_intent_id = COALESCE(?9, payment_intent_id),
                stripe_commission = COALESCE(stripe_commission, ?10),
                iva = COALESCE(iva, ?11),
                irpf = COALESCE(irpf, ?12),
                net_amount = COALESCE(net_amount, ?13),
                updated_at = ?14
             WHERE id = ?15 AND status = ?16",
            params![
                change.to.as_ref(),
                code,
                details.map(|d| d.amount.to_string()),
                details.map(|d| d.customer_email.as_str()),
                details.and_then(|d| d.customer_name.as_deref()),
                details.and_then(|d| d.payment_method.as_deref()),
                details.and_then(|d| d.city.as_deref()),
                details.and_then(|d| d.coupon_code.as_deref()),
                details.and_then(|d| d.payment_intent_id.as_deref()),
                split.map(|s| s.commission.to_string()),
                split.map(|s| s.vat.to_string()),
                split.map(|s| s.withholding.to_string()),
                split.map(|s| s.net.to_string()),
                now,
                id,
                change.from.as_ref(),
            ],
        )
        .map_err(|e| {
            if code.is_some() && is_constraint_violation(&e) {
                AppError::CodeCollision
            } else {
                e.into()
            }
        })?;

    if updated == 0 {
        return Ok(TransitionResult::Conflict(current));
    }

    let notification_id = if change.enqueue_notification {
        tx.query_row(
            "INSERT INTO notifications (id, transaction_id, status, attempts, next_attempt_at, created_at, updated_at)
             VALUES (?1, ?2, 'pending', 0, ?3, ?3, ?3)
             ON CONFLICT(transaction_id) DO NOTHING
             RETURNING id",
            params![gen_id(), id, now],
            |row| row.get::<_, String>(0),
        )
        .optional()?
    } else {
        None
    };

    tx.commit()?;

    let transaction = get_transaction_by_id(conn, id)?
        .ok_or_else(|| AppError::Internal("Transaction vanished after update".into()))?;

    Ok(TransitionResult::Applied {
        transaction,
        notification_id,
    })
}

/// Record the reward coupon issued for a transaction. First writer wins.
pub fn set_reward_coupon_code(conn: &Connection, id: &str, code: &str) -> Result<()> {
    conn.execute(
        "UPDATE transactions SET reward_coupon_code = COALESCE(reward_coupon_code, ?1), updated_at = ?2 WHERE id = ?3",
        params![code, now(), id],
    )?;
    Ok(())
}

/// Count one download, refusing to go past `max_downloads`.
///
/// Returns `Ok(false)` when the transaction is not `success` or its quota is
/// already used up.
pub fn increment_download_count(conn: &Connection, id: &str) -> Result<bool> {
    let affected = conn.execute(
        "UPDATE transactions SET download_count = download_count + 1, updated_at = ?1
         WHERE id = ?2 AND status = 'success' AND download_count < max_downloads",
        params![now(), id],
    )?;
    Ok(affected > 0)
}

/// Authorize one download of the product bought under `code`.
///
/// A refused increment is classified against the row as it is after the
/// attempt, so a purchase refunded meanwhile reports `Forbidden` rather than
/// an exhausted quota.
pub fn record_download(conn: &Connection, code: &str) -> Result<Transaction> {
    let transaction = get_transaction_by_code(conn, code)?
        .ok_or_else(|| AppError::NotFound("Redemption code not found".into()))?;

    if !increment_download_count(conn, &transaction.id)? {
        let current = get_transaction_by_id(conn, &transaction.id)?.unwrap_or(transaction);
        if current.status != TransactionStatus::Success {
            return Err(AppError::Forbidden(format!(
                "Purchase is {}, downloads are not available",
                current.status
            )));
        }
        return Err(AppError::QuotaExceeded {
            used: current.download_count,
            max: current.max_downloads,
        });
    }

    get_transaction_by_id(conn, &transaction.id)?
        .ok_or_else(|| AppError::Internal("Transaction vanished after download".into()))
}

// ============ Notifications ============

pub fn get_notification_by_id(conn: &Connection, id: &str) -> Result<Option<NotificationJob>> {
    query_one(
        conn,
        &format!("SELECT {} FROM notifications WHERE id = ?1", NOTIFICATION_COLS),
        params![id],
    )
}

pub fn get_notification_for_transaction(
    conn: &Connection,
    transaction_id: &str,
) -> Result<Option<NotificationJob>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM notifications WHERE transaction_id = ?1",
            NOTIFICATION_COLS
        ),
        params![transaction_id],
    )
}

/// Claim a notification for sending, returning whether this call won the claim.
///
/// Compare-and-swap on `pending` so two workers never send the same email.
pub fn try_claim_notification(conn: &Connection, id: &str) -> Result<bool> {
    let affected = conn.execute(
        "UPDATE notifications SET status = 'sending', attempts = attempts + 1, updated_at = ?1
         WHERE id = ?2 AND status = 'pending'",
        params![now(), id],
    )?;
    Ok(affected > 0)
}

pub fn mark_notification_sent(conn: &Connection, id: &str, message_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE notifications SET status = 'sent', message_id = ?1, last_error = NULL, updated_at = ?2
         WHERE id = ?3",
        params![message_id, now(), id],
    )?;
    Ok(())
}

/// Record a failed attempt. `next_attempt_at = None` gives up on the job.
pub fn mark_notification_failed(
    conn: &Connection,
    id: &str,
    error: &str,
    next_attempt_at: Option<i64>,
) -> Result<()> {
    let now = now();
    match next_attempt_at {
        Some(at) => conn.execute(
            "UPDATE notifications SET status = 'pending', last_error = ?1, next_attempt_at = ?2, updated_at = ?3
             WHERE id = ?4",
            params![error, at, now, id],
        )?,
        None => conn.execute(
            "UPDATE notifications SET status = 'dead', last_error = ?1, updated_at = ?2
             WHERE id = ?3",
            params![error, now, id],
        )?,
    };
    Ok(())
}

pub fn list_due_notifications(conn: &Connection, now: i64, limit: i64) -> Result<Vec<NotificationJob>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM notifications WHERE status = 'pending' AND next_attempt_at <= ?1
             ORDER BY next_attempt_at LIMIT ?2",
            NOTIFICATION_COLS
        ),
        params![now, limit],
    )
}

pub fn list_dead_notifications(conn: &Connection) -> Result<Vec<NotificationJob>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM notifications WHERE status = 'dead' ORDER BY updated_at DESC",
            NOTIFICATION_COLS
        ),
        [],
    )
}

/// Put claims abandoned mid-send (crashed worker) back in the queue.
pub fn release_stale_notifications(conn: &Connection, claimed_before: i64) -> Result<usize> {
    let released = conn.execute(
        "UPDATE notifications SET status = 'pending', updated_at = ?1
         WHERE status = 'sending' AND updated_at < ?2",
        params![now(), claimed_before],
    )?;
    Ok(released)
}

/// Re-arm a dead (or already sent) notification for a manual resend.
/// Returns the notification id, or `None` if the transaction has no notification.
pub fn requeue_notification(conn: &Connection, transaction_id: &str) -> Result<Option<String>> {
    let now = now();
    let id: Option<String> = conn
        .query_row(
            "UPDATE notifications SET status = 'pending', attempts = 0, next_attempt_at = ?1, updated_at = ?1
             WHERE transaction_id = ?2 AND status IN ('dead', 'sent')
             RETURNING id",
            params![now, transaction_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}
