use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
};

use super::process_callback;
use crate::db::{AppState, queries};
use crate::models::TransactionStatus;
use crate::payments::{
    StripeCharge, StripeCheckoutSession, StripeWebhookEvent, from_minor_units, verify_stripe_signature,
};
use crate::pipeline::CheckoutCallback;

pub async fn handle_stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, &'static str) {
    let Some(secret) = state.stripe_webhook_secret.as_deref() else {
        tracing::error!("Stripe webhook received but STRIPE_WEBHOOK_SECRET is not set");
        return (StatusCode::SERVICE_UNAVAILABLE, "Stripe not configured");
    };

    let signature = match headers.get("stripe-signature") {
        Some(sig) => match sig.to_str() {
            Ok(s) => s,
            Err(_) => return (StatusCode::BAD_REQUEST, "Invalid signature header"),
        },
        None => return (StatusCode::BAD_REQUEST, "Missing stripe-signature header"),
    };

    let now = chrono::Utc::now().timestamp();
    match verify_stripe_signature(secret, &body, signature, now) {
        Ok(true) => {}
        Ok(false) => return (StatusCode::UNAUTHORIZED, "Invalid signature"),
        Err(e) => {
            tracing::error!("Signature verification error: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Signature verification failed");
        }
    }

    let event: StripeWebhookEvent = match serde_json::from_slice(&body) {
        Ok(e) => e,
        Err(e) => {
            tracing::error!("Failed to parse Stripe webhook: {}", e);
            return (StatusCode::BAD_REQUEST, "Invalid JSON");
        }
    };

    tracing::debug!(event_id = %event.id, event_type = %event.event_type, "Stripe webhook received");

    match event.event_type.as_str() {
        "checkout.session.completed" => handle_session_event(&state, &event, None).await,
        "checkout.session.async_payment_succeeded" => {
            handle_session_event(&state, &event, Some(TransactionStatus::Success)).await
        }
        "checkout.session.async_payment_failed" | "checkout.session.expired" => {
            handle_session_event(&state, &event, Some(TransactionStatus::Failed)).await
        }
        "charge.refunded" => handle_charge_refunded(&state, &event).await,
        _ => (StatusCode::OK, "Event ignored"),
    }
}

/// Map `payment_status` of a completed session. Delayed methods (SEPA,
/// bank transfer) complete as `unpaid` and settle in a later event.
fn completed_session_status(payment_status: &str) -> Option<TransactionStatus> {
    match payment_status {
        "paid" | "no_payment_required" => Some(TransactionStatus::Success),
        "unpaid" => Some(TransactionStatus::Pending),
        _ => None,
    }
}

fn session_callback(
    session: &StripeCheckoutSession,
    status: TransactionStatus,
) -> Result<CheckoutCallback, &'static str> {
    let product_id = session
        .metadata
        .product_id
        .clone()
        .ok_or("No product ID")?;

    let customer_email = session
        .customer_details
        .as_ref()
        .and_then(|d| d.email.clone())
        .or_else(|| session.customer_email.clone())
        .ok_or("No customer email")?;

    let amount_total = session.amount_total.ok_or("No amount")?;

    Ok(CheckoutCallback {
        session_id: session.id.clone(),
        status,
        gross_amount: from_minor_units(amount_total),
        customer_email,
        customer_name: session.customer_details.as_ref().and_then(|d| d.name.clone()),
        product_id,
        payment_method: session.payment_method_types.first().cloned(),
        city: session
            .customer_details
            .as_ref()
            .and_then(|d| d.address.as_ref())
            .and_then(|a| a.city.clone()),
        coupon_code: session.metadata.coupon_code.clone(),
        payment_intent_id: session.payment_intent.clone(),
        subscribe_newsletter: session.metadata.newsletter.as_deref() == Some("true"),
    })
}

async fn handle_session_event(
    state: &AppState,
    event: &StripeWebhookEvent,
    status: Option<TransactionStatus>,
) -> (StatusCode, &'static str) {
    let session: StripeCheckoutSession = match serde_json::from_value(event.data.object.clone()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Failed to parse checkout session: {}", e);
            return (StatusCode::BAD_REQUEST, "Invalid checkout session");
        }
    };

    let Some(status) = status.or_else(|| completed_session_status(&session.payment_status)) else {
        return (StatusCode::OK, "Payment status ignored");
    };

    let callback = match session_callback(&session, status) {
        Ok(c) => c,
        Err(reason) => {
            tracing::warn!(session_id = %session.id, reason, "Checkout session missing data");
            return (StatusCode::OK, reason);
        }
    };

    process_callback(state, &callback).await
}

async fn handle_charge_refunded(
    state: &AppState,
    event: &StripeWebhookEvent,
) -> (StatusCode, &'static str) {
    let charge: StripeCharge = match serde_json::from_value(event.data.object.clone()) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to parse charge: {}", e);
            return (StatusCode::BAD_REQUEST, "Invalid charge");
        }
    };

    // Partial refunds leave the purchase valid
    if !charge.refunded {
        return (StatusCode::OK, "Partial refund ignored");
    }

    let Some(payment_intent) = charge.payment_intent.as_deref() else {
        return (StatusCode::OK, "No payment intent");
    };

    let transaction = {
        let conn = match state.db.get() {
            Ok(c) => c,
            Err(e) => {
                tracing::error!("DB connection error: {}", e);
                return (StatusCode::INTERNAL_SERVER_ERROR, "Database error");
            }
        };
        match queries::get_transaction_by_payment_intent(&conn, payment_intent) {
            Ok(Some(t)) => t,
            Ok(None) => {
                tracing::warn!(charge_id = %charge.id, payment_intent, "Refund for unknown payment");
                return (StatusCode::OK, "Transaction not found");
            }
            Err(e) => {
                tracing::error!("DB error: {}", e);
                return (StatusCode::INTERNAL_SERVER_ERROR, "Database error");
            }
        }
    };

    process_callback(state, &CheckoutCallback::refund_of(&transaction)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn session(payment_status: &str) -> StripeCheckoutSession {
        serde_json::from_value(serde_json::json!({
            "id": "cs_test_1",
            "payment_status": payment_status,
            "amount_total": 1475,
            "payment_intent": "pi_1",
            "customer_details": {
                "email": "ana@example.com",
                "name": "Ana",
                "address": { "city": "Sevilla" }
            },
            "metadata": { "product_id": "recetario-navidad", "newsletter": "true" },
            "payment_method_types": ["card"]
        }))
        .unwrap()
    }

    #[test]
    fn test_completed_session_status_mapping() {
        assert_eq!(completed_session_status("paid"), Some(TransactionStatus::Success));
        assert_eq!(
            completed_session_status("no_payment_required"),
            Some(TransactionStatus::Success)
        );
        assert_eq!(completed_session_status("unpaid"), Some(TransactionStatus::Pending));
        assert_eq!(completed_session_status("something_new"), None);
    }

    #[test]
    fn test_session_callback_fields() {
        let callback = session_callback(&session("paid"), TransactionStatus::Success).unwrap();
        assert_eq!(callback.session_id, "cs_test_1");
        assert_eq!(callback.gross_amount, dec!(14.75));
        assert_eq!(callback.customer_email, "ana@example.com");
        assert_eq!(callback.city.as_deref(), Some("Sevilla"));
        assert_eq!(callback.payment_method.as_deref(), Some("card"));
        assert_eq!(callback.payment_intent_id.as_deref(), Some("pi_1"));
        assert!(callback.subscribe_newsletter);
    }

    #[test]
    fn test_session_without_product_is_rejected() {
        let mut s = session("paid");
        s.metadata.product_id = None;
        assert_eq!(
            session_callback(&s, TransactionStatus::Success).unwrap_err(),
            "No product ID"
        );
    }
}
