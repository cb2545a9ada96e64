use axum::{Json, extract::State};
use serde::{Deserialize, Serialize};

use crate::db::{AppState, queries};
use crate::error::{AppError, Result};
use crate::models::{Coupon, CreateTransaction};
use crate::payments::CheckoutRequest;

#[derive(Debug, Deserialize)]
pub struct BeginCheckoutRequest {
    pub product_id: String,
    pub customer_email: String,
    #[serde(default)]
    pub customer_name: Option<String>,
    /// Discount code typed by the customer
    #[serde(default)]
    pub coupon_code: Option<String>,
    #[serde(default)]
    pub subscribe_newsletter: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BeginCheckoutResponse {
    pub checkout_url: String,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discount_percent: Option<u32>,
}

/// Open a hosted checkout for a product and record the pending transaction.
///
/// A coupon that is unknown, used up, or cannot be checked because the
/// provider is unreachable is dropped and the customer pays full price.
pub async fn begin_checkout(
    State(state): State<AppState>,
    Json(request): Json<BeginCheckoutRequest>,
) -> Result<Json<BeginCheckoutResponse>> {
    let email = request.customer_email.trim();
    if email.is_empty() || !email.contains('@') {
        return Err(AppError::BadRequest("A valid customer_email is required".into()));
    }

    let product = {
        let conn = state.db.get()?;
        queries::get_product_by_id(&conn, &request.product_id)?
            .ok_or_else(|| AppError::NotFound("Product not found".into()))?
    };

    let coupon = match request.coupon_code.as_deref().map(str::trim) {
        Some(code) if !code.is_empty() => applicable_coupon(&state, code).await,
        _ => None,
    };

    let session = state
        .gateway
        .create_checkout_session(&CheckoutRequest {
            product_id: product.id.clone(),
            product_title: product.title.clone(),
            unit_amount: product.price,
            currency: state.currency.clone(),
            customer_email: email.to_string(),
            coupon_code: coupon.as_ref().map(|c| c.code.clone()),
            newsletter_opt_in: request.subscribe_newsletter,
            success_url: format!(
                "{}/checkout/success?session_id={{CHECKOUT_SESSION_ID}}",
                state.base_url
            ),
            cancel_url: format!("{}/checkout/cancel", state.base_url),
        })
        .await?;

    let conn = state.db.get()?;
    let (transaction, _) = queries::create_transaction(
        &conn,
        &CreateTransaction {
            session_id: session.id.clone(),
            amount: product.price,
            customer_email: email.to_string(),
            customer_name: request.customer_name.clone(),
            product_id: product.id.clone(),
            payment_method: None,
            city: None,
            coupon_code: coupon.as_ref().map(|c| c.code.clone()),
            newsletter_opt_in: request.subscribe_newsletter,
            max_downloads: product.max_downloads.unwrap_or(state.default_max_downloads),
        },
    )?;

    tracing::info!(
        session_id = %session.id,
        transaction_id = %transaction.id,
        product_id = %product.id,
        coupon = ?transaction.coupon_code,
        "Checkout session created"
    );

    Ok(Json(BeginCheckoutResponse {
        checkout_url: session.url,
        session_id: session.id,
        discount_percent: coupon.map(|c| c.percent_off),
    }))
}

async fn applicable_coupon(state: &AppState, code: &str) -> Option<Coupon> {
    match state.coupons.validate_coupon(code).await {
        Ok(Some(coupon)) => Some(coupon),
        Ok(None) => {
            tracing::info!(code = %code, "Coupon not redeemable, charging full price");
            None
        }
        Err(e) => {
            tracing::warn!(code = %code, error = %e, "Coupon check failed, charging full price");
            None
        }
    }
}
