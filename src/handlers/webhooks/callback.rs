use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
};

use super::process_callback;
use crate::db::AppState;
use crate::payments::verify_hmac_signature;
use crate::pipeline::CheckoutCallback;
use crate::util::header_str;

pub const SIGNATURE_HEADER: &str = "x-signature";

/// Provider-neutral completion callback: a JSON `CheckoutCallback` signed
/// with a hex HMAC-SHA256 of the raw body.
pub async fn handle_checkout_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, &'static str) {
    let Some(secret) = state.callback_secret.as_deref() else {
        return (StatusCode::NOT_FOUND, "Callback endpoint disabled");
    };

    let Some(signature) = header_str(&headers, SIGNATURE_HEADER) else {
        return (StatusCode::BAD_REQUEST, "Missing x-signature header");
    };

    match verify_hmac_signature(secret, &body, signature) {
        Ok(true) => {}
        Ok(false) => return (StatusCode::UNAUTHORIZED, "Invalid signature"),
        Err(e) => {
            tracing::error!("Signature verification error: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Signature verification failed");
        }
    }

    let callback: CheckoutCallback = match serde_json::from_slice(&body) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to parse checkout callback: {}", e);
            return (StatusCode::BAD_REQUEST, "Invalid JSON");
        }
    };

    process_callback(&state, &callback).await
}
