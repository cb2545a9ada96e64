mod callback;
mod stripe;

pub use callback::*;
pub use stripe::*;

use axum::{Router, http::StatusCode, routing::post};

use crate::db::AppState;
use crate::error::AppError;
use crate::pipeline::{CheckoutCallback, CompletionOutcome};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/webhook/stripe", post(handle_stripe_webhook))
        .route("/callback/checkout", post(handle_checkout_callback))
}

/// Run a verified callback through the orchestrator and pick the reply.
///
/// Anything the provider should not redeliver is acknowledged with 200:
/// duplicates, rejected regressions and refunds of unknown sessions. Store
/// failures answer 500 so the provider retries.
pub(crate) async fn process_callback(
    state: &AppState,
    callback: &CheckoutCallback,
) -> (StatusCode, &'static str) {
    match state.orchestrator.complete(callback).await {
        Ok(CompletionOutcome::Applied { .. }) => (StatusCode::OK, "OK"),
        Ok(CompletionOutcome::Duplicate { .. }) => (StatusCode::OK, "Already processed"),
        Err(AppError::InvalidTransition { .. }) => (StatusCode::OK, "Ignored"),
        Err(AppError::NotFound(_)) => (StatusCode::OK, "Transaction not found"),
        Err(e) => {
            tracing::error!(
                session_id = %callback.session_id,
                error = %e,
                "Failed to process checkout callback"
            );
            (StatusCode::INTERNAL_SERVER_ERROR, "Processing failed")
        }
    }
}
