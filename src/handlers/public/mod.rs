mod checkout;
mod coupons;
mod download;

pub use checkout::*;
pub use coupons::*;
pub use download::*;

use axum::{
    Json, Router,
    routing::{get, post},
};
use serde::Serialize;

use crate::db::AppState;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/checkout", post(begin_checkout))
        .route("/coupons/{code}", get(get_coupon))
        .route("/download/{code}", get(download))
}
