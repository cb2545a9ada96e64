use axum::{
    Json,
    extract::{Path, State},
};

use crate::db::AppState;
use crate::error::{AppError, Result};
use crate::models::Coupon;

/// Look up a coupon before checkout. Used-up coupons read as missing.
pub async fn get_coupon(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<Coupon>> {
    state
        .coupons
        .validate_coupon(&code)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound("Coupon not found or already used".into()))
}
