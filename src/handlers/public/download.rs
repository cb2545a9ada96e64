use axum::{
    extract::{Path, State},
    response::Redirect,
};

use crate::db::{AppState, queries};
use crate::error::{AppError, Result};

/// Redeem one download of the product bought under `code`.
///
/// The counter is only incremented once the file is known to exist, so a
/// misconfigured product does not eat into the customer's quota.
pub async fn download(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Redirect> {
    let conn = state.db.get()?;

    let transaction = queries::get_transaction_by_code(&conn, &code)?
        .ok_or_else(|| AppError::NotFound("Redemption code not found".into()))?;

    let file = queries::get_product_by_id(&conn, &transaction.product_id)?
        .and_then(|p| p.file)
        .ok_or_else(|| AppError::NotFound("No downloadable file for this product".into()))?;

    let transaction = queries::record_download(&conn, &code)?;

    tracing::info!(
        transaction_id = %transaction.id,
        code = %code,
        download_count = transaction.download_count,
        max_downloads = transaction.max_downloads,
        "Download authorized"
    );

    Ok(Redirect::temporary(&state.assets.resolve(&file)))
}
