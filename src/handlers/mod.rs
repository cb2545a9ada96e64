pub mod public;
pub mod webhooks;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::db::AppState;

/// Full application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(public::router())
        .merge(webhooks::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
