// Route table for the Codelab API
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::handlers;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/submissions", post(handlers::submit))
        .route(
            "/submissions/:id",
            get(handlers::get_submission).delete(handlers::cancel_submission),
        )
        .route("/languages", get(handlers::list_languages))
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::export_metrics))
}
