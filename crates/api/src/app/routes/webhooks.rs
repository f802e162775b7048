use std::sync::Arc;

use axum::{
    body::Bytes, extract::Extension, http::StatusCode, response::IntoResponse, routing::post,
    Json, Router,
};

use crate::app::errors;
use crate::app::services::AppServices;

/// Provider callbacks. Unauthenticated: the provider cannot present a user token.
pub fn router() -> Router {
    Router::new().route("/provider", post(provider_callback))
}

pub async fn provider_callback(
    Extension(services): Extension<Arc<AppServices>>,
    body: Bytes,
) -> axum::response::Response {
    match services.reconciler.handle(&body).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "ok", "outcome": outcome })),
        )
            .into_response(),
        Err(e) => errors::webhook_error_to_response(e),
    }
}
