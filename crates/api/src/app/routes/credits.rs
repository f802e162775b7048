use std::sync::Arc;

use axum::{
    extract::Extension, http::StatusCode, response::IntoResponse, routing::get, Json, Router,
};

use genforge_infra::ledger::CreditsLedger;

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::UserContext;

pub fn router() -> Router {
    Router::new().route("/", get(get_credits))
}

pub async fn get_credits(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
) -> axum::response::Response {
    if let Err(e) = services.welcome(user.user_id()).await {
        return errors::ledger_error_to_response(e);
    }

    let balance = match services.ledger.balance(user.user_id()).await {
        Ok(b) => b,
        Err(e) => return errors::ledger_error_to_response(e),
    };
    let entries = match services.ledger.entries(user.user_id()).await {
        Ok(v) => v,
        Err(e) => return errors::ledger_error_to_response(e),
    };

    let entries = entries.iter().map(dto::ledger_entry_to_json).collect::<Vec<_>>();
    (
        StatusCode::OK,
        Json(serde_json::json!({ "balance": balance, "entries": entries })),
    )
        .into_response()
}
