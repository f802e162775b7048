use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use genforge_infra::jobs::JobStoreError;
use genforge_infra::ledger::LedgerError;
use genforge_infra::orchestrator::{SubmitError, WebhookError};

pub fn submit_error_to_response(err: SubmitError) -> axum::response::Response {
    match err {
        SubmitError::Validation(msg) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", msg)
        }
        e @ SubmitError::ConcurrencyLimit { .. } => json_error(
            StatusCode::TOO_MANY_REQUESTS,
            "concurrency_limit_exceeded",
            e.to_string(),
        ),
        e @ SubmitError::InsufficientCredits { .. } => json_error(
            StatusCode::PAYMENT_REQUIRED,
            "insufficient_credits",
            e.to_string(),
        ),
        SubmitError::Provider { status, message, .. } => {
            json_error(provider_status(status), "provider_error", message)
        }
        SubmitError::Internal(msg) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg)
        }
    }
}

/// The provider's own error status when it gave one, otherwise 502.
fn provider_status(status: Option<u16>) -> StatusCode {
    status
        .and_then(|s| StatusCode::from_u16(s).ok())
        .filter(|s| s.is_client_error() || s.is_server_error())
        .unwrap_or(StatusCode::BAD_GATEWAY)
}

pub fn webhook_error_to_response(err: WebhookError) -> axum::response::Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let code = match err {
        WebhookError::InvalidPayload(_) => "invalid_payload",
        WebhookError::Store(_) => "store_error",
    };
    json_error(status, code, err.to_string())
}

/// Unreadable request bodies keep axum's status (400, 415 or 422) but use our
/// error shape.
pub fn json_rejection_to_response(rejection: JsonRejection) -> axum::response::Response {
    json_error(rejection.status(), "invalid_body", rejection.body_text())
}

pub fn store_error_to_response(err: JobStoreError) -> axum::response::Response {
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", err.to_string())
}

pub fn ledger_error_to_response(err: LedgerError) -> axum::response::Response {
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "ledger_error", err.to_string())
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
