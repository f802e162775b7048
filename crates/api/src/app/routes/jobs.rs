use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};

use genforge_core::JobId;
use genforge_infra::jobs::JobStore;

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::UserContext;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_jobs).post(create_job))
        .route("/:id", get(get_job))
}

pub async fn create_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    body: Result<Json<dto::CreateJobRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return errors::json_rejection_to_response(rejection),
    };
    if let Err(e) = services.welcome(user.user_id()).await {
        return errors::ledger_error_to_response(e);
    }

    match services
        .job_service
        .create_job(user.user_id(), user.plan(), body)
        .await
    {
        Ok(created) => (StatusCode::CREATED, Json(created)).into_response(),
        Err(e) => errors::submit_error_to_response(e),
    }
}

pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Query(query): Query<dto::ListJobsQuery>,
) -> axum::response::Response {
    match services
        .jobs
        .list_for_user(user.user_id(), query.effective_limit())
        .await
    {
        Ok(jobs) => {
            let items = jobs.iter().map(dto::job_summary_to_json).collect::<Vec<_>>();
            (StatusCode::OK, Json(serde_json::json!({ "items": items }))).into_response()
        }
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    // Malformed ids and other users' jobs look the same to the caller.
    let Ok(job_id) = id.parse::<JobId>() else {
        return errors::json_error(StatusCode::NOT_FOUND, "not_found", "job not found");
    };

    let job = match services.jobs.get_for_user(user.user_id(), job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => {
            return errors::json_error(StatusCode::NOT_FOUND, "not_found", "job not found");
        }
        Err(e) => return errors::store_error_to_response(e),
    };
    let outputs = match services.jobs.outputs(job.id).await {
        Ok(v) => v,
        Err(e) => return errors::store_error_to_response(e),
    };

    (StatusCode::OK, Json(dto::job_detail_to_json(&job, &outputs))).into_response()
}
