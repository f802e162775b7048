use axum::{routing::get, Router};

pub mod credits;
pub mod jobs;
pub mod system;
pub mod webhooks;

/// Router for all authenticated (user-scoped) endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/whoami", get(system::whoami))
        .nest("/jobs", jobs::router())
        .nest("/credits", credits::router())
}
