//! HTTP application wiring (Axum router + service wiring).
//!
//! - `services.rs`: storage, provider and orchestration wiring
//! - `routes/`: HTTP routes + handlers (one file per area)
//! - `dto.rs`: request DTOs and JSON mapping helpers
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use tower::ServiceBuilder;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

use services::AppServices;

/// Build the full HTTP router around already-wired services.
pub fn build_app(services: Arc<AppServices>, jwt_secret: String) -> Router {
    let jwt = Arc::new(genforge_auth::Hs256JwtValidator::new(jwt_secret.into_bytes()));
    let auth_state = middleware::AuthState { jwt };

    // Protected routes: require a valid bearer token.
    let protected = routes::router().layer(axum::middleware::from_fn_with_state(
        auth_state,
        middleware::auth_middleware,
    ));

    Router::new()
        .route("/health", get(routes::system::health))
        .nest("/webhooks", routes::webhooks::router())
        .merge(protected)
        .layer(ServiceBuilder::new().layer(Extension(services)))
}
