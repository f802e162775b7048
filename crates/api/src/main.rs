use std::sync::Arc;

use anyhow::Context;

use genforge_infra::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    genforge_observability::init();

    let config = AppConfig::from_env().context("invalid configuration")?;
    let services = genforge_api::app::services::build_services(&config)
        .await
        .context("failed to wire services")?;

    let app = genforge_api::app::build_app(Arc::new(services), config.jwt_secret.clone());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
