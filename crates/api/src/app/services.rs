use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use genforge_core::UserId;
use genforge_generation::PricingCatalog;
use genforge_infra::config::{AppConfig, StorageBackend};
use genforge_infra::db;
use genforge_infra::jobs::{InMemoryJobStore, JobStore, PostgresJobStore};
use genforge_infra::ledger::{
    CreditsLedger, InMemoryCreditsLedger, LedgerError, PostgresCreditsLedger,
};
use genforge_infra::orchestrator::{JobService, JobServiceSettings, Reconciler};
use genforge_infra::provider::{
    HttpProviderGateway, ProviderError, ProviderGateway, StubProviderGateway,
};
use genforge_infra::share::SlugShareAttacher;

#[derive(Debug, Error)]
pub enum ServicesError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("provider client error: {0}")]
    Provider(#[from] ProviderError),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Everything the handlers need, wired for one storage backend.
pub struct AppServices {
    pub jobs: Arc<dyn JobStore>,
    pub ledger: Arc<dyn CreditsLedger>,
    pub job_service: JobService,
    pub reconciler: Reconciler,
    signup_credits: i64,
    /// One cell per user seen; the registry lock is never held across an await.
    welcomed: Mutex<HashMap<UserId, Arc<OnceCell<()>>>>,
}

impl AppServices {
    /// In-memory stores; `signup_credits` are granted to each user on first contact.
    pub fn in_memory(
        gateway: Arc<dyn ProviderGateway>,
        settings: JobServiceSettings,
        signup_credits: i64,
    ) -> Self {
        Self::assemble(
            Arc::new(InMemoryJobStore::new()),
            Arc::new(InMemoryCreditsLedger::new()),
            gateway,
            settings,
            signup_credits,
        )
    }

    fn assemble(
        jobs: Arc<dyn JobStore>,
        ledger: Arc<dyn CreditsLedger>,
        gateway: Arc<dyn ProviderGateway>,
        settings: JobServiceSettings,
        signup_credits: i64,
    ) -> Self {
        let share = Arc::new(SlugShareAttacher::new(jobs.clone()));
        let job_service = JobService::new(jobs.clone(), ledger.clone(), gateway, share, settings);
        let reconciler = Reconciler::new(jobs.clone(), ledger.clone());
        Self {
            jobs,
            ledger,
            job_service,
            reconciler,
            signup_credits,
            welcomed: Mutex::new(HashMap::new()),
        }
    }

    /// Grant signup credits the first time a user is seen by this process.
    ///
    /// Concurrent first requests from the same user wait for a single grant;
    /// other users are never blocked by it. A failed grant is retried on the
    /// next request.
    pub async fn welcome(&self, user_id: UserId) -> Result<(), LedgerError> {
        if self.signup_credits <= 0 {
            return Ok(());
        }
        let cell = {
            let mut welcomed = self
                .welcomed
                .lock()
                .map_err(|_| LedgerError::Storage("welcome registry lock poisoned".to_string()))?;
            welcomed.entry(user_id).or_default().clone()
        };

        cell.get_or_try_init(|| async {
            self.ledger
                .grant(user_id, self.signup_credits, "signup credits")
                .await?;
            info!(user_id = %user_id, credits = self.signup_credits, "signup credits granted");
            Ok::<(), LedgerError>(())
        })
        .await?;
        Ok(())
    }
}

pub async fn build_services(config: &AppConfig) -> Result<AppServices, ServicesError> {
    let gateway: Arc<dyn ProviderGateway> = match config.provider_config() {
        Some(provider) => Arc::new(HttpProviderGateway::new(provider)?),
        None => {
            warn!("PROVIDER_BASE_URL not set; submissions go to the stub provider gateway");
            Arc::new(StubProviderGateway::accepting("CREATED"))
        }
    };

    let settings = JobServiceSettings {
        provider_code: config.provider_code.clone(),
        limits: config.concurrency_limits(),
        catalog: PricingCatalog::default(),
    };

    match config.storage {
        StorageBackend::Memory => {
            info!("using in-memory stores");
            Ok(AppServices::in_memory(gateway, settings, config.signup_credits))
        }
        StorageBackend::Postgres => {
            let database_url = config.database_url.as_deref().ok_or_else(|| {
                ServicesError::Config("DATABASE_URL must be set for postgres storage".to_string())
            })?;
            let pool = db::connect(database_url, config.database_max_connections).await?;
            db::migrate(&pool).await?;
            Ok(AppServices::assemble(
                Arc::new(PostgresJobStore::new(pool.clone())),
                Arc::new(PostgresCreditsLedger::new(pool)),
                gateway,
                settings,
                0,
            ))
        }
    }
}
