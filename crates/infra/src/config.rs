//! Process configuration read from the environment.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use genforge_generation::ConcurrencyLimits;

use crate::provider::HttpProviderConfig;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required env var: {0}")]
    Missing(&'static str),

    #[error("invalid {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

/// Where jobs and ledger entries are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    Postgres,
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StorageBackend::Memory),
            "postgres" => Ok(StorageBackend::Postgres),
            other => Err(format!("expected memory or postgres, got {other:?}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub jwt_secret: String,
    pub storage: StorageBackend,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub provider_base_url: Option<String>,
    pub provider_api_key: Option<String>,
    pub provider_code: String,
    pub provider_timeout_secs: u64,
    pub provider_webhook_url: Option<String>,
    pub free_concurrency_limit: u32,
    pub paid_concurrency_limit: u32,
    /// Credits granted to a user the first time they are seen (memory storage only).
    pub signup_credits: i64,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let vars = Vars(&lookup);
        let config = Self {
            bind_addr: vars.string_or("BIND_ADDR", "0.0.0.0:8080"),
            jwt_secret: vars.required("JWT_SECRET")?,
            storage: vars.parsed_or("STORAGE", StorageBackend::Memory)?,
            database_url: vars.optional("DATABASE_URL"),
            database_max_connections: vars.parsed_or("DATABASE_MAX_CONNECTIONS", 10)?,
            provider_base_url: vars.optional("PROVIDER_BASE_URL"),
            provider_api_key: vars.optional("PROVIDER_API_KEY"),
            provider_code: vars.string_or("PROVIDER_CODE", "freepik"),
            provider_timeout_secs: vars.parsed_or("PROVIDER_TIMEOUT_SECS", 30)?,
            provider_webhook_url: vars.optional("PROVIDER_WEBHOOK_URL"),
            free_concurrency_limit: vars.parsed_or("FREE_CONCURRENCY_LIMIT", 1)?,
            paid_concurrency_limit: vars.parsed_or("PAID_CONCURRENCY_LIMIT", 4)?,
            signup_credits: vars.parsed_or("SIGNUP_CREDITS", 0)?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.storage == StorageBackend::Postgres && self.database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }
        if self.provider_base_url.is_some() && self.provider_api_key.is_none() {
            return Err(ConfigError::Missing("PROVIDER_API_KEY"));
        }
        for (key, value) in [
            ("FREE_CONCURRENCY_LIMIT", self.free_concurrency_limit),
            ("PAID_CONCURRENCY_LIMIT", self.paid_concurrency_limit),
            ("DATABASE_MAX_CONNECTIONS", self.database_max_connections),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key,
                    message: "must be at least 1".to_string(),
                });
            }
        }
        if self.signup_credits < 0 {
            return Err(ConfigError::Invalid {
                key: "SIGNUP_CREDITS",
                message: "must not be negative".to_string(),
            });
        }
        Ok(())
    }

    pub fn concurrency_limits(&self) -> ConcurrencyLimits {
        ConcurrencyLimits {
            free: self.free_concurrency_limit,
            paid: self.paid_concurrency_limit,
        }
    }

    /// Settings for the HTTP provider client; `None` runs against the stub gateway.
    pub fn provider_config(&self) -> Option<HttpProviderConfig> {
        let base_url = self.provider_base_url.clone()?;
        Some(HttpProviderConfig {
            base_url,
            api_key: self.provider_api_key.clone().unwrap_or_default(),
            webhook_url: self.provider_webhook_url.clone(),
            timeout: Duration::from_secs(self.provider_timeout_secs),
        })
    }
}

struct Vars<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Vars<'_, F> {
    /// Unset and blank values read as absent.
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.optional(key).ok_or(ConfigError::Missing(key))
    }

    fn string_or(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn parsed_or<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: ToString,
    {
        match self.optional(key) {
            Some(v) => v.parse::<T>().map_err(|e| ConfigError::Invalid {
                key,
                message: e.to_string(),
            }),
            None => Ok(default),
        }
    }
}
