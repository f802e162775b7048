//! Infrastructure layer: storage adapters, provider client, orchestration, config.

pub mod config;
pub mod db;
pub mod jobs;
pub mod ledger;
pub mod orchestrator;
pub mod provider;
pub mod share;
