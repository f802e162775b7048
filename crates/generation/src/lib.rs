//! `genforge-generation`
//!
//! **Responsibility:** the generation job domain.
//!
//! - Job lifecycle and its status state machine (`job`, `status`).
//! - Provider status vocabulary, isolated behind [`map_provider_status`].
//! - Provider callback parsing (`callback`), pure and storage-agnostic.
//! - Pricing and plan-tier concurrency limits (`pricing`).
//!
//! Nothing here performs IO: infra decides *when* to persist, this crate
//! decides *what* changes.

pub mod callback;
pub mod job;
pub mod pricing;
pub mod status;

pub use callback::{parse_callback, CallbackParseError, ProviderCallback};
pub use job::{Job, JobEvent, JobEventType, JobOutput, NewJob, OutputKind, StatusChange};
pub use pricing::{ConcurrencyLimits, CostEstimate, ModelPrice, PlanTier, PricingCatalog};
pub use status::{map_provider_status, JobStatus, ProviderStatus};
