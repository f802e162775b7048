//! Model pricing and plan-tier concurrency limits.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use genforge_core::{DomainError, DomainResult};

/// Upper bound applied to the per-request quantity multiplier.
const MAX_MULTIPLIER: i64 = 4;

/// Seconds of video covered by one unit of a video model's base price.
const VIDEO_SECONDS_PER_UNIT: i64 = 5;

/// Subscription tier carried by the caller's token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    #[default]
    Free,
    Paid,
}

/// In-flight job caps per tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyLimits {
    pub free: u32,
    pub paid: u32,
}

impl Default for ConcurrencyLimits {
    fn default() -> Self {
        Self { free: 1, paid: 4 }
    }
}

impl ConcurrencyLimits {
    pub fn limit_for(&self, tier: PlanTier) -> u32 {
        match tier {
            PlanTier::Free => self.free,
            PlanTier::Paid => self.paid,
        }
    }
}

/// Price list entry for one model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPrice {
    /// Platform-facing model name, e.g. `mystic`.
    pub model_slug: String,
    /// Provider endpoint path for the model, e.g. `text-to-image/mystic`.
    pub provider_model_id: String,
    /// Base credits for one unit of output.
    pub credits: i64,
}

impl ModelPrice {
    pub fn new(model_slug: &str, provider_model_id: &str, credits: i64) -> Self {
        Self {
            model_slug: model_slug.to_string(),
            provider_model_id: provider_model_id.to_string(),
            credits,
        }
    }
}

/// Cost computed at submission time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub model_slug: String,
    pub credits: i64,
}

impl CostEstimate {
    pub fn new(model_slug: impl Into<String>, credits: i64) -> Self {
        Self {
            model_slug: model_slug.into(),
            credits,
        }
    }

    /// Audit snapshot stored on the job.
    pub fn snapshot(&self, captured_at: DateTime<Utc>) -> JsonValue {
        serde_json::json!({
            "model_slug": self.model_slug,
            "credits": self.credits,
            "currency": "credits",
            "captured_at": captured_at.to_rfc3339(),
        })
    }
}

/// Known models and their prices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingCatalog {
    models: BTreeMap<String, ModelPrice>,
}

impl Default for PricingCatalog {
    fn default() -> Self {
        Self::new([
            ModelPrice::new("mystic", "text-to-image/mystic", 5),
            ModelPrice::new("flux-dev", "text-to-image/flux-dev", 4),
            ModelPrice::new("imagen3", "text-to-image/imagen3", 6),
            ModelPrice::new("kling-v2", "image-to-video/kling-v2", 20),
            ModelPrice::new("seedance-pro", "image-to-video/seedance-pro-1080p", 25),
            ModelPrice::new("sound-effects", "sound-effects", 3),
            ModelPrice::new("latent-sync", "lip-sync/latent-sync", 30),
        ])
    }
}

impl PricingCatalog {
    pub fn new(models: impl IntoIterator<Item = ModelPrice>) -> Self {
        Self {
            models: models
                .into_iter()
                .map(|m| (m.model_slug.clone(), m))
                .collect(),
        }
    }

    pub fn get(&self, model_slug: &str) -> Option<&ModelPrice> {
        self.models.get(model_slug)
    }

    /// Estimate credits for a request.
    ///
    /// Image models scale with `num_images`, video models with `duration`
    /// (in 5-second units); both multipliers are clamped to `1..=4`.
    pub fn estimate(
        &self,
        model_slug: &str,
        input_params: &JsonValue,
    ) -> DomainResult<CostEstimate> {
        let price = self
            .get(model_slug)
            .ok_or_else(|| DomainError::validation(format!("unknown model: {model_slug}")))?;

        let multiplier = quantity_multiplier(input_params);
        Ok(CostEstimate::new(model_slug, price.credits * multiplier))
    }
}

fn quantity_multiplier(input_params: &JsonValue) -> i64 {
    if let Some(n) = int_param(input_params, "num_images") {
        return n.clamp(1, MAX_MULTIPLIER);
    }
    if let Some(seconds) = int_param(input_params, "duration") {
        let units = seconds.saturating_add(VIDEO_SECONDS_PER_UNIT - 1) / VIDEO_SECONDS_PER_UNIT;
        return units.clamp(1, MAX_MULTIPLIER);
    }
    1
}

/// Providers accept numbers either as JSON numbers or numeric strings (`"10"`).
fn int_param(params: &JsonValue, key: &str) -> Option<i64> {
    match params.get(key)? {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
