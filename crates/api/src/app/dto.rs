use serde::Deserialize;
use serde_json::json;

use genforge_credits::CreditLedgerEntry;
use genforge_generation::{Job, JobOutput};

pub use genforge_infra::orchestrator::CreateJobRequest;

pub const DEFAULT_LIST_LIMIT: usize = 50;
pub const MAX_LIST_LIMIT: usize = 200;

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub limit: Option<usize>,
}

impl ListJobsQuery {
    pub fn effective_limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT)
    }
}

// -------------------------
// Response mapping
// -------------------------

pub fn job_summary_to_json(job: &Job) -> serde_json::Value {
    json!({
        "id": job.id.to_string(),
        "model": job.model_slug,
        "modality": job.modality_code,
        "status": job.status,
        "provider_job_id": job.provider_job_id,
        "credits_cost": job.cost_actual_credits,
        "is_public": job.is_public,
        "share_slug": job.share_slug,
        "created_at": job.created_at,
        "completed_at": job.completed_at,
    })
}

pub fn job_detail_to_json(job: &Job, outputs: &[JobOutput]) -> serde_json::Value {
    let mut body = job_summary_to_json(job);
    if let Some(fields) = body.as_object_mut() {
        fields.insert("input_params".to_string(), job.input_params.clone());
        fields.insert("credits_estimated".to_string(), json!(job.cost_estimated_credits));
        fields.insert("error_message".to_string(), json!(job.error_message()));
        fields.insert("refund_issued".to_string(), json!(job.refund_issued()));
        fields.insert("provider_status".to_string(), json!(job.provider_latest_status()));
        fields.insert("started_at".to_string(), json!(job.started_at));
        fields.insert(
            "outputs".to_string(),
            outputs.iter().map(output_to_json).collect(),
        );
    }
    body
}

pub fn output_to_json(output: &JobOutput) -> serde_json::Value {
    json!({
        "index": output.index,
        "kind": output.kind,
        "url": output.url,
    })
}

pub fn ledger_entry_to_json(entry: &CreditLedgerEntry) -> serde_json::Value {
    json!({
        "id": entry.id.to_string(),
        "amount": entry.amount,
        "type": entry.entry_type,
        "related_job_id": entry.related_job_id.map(|id| id.to_string()),
        "notes": entry.notes,
        "created_at": entry.created_at,
    })
}
