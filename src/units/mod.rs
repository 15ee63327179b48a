//! Pipeline units.
//!
//! Each unit takes one JSON event plus the shared [`Services`] and returns
//! one JSON value: a stage payload on success or `{"error": ...}`. Units
//! never return `Err` and never panic; an orchestrator chains them by
//! feeding outputs into later events.

pub mod act;
pub mod aggregate;
pub mod analyze;
pub mod batch;
pub mod chunk;
pub mod classify;
pub mod detect;
pub mod extract;
pub mod score;

use crate::agent::{AgentConfig, ChatBackend, ReasoningAgent, ToolExecutor};
use crate::jobs::{self, JobRecord, JobStore, NewJob, StatusTracker};
use crate::knowledge::KnowledgeBase;
use crate::models::{InsuranceType, Language};
use crate::pages::PageSource;
use crate::store::{self, BlobStore};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Every unit the CLI can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Unit {
    CreateJob,
    ListJobs,
    Batch,
    Classify,
    Extract,
    ChunkData,
    AnalyzeChunk,
    DetectChunk,
    AggregateAnalysis,
    AggregateDetection,
    Detect,
    Score,
    Act,
}

/// Pipeline knobs shared by the units.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Agent settings for text reasoning stages.
    pub reasoning: AgentConfig,
    /// Agent settings for classification and extraction.
    pub vision: AgentConfig,
    pub batch_size: usize,
    pub max_chunk_bytes: usize,
}

/// Clients constructed once at startup and handed to every unit.
pub struct Services {
    pub tracker: StatusTracker,
    pub blobs: Arc<dyn BlobStore>,
    pub backend: Arc<dyn ChatBackend>,
    pub knowledge: Option<Arc<dyn KnowledgeBase>>,
    pub pages: Arc<dyn PageSource>,
    pub settings: Settings,
}

impl Services {
    pub fn jobs(&self) -> &dyn JobStore {
        self.tracker.store().as_ref()
    }

    /// Reasoning agent bound to `system_prompt` and `tools`.
    pub fn agent(&self, system_prompt: String, tools: ToolExecutor) -> ReasoningAgent {
        ReasoningAgent::new(
            self.backend.clone(),
            self.settings.reasoning.clone(),
            system_prompt,
            tools,
        )
    }

    /// Tool-less multimodal agent.
    pub fn vision_agent(&self, system_prompt: String) -> ReasoningAgent {
        ReasoningAgent::new(
            self.backend.clone(),
            self.settings.vision.clone(),
            system_prompt,
            ToolExecutor::none(),
        )
    }

    /// Stored response language of a job, en-US by default.
    pub fn language(&self, job_id: Option<&str>) -> Language {
        job_id
            .map(|id| Language::from_code(&self.tracker.get_field(id, "userLanguage", "en-US")))
            .unwrap_or_default()
    }

    /// Stored line of business of a job, P&C by default.
    pub fn insurance_type(&self, job_id: &str) -> InsuranceType {
        InsuranceType::from_label(&self.tracker.get_field(
            job_id,
            "insuranceType",
            InsuranceType::PropertyCasualty.as_str(),
        ))
    }

    /// Store a trace blob; failures are logged and yield `None`.
    pub fn write_trace(&self, key: &str, payload: &Value) -> Option<String> {
        match store::put_json(self.blobs.as_ref(), key, payload) {
            Ok(()) => {
                info!(key, "Wrote trace");
                Some(key.to_string())
            }
            Err(e) => {
                warn!(key, "Failed to write trace: {}", e);
                None
            }
        }
    }
}

/// Run `unit` on `event`.
pub async fn run(unit: Unit, event: &Value, services: &Services) -> Value {
    match unit {
        Unit::CreateJob => create_job(event, services),
        Unit::ListJobs => list_jobs(services),
        Unit::Batch => batch::run(event, services),
        Unit::Classify => classify::run(event, services).await,
        Unit::Extract => extract::run(event, services).await,
        Unit::ChunkData => chunk::run(event, services),
        Unit::AnalyzeChunk => analyze::run(event, services).await,
        Unit::DetectChunk => detect::run_chunk(event, services).await,
        Unit::AggregateAnalysis => aggregate::run_analysis(event, services),
        Unit::AggregateDetection => aggregate::run_detection(event, services),
        Unit::Detect => detect::run_document(event, services).await,
        Unit::Score => score::run(event, services).await,
        Unit::Act => act::run(event, services).await,
    }
}

/// `{error: message}`.
pub fn error_response(message: impl Into<String>) -> Value {
    json!({ "error": message.into() })
}

/// Non-empty string at a JSON pointer.
pub fn str_at<'a>(event: &'a Value, pointer: &str) -> Option<&'a str> {
    event
        .pointer(pointer)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// `classification.jobId`, else top-level `jobId`.
pub fn job_id(event: &Value) -> Option<String> {
    str_at(event, "/classification/jobId")
        .or_else(|| str_at(event, "/jobId"))
        .map(str::to_string)
}

/// Uploaded document key from `detail.object.key` (or a bare `detail.object`).
pub fn object_key(event: &Value) -> Option<&str> {
    str_at(event, "/detail/object/key").or_else(|| str_at(event, "/detail/object"))
}

/// Job id encoded in an upload key `uploads/{jobId}/{filename}`.
pub fn job_id_from_key(key: &str) -> Option<&str> {
    let rest = key.strip_prefix("uploads/")?;
    let (job_id, filename) = rest.split_once('/')?;
    (!job_id.is_empty() && !filename.is_empty()).then_some(job_id)
}

/// UTC timestamp used in trace names.
pub fn trace_stamp() -> String {
    Utc::now().format("%Y%m%dT%H%M%SZ").to_string()
}

/// Top-level keys of the event, for traces.
pub fn event_keys(event: &Value) -> Vec<String> {
    event
        .as_object()
        .map(|obj| obj.keys().cloned().collect())
        .unwrap_or_default()
}

/// Job record fields from a JSON object literal.
pub fn fields(value: Value) -> JobRecord {
    match value {
        Value::Object(map) => map,
        _ => JobRecord::new(),
    }
}

/// Pretty JSON for prompts.
pub fn pretty(value: &impl serde::Serialize) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
}

fn create_job(event: &Value, services: &Services) -> Value {
    let Some(filename) = str_at(event, "/filename") else {
        return error_response("Missing filename");
    };
    let request = NewJob {
        filename: filename.to_string(),
        insurance_type: str_at(event, "/insuranceType")
            .unwrap_or(InsuranceType::PropertyCasualty.as_str())
            .to_string(),
        language: str_at(event, "/userLanguage").unwrap_or("en-US").to_string(),
        batch_id: str_at(event, "/batchId").map(str::to_string),
    };

    match jobs::create_job(services.jobs(), &request) {
        Ok(created) => serde_json::to_value(created)
            .unwrap_or_else(|e| error_response(format!("Failed to serialize job: {}", e))),
        Err(e) => {
            error!("Failed to create job: {}", e);
            error_response(format!("Failed to create job: {}", e))
        }
    }
}

fn list_jobs(services: &Services) -> Value {
    match jobs::list_jobs(services.jobs()) {
        Ok(jobs) => json!({ "count": jobs.len(), "jobs": jobs }),
        Err(e) => {
            error!("Failed to list jobs: {}", e);
            error_response(format!("Failed to list jobs: {}", e))
        }
    }
}
