//! Impairment detection, per chunk and over a whole document.

use super::analyze::ChunkTask;
use super::{event_keys, fields, pretty, str_at, trace_stamp, Services};
use crate::agent::{prompts, Tool, ToolExecutor};
use crate::chunking::merge_chunks;
use crate::models::{DetectionReport, ExtractedData, InsuranceType, JobStatus, Language};
use crate::parser;
use crate::store::analysis_trace_key;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{error, info, warn};

/// Detection tools for a line of business.
pub fn detection_tools(insurance_type: InsuranceType, services: &Services) -> ToolExecutor {
    match insurance_type {
        InsuranceType::Life => ToolExecutor::new(vec![Tool::KbSearch, Tool::ScratchPad])
            .with_knowledge(services.knowledge.clone()),
        InsuranceType::PropertyCasualty => ToolExecutor::new(vec![Tool::ScratchPad]),
    }
}

/// Detect impairments in one chunk; the report carries `chunkId`.
pub async fn run_chunk(event: &Value, services: &Services) -> Value {
    let task = match ChunkTask::load(event, services) {
        Ok(task) => task,
        Err(response) => return response,
    };
    let insurance_type = match str_at(event, "/insuranceType") {
        Some(label) => InsuranceType::from_label(label),
        None => task
            .job_id
            .as_deref()
            .map(|id| services.insurance_type(id))
            .unwrap_or_default(),
    };

    let mut agent = services.agent(
        prompts::detection_system(insurance_type, task.language),
        detection_tools(insurance_type, services),
    );
    let message = prompts::detection_message(&pretty(&task.data), task.note());
    let text = match agent.invoke(&message).await {
        Ok(text) => text,
        Err(e) => {
            error!(chunk_id = task.chunk_id, "Detection agent failed: {:#}", e);
            return task.failure(format!("Agent error: {:#}", e), None);
        }
    };

    if text.trim().is_empty() {
        return task.failure("Empty response from model".to_string(), None);
    }

    let Some(obj) = parser::extract_object(&text) else {
        warn!(chunk_id = task.chunk_id, "Unparseable detection output");
        return task.failure("Agent error: no JSON object in response".to_string(), Some(&text));
    };
    let mut report: DetectionReport = match serde_json::from_value(Value::Object(obj)) {
        Ok(report) => report,
        Err(e) => return task.failure(format!("Agent error: {}", e), Some(&text)),
    };
    report.chunk_id = Some(task.chunk_id);

    info!(
        chunk_id = task.chunk_id,
        impairments = report.impairments.len(),
        "Detected impairments in chunk"
    );
    serde_json::to_value(&report)
        .unwrap_or_else(|e| task.failure(format!("Failed to serialize report: {}", e), None))
}

/// Detect impairments over every extraction batch at once.
///
/// Never fails: a model or parse failure yields an empty detection.
pub async fn run_document(event: &Value, services: &Services) -> Value {
    let refs = event
        .get("extractionResults")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let merged = merge_chunks(services.blobs.as_ref(), refs);

    let job_id = str_at(event, "/classification/jobId");
    let insurance_type = match str_at(event, "/classification/insuranceType") {
        Some(label) => InsuranceType::from_label(label),
        None => job_id
            .map(|id| services.insurance_type(id))
            .unwrap_or_default(),
    };
    let language = services.language(job_id);

    if let Some(id) = job_id {
        let document_type = str_at(event, "/classification/classification").unwrap_or("Unknown");
        services.tracker.set_status(
            id,
            JobStatus::Detecting,
            fields(json!({
                "documentType": document_type,
                "extractedDataJsonStr": pretty_compact(&merged),
                "extractionTimestamp": Utc::now().to_rfc3339(),
            })),
        );
    }

    let (agent_raw, mut detection) =
        detect_document(services, &merged, insurance_type, language).await;

    if let Some(id) = job_id {
        let key = analysis_trace_key(id, &format!("detection-{}", trace_stamp()));
        let output = serde_json::to_value(&detection).unwrap_or(Value::Null);
        let trace = json!({
            "eventKeys": event_keys(event),
            "agentRaw": agent_raw,
            "output": output,
        });
        detection.trace_key = services.write_trace(&key, &trace);

        let value = serde_json::to_value(&detection).unwrap_or(Value::Null);
        if let Err(e) = services.tracker.write_output(
            id,
            "analysisDetectionJsonStr",
            "detectionTimestamp",
            &value,
        ) {
            error!(job_id = id, "Failed to persist detection: {}", e);
        }
    }

    info!(
        job_id = ?job_id,
        impairments = detection.impairments.len(),
        "Document detection completed"
    );
    json!({
        "status": "SUCCESS",
        "message": "Detection completed",
        "analysisDetection": detection,
    })
}

/// Raw agent object (or the fallback) and its normalized form.
async fn detect_document(
    services: &Services,
    data: &ExtractedData,
    insurance_type: InsuranceType,
    language: Language,
) -> (Value, DetectionReport) {
    let fallback = || {
        (
            json!({"impairments": [], "narrative": ""}),
            DetectionReport::empty(),
        )
    };

    let mut agent = services.agent(
        prompts::detection_system(insurance_type, language),
        detection_tools(insurance_type, services),
    );
    let text = match agent.invoke(&pretty_compact(data)).await {
        Ok(text) => text,
        Err(e) => {
            error!("Detection agent failed: {:#}", e);
            return fallback();
        }
    };

    let Some(obj) = parser::extract_object(&text) else {
        warn!(raw = %parser::preview(&text), "Unparseable detection output");
        return fallback();
    };
    let raw = Value::Object(obj);
    match serde_json::from_value::<DetectionReport>(raw.clone()) {
        Ok(report) => (raw, report),
        Err(e) => {
            warn!("Detection output did not match the report shape: {}", e);
            fallback()
        }
    }
}

fn pretty_compact(data: &ExtractedData) -> String {
    serde_json::to_string(data).unwrap_or_else(|_| "{}".to_string())
}
