//! Fan-in of per-chunk analysis and detection results.

use super::{error_response, job_id, Services};
use crate::analysis::{aggregate, Aggregate, ChunkSchema};
use crate::jobs::JobRecord;
use crate::models::{AnalysisReport, DetectionReport, JobStatus};
use crate::store::{analysis_trace_key, detection_trace_key};
use serde_json::{json, Value};
use tracing::{error, info, warn};

/// Where one kind of aggregate is traced and persisted.
struct Target {
    status: JobStatus,
    trace_key: fn(&str, &str) -> String,
    trace_name: &'static str,
    field: &'static str,
    timestamp_field: &'static str,
    output_key: &'static str,
    message: &'static str,
}

const ANALYSIS: Target = Target {
    status: JobStatus::Analyzing,
    trace_key: analysis_trace_key,
    trace_name: "aggregated-analysis",
    field: "analysisOutputJsonStr",
    timestamp_field: "analysisTimestamp",
    output_key: "analysisOutput",
    message: "Analysis aggregated successfully",
};

const DETECTION: Target = Target {
    status: JobStatus::Detecting,
    trace_key: detection_trace_key,
    trace_name: "aggregated-detection",
    field: "analysisDetectionJsonStr",
    timestamp_field: "detectionTimestamp",
    output_key: "analysisDetection",
    message: "Detection aggregated successfully",
};

/// Merge analysis chunk results and persist the document analysis.
pub fn run_analysis(event: &Value, services: &Services) -> Value {
    run_target::<AnalysisReport>(event, services, &ANALYSIS)
}

/// Merge detection chunk results and persist the document detection.
pub fn run_detection(event: &Value, services: &Services) -> Value {
    run_target::<DetectionReport>(event, services, &DETECTION)
}

fn run_target<S: ChunkSchema>(event: &Value, services: &Services, target: &Target) -> Value {
    let Some(job_id) = job_id(event) else {
        return error_response("Missing jobId");
    };
    let results = match event.get("chunkResults").and_then(Value::as_array) {
        Some(results) if !results.is_empty() => results,
        _ => return error_response("No chunk results to aggregate"),
    };

    services
        .tracker
        .set_status(&job_id, target.status, JobRecord::new());

    let aggregated = aggregate::<S>(results);
    let output = aggregated.to_value();
    if let Aggregate::AllFailed { .. } = aggregated {
        warn!(job_id = %job_id, schema = S::NAME, "Every chunk failed; nothing persisted");
        return output;
    }
    if output.get("error").is_some() {
        return output;
    }

    let trace = json!({
        "jobId": job_id,
        "totalChunks": results.len(),
        "output": output,
    });
    services.write_trace(&(target.trace_key)(&job_id, target.trace_name), &trace);

    if let Err(e) = services
        .tracker
        .write_output(&job_id, target.field, target.timestamp_field, &output)
    {
        error!(job_id = %job_id, field = target.field, "Failed to persist aggregate: {}", e);
        return error_response(format!("Failed to persist: {}", e));
    }

    info!(
        job_id = %job_id,
        schema = S::NAME,
        chunks = results.len(),
        "Persisted aggregate"
    );
    let mut response = json!({ "status": "success", "message": target.message });
    response[target.output_key] = output;
    response
}
