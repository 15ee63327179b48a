//! Merge extraction batches and partition them for fan-out.

use super::{error_response, fields, job_id, str_at, Services};
use crate::chunking::{merge_chunks, partition};
use crate::store::{self, chunk_key, merged_key};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info};

const ANALYSIS_CHUNKS: &str = "analysis";

/// Reference to one stored chunk.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRef {
    pub chunk_id: usize,
    pub chunk_s3_key: String,
    pub document_types: Vec<String>,
}

/// `{jobId, totalChunks, chunks, chunkType}`.
pub fn run(event: &Value, services: &Services) -> Value {
    let Some(job_id) = job_id(event) else {
        return error_response("Missing jobId");
    };
    let chunk_type = str_at(event, "/chunkType").unwrap_or(ANALYSIS_CHUNKS);
    let refs = event
        .get("extractionResults")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let merged = merge_chunks(services.blobs.as_ref(), refs);

    if chunk_type == ANALYSIS_CHUNKS {
        record_merged(event, services, &job_id, &merged);
    }

    let chunks = partition(&merged, services.settings.max_chunk_bytes);
    let mut chunk_refs = Vec::with_capacity(chunks.len());
    for (i, chunk) in chunks.iter().enumerate() {
        let key = chunk_key(&job_id, chunk_type, i);
        if let Err(e) = store::put_json(services.blobs.as_ref(), &key, chunk) {
            error!(job_id = %job_id, key = %key, "Failed to store chunk: {}", e);
            return error_response(format!("Failed to store chunk {}: {}", i, e));
        }
        chunk_refs.push(ChunkRef {
            chunk_id: i,
            chunk_s3_key: key,
            document_types: chunk.keys().cloned().collect(),
        });
    }

    info!(
        job_id = %job_id,
        chunk_type,
        batches = refs.len(),
        chunks = chunk_refs.len(),
        "Partitioned extracted data"
    );
    json!({
        "jobId": job_id,
        "totalChunks": chunk_refs.len(),
        "chunks": chunk_refs,
        "chunkType": chunk_type,
    })
}

/// Store the merged document and point the job record at it. Best effort.
fn record_merged(event: &Value, services: &Services, job_id: &str, merged: &crate::models::ExtractedData) {
    let key = merged_key(job_id);
    if let Err(e) = store::put_json(services.blobs.as_ref(), &key, merged) {
        error!(job_id, "Failed to store merged extraction: {}", e);
        return;
    }

    let document_type = str_at(event, "/classification/classification").unwrap_or("Unknown");
    let update = fields(json!({
        "documentType": document_type,
        "extractedDataJsonStr": key,
        "extractionTimestamp": Utc::now().to_rfc3339(),
    }));
    if let Err(e) = services.tracker.set_fields(job_id, update) {
        error!(job_id, "Failed to record merged extraction: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::page_count;
    use crate::store::BlobStore;
    use crate::units::testing::{scripted, services};

    fn seeded() -> Services {
        let services = services(scripted(&[]), 1);
        store::put_json(
            services.blobs.as_ref(),
            "job-1/extracted/1-1.json",
            &json!({"Lab": [{"page_number": 1}]}),
        )
        .unwrap();
        store::put_json(
            services.blobs.as_ref(),
            "job-1/extracted/2-2.json",
            &json!({"Lab": [{"page_number": 2}], "APS": [{"page_number": 2}]}),
        )
        .unwrap();
        services
    }

    fn event(chunk_type: Option<&str>) -> Value {
        let mut event = json!({
            "classification": {"jobId": "job-1", "classification": "MEDICAL_REPORT"},
            "extractionResults": [
                {"pages": {"start": 1, "end": 1}, "chunkS3Key": "job-1/extracted/1-1.json"},
                {"pages": {"start": 2, "end": 2}, "chunkS3Key": "job-1/extracted/2-2.json"},
                {"error": "extraction failed"}
            ]
        });
        if let Some(chunk_type) = chunk_type {
            event["chunkType"] = json!(chunk_type);
        }
        event
    }

    #[test]
    fn test_analysis_chunks_record_merged_document() {
        let services = seeded();
        let out = run(&event(None), &services);

        assert_eq!(out["totalChunks"], json!(1));
        assert_eq!(out["chunkType"], json!("analysis"));
        assert_eq!(
            out["chunks"][0],
            json!({"chunkId": 0, "chunkS3Key": "job-1/analysis-chunks/chunk-0.json", "documentTypes": ["Lab", "APS"]})
        );

        let merged: crate::models::ExtractedData =
            store::get_json(services.blobs.as_ref(), "job-1/merged/merged.json").unwrap();
        assert_eq!(page_count(&merged), 3);
        assert_eq!(
            services.tracker.get_field("job-1", "extractedDataJsonStr", ""),
            "job-1/merged/merged.json"
        );
        assert_eq!(services.tracker.get_field("job-1", "documentType", ""), "MEDICAL_REPORT");
    }

    #[test]
    fn test_detection_chunks_leave_record_alone() {
        let services = seeded();
        let out = run(&event(Some("detection")), &services);
        assert_eq!(out["chunks"][0]["chunkS3Key"], json!("job-1/detection-chunks/chunk-0.json"));
        assert!(services.tracker.get_value("job-1", "documentType").is_none());
        assert!(services.blobs.get("job-1/merged/merged.json").is_err());
    }

    #[test]
    fn test_small_limit_splits_chunks() {
        let mut services = seeded();
        services.settings.max_chunk_bytes = 30;
        let out = run(&event(Some("detection")), &services);
        assert!(out["totalChunks"].as_u64().unwrap() >= 2);
    }

    #[test]
    fn test_missing_job_id() {
        let services = seeded();
        assert_eq!(run(&json!({}), &services), json!({"error": "Missing jobId"}));
    }
}
