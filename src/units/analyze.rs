//! Per-chunk underwriting analysis.

use super::{error_response, pretty, str_at, Services};
use crate::agent::{prompts, ToolExecutor};
use crate::models::{AnalysisReport, ExtractedData, Language};
use crate::parser;
use crate::store;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

/// One fan-out chunk as addressed by its event.
pub(super) struct ChunkTask {
    pub job_id: Option<String>,
    pub chunk_id: u64,
    pub total_chunks: u64,
    pub data: ExtractedData,
    pub language: Language,
}

impl ChunkTask {
    /// Resolve the event and fetch the chunk, or the `{error}` to return.
    pub fn load(event: &Value, services: &Services) -> Result<Self, Value> {
        let Some(chunk_key) = str_at(event, "/chunkS3Key") else {
            return Err(error_response("Missing chunkS3Key"));
        };
        let job_id = str_at(event, "/jobId").map(str::to_string);
        let chunk_id = event.get("chunkId").and_then(Value::as_u64).unwrap_or(0);
        let total_chunks = event.get("totalChunks").and_then(Value::as_u64).unwrap_or(1);
        let language = services.language(job_id.as_deref());

        let data: ExtractedData = store::get_json(services.blobs.as_ref(), chunk_key).map_err(|e| {
            error!(chunk_id, key = chunk_key, "Failed to fetch chunk: {}", e);
            error_response(format!("Failed to fetch chunk: {}", e))
        })?;

        Ok(Self {
            job_id,
            chunk_id,
            total_chunks,
            data,
            language,
        })
    }

    pub fn note(&self) -> Option<String> {
        prompts::chunk_note(self.chunk_id, self.total_chunks)
    }

    /// `{error, chunkId}` with an optional raw-text preview.
    pub fn failure(&self, message: String, raw_text: Option<&str>) -> Value {
        let mut out = json!({ "error": message, "chunkId": self.chunk_id });
        if let Some(raw) = raw_text {
            out["raw_text"] = json!(parser::preview(raw));
        }
        out
    }
}

/// Analyze one chunk; the report carries `chunkId`.
pub async fn run(event: &Value, services: &Services) -> Value {
    let task = match ChunkTask::load(event, services) {
        Ok(task) => task,
        Err(response) => return response,
    };
    debug!(
        job_id = ?task.job_id,
        chunk_id = task.chunk_id,
        total_chunks = task.total_chunks,
        "Analyzing chunk"
    );

    let message = prompts::analysis_message(&pretty(&task.data), task.note(), task.language);
    let mut agent = services.agent(prompts::ANALYSIS_SYSTEM.to_string(), ToolExecutor::none());
    let text = match agent.invoke(&message).await {
        Ok(text) => text,
        Err(e) => {
            error!(chunk_id = task.chunk_id, "Analysis call failed: {:#}", e);
            return task.failure(format!("Model call failed: {:#}", e), None);
        }
    };

    if text.trim().is_empty() {
        return task.failure("Empty response from model".to_string(), None);
    }

    let Some(obj) = parser::extract_object(&text) else {
        warn!(chunk_id = task.chunk_id, "Unparseable analysis output");
        return task.failure("Failed to parse response".to_string(), Some(&text));
    };
    let mut report: AnalysisReport = match serde_json::from_value(Value::Object(obj)) {
        Ok(report) => report,
        Err(e) => {
            return task.failure(format!("Failed to parse response: {}", e), Some(&text));
        }
    };
    report.chunk_id = Some(task.chunk_id);

    info!(
        chunk_id = task.chunk_id,
        risks = report.identified_risks.len(),
        "Analyzed chunk"
    );
    serde_json::to_value(&report)
        .unwrap_or_else(|e| task.failure(format!("Failed to serialize report: {}", e), None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::testing::{scripted, seed_job, services};
    use tokio_test::block_on;

    fn seeded(texts: &[&str]) -> (Services, std::sync::Arc<crate::agent::testing::ScriptedBackend>) {
        let backend = scripted(texts);
        let services = services(backend.clone(), 1);
        store::put_json(
            services.blobs.as_ref(),
            "job-1/analysis-chunks/chunk-1.json",
            &json!({"Lab": [{"page_number": 4, "glucose": "180 mg/dL"}]}),
        )
        .unwrap();
        seed_job(&services, "job-1", json!({"userLanguage": "es-ES"}));
        (services, backend)
    }

    fn event() -> Value {
        json!({
            "jobId": "job-1",
            "chunkId": 1,
            "chunkS3Key": "job-1/analysis-chunks/chunk-1.json",
            "totalChunks": 3
        })
    }

    #[test]
    fn test_analysis_report_with_chunk_id() {
        let (services, backend) = seeded(&[r#"Here you go:
```json
{"overall_summary": "Elevated glucose.", "identified_risks": [{"risk_description": "Hyperglycemia", "severity": "High", "page_references": ["4"]}], "confidence_score": 0.8}
```"#]);

        let out = block_on(run(&event(), &services));
        assert_eq!(out["chunkId"], json!(1));
        assert_eq!(out["overall_summary"], json!("Elevated glucose."));
        assert_eq!(out["identified_risks"][0]["risk_description"], json!("Hyperglycemia"));
        assert_eq!(out["confidence_score"], json!(0.8));

        let prompt = &backend.requests()[0].messages[1].content;
        assert!(prompt.contains("This is chunk 2 of 3."));
        assert!(prompt.contains("180 mg/dL"));
        assert!(prompt.contains("Respond in Spanish"));
    }

    #[test]
    fn test_unparseable_output_keeps_preview() {
        let long = "x".repeat(800);
        let (services, _) = seeded(&[long.as_str()]);
        let out = block_on(run(&event(), &services));
        assert_eq!(out["error"], json!("Failed to parse response"));
        assert_eq!(out["chunkId"], json!(1));
        assert_eq!(out["raw_text"].as_str().unwrap().len(), 500);
    }

    #[test]
    fn test_empty_output() {
        let (services, _) = seeded(&["   "]);
        let out = block_on(run(&event(), &services));
        assert_eq!(out, json!({"error": "Empty response from model", "chunkId": 1}));
    }

    #[test]
    fn test_missing_and_unreadable_chunks() {
        let (services, _) = seeded(&[]);
        assert_eq!(
            block_on(run(&json!({"chunkId": 0}), &services)),
            json!({"error": "Missing chunkS3Key"})
        );

        let out = block_on(run(&json!({"chunkS3Key": "job-1/analysis-chunks/chunk-9.json"}), &services));
        assert!(out["error"].as_str().unwrap().starts_with("Failed to fetch chunk: "));
    }
}
