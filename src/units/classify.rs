//! First-page document classification.

use super::{job_id, job_id_from_key, object_key, Services};
use crate::agent::prompts;
use crate::models::{InsuranceType, JobStatus};
use crate::jobs::JobRecord;
use crate::parser;
use serde_json::{json, Value};
use tracing::{error, info, warn};

pub const ERROR_NO_IMAGE: &str = "ERROR_NO_IMAGE";
pub const ERROR_MODEL_API: &str = "ERROR_MODEL_API";
pub const ERROR_PARSE: &str = "ERROR_PARSE";
pub const ERROR_NO_DOCUMENT: &str = "ERROR_NO_DOCUMENT";

const FALLBACK_TYPE: &str = "OTHER";
const CLASSIFY_MESSAGE: &str = "Classify this document from its first page.";

/// `{classification, jobId, insuranceType}`; failures become `ERROR_*` labels.
pub async fn run(event: &Value, services: &Services) -> Value {
    let key = object_key(event);
    let job_id = key
        .and_then(job_id_from_key)
        .map(str::to_string)
        .or_else(|| job_id(event));

    let insurance_type = match &job_id {
        Some(id) => services.insurance_type(id),
        None => {
            warn!(key = ?key, "Could not resolve a job id; status updates skipped");
            InsuranceType::default()
        }
    };

    if let Some(id) = &job_id {
        services
            .tracker
            .set_status(id, JobStatus::Classifying, JobRecord::new());
    }

    let classification = match key {
        Some(key) => classify_document(services, key, insurance_type).await,
        None => ERROR_NO_DOCUMENT.to_string(),
    };
    info!(job_id = ?job_id, classification = %classification, "Classified document");

    json!({
        "classification": classification,
        "jobId": job_id,
        "insuranceType": insurance_type,
    })
}

async fn classify_document(services: &Services, key: &str, insurance_type: InsuranceType) -> String {
    let image = match services.pages.render(key, 1) {
        Ok(image) => image,
        Err(e) => {
            error!(key, "Failed to render first page: {}", e);
            return ERROR_NO_IMAGE.to_string();
        }
    };

    let mut agent = services.vision_agent(prompts::classification_system(insurance_type));
    let text = match agent.invoke_with_images(CLASSIFY_MESSAGE, &[image.bytes]).await {
        Ok(text) => text,
        Err(e) => {
            error!(key, "Classification call failed: {}", e);
            return ERROR_MODEL_API.to_string();
        }
    };

    match parser::extract_object(&text) {
        Some(obj) => obj
            .get("document_type")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(FALLBACK_TYPE)
            .to_string(),
        None => {
            warn!(key, raw = %parser::preview(&text), "Unparseable classification output");
            ERROR_PARSE.to_string()
        }
    }
}
