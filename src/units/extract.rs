//! Page-image data extraction.

use super::batch::{batch_ranges, PageRange};
use super::{error_response, object_key, pretty, str_at, Services};
use crate::agent::prompts;
use crate::chunking::merge::extend_pages;
use crate::jobs::JobRecord;
use crate::models::{ExtractedData, InsuranceType, JobStatus, Language};
use crate::parser;
use crate::store::{self, extracted_key};
use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

const DEFAULT_DOCUMENT_TYPE: &str = "OTHER";

/// Extract the requested page range (or the whole document) into one blob.
///
/// Returns `{pages: {start, end}, chunkS3Key}`. Any failure marks the job
/// FAILED and returns `{error}`.
pub async fn run(event: &Value, services: &Services) -> Value {
    let Some(job_id) = str_at(event, "/classification/jobId") else {
        return error_response("Missing classification.jobId");
    };
    let document_type = str_at(event, "/classification/classification").unwrap_or(DEFAULT_DOCUMENT_TYPE);
    let insurance_type = str_at(event, "/classification/insuranceType")
        .map(InsuranceType::from_label)
        .unwrap_or_else(|| services.insurance_type(job_id));
    let language = services.language(Some(job_id));

    services
        .tracker
        .set_status(job_id, JobStatus::Extracting, JobRecord::new());

    let job = ExtractionJob {
        job_id,
        document_type,
        insurance_type,
        language,
    };
    match job.extract(event, services).await {
        Ok(output) => output,
        Err(e) => {
            let message = format!("Extraction failed: {:#}", e);
            error!(job_id, "{}", message);
            services.tracker.fail(job_id, &message);
            error_response(message)
        }
    }
}

struct ExtractionJob<'a> {
    job_id: &'a str,
    document_type: &'a str,
    insurance_type: InsuranceType,
    language: Language,
}

impl ExtractionJob<'_> {
    async fn extract(&self, event: &Value, services: &Services) -> Result<Value> {
        let key = match object_key(event) {
            Some(key) => key.to_string(),
            None => services
                .tracker
                .get_value(self.job_id, "s3Key")
                .and_then(|v| v.as_str().map(str::to_string))
                .context("Missing document key")?,
        };

        let total = services
            .pages
            .page_count(&key)
            .with_context(|| format!("Could not read page count for {}", key))?;

        let (range, batches) = match event.get("pages") {
            Some(pages) => {
                let start = pages.get("start").and_then(Value::as_u64).unwrap_or(1) as usize;
                let end = pages
                    .get("end")
                    .and_then(Value::as_u64)
                    .map(|e| e as usize)
                    .unwrap_or(start);
                let range = PageRange { start, end };
                (range, vec![range])
            }
            None => (
                PageRange { start: 1, end: total },
                batch_ranges(total, services.settings.batch_size),
            ),
        };
        if range.start == 0 || range.end < range.start || range.end > total {
            bail!(
                "Invalid page range {}-{} for a {}-page document",
                range.start,
                range.end,
                total
            );
        }

        let mut agent = services.vision_agent(prompts::extraction_system(
            self.insurance_type,
            self.language,
        ));
        let mut all_data = ExtractedData::new();

        for batch in batches {
            let pages = batch.pages();
            let images = pages
                .iter()
                .map(|page| services.pages.render(&key, *page).map(|image| image.bytes))
                .collect::<Result<Vec<_>>>()
                .with_context(|| format!("Page rendering failed for pages {}-{}", batch.start, batch.end))?;

            let message =
                prompts::extraction_message(self.document_type, &pages, &pretty(&all_data));
            let text = agent
                .invoke_with_images(&message, &images)
                .await
                .with_context(|| format!("Model call failed for pages {}-{}", batch.start, batch.end))?;

            match parser::extract_object(&text) {
                Some(batch_data) => {
                    debug!(
                        job_id = self.job_id,
                        start = batch.start,
                        types = batch_data.len(),
                        "Extracted batch"
                    );
                    extend_pages(&mut all_data, batch_data);
                }
                None => warn!(
                    job_id = self.job_id,
                    start = batch.start,
                    end = batch.end,
                    raw = %parser::preview(&text),
                    "No JSON object in extraction output"
                ),
            }
        }

        let chunk_key = extracted_key(self.job_id, range.start, range.end);
        store::put_json(services.blobs.as_ref(), &chunk_key, &all_data)
            .with_context(|| format!("Failed to store {}", chunk_key))?;

        info!(
            job_id = self.job_id,
            start = range.start,
            end = range.end,
            key = %chunk_key,
            "Stored extraction"
        );
        Ok(json!({ "pages": range, "chunkS3Key": chunk_key }))
    }
}
