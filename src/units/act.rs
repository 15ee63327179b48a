//! Final triage: the action agent decides whether to reject the
//! application or ask for more documents, and the job completes.

use super::{error_response, object_key, pretty, str_at, Services};
use crate::agent::{prompts, Tool, ToolExecutor};
use crate::jobs::JobRecord;
use crate::models::{InsuranceType, JobStatus};
use serde_json::{json, Value};
use tracing::{error, info, warn};

/// `{document_identifier, agent_action_confirmation, message, actions}`.
pub async fn run(event: &Value, services: &Services) -> Value {
    let Some(document_id) = object_key(event).or_else(|| str_at(event, "/s3_object_key")) else {
        return error_response("Missing S3 object key in event");
    };
    let job_id = str_at(event, "/classification/jobId");
    let insurance_type = match str_at(event, "/classification/insuranceType") {
        Some(label) => InsuranceType::from_label(label),
        None => job_id
            .map(|id| services.insurance_type(id))
            .unwrap_or_default(),
    };
    let language = services.language(job_id);

    if let Some(id) = job_id {
        services
            .tracker
            .set_status(id, JobStatus::Acting, JobRecord::new());
    }

    let Some(document_type) = str_at(event, "/classification/classification") else {
        error!(document = document_id, "Missing document type in classification");
        return error_response("Missing or invalid document type in classification");
    };
    let data = match event.pointer("/extraction/data") {
        Some(data @ Value::Object(_)) => data.clone(),
        _ => {
            warn!(document = document_id, "No extracted data; triaging without it");
            json!({})
        }
    };

    let tools = ToolExecutor::new(vec![
        Tool::SendIneligibilityNotice,
        Tool::RequestSupportingDocuments,
    ])
    .with_outputs(services.blobs.clone());
    let mut agent = services.agent(prompts::action_system(insurance_type, language), tools);
    let message = prompts::action_message(document_id, document_type, &pretty(&data));

    let confirmation = match agent.invoke(&message).await {
        Ok(text) => text,
        Err(e) => {
            let message = format!("Action agent failed: {:#}", e);
            error!(document = document_id, "{}", message);
            if let Some(id) = job_id {
                services.tracker.fail(id, &message);
            }
            return error_response(message);
        }
    };

    let output = json!({
        "document_identifier": document_id,
        "agent_action_confirmation": confirmation,
        "message": "Agent triage process completed.",
        "actions": agent.tools().actions(),
    });

    if let Some(id) = job_id {
        match services
            .tracker
            .write_output(id, "agentActionOutputJsonStr", "actionTimestamp", &output)
        {
            Ok(()) => services
                .tracker
                .set_status(id, JobStatus::Complete, JobRecord::new()),
            Err(e) => error!(job_id = id, "Failed to persist action output: {}", e),
        }
    } else {
        warn!(document = document_id, "No job id; action output not persisted");
    }

    info!(
        document = document_id,
        actions = agent.tools().actions().len(),
        "Triage completed"
    );
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::ScriptedBackend;
    use crate::agent::tools::{FunctionCall, ToolCall};
    use crate::agent::ResponseMessage;
    use crate::store::BlobStore;
    use crate::units::testing::{scripted, seed_job, services, stored_json};
    use std::sync::Arc;
    use tokio_test::block_on;

    fn event() -> Value {
        json!({
            "detail": {"object": {"key": "uploads/job-1/app.pdf"}},
            "classification": {
                "jobId": "job-1",
                "classification": "LIFE_INSURANCE_APPLICATION",
                "insuranceType": "life"
            },
            "extraction": {"data": {"Application": [{"page_number": 1, "age": 17}]}}
        })
    }

    #[test]
    fn test_ineligible_application_completes_job() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            Ok(ResponseMessage {
                content: String::new(),
                tool_calls: Some(vec![ToolCall {
                    function: FunctionCall {
                        name: "send_ineligibility_notice".to_string(),
                        arguments: json!({
                            "document_identifier": "uploads/job-1/app.pdf",
                            "reason_for_ineligibility": "Applicant is under 18."
                        }),
                    },
                }]),
            }),
            Ok(ResponseMessage {
                content: "Ineligibility notice sent.".to_string(),
                tool_calls: None,
            }),
        ]));
        let services = services(backend.clone(), 1);
        seed_job(&services, "job-1", json!({"status": "SCORING"}));

        let out = block_on(run(&event(), &services));
        assert_eq!(out["document_identifier"], json!("uploads/job-1/app.pdf"));
        assert_eq!(out["agent_action_confirmation"], json!("Ineligibility notice sent."));
        assert_eq!(out["message"], json!("Agent triage process completed."));
        assert_eq!(out["actions"][0]["tool"], json!("send_ineligibility_notice"));

        let notice = services
            .blobs
            .get("agent_outputs/uploads_job-1_app.pdf_ineligible.txt")
            .unwrap();
        assert!(String::from_utf8(notice).unwrap().contains("Reason: Applicant is under 18."));

        assert_eq!(services.tracker.current_status("job-1"), Some(JobStatus::Complete));
        let stored = stored_json(&services, "job-1", "agentActionOutputJsonStr");
        assert_eq!(stored["agent_action_confirmation"], out["agent_action_confirmation"]);

        let prompt = &backend.requests()[0].messages[1].content;
        assert!(prompt.starts_with("Triage the following insurance application."));
        assert!(prompt.contains("Application Type: LIFE_INSURANCE_APPLICATION"));
    }

    #[test]
    fn test_agent_failure_fails_job() {
        let backend = Arc::new(ScriptedBackend::new(vec![Err("throttled".to_string())]));
        let services = services(backend, 1);
        seed_job(&services, "job-1", json!({"status": "SCORING"}));

        let out = block_on(run(&event(), &services));
        assert!(out["error"].as_str().unwrap().starts_with("Action agent failed"));
        assert_eq!(services.tracker.current_status("job-1"), Some(JobStatus::Failed));
    }

    #[test]
    fn test_missing_inputs() {
        let services = services(scripted(&[]), 1);
        assert_eq!(
            block_on(run(&json!({}), &services)),
            json!({"error": "Missing S3 object key in event"})
        );

        let mut event = event();
        event["classification"]
            .as_object_mut()
            .unwrap()
            .remove("classification");
        let out = block_on(run(&event, &services));
        assert!(out["error"].as_str().unwrap().contains("document type"));
    }

    #[test]
    fn test_missing_extraction_uses_empty_data() {
        let backend = scripted(&["Application is complete."]);
        let services = services(backend.clone(), 1);
        let out = block_on(run(
            &json!({
                "s3_object_key": "uploads/job-2/claim.pdf",
                "classification": {"classification": "ACORD_FORM"}
            }),
            &services,
        ));
        assert_eq!(out["actions"], json!([]));
        assert!(backend.requests()[0].messages[1].content.contains("Extracted Data: {}"));
    }
}
