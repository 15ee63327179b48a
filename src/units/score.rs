//! Numeric scoring of detected impairments.

use super::{event_keys, job_id, pretty, str_at, trace_stamp, Services};
use crate::agent::{prompts, Tool, ToolExecutor};
use crate::jobs::JobRecord;
use crate::models::{InsuranceType, JobStatus, ScoringReport};
use crate::parser;
use crate::store::analysis_trace_key;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

const MAX_IMPAIRMENTS: usize = 20;
const MAX_EVIDENCE: usize = 10;
const MAX_EVIDENCE_CHARS: usize = 500;
const MAX_FACTORS: usize = 30;
const MAX_FACTOR_CHARS: usize = 400;

/// Score the job's impairments. Never fails: a model or parse failure
/// yields a zero score.
pub async fn run(event: &Value, services: &Services) -> Value {
    let job_id = job_id(event);
    if let Some(id) = &job_id {
        services
            .tracker
            .set_status(id, JobStatus::Scoring, JobRecord::new());
    }

    let payload = impairments_payload(event);
    let insurance_type = match str_at(event, "/classification/insuranceType") {
        Some(label) => InsuranceType::from_label(label),
        None => job_id
            .as_deref()
            .map(|id| services.insurance_type(id))
            .unwrap_or_default(),
    };
    debug!(job_id = ?job_id, impairments = payload.len(), "Scoring impairments");

    let (agent_raw, mut scoring) = score_impairments(services, &payload, insurance_type).await;

    if let Some(id) = &job_id {
        let key = analysis_trace_key(id, &format!("scoring-{}", trace_stamp()));
        let trace = json!({
            "eventKeys": event_keys(event),
            "payloadCount": payload.len(),
            "agentRaw": agent_raw,
        });
        scoring.trace_key = services.write_trace(&key, &trace);

        let value = serde_json::to_value(&scoring).unwrap_or(Value::Null);
        if let Err(e) = services.tracker.write_output(
            id,
            "analysisScoringJsonStr",
            "scoringTimestamp",
            &value,
        ) {
            error!(job_id = %id, "Failed to persist scoring: {}", e);
        }
    }

    info!(
        job_id = ?job_id,
        total_score = scoring.total_score,
        "Scoring completed"
    );
    json!({
        "status": "SUCCESS",
        "message": "Scoring completed",
        "scoring": scoring,
    })
}

fn scoring_tools(insurance_type: InsuranceType, services: &Services) -> ToolExecutor {
    match insurance_type {
        InsuranceType::Life => ToolExecutor::new(vec![Tool::KbSearch, Tool::Calculator])
            .with_knowledge(services.knowledge.clone()),
        InsuranceType::PropertyCasualty => ToolExecutor::new(vec![Tool::Calculator]),
    }
}

async fn score_impairments(
    services: &Services,
    payload: &[Value],
    insurance_type: InsuranceType,
) -> (Value, ScoringReport) {
    let fallback = || {
        (
            json!({"total_score": 0, "impairment_scores": []}),
            ScoringReport::empty(),
        )
    };

    let message = format!(
        "{}{}",
        prompts::SCORING_MESSAGE_PREFIX,
        pretty(&truncate_payload(payload))
    );
    let mut agent = services.agent(
        prompts::scoring_system(insurance_type),
        scoring_tools(insurance_type, services),
    );
    let text = match agent.invoke(&message).await {
        Ok(text) => text,
        Err(e) => {
            error!("Scoring agent failed: {:#}", e);
            return fallback();
        }
    };

    let Some(obj) = parser::extract_object(&text) else {
        warn!(raw = %parser::preview(&text), "Unparseable scoring output");
        return fallback();
    };
    let raw = Value::Object(obj);
    match serde_json::from_value::<ScoringReport>(raw.clone()) {
        Ok(report) => (raw, report),
        Err(e) => {
            warn!("Scoring output did not match the report shape: {}", e);
            fallback()
        }
    }
}

/// Impairments to score, from detection or the legacy analysis risks.
pub fn impairments_payload(event: &Value) -> Vec<Value> {
    let mut detection = event.get("analysisDetection");
    if let Some(inner) = detection.and_then(|d| d.get("analysisDetection")) {
        detection = Some(inner);
    }
    if let Some(impairments) = detection
        .and_then(|d| d.get("impairments"))
        .and_then(Value::as_array)
        .filter(|list| !list.is_empty())
    {
        return impairments.clone();
    }

    event
        .pointer("/analysis/analysis_data/identified_risks")
        .and_then(Value::as_array)
        .map(|risks| {
            risks
                .iter()
                .filter_map(|risk| {
                    let description = risk
                        .get("risk_description")
                        .or_else(|| risk.get("description"))
                        .and_then(Value::as_str)?
                        .trim();
                    (!description.is_empty()).then(|| {
                        json!({
                            "impairment_id": description,
                            "scoring_factors": {},
                            "evidence": [],
                        })
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Bound the payload so oversized detections still fit the prompt.
fn truncate_payload(payload: &[Value]) -> Vec<Value> {
    payload
        .iter()
        .take(MAX_IMPAIRMENTS)
        .map(|item| {
            let Value::Object(obj) = item else {
                return item.clone();
            };
            let mut obj = obj.clone();
            if let Some(Value::Array(evidence)) = obj.get("evidence") {
                let trimmed: Vec<Value> = evidence
                    .iter()
                    .take(MAX_EVIDENCE)
                    .filter_map(|e| match e {
                        Value::String(s) => Some(s.clone()),
                        Value::Object(o) => o.get("text").map(|t| match t {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        }),
                        _ => None,
                    })
                    .map(|s| Value::String(truncate_chars(&s, MAX_EVIDENCE_CHARS)))
                    .collect();
                obj.insert("evidence".to_string(), Value::Array(trimmed));
            }
            if let Some(Value::Object(factors)) = obj.get("scoring_factors") {
                let limited: Map<String, Value> = factors
                    .iter()
                    .take(MAX_FACTORS)
                    .map(|(k, v)| {
                        let v = match v {
                            Value::String(s) => Value::String(truncate_chars(s, MAX_FACTOR_CHARS)),
                            other => other.clone(),
                        };
                        (k.clone(), v)
                    })
                    .collect();
                obj.insert("scoring_factors".to_string(), Value::Object(limited));
            }
            Value::Object(obj)
        })
        .collect()
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
