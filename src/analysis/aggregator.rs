//! Fan-in aggregation of per-chunk results.
//!
//! Each chunk of a document is analyzed independently; this module folds
//! the per-chunk results back into one result per document. Errored chunks
//! are logged and dropped. When no chunk succeeded the caller gets an
//! all-failed marker instead of a merged result.

use crate::models::{AnalysisReport, DetectionReport, Impairment};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// Error text reported when every chunk failed.
pub const ALL_CHUNKS_FAILED: &str = "All chunks failed";

/// Confidence assumed when no chunk reported a numeric score.
pub const DEFAULT_CONFIDENCE: f64 = 0.75;

const NOT_APPLICABLE: &str = "N/A";

/// A per-chunk result shape that knows how to merge with its siblings.
pub trait ChunkSchema: DeserializeOwned + Serialize + Sized {
    /// Short label used in log lines.
    const NAME: &'static str;

    /// Merge valid chunk results, given in chunk order.
    fn merge(results: Vec<Self>) -> Self;
}

/// Outcome of aggregating a set of chunk results.
#[derive(Debug, Clone, PartialEq)]
pub enum Aggregate<S> {
    Merged(S),
    AllFailed { failed_chunks: usize },
}

impl<S: Serialize> Aggregate<S> {
    /// JSON form: the merged object, or `{error, failed_chunks}`.
    pub fn to_value(&self) -> Value {
        match self {
            Aggregate::Merged(merged) => serde_json::to_value(merged)
                .unwrap_or_else(|e| json!({ "error": format!("Failed to serialize result: {}", e) })),
            Aggregate::AllFailed { failed_chunks } => json!({
                "error": ALL_CHUNKS_FAILED,
                "failed_chunks": failed_chunks,
            }),
        }
    }
}

/// Split chunk results into usable and errored ones, logging the latter.
fn partition_results<S: ChunkSchema>(chunk_results: &[Value]) -> (Vec<S>, usize) {
    let mut valid = Vec::new();
    let mut failed = 0usize;

    for result in chunk_results {
        let chunk_id = result.get("chunkId").cloned().unwrap_or(Value::Null);
        let error = match result {
            Value::Object(obj) if obj.contains_key("error") => Some(
                obj.get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown error")
                    .to_string(),
            ),
            Value::Object(_) => match serde_json::from_value::<S>(result.clone()) {
                Ok(parsed) => {
                    valid.push(parsed);
                    None
                }
                Err(e) => Some(format!("Unreadable result: {}", e)),
            },
            _ => Some("Result is not an object".to_string()),
        };

        if let Some(message) = error {
            failed += 1;
            warn!(schema = S::NAME, chunk_id = %chunk_id, "Chunk failed: {}", message);
        }
    }

    if failed > 0 {
        warn!(
            schema = S::NAME,
            "{} of {} chunks had errors",
            failed,
            chunk_results.len()
        );
    }
    (valid, failed)
}

/// Aggregate `chunk_results` under schema `S`.
pub fn aggregate<S: ChunkSchema>(chunk_results: &[Value]) -> Aggregate<S> {
    info!(schema = S::NAME, "Aggregating {} chunk results", chunk_results.len());

    let (valid, _failed) = partition_results::<S>(chunk_results);
    if valid.is_empty() {
        return Aggregate::AllFailed {
            failed_chunks: chunk_results.len(),
        };
    }

    debug!(
        schema = S::NAME,
        "{} valid results out of {}",
        valid.len(),
        chunk_results.len()
    );
    Aggregate::Merged(S::merge(valid))
}

/// Join the non-empty, non-"N/A" values with blank lines, or "N/A".
fn join_sections<'a>(values: impl Iterator<Item = &'a str>) -> String {
    let parts: Vec<&str> = values
        .filter(|v| !v.is_empty() && *v != NOT_APPLICABLE)
        .collect();
    if parts.is_empty() {
        NOT_APPLICABLE.to_string()
    } else {
        parts.join("\n\n")
    }
}

fn join_non_empty<'a>(values: impl Iterator<Item = &'a str>) -> String {
    values
        .filter(|v| !v.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

impl ChunkSchema for AnalysisReport {
    const NAME: &'static str = "analysis";

    fn merge(results: Vec<Self>) -> Self {
        let overall_summary = results
            .iter()
            .map(|r| r.overall_summary.as_str())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
            .trim()
            .to_string();
        let medical_timeline = join_sections(results.iter().map(|r| r.medical_timeline.as_str()));
        let property_assessment =
            join_sections(results.iter().map(|r| r.property_assessment.as_str()));
        let final_recommendation =
            join_non_empty(results.iter().map(|r| r.final_recommendation.as_str()));

        let scores: Vec<f64> = results.iter().filter_map(|r| r.confidence_score).collect();
        let confidence_score = if scores.is_empty() {
            DEFAULT_CONFIDENCE
        } else {
            scores.iter().sum::<f64>() / scores.len() as f64
        };

        let mut merged = AnalysisReport {
            chunk_id: None,
            overall_summary,
            medical_timeline,
            property_assessment,
            final_recommendation,
            confidence_score: Some(confidence_score),
            ..Default::default()
        };

        let mut seen_missing = HashSet::new();
        for result in results {
            merged.identified_risks.extend(result.identified_risks);
            merged.discrepancies.extend(result.discrepancies);
            for item in result.missing_information {
                if !item.item_description.is_empty()
                    && seen_missing.insert(item.item_description.clone())
                {
                    merged.missing_information.push(item);
                }
            }
        }

        info!(
            risks = merged.identified_risks.len(),
            discrepancies = merged.discrepancies.len(),
            "Aggregated analysis"
        );
        merged
    }
}

/// Fold a later duplicate impairment into the first occurrence.
fn absorb_impairment(existing: &mut Impairment, later: Impairment) {
    let mut seen: HashSet<String> = HashSet::new();
    let mut evidence = Vec::new();
    for item in existing.evidence.drain(..).chain(later.evidence) {
        if seen.insert(item.clone()) {
            evidence.push(item);
        }
    }
    existing.evidence = evidence;

    for (key, value) in later.scoring_factors {
        if let Some(previous) = existing.scoring_factors.get(&key) {
            if *previous != value {
                warn!(
                    impairment_id = %existing.impairment_id,
                    factor = %key,
                    old = %previous,
                    new = %value,
                    "Scoring factor overwritten by a later chunk"
                );
            }
        }
        existing.scoring_factors.insert(key, value);
    }
}

impl ChunkSchema for DetectionReport {
    const NAME: &'static str = "detection";

    fn merge(results: Vec<Self>) -> Self {
        let narrative = join_non_empty(results.iter().map(|r| r.narrative.as_str()));

        let mut impairments: Vec<Impairment> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();
        for result in results {
            for imp in result.impairments {
                match positions.get(&imp.impairment_id) {
                    Some(&idx) => absorb_impairment(&mut impairments[idx], imp),
                    None => {
                        positions.insert(imp.impairment_id.clone(), impairments.len());
                        impairments.push(imp);
                    }
                }
            }
        }

        info!(impairments = impairments.len(), "Aggregated detection");
        DetectionReport {
            chunk_id: None,
            impairments,
            narrative,
            trace_key: None,
        }
    }
}
