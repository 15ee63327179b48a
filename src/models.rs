//! Data models for the triage pipeline.
//!
//! This module contains the job lifecycle enums and the structured shapes
//! that model output is normalized into: per-chunk analysis and detection
//! reports, and the scoring report. Model output is untrusted, so every
//! field deserializes leniently: wrong types degrade to defaults and
//! list items that are not objects are dropped instead of failing the whole
//! object.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Extracted document data: sub-document-type label to an ordered list of
/// page objects. Key order is insertion order.
pub type ExtractedData = Map<String, Value>;

/// Count the page objects across all sub-document types.
pub fn page_count(data: &ExtractedData) -> usize {
    data.values()
        .map(|pages| pages.as_array().map(Vec::len).unwrap_or(0))
        .sum()
}

/// Lifecycle stage of a job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Created,
    Classifying,
    Extracting,
    Detecting,
    Analyzing,
    Scoring,
    Acting,
    Complete,
    Failed,
}

impl JobStatus {
    /// Wire representation stored in the job record.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "CREATED",
            JobStatus::Classifying => "CLASSIFYING",
            JobStatus::Extracting => "EXTRACTING",
            JobStatus::Detecting => "DETECTING",
            JobStatus::Analyzing => "ANALYZING",
            JobStatus::Scoring => "SCORING",
            JobStatus::Acting => "ACTING",
            JobStatus::Complete => "COMPLETE",
            JobStatus::Failed => "FAILED",
        }
    }

    /// Milestone field written alongside this status.
    pub fn timestamp_field(&self) -> &'static str {
        match self {
            JobStatus::Created => "uploadTimestamp",
            JobStatus::Classifying => "classifyTimestamp",
            JobStatus::Extracting => "extractionStartTimestamp",
            JobStatus::Detecting => "detectionStartTimestamp",
            JobStatus::Analyzing => "analysisStartTimestamp",
            JobStatus::Scoring => "scoringStartTimestamp",
            JobStatus::Acting => "actionStartTimestamp",
            JobStatus::Complete => "completeTimestamp",
            JobStatus::Failed => "failedTimestamp",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Failed)
    }

    // DETECTING and ANALYZING share a rank: either path may run first.
    fn rank(&self) -> u8 {
        match self {
            JobStatus::Created => 0,
            JobStatus::Classifying => 1,
            JobStatus::Extracting => 2,
            JobStatus::Detecting | JobStatus::Analyzing => 3,
            JobStatus::Scoring => 4,
            JobStatus::Acting => 5,
            JobStatus::Complete => 6,
            JobStatus::Failed => 7,
        }
    }

    /// Whether `next` is a legal successor in the (non-strict) progression.
    ///
    /// Re-entering the same status is always legal so retried units stay
    /// idempotent.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        if *self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        next == JobStatus::Failed || next.rank() >= self.rank()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(JobStatus::Created),
            "CLASSIFYING" => Ok(JobStatus::Classifying),
            "EXTRACTING" => Ok(JobStatus::Extracting),
            "DETECTING" => Ok(JobStatus::Detecting),
            "ANALYZING" => Ok(JobStatus::Analyzing),
            "SCORING" => Ok(JobStatus::Scoring),
            "ACTING" => Ok(JobStatus::Acting),
            "COMPLETE" => Ok(JobStatus::Complete),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(format!("Unknown job status: {}", other)),
        }
    }
}

/// Line of business the document is underwritten for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsuranceType {
    Life,
    #[default]
    PropertyCasualty,
}

impl InsuranceType {
    /// Interpret a stored label. Anything other than exactly `life` is P&C.
    pub fn from_label(label: &str) -> Self {
        if label == "life" {
            InsuranceType::Life
        } else {
            InsuranceType::PropertyCasualty
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InsuranceType::Life => "life",
            InsuranceType::PropertyCasualty => "property_casualty",
        }
    }
}

impl fmt::Display for InsuranceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supported response locales.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Language {
    #[default]
    EnUs,
    ZhCn,
    JaJp,
    EsEs,
    FrFr,
    FrCa,
    DeDe,
    ItIt,
}

impl Language {
    /// Parse a locale code, falling back to en-US for anything unsupported.
    pub fn from_code(code: &str) -> Self {
        match code.trim() {
            "zh-CN" => Language::ZhCn,
            "ja-JP" => Language::JaJp,
            "es-ES" => Language::EsEs,
            "fr-FR" => Language::FrFr,
            "fr-CA" => Language::FrCa,
            "de-DE" => Language::DeDe,
            "it-IT" => Language::ItIt,
            _ => Language::EnUs,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Language::EnUs => "en-US",
            Language::ZhCn => "zh-CN",
            Language::JaJp => "ja-JP",
            Language::EsEs => "es-ES",
            Language::FrFr => "fr-FR",
            Language::FrCa => "fr-CA",
            Language::DeDe => "de-DE",
            Language::ItIt => "it-IT",
        }
    }

    /// Human name used in prompt instructions.
    pub fn display_name(&self) -> &'static str {
        match self {
            Language::EnUs => "English",
            Language::ZhCn => "Simplified Chinese (简体中文)",
            Language::JaJp => "Japanese (日本語)",
            Language::EsEs => "Spanish (Español)",
            Language::FrFr => "French (Français)",
            Language::FrCa => "Canadian French (Français canadien)",
            Language::DeDe => "German (Deutsch)",
            Language::ItIt => "Italian (Italiano)",
        }
    }
}

/// A risk or discrepancy reported by the analysis agent, kept with the
/// keys the model used (`risk_description`, `severity`, ...).
pub type ReportItem = Map<String, Value>;

/// Information the underwriter still needs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MissingItem {
    #[serde(default, deserialize_with = "lenient::string")]
    pub item_description: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub notes: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Analysis of one chunk (or the aggregate of several).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    #[serde(
        rename = "chunkId",
        default,
        deserialize_with = "lenient::opt_u64",
        skip_serializing_if = "Option::is_none"
    )]
    pub chunk_id: Option<u64>,
    #[serde(default, deserialize_with = "lenient::string")]
    pub overall_summary: String,
    #[serde(default, deserialize_with = "lenient::vec")]
    pub identified_risks: Vec<ReportItem>,
    #[serde(default, deserialize_with = "lenient::vec")]
    pub discrepancies: Vec<ReportItem>,
    #[serde(default, deserialize_with = "lenient::string")]
    pub medical_timeline: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub property_assessment: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub final_recommendation: String,
    #[serde(default, deserialize_with = "lenient::vec")]
    pub missing_information: Vec<MissingItem>,
    #[serde(
        default,
        deserialize_with = "lenient::opt_f64",
        skip_serializing_if = "Option::is_none"
    )]
    pub confidence_score: Option<f64>,
}

/// A detected impairment with its scoring inputs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Impairment {
    #[serde(default, deserialize_with = "lenient::string")]
    pub impairment_id: String,
    #[serde(default, deserialize_with = "lenient::map")]
    pub scoring_factors: Map<String, Value>,
    #[serde(default, deserialize_with = "lenient::strings")]
    pub evidence: Vec<String>,
    #[serde(
        default,
        deserialize_with = "lenient::opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub knowledgebase_location: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient::opt_values",
        skip_serializing_if = "Option::is_none"
    )]
    pub discrepancies: Option<Vec<Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Impairment detection for one chunk (or the aggregate of several).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionReport {
    #[serde(
        rename = "chunkId",
        default,
        deserialize_with = "lenient::opt_u64",
        skip_serializing_if = "Option::is_none"
    )]
    pub chunk_id: Option<u64>,
    #[serde(default, deserialize_with = "lenient::vec")]
    pub impairments: Vec<Impairment>,
    #[serde(default, deserialize_with = "lenient::string")]
    pub narrative: String,
    #[serde(
        rename = "traceS3Key",
        default,
        deserialize_with = "lenient::opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub trace_key: Option<String>,
}

impl DetectionReport {
    /// Fallback when detection produced nothing usable.
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Score contribution of one impairment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImpairmentScore {
    #[serde(default, deserialize_with = "lenient::string")]
    pub impairment_id: String,
    #[serde(default, deserialize_with = "lenient::number")]
    pub sub_total: f64,
    #[serde(default, deserialize_with = "lenient::string")]
    pub reason: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Numeric risk score over all detected impairments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoringReport {
    #[serde(default, deserialize_with = "lenient::number")]
    pub total_score: f64,
    #[serde(default, deserialize_with = "lenient::vec")]
    pub impairment_scores: Vec<ImpairmentScore>,
    #[serde(
        rename = "traceS3Key",
        default,
        deserialize_with = "lenient::opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub trace_key: Option<String>,
}

impl ScoringReport {
    /// Fallback when scoring produced nothing usable.
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Field deserializers that never reject model output on type mismatches.
mod lenient {
    use serde::de::DeserializeOwned;
    use serde::{Deserialize, Deserializer};
    use serde_json::{Map, Value};
    use tracing::warn;

    pub fn string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::String(s) => s,
            Value::Null => String::new(),
            other => other.to_string(),
        })
    }

    pub fn opt_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::String(s) => Some(s),
            Value::Null => None,
            other => Some(other.to_string()),
        })
    }

    fn text_of(value: Value) -> String {
        match value {
            Value::String(s) => s,
            Value::Object(ref obj) => match obj.get("text").and_then(Value::as_str) {
                Some(text) => text.to_string(),
                None => value.to_string(),
            },
            other => other.to_string(),
        }
    }

    pub fn strings<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Array(items) => items.into_iter().map(text_of).collect(),
            Value::Null => Vec::new(),
            single => vec![text_of(single)],
        })
    }

    pub fn vec<'de, D, T>(d: D) -> Result<Vec<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: DeserializeOwned,
    {
        let Value::Array(items) = Value::deserialize(d)? else {
            return Ok(Vec::new());
        };
        let total = items.len();
        let parsed: Vec<T> = items
            .into_iter()
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect();
        if parsed.len() < total {
            warn!(
                "Dropped {} of {} list items that are not objects",
                total - parsed.len(),
                total
            );
        }
        Ok(parsed)
    }

    /// A list of arbitrary values; a lone value becomes a one-item list.
    pub fn opt_values<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<Value>>, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Array(items) => Some(items),
            Value::Null => None,
            single => Some(vec![single]),
        })
    }

    pub fn map<'de, D: Deserializer<'de>>(d: D) -> Result<Map<String, Value>, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Object(map) => map,
            _ => Map::new(),
        })
    }

    pub fn opt_f64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
        Ok(Value::deserialize(d)?.as_f64())
    }

    pub fn opt_u64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
        Ok(Value::deserialize(d)?.as_u64())
    }

    pub fn number<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Number(n) => n.as_f64().unwrap_or(0.0),
            Value::String(s) => s.trim().parse().unwrap_or(0.0),
            _ => 0.0,
        })
    }
}
