//! Tools the reasoning agent may call.
//!
//! Each agent gets its own [`ToolExecutor`] holding only the tools enabled
//! for its stage and line of business. Tool failures are reported back to
//! the model as text; they never abort the agent loop.

use crate::knowledge::KnowledgeBase;
use crate::store::{agent_output_key, BlobStore};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Maximum number of values the calculator sums.
pub const CALCULATOR_MAX_VALUES: usize = 100;

/// Sender address on supporting-document requests.
const NOTICE_SENDER: &str = "underwriting-bot@example.com";

/// Tool definition for Ollama's tool-calling API.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, Serialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// A tool call made by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Result of executing a tool.
#[derive(Debug, Clone, Serialize)]
pub struct ToolResult {
    pub success: bool,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn success(output: String) -> Self {
        Self {
            success: true,
            output,
            error: None,
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(message),
        }
    }

    /// Text fed back to the model as the tool message.
    pub fn into_message(self) -> String {
        if self.success {
            self.output
        } else {
            format!("Error: {}", self.error.unwrap_or_default())
        }
    }
}

/// Tools known to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    KbSearch,
    ScratchPad,
    Calculator,
    SendIneligibilityNotice,
    RequestSupportingDocuments,
}

impl Tool {
    pub fn name(&self) -> &'static str {
        match self {
            Tool::KbSearch => "kb_search",
            Tool::ScratchPad => "scratch_pad",
            Tool::Calculator => "calculator",
            Tool::SendIneligibilityNotice => "send_ineligibility_notice",
            Tool::RequestSupportingDocuments => "request_supporting_documents",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        [
            Tool::KbSearch,
            Tool::ScratchPad,
            Tool::Calculator,
            Tool::SendIneligibilityNotice,
            Tool::RequestSupportingDocuments,
        ]
        .into_iter()
        .find(|t| t.name() == name)
    }

    pub fn definition(&self) -> ToolDefinition {
        let (description, parameters) = match self {
            Tool::KbSearch => (
                "Look up an impairment in the underwriting manual. Returns the manual location and text of the best match.",
                json!({
                    "type": "object",
                    "properties": {
                        "canonical_term": {
                            "type": "string",
                            "description": "Canonical impairment name, e.g. 'diabetes mellitus type 2'"
                        }
                    },
                    "required": ["canonical_term"]
                }),
            ),
            Tool::ScratchPad => (
                "Keep notes during this task. 'append' adds a value to a list, 'set' replaces it, 'get' reads it back.",
                json!({
                    "type": "object",
                    "properties": {
                        "action": {"type": "string", "enum": ["append", "set", "get"]},
                        "key": {"type": "string"},
                        "value": {"description": "Value to store (ignored for get)"}
                    },
                    "required": ["action", "key"]
                }),
            ),
            Tool::Calculator => (
                "Sum a list of numbers (at most 100). Returns the total.",
                json!({
                    "type": "object",
                    "properties": {
                        "values": {"type": "array", "items": {"type": "number"}}
                    },
                    "required": ["values"]
                }),
            ),
            Tool::SendIneligibilityNotice => (
                "Record that the application is ineligible and why.",
                json!({
                    "type": "object",
                    "properties": {
                        "document_identifier": {"type": "string"},
                        "reason_for_ineligibility": {"type": "string"}
                    },
                    "required": ["document_identifier", "reason_for_ineligibility"]
                }),
            ),
            Tool::RequestSupportingDocuments => (
                "Draft a request to the applicant for additional supporting documents.",
                json!({
                    "type": "object",
                    "properties": {
                        "document_identifier": {"type": "string"},
                        "recipient_email": {"type": "string"},
                        "documents_to_request": {"type": "array", "items": {"type": "string"}},
                        "email_body": {"type": "string"}
                    },
                    "required": ["document_identifier", "recipient_email", "documents_to_request", "email_body"]
                }),
            ),
        };

        ToolDefinition {
            tool_type: "function".to_string(),
            function: FunctionDefinition {
                name: self.name().to_string(),
                description: description.to_string(),
                parameters,
            },
        }
    }
}

/// A side effect performed by a notice tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordedAction {
    pub tool: String,
    pub document_identifier: String,
    pub key: String,
}

/// Executes tool calls for one agent invocation.
pub struct ToolExecutor {
    enabled: Vec<Tool>,
    knowledge: Option<Arc<dyn KnowledgeBase>>,
    outputs: Option<Arc<dyn BlobStore>>,
    scratch: Map<String, Value>,
    actions: Vec<RecordedAction>,
}

impl ToolExecutor {
    pub fn new(enabled: Vec<Tool>) -> Self {
        Self {
            enabled,
            knowledge: None,
            outputs: None,
            scratch: Map::new(),
            actions: Vec::new(),
        }
    }

    /// Executor with no tools.
    pub fn none() -> Self {
        Self::new(Vec::new())
    }

    pub fn with_knowledge(mut self, knowledge: Option<Arc<dyn KnowledgeBase>>) -> Self {
        self.knowledge = knowledge;
        self
    }

    /// Store notice tools write into.
    pub fn with_outputs(mut self, outputs: Arc<dyn BlobStore>) -> Self {
        self.outputs = Some(outputs);
        self
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.enabled.iter().map(Tool::definition).collect()
    }

    pub fn tool_names(&self) -> Vec<&'static str> {
        self.enabled.iter().map(Tool::name).collect()
    }

    /// Notices written during this invocation.
    pub fn actions(&self) -> &[RecordedAction] {
        &self.actions
    }

    /// Clear per-invocation state.
    pub fn reset(&mut self) {
        self.scratch.clear();
        self.actions.clear();
    }

    /// Execute a tool call and return the result.
    pub async fn execute(&mut self, tool_call: &ToolCall) -> ToolResult {
        let name = &tool_call.function.name;
        let args = normalize_arguments(&tool_call.function.arguments);

        debug!("Executing tool: {} with args: {:?}", name, args);

        let Some(tool) = Tool::from_name(name).filter(|t| self.enabled.contains(t)) else {
            return ToolResult::error(format!("Unknown tool: {}", name));
        };

        match tool {
            Tool::KbSearch => self.kb_search(&args).await,
            Tool::ScratchPad => self.scratch_pad(&args),
            Tool::Calculator => calculator(&args),
            Tool::SendIneligibilityNotice => self.send_ineligibility_notice(&args),
            Tool::RequestSupportingDocuments => self.request_supporting_documents(&args),
        }
    }

    async fn kb_search(&self, args: &Value) -> ToolResult {
        let Some(term) = str_arg(args, "canonical_term") else {
            return ToolResult::error("Missing required parameter: canonical_term".to_string());
        };
        let Some(knowledge) = &self.knowledge else {
            return ToolResult::success("Knowledge base not configured.".to_string());
        };

        match knowledge.retrieve(term).await {
            Ok(Some(hit)) => ToolResult::success(format!(
                "knowledgebase_location: {}\ntext_content: {}",
                hit.location, hit.text
            )),
            Ok(None) => ToolResult::success("No matching documents found.".to_string()),
            Err(e) => {
                warn!(term, "Knowledge base lookup failed: {}", e);
                ToolResult::success(format!("KB retrieval error: {}", e))
            }
        }
    }

    fn scratch_pad(&mut self, args: &Value) -> ToolResult {
        let Some(key) = str_arg(args, "key") else {
            return ToolResult::error("Missing required parameter: key".to_string());
        };
        let value = args.get("value").cloned().unwrap_or(Value::Null);

        match str_arg(args, "action").unwrap_or("get") {
            "append" => {
                let slot = self
                    .scratch
                    .entry(key.to_string())
                    .or_insert_with(|| Value::Array(Vec::new()));
                match slot {
                    Value::Array(list) => list.push(value),
                    other => *other = Value::Array(vec![other.take(), value]),
                }
                ToolResult::success("ok".to_string())
            }
            "set" => {
                self.scratch.insert(key.to_string(), value);
                ToolResult::success("ok".to_string())
            }
            "get" => ToolResult::success(
                self.scratch
                    .get(key)
                    .map(Value::to_string)
                    .unwrap_or_else(|| "null".to_string()),
            ),
            other => ToolResult::error(format!("Unknown scratch_pad action: {}", other)),
        }
    }

    fn send_ineligibility_notice(&mut self, args: &Value) -> ToolResult {
        let (Some(document), Some(reason)) = (
            str_arg(args, "document_identifier"),
            str_arg(args, "reason_for_ineligibility"),
        ) else {
            return ToolResult::error(
                "Missing required parameters: document_identifier, reason_for_ineligibility"
                    .to_string(),
            );
        };

        let content = format!(
            "Document Identifier: {}\nStatus: Ineligible\nReason: {}",
            document, reason
        );
        self.write_notice(Tool::SendIneligibilityNotice, document, "ineligible", &content)
            .map(|key| {
                ToolResult::success(format!(
                    "Ineligibility notice recorded for {} at {}",
                    document, key
                ))
            })
            .unwrap_or_else(ToolResult::error)
    }

    fn request_supporting_documents(&mut self, args: &Value) -> ToolResult {
        let (Some(document), Some(email), Some(body)) = (
            str_arg(args, "document_identifier"),
            str_arg(args, "recipient_email"),
            str_arg(args, "email_body"),
        ) else {
            return ToolResult::error(
                "Missing required parameters: document_identifier, recipient_email, email_body"
                    .to_string(),
            );
        };
        let requested: Vec<String> = match args.get("documents_to_request") {
            Some(Value::Array(items)) => items.iter().map(value_text).collect(),
            Some(Value::String(s)) => vec![s.clone()],
            _ => Vec::new(),
        };

        let content = format!(
            "To: {}\nFrom: {}\nSubject: Additional Documents Required for Application (Document: {})\n\n{}",
            email, NOTICE_SENDER, document, body
        );
        self.write_notice(
            Tool::RequestSupportingDocuments,
            document,
            "document_request",
            &content,
        )
        .map(|key| {
            ToolResult::success(format!(
                "Request for {} document(s) recorded for {} at {}",
                requested.len(),
                document,
                key
            ))
        })
        .unwrap_or_else(ToolResult::error)
    }

    fn write_notice(
        &mut self,
        tool: Tool,
        document: &str,
        kind: &str,
        content: &str,
    ) -> Result<String, String> {
        let Some(outputs) = &self.outputs else {
            return Err("No output store configured".to_string());
        };
        let key = agent_output_key(document, kind);
        outputs
            .put(&key, content.as_bytes())
            .map_err(|e| format!("Failed to write notice: {}", e))?;

        info!(document, key = %key, tool = tool.name(), "Recorded agent action");
        self.actions.push(RecordedAction {
            tool: tool.name().to_string(),
            document_identifier: document.to_string(),
            key: key.clone(),
        });
        Ok(key)
    }
}

/// Sum of the first [`CALCULATOR_MAX_VALUES`] numeric values.
fn calculator(args: &Value) -> ToolResult {
    let values = match args.get("values") {
        Some(Value::Array(values)) => values,
        _ => return ToolResult::error("Missing required parameter: values".to_string()),
    };

    let total: f64 = values
        .iter()
        .take(CALCULATOR_MAX_VALUES)
        .filter_map(|v| match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
        .sum();

    ToolResult::success(json!(total).to_string())
}

/// Some models send arguments as a JSON-encoded string.
fn normalize_arguments(arguments: &Value) -> Value {
    match arguments {
        Value::String(s) => serde_json::from_str(s).unwrap_or_else(|_| json!({})),
        Value::Null => json!({}),
        other => other.clone(),
    }
}

fn str_arg<'a>(args: &'a Value, name: &str) -> Option<&'a str> {
    args.get(name).and_then(Value::as_str)
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::KbHit;
    use crate::store::MemoryBlobStore;
    use async_trait::async_trait;
    use tokio_test::block_on;

    struct FixedKb(Option<KbHit>);

    #[async_trait]
    impl KnowledgeBase for FixedKb {
        async fn retrieve(&self, _term: &str) -> anyhow::Result<Option<KbHit>> {
            Ok(self.0.clone())
        }
    }

    fn call(name: &str, arguments: Value) -> ToolCall {
        ToolCall {
            function: FunctionCall {
                name: name.to_string(),
                arguments,
            },
        }
    }

    #[test]
    fn test_disabled_tool_is_unknown() {
        let mut executor = ToolExecutor::new(vec![Tool::Calculator]);
        let result = block_on(executor.execute(&call("scratch_pad", json!({"key": "a"}))));
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Unknown tool: scratch_pad"));
    }

    #[test]
    fn test_calculator_sums_numbers_and_numeric_strings() {
        let mut executor = ToolExecutor::new(vec![Tool::Calculator]);
        let result = block_on(executor.execute(&call(
            "calculator",
            json!({"values": [25, "50", 12.5, "abc", null]}),
        )));
        assert_eq!(result.output, "87.5");
    }

    #[test]
    fn test_calculator_caps_value_count() {
        let values: Vec<Value> = (0..150).map(|_| json!(1)).collect();
        let result = calculator(&json!({ "values": values }));
        assert_eq!(result.output, "100.0");
    }

    #[test]
    fn test_scratch_pad_round_trip() {
        let mut executor = ToolExecutor::new(vec![Tool::ScratchPad]);
        block_on(executor.execute(&call(
            "scratch_pad",
            json!({"action": "append", "key": "ids", "value": "diabetes"}),
        )));
        block_on(executor.execute(&call(
            "scratch_pad",
            json!({"action": "append", "key": "ids", "value": "hypertension"}),
        )));
        let got = block_on(executor.execute(&call(
            "scratch_pad",
            json!({"action": "get", "key": "ids"}),
        )));
        assert_eq!(got.output, r#"["diabetes","hypertension"]"#);

        let missing = block_on(executor.execute(&call(
            "scratch_pad",
            json!({"action": "get", "key": "other"}),
        )));
        assert_eq!(missing.output, "null");
    }

    #[test]
    fn test_string_encoded_arguments() {
        let mut executor = ToolExecutor::new(vec![Tool::ScratchPad]);
        let result = block_on(executor.execute(&call(
            "scratch_pad",
            Value::String(r#"{"action": "set", "key": "k", "value": 3}"#.to_string()),
        )));
        assert_eq!(result.output, "ok");
    }

    #[test]
    fn test_kb_search_outcomes() {
        let mut unconfigured = ToolExecutor::new(vec![Tool::KbSearch]);
        let result = block_on(unconfigured.execute(&call(
            "kb_search",
            json!({"canonical_term": "diabetes"}),
        )));
        assert_eq!(result.output, "Knowledge base not configured.");

        let hit = KbHit {
            location: "manual/endocrine.md".to_string(),
            text: "Rate by HbA1c.".to_string(),
        };
        let mut configured = ToolExecutor::new(vec![Tool::KbSearch])
            .with_knowledge(Some(Arc::new(FixedKb(Some(hit)))));
        let result = block_on(configured.execute(&call(
            "kb_search",
            json!({"canonical_term": "diabetes"}),
        )));
        assert_eq!(
            result.output,
            "knowledgebase_location: manual/endocrine.md\ntext_content: Rate by HbA1c."
        );

        let mut empty =
            ToolExecutor::new(vec![Tool::KbSearch]).with_knowledge(Some(Arc::new(FixedKb(None))));
        let result = block_on(empty.execute(&call(
            "kb_search",
            json!({"canonical_term": "unknown"}),
        )));
        assert_eq!(result.output, "No matching documents found.");
    }

    #[test]
    fn test_notices_write_blobs() {
        let outputs = Arc::new(MemoryBlobStore::new());
        let mut executor = ToolExecutor::new(vec![
            Tool::SendIneligibilityNotice,
            Tool::RequestSupportingDocuments,
        ])
        .with_outputs(outputs.clone());

        let result = block_on(executor.execute(&call(
            "send_ineligibility_notice",
            json!({"document_identifier": "uploads/j1/app.pdf", "reason_for_ineligibility": "Vacant building"}),
        )));
        assert!(result.success);
        let notice = outputs
            .get("agent_outputs/uploads_j1_app.pdf_ineligible.txt")
            .unwrap();
        assert_eq!(
            String::from_utf8(notice).unwrap(),
            "Document Identifier: uploads/j1/app.pdf\nStatus: Ineligible\nReason: Vacant building"
        );

        let result = block_on(executor.execute(&call(
            "request_supporting_documents",
            json!({
                "document_identifier": "uploads/j1/app.pdf",
                "recipient_email": "broker@example.com",
                "documents_to_request": ["Loss runs", "Roof inspection"],
                "email_body": "Please send the items below."
            }),
        )));
        assert!(result.output.contains("2 document(s)"));
        let request = String::from_utf8(
            outputs
                .get("agent_outputs/uploads_j1_app.pdf_document_request.txt")
                .unwrap(),
        )
        .unwrap();
        assert!(request.starts_with("To: broker@example.com\nFrom: underwriting-bot@example.com\n"));
        assert!(request.ends_with("\n\nPlease send the items below."));
        assert_eq!(executor.actions().len(), 2);
    }

    #[test]
    fn test_tool_definitions() {
        let executor = ToolExecutor::new(vec![Tool::KbSearch, Tool::Calculator]);
        let defs = executor.definitions();
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0].function.name, "kb_search");
        assert_eq!(defs[1].tool_type, "function");
        assert_eq!(executor.tool_names(), vec!["kb_search", "calculator"]);
    }
}
