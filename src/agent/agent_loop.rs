//! Chat backend and the tool-calling agent loop.
//!
//! [`ReasoningAgent`] binds a system prompt, a tool set and a model id. One
//! `invoke` sends the user message, runs any tool calls the model asks for,
//! feeds the results back, and returns the content of the first response
//! that asks for no tools. Parsing the answer is left to the caller.

use crate::agent::tools::{ToolCall, ToolDefinition, ToolExecutor};
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for the agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub ollama_url: String,
    pub model_name: String,
    pub temperature: f32,
    pub max_iterations: usize,
    pub timeout_seconds: u64,
    /// Max tool exchanges kept in context (sliding window)
    pub max_context_messages: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            ollama_url: "http://localhost:11434".to_string(),
            model_name: "llama3.2:latest".to_string(),
            temperature: 0.1,
            max_iterations: 50,
            timeout_seconds: 300,
            max_context_messages: 10,
        }
    }
}

/// Message in the chat history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    /// Base64-encoded page images.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl ChatMessage {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
            images: None,
            tool_calls: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::new("tool", content)
    }

    pub fn with_images(mut self, images: &[Vec<u8>]) -> Self {
        if !images.is_empty() {
            self.images = Some(images.iter().map(|b| STANDARD.encode(b)).collect());
        }
        self
    }
}

/// One model turn request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub temperature: f32,
}

/// Assistant turn returned by the backend.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseMessage {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl ResponseMessage {
    fn pending_tool_calls(&self) -> &[ToolCall] {
        self.tool_calls.as_deref().unwrap_or_default()
    }
}

/// A chat-completion service.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn chat(&self, request: &ChatRequest) -> Result<ResponseMessage>;
}

/// Ollama chat API request.
#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "no_tools")]
    tools: &'a [ToolDefinition],
    stream: bool,
    options: OllamaOptions,
}

fn no_tools(tools: &&[ToolDefinition]) -> bool {
    tools.is_empty()
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
}

/// Ollama chat API response.
#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: ResponseMessage,
}

/// `/api/chat` on an Ollama server.
pub struct OllamaBackend {
    http_client: reqwest::Client,
    ollama_url: String,
    timeout_seconds: u64,
}

impl OllamaBackend {
    pub fn new(ollama_url: &str, timeout_seconds: u64) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http_client,
            ollama_url: ollama_url.trim_end_matches('/').to_string(),
            timeout_seconds,
        })
    }
}

#[async_trait]
impl ChatBackend for OllamaBackend {
    async fn chat(&self, request: &ChatRequest) -> Result<ResponseMessage> {
        let url = format!("{}/api/chat", self.ollama_url);

        let body = OllamaChatRequest {
            model: &request.model,
            messages: &request.messages,
            tools: &request.tools,
            stream: false,
            options: OllamaOptions {
                temperature: request.temperature,
            },
        };

        debug!(
            model = %request.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "Sending chat request"
        );

        let response = self
            .http_client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    anyhow::anyhow!("Request timed out after {}s", self.timeout_seconds)
                } else if e.is_connect() {
                    anyhow::anyhow!("Cannot connect to Ollama at {}", self.ollama_url)
                } else {
                    anyhow::anyhow!("Failed to send request: {}", e)
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("Ollama API error {}: {}", status, body));
        }

        let chat_response: OllamaChatResponse = response
            .json()
            .await
            .context("Failed to parse Ollama response")?;

        Ok(chat_response.message)
    }
}

/// A system prompt, a tool set and a model bound together.
pub struct ReasoningAgent {
    backend: Arc<dyn ChatBackend>,
    config: AgentConfig,
    system_prompt: String,
    tools: ToolExecutor,
}

impl ReasoningAgent {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        config: AgentConfig,
        system_prompt: impl Into<String>,
        tools: ToolExecutor,
    ) -> Self {
        Self {
            backend,
            config,
            system_prompt: system_prompt.into(),
            tools,
        }
    }

    pub fn tools(&self) -> &ToolExecutor {
        &self.tools
    }

    /// Send `message` and return the final answer text.
    pub async fn invoke(&mut self, message: &str) -> Result<String> {
        self.invoke_with_images(message, &[]).await
    }

    /// Send `message` with attached images and return the final answer text.
    pub async fn invoke_with_images(&mut self, message: &str, images: &[Vec<u8>]) -> Result<String> {
        self.tools.reset();

        let mut messages = vec![
            ChatMessage::system(self.system_prompt.clone()),
            ChatMessage::user(message).with_images(images),
        ];
        let definitions = self.tools.definitions();
        let mut last_content = String::new();

        info!(
            model = %self.config.model_name,
            tools = ?self.tools.tool_names(),
            "Invoking agent"
        );

        for iteration in 0..self.config.max_iterations {
            debug!("Agent iteration {}", iteration + 1);

            let request = ChatRequest {
                model: self.config.model_name.clone(),
                messages: messages.clone(),
                tools: definitions.clone(),
                temperature: self.config.temperature,
            };
            let response = self.backend.chat(&request).await?;

            let calls = response.pending_tool_calls().to_vec();
            if calls.is_empty() {
                debug!(iterations = iteration + 1, "Agent produced final answer");
                return Ok(response.content);
            }

            last_content = response.content.clone();
            messages.push(ChatMessage {
                role: "assistant".to_string(),
                content: response.content,
                images: None,
                tool_calls: Some(calls.clone()),
            });

            for call in &calls {
                let result = self.tools.execute(call).await;
                debug!(tool = %call.function.name, success = result.success, "Tool executed");
                messages.push(ChatMessage::tool(result.into_message()));
            }

            prune_old_messages(&mut messages, self.config.max_context_messages);
        }

        warn!(
            max_iterations = self.config.max_iterations,
            "Agent hit the iteration limit without a final answer"
        );
        Ok(last_content)
    }
}

/// Keep system prompt and first user message plus the last `max_keep` messages.
fn prune_old_messages(messages: &mut Vec<ChatMessage>, max_keep: usize) {
    let keep_start = 2;
    let limit = max_keep + keep_start;
    if messages.len() > limit {
        let remove_count = messages.len() - limit;
        messages.drain(keep_start..keep_start + remove_count);
        debug!("Pruned {} old messages to save context", remove_count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::ScriptedBackend;
    use crate::agent::tools::{FunctionCall, Tool};
    use serde_json::json;
    use tokio_test::block_on;

    fn tool_call(name: &str, arguments: serde_json::Value) -> ToolCall {
        ToolCall {
            function: FunctionCall {
                name: name.to_string(),
                arguments,
            },
        }
    }

    #[test]
    fn test_agent_config_default() {
        let config = AgentConfig::default();
        assert_eq!(config.model_name, "llama3.2:latest");
        assert_eq!(config.max_iterations, 50);
    }

    #[test]
    fn test_plain_answer_is_returned() {
        let backend = Arc::new(ScriptedBackend::new(vec![Ok(ResponseMessage {
            content: "```json\n{\"a\": 1}\n```".to_string(),
            tool_calls: None,
        })]));
        let mut agent = ReasoningAgent::new(
            backend.clone(),
            AgentConfig::default(),
            "system",
            ToolExecutor::none(),
        );

        let answer = block_on(agent.invoke("hello")).unwrap();
        assert_eq!(answer, "```json\n{\"a\": 1}\n```");

        let requests = backend.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].messages[0].role, "system");
        assert_eq!(requests[0].messages[1].content, "hello");
        assert!(requests[0].tools.is_empty());
    }

    #[test]
    fn test_tool_results_are_fed_back() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            Ok(ResponseMessage {
                content: String::new(),
                tool_calls: Some(vec![tool_call("calculator", json!({"values": [1, 2]}))]),
            }),
            Ok(ResponseMessage {
                content: "{\"total_score\": 3}".to_string(),
                tool_calls: None,
            }),
        ]));
        let mut agent = ReasoningAgent::new(
            backend.clone(),
            AgentConfig::default(),
            "score",
            ToolExecutor::new(vec![Tool::Calculator]),
        );

        let answer = block_on(agent.invoke("score these")).unwrap();
        assert_eq!(answer, "{\"total_score\": 3}");

        let second = &backend.requests()[1];
        let last = second.messages.last().unwrap();
        assert_eq!(last.role, "tool");
        assert_eq!(last.content, "3.0");
        assert_eq!(second.tools[0].function.name, "calculator");
    }

    #[test]
    fn test_iteration_limit_returns_last_content() {
        let looping = || {
            Ok(ResponseMessage {
                content: "thinking".to_string(),
                tool_calls: Some(vec![tool_call("scratch_pad", json!({"action": "get", "key": "k"}))]),
            })
        };
        let backend = Arc::new(ScriptedBackend::new(vec![looping(), looping(), looping()]));
        let config = AgentConfig {
            max_iterations: 2,
            ..AgentConfig::default()
        };
        let mut agent = ReasoningAgent::new(
            backend.clone(),
            config,
            "system",
            ToolExecutor::new(vec![Tool::ScratchPad]),
        );

        assert_eq!(block_on(agent.invoke("go")).unwrap(), "thinking");
        assert_eq!(backend.requests().len(), 2);
    }

    #[test]
    fn test_transport_error_propagates() {
        let backend = Arc::new(ScriptedBackend::new(vec![Err("connection refused".to_string())]));
        let mut agent =
            ReasoningAgent::new(backend, AgentConfig::default(), "system", ToolExecutor::none());
        let err = block_on(agent.invoke("go")).unwrap_err();
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_images_are_base64_encoded() {
        let message = ChatMessage::user("page").with_images(&[b"abc".to_vec()]);
        assert_eq!(message.images, Some(vec!["YWJj".to_string()]));
        assert!(ChatMessage::user("none").with_images(&[]).images.is_none());
    }

    #[test]
    fn test_prune_keeps_head_and_tail() {
        let mut messages: Vec<ChatMessage> =
            (0..8).map(|i| ChatMessage::user(i.to_string())).collect();
        prune_old_messages(&mut messages, 3);
        let contents: Vec<_> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["0", "1", "5", "6", "7"]);
    }

    #[test]
    fn test_ollama_request_shape() {
        let messages = vec![ChatMessage::user("hi")];
        let body = OllamaChatRequest {
            model: "llava",
            messages: &messages,
            tools: &[],
            stream: false,
            options: OllamaOptions { temperature: 0.1 },
        };
        let value = serde_json::to_value(&body).unwrap();
        assert!(value.get("tools").is_none());
        assert_eq!(value["stream"], json!(false));
        assert_eq!(value["messages"][0], json!({"role": "user", "content": "hi"}));
    }
}
