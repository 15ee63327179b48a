//! Model access for the pipeline stages.
//!
//! This module provides the chat backend, the tool-calling reasoning agent,
//! its tools and the stage prompts.

pub mod agent_loop;
pub mod prompts;
pub mod tools;

pub use agent_loop::{
    AgentConfig, ChatBackend, ChatMessage, ChatRequest, OllamaBackend, ReasoningAgent,
    ResponseMessage,
};
pub use tools::{Tool, ToolExecutor};
