//! Model boundary: the opaque capability an LLM agent reasons with.
//!
//! A [`Model`] receives the resolved instruction, the conversation so far and
//! the catalog of tools the agent declared, and answers with text, tool-call
//! requests, or both. Everything vendor-specific lives behind this trait.

pub mod mock;
pub mod openai;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ModelError {
    #[error("model call timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),
    #[error("model quota exhausted: {0}")]
    Quota(String),
    #[error("malformed model output: {0}")]
    Malformed(String),
    #[error("model transport error: {0}")]
    Transport(String),
}

/// One entry in the model-facing tool catalog.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON-Schema object describing the accepted parameters.
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub params: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, params: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Turn {
    User {
        text: String,
    },
    Assistant {
        text: Option<String>,
        tool_calls: Vec<ToolCall>,
    },
    ToolResult {
        call_id: String,
        name: String,
        payload: Value,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelRequest {
    /// Name of the agent issuing the request, for logging and test assertions.
    pub agent: String,
    pub instruction: String,
    pub turns: Vec<Turn>,
    pub tools: Vec<ToolSpec>,
}

impl ModelRequest {
    pub fn latest_user_text(&self) -> Option<&str> {
        self.turns.iter().rev().find_map(|turn| match turn {
            Turn::User { text } => Some(text.as_str()),
            _ => None,
        })
    }

    pub fn latest_tool_result(&self) -> Option<&Value> {
        match self.turns.last() {
            Some(Turn::ToolResult { payload, .. }) => Some(payload),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub text: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

impl ModelResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            text: None,
            tool_calls: calls,
        }
    }
}

#[async_trait]
pub trait Model: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, request: ModelRequest) -> Result<ModelResponse, ModelError>;
}

/// Replies with the latest user turn. Used for offline dry runs.
#[derive(Debug, Clone)]
pub struct EchoModel {
    name: String,
}

impl EchoModel {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for EchoModel {
    fn default() -> Self {
        Self::new("echo")
    }
}

#[async_trait]
impl Model for EchoModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        let text = request.latest_user_text().unwrap_or_default().to_string();
        Ok(ModelResponse::text(text))
    }
}
