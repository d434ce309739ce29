//! OpenAI-compatible `/chat/completions` client with function calling.
//!
//! Works against OpenAI itself and against local servers exposing the same
//! wire format (Ollama serves it under `/v1`).

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{Model, ModelError, ModelRequest, ModelResponse, ToolCall, Turn};

#[derive(Debug, Clone)]
pub struct OpenAiCompatConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

pub struct OpenAiCompatModel {
    config: OpenAiCompatConfig,
    client: reqwest::Client,
}

impl OpenAiCompatModel {
    pub fn new(config: OpenAiCompatConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("failed to build HTTP client for model provider")?;
        Ok(Self { config, client })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }
}

pub fn build_chat_body(model: &str, request: &ModelRequest) -> Value {
    let mut messages = vec![json!({ "role": "system", "content": request.instruction })];
    for turn in &request.turns {
        messages.push(match turn {
            Turn::User { text } => json!({ "role": "user", "content": text }),
            Turn::Assistant { text, tool_calls } => {
                let mut message = json!({ "role": "assistant", "content": text });
                if !tool_calls.is_empty() {
                    message["tool_calls"] = tool_calls
                        .iter()
                        .map(|call| {
                            json!({
                                "id": call.id,
                                "type": "function",
                                "function": {
                                    "name": call.name,
                                    "arguments": call.params.to_string(),
                                }
                            })
                        })
                        .collect();
                }
                message
            }
            Turn::ToolResult {
                call_id, payload, ..
            } => json!({
                "role": "tool",
                "tool_call_id": call_id,
                "content": payload.to_string(),
            }),
        });
    }

    let mut body = json!({ "model": model, "messages": messages });
    if !request.tools.is_empty() {
        body["tools"] = request
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    }
                })
            })
            .collect();
    }
    body
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: Option<String>,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

pub fn parse_chat_completion(raw: &str) -> Result<ModelResponse, ModelError> {
    let completion: ChatCompletion = serde_json::from_str(raw)
        .map_err(|err| ModelError::Malformed(format!("undecodable completion: {err}")))?;
    let choice = completion
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ModelError::Malformed("completion has no choices".to_string()))?;

    let tool_calls = choice
        .message
        .tool_calls
        .into_iter()
        .enumerate()
        .map(|(index, call)| {
            let params = match call.function.arguments {
                Value::String(raw_args) => serde_json::from_str(&raw_args)
                    .unwrap_or(Value::String(raw_args)),
                other => other,
            };
            ToolCall::new(
                call.id.unwrap_or_else(|| format!("call_{index}")),
                call.function.name,
                params,
            )
        })
        .collect();

    Ok(ModelResponse {
        text: choice
            .message
            .content
            .filter(|text| !text.trim().is_empty()),
        tool_calls,
    })
}

#[async_trait]
impl Model for OpenAiCompatModel {
    fn name(&self) -> &str {
        &self.config.model
    }

    async fn send(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        let body = build_chat_body(&self.config.model, &request);
        let mut call = self.client.post(self.endpoint()).json(&body);
        if let Some(key) = self.config.api_key.as_deref() {
            call = call.bearer_auth(key);
        }

        let response = call.send().await.map_err(|err| {
            if err.is_timeout() {
                ModelError::Timeout(self.config.timeout)
            } else {
                ModelError::Transport(err.to_string())
            }
        })?;

        let status = response.status();
        let raw = response.text().await.map_err(|err| {
            if err.is_timeout() {
                ModelError::Timeout(self.config.timeout)
            } else {
                ModelError::Transport(err.to_string())
            }
        })?;

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ModelError::Quota(raw));
        }
        if !status.is_success() {
            return Err(ModelError::Transport(format!("HTTP {status}: {raw}")));
        }

        parse_chat_completion(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ToolSpec;

    #[test]
    fn tool_call_arguments_are_decoded_from_strings() {
        let raw = r#"{"choices":[{"message":{"content":null,"tool_calls":[
            {"id":"c1","type":"function","function":{"name":"add","arguments":"{\"a\":1,\"b\":2}"}}
        ]}}]}"#;
        let response = parse_chat_completion(raw).expect("completion should parse");
        assert_eq!(response.text, None);
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].name, "add");
        assert_eq!(response.tool_calls[0].params, json!({"a": 1, "b": 2}));
    }

    #[test]
    fn empty_choices_are_malformed() {
        let err = parse_chat_completion(r#"{"choices":[]}"#).expect_err("should fail");
        assert!(matches!(err, ModelError::Malformed(_)));
    }

    #[test]
    fn chat_body_carries_tool_results_and_catalog() {
        let request = ModelRequest {
            agent: "calc".to_string(),
            instruction: "Add numbers.".to_string(),
            turns: vec![
                Turn::User {
                    text: "1+2".to_string(),
                },
                Turn::Assistant {
                    text: None,
                    tool_calls: vec![ToolCall::new("c1", "add", json!({"a": 1, "b": 2}))],
                },
                Turn::ToolResult {
                    call_id: "c1".to_string(),
                    name: "add".to_string(),
                    payload: json!({"result": 3}),
                },
            ],
            tools: vec![ToolSpec {
                name: "add".to_string(),
                description: "adds".to_string(),
                parameters: json!({"type": "object"}),
            }],
        };

        let body = build_chat_body("gpt-4o-mini", &request);
        let messages = body["messages"].as_array().expect("messages array");
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[2]["tool_calls"][0]["function"]["name"], "add");
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(messages[3]["tool_call_id"], "c1");
        assert_eq!(body["tools"][0]["function"]["name"], "add");
    }
}
