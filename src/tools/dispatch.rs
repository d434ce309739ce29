//! Routes model-issued tool calls to handlers.
//!
//! Order of operations for one call: lookup, a single normalisation pass over
//! the raw parameters, schema validation, then a time-bounded invocation.
//! Every failure comes back as an error payload for the model to read; the
//! dispatcher never fails the calling agent.

use std::time::Duration;

use serde_json::{Map, Value, json};

use super::{ToolDescriptor, ToolSet};
use crate::error::PipelineError;
use crate::model::ToolCall;
use crate::session::SessionState;
use crate::telemetry::TelemetrySink;

#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub payload: Value,
    pub escalate: bool,
    pub error: Option<PipelineError>,
}

impl DispatchOutcome {
    fn failed(error: PipelineError) -> Self {
        Self {
            payload: error_payload(&error),
            escalate: false,
            error: Some(error),
        }
    }
}

pub fn error_payload(err: &PipelineError) -> Value {
    json!({ "error": err.to_string(), "kind": err.kind().label() })
}

#[derive(Debug, Clone, Copy)]
pub struct ToolDispatcher {
    timeout: Duration,
}

impl ToolDispatcher {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Lookup, normalisation and validation without invoking the handler.
    pub fn prepare<'t>(
        &self,
        tools: &'t ToolSet,
        call: &ToolCall,
    ) -> Result<(&'t ToolDescriptor, Map<String, Value>), PipelineError> {
        let tool = tools.get(&call.name).ok_or_else(|| PipelineError::UnknownTool {
            tool: call.name.clone(),
        })?;
        let params = normalize_params(tool, &call.params)?;
        validate_params(tool, &params)?;
        Ok((tool, params))
    }

    pub async fn dispatch(
        &self,
        tools: &ToolSet,
        call: &ToolCall,
        state: &SessionState,
        telemetry: Option<&TelemetrySink>,
    ) -> DispatchOutcome {
        if let Some(sink) = telemetry {
            sink.emit("tool.requested", json!({ "tool": call.name, "call_id": call.id }));
        }

        let outcome = match self.prepare(tools, call) {
            Ok((tool, params)) => self.invoke(tool, params, state).await,
            Err(err) => DispatchOutcome::failed(err),
        };

        match &outcome.error {
            None => {
                tracing::info!(tool = %call.name, escalate = outcome.escalate, "Tool call succeeded");
                if let Some(sink) = telemetry {
                    sink.emit("tool.succeeded", json!({ "tool": call.name, "call_id": call.id }));
                }
            }
            Some(err) => {
                tracing::warn!(tool = %call.name, kind = %err.kind(), error = %err, "Tool call failed");
                if let Some(sink) = telemetry {
                    sink.emit(
                        "tool.failed",
                        json!({
                            "tool": call.name,
                            "call_id": call.id,
                            "kind": err.kind().label(),
                        }),
                    );
                }
            }
        }
        outcome
    }

    async fn invoke(
        &self,
        tool: &ToolDescriptor,
        params: Map<String, Value>,
        state: &SessionState,
    ) -> DispatchOutcome {
        match tokio::time::timeout(self.timeout, tool.handler.call(params, state)).await {
            Err(_) => DispatchOutcome::failed(PipelineError::Timeout {
                operation: format!("tool '{}'", tool.name),
                after: self.timeout,
            }),
            Ok(output) => match &output.result {
                Ok(_) => DispatchOutcome {
                    payload: output.payload(),
                    escalate: output.escalate,
                    error: None,
                },
                Err(message) => DispatchOutcome {
                    payload: output.payload(),
                    escalate: output.escalate,
                    error: Some(PipelineError::ToolFailed {
                        tool: tool.name.clone(),
                        message: message.clone(),
                    }),
                },
            },
        }
    }
}

/// One normalisation pass: `null` becomes `{}`, a JSON string holding an
/// object is decoded, and a lone `parameters` wrapper is unwrapped when the
/// schema has no field of that name. Anything else must already be an object.
pub fn normalize_params(
    tool: &ToolDescriptor,
    raw: &Value,
) -> Result<Map<String, Value>, PipelineError> {
    let invalid = |reason: String| PipelineError::InvalidParameters {
        tool: tool.name.clone(),
        reason,
    };

    let object = match raw {
        Value::Null => Map::new(),
        Value::Object(map) => map.clone(),
        Value::String(text) => match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => map,
            _ => {
                return Err(invalid(
                    "expected a JSON object, got a string".to_string(),
                ));
            }
        },
        other => {
            return Err(invalid(format!(
                "expected a JSON object, got {}",
                json_type_name(other)
            )));
        }
    };

    if object.len() == 1
        && tool.field("parameters").is_none()
        && let Some(Value::Object(inner)) = object.get("parameters")
    {
        return Ok(inner.clone());
    }
    Ok(object)
}

pub fn validate_params(
    tool: &ToolDescriptor,
    params: &Map<String, Value>,
) -> Result<(), PipelineError> {
    let invalid = |reason: String| PipelineError::InvalidParameters {
        tool: tool.name.clone(),
        reason,
    };

    for field in &tool.input_schema {
        match params.get(&field.name) {
            None if field.required => {
                return Err(invalid(format!(
                    "missing required field '{}'",
                    field.name
                )));
            }
            Some(value) if !field.kind.accepts(value) => {
                return Err(invalid(format!(
                    "field '{}' must be {}, got {}",
                    field.name,
                    field.kind.label(),
                    json_type_name(value)
                )));
            }
            _ => {}
        }
    }

    let mut unknown = params
        .keys()
        .filter(|key| tool.field(key).is_none())
        .cloned()
        .collect::<Vec<String>>();
    if !unknown.is_empty() {
        unknown.sort();
        return Err(invalid(format!("unknown field(s): {}", unknown.join(", "))));
    }
    Ok(())
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(number) if number.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{FieldSpec, FieldType, ToolOutput};

    fn add_tool() -> ToolDescriptor {
        ToolDescriptor::from_fn("add", "Adds two integers.", |params, _state| async move {
            let a = params.get("a").and_then(Value::as_i64).unwrap_or_default();
            let b = params.get("b").and_then(Value::as_i64).unwrap_or_default();
            ToolOutput::ok(json!(a + b))
        })
        .with_field(FieldSpec::required("a", FieldType::Integer, "left operand"))
        .with_field(FieldSpec::required("b", FieldType::Integer, "right operand"))
    }

    fn slow_tool() -> ToolDescriptor {
        ToolDescriptor::from_fn("slow", "Sleeps.", |_params, _state| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            ToolOutput::ok(Value::Null)
        })
    }

    fn tool_set(tools: Vec<ToolDescriptor>) -> ToolSet {
        let mut set = ToolSet::new();
        for tool in tools {
            set.insert(tool).expect("unique tool names");
        }
        set
    }

    fn state() -> SessionState {
        SessionState::new(Map::new())
    }

    #[test]
    fn normalisation_accepts_wrapped_and_stringified_objects() {
        let tool = add_tool();
        let wrapped = normalize_params(&tool, &json!({"parameters": {"a": 1, "b": 2}}))
            .expect("wrapper should unwrap");
        assert_eq!(wrapped.get("a"), Some(&json!(1)));

        let stringified =
            normalize_params(&tool, &json!("{\"a\": 1, \"b\": 2}")).expect("string should decode");
        assert_eq!(stringified.len(), 2);

        assert!(normalize_params(&tool, &Value::Null)
            .expect("null is empty")
            .is_empty());
        assert!(normalize_params(&tool, &json!([1, 2])).is_err());
    }

    #[test]
    fn validation_rejects_missing_mistyped_and_unknown_fields() {
        let tool = add_tool();
        let missing = json!({"a": 1}).as_object().cloned().unwrap_or_default();
        assert!(validate_params(&tool, &missing).is_err());

        let mistyped = json!({"a": 1, "b": "two"}).as_object().cloned().unwrap_or_default();
        let err = validate_params(&tool, &mistyped).expect_err("string is not an integer");
        assert!(err.to_string().contains("must be integer"));

        let unknown = json!({"a": 1, "b": 2, "c": 3}).as_object().cloned().unwrap_or_default();
        let err = validate_params(&tool, &unknown).expect_err("c is not declared");
        assert!(err.to_string().contains("unknown field(s): c"));
    }

    #[tokio::test]
    async fn unknown_tool_and_invalid_params_become_error_payloads() {
        let tools = tool_set(vec![add_tool()]);
        let dispatcher = ToolDispatcher::new(Duration::from_secs(1));

        let outcome = dispatcher
            .dispatch(&tools, &ToolCall::new("c1", "mul", json!({})), &state(), None)
            .await;
        assert_eq!(outcome.payload["kind"], "unknown_tool");

        let outcome = dispatcher
            .dispatch(
                &tools,
                &ToolCall::new("c2", "add", json!({"a": "1", "b": 2})),
                &state(),
                None,
            )
            .await;
        assert_eq!(outcome.payload["kind"], "invalid_parameters");

        let outcome = dispatcher
            .dispatch(
                &tools,
                &ToolCall::new("c3", "add", json!({"a": 1, "b": 2})),
                &state(),
                None,
            )
            .await;
        assert!(outcome.error.is_none());
        assert_eq!(outcome.payload, json!({"result": 3}));
    }

    #[tokio::test]
    async fn slow_handlers_time_out() {
        let tools = tool_set(vec![slow_tool()]);
        let dispatcher = ToolDispatcher::new(Duration::from_millis(50));
        let outcome = dispatcher
            .dispatch(&tools, &ToolCall::new("c1", "slow", Value::Null), &state(), None)
            .await;
        assert_eq!(outcome.payload["kind"], "timeout");
    }
}
