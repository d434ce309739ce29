use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::error::PipelineError;
use crate::model::{Model, ModelError, ModelRequest, ModelResponse, ToolCall, ToolSpec, Turn};
use crate::node::NodeStatus;
use crate::runner::RunContext;
use crate::session::Session;
use crate::template::resolve_instruction;
use crate::tools::dispatch::{DispatchOutcome, error_payload, validate_params};
use crate::tools::{FieldType, ToolDescriptor, ToolSet};

pub const DEFAULT_MAX_TOOL_CALLS: usize = 8;

pub enum Capability {
    Llm {
        model: Arc<dyn Model>,
        tools: ToolSet,
        max_tool_calls: usize,
        /// Agents the model may hand a request to, each offered as a tool.
        sub_agents: Vec<Arc<Agent>>,
    },
    Tool(ToolDescriptor),
}

impl Capability {
    pub fn label(&self) -> &'static str {
        match self {
            Capability::Llm { .. } => "llm",
            Capability::Tool(_) => "tool",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AgentResult {
    pub text: Option<String>,
    pub structured: Option<Value>,
    pub escalate: bool,
    /// The model kept requesting tools past the per-invocation budget.
    pub budget_exhausted: bool,
}

impl AgentResult {
    pub fn from_text(text: Option<String>) -> Self {
        let structured = text.as_deref().and_then(parse_structured);
        Self {
            text,
            structured,
            ..Self::default()
        }
    }
}

fn parse_structured(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if !(trimmed.starts_with('{') || trimmed.starts_with('[')) {
        return None;
    }
    serde_json::from_str::<Value>(trimmed)
        .ok()
        .filter(|value| value.is_object() || value.is_array())
}

pub struct Agent {
    pub name: String,
    pub description: String,
    pub instruction: String,
    pub capability: Capability,
    pub output_key: Option<String>,
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("capability", &self.capability.label())
            .field("output_key", &self.output_key)
            .finish_non_exhaustive()
    }
}

impl Agent {
    pub fn sub_agents(&self) -> &[Arc<Agent>] {
        match &self.capability {
            Capability::Llm { sub_agents, .. } => sub_agents,
            Capability::Tool(_) => &[],
        }
    }

    /// Every agent reachable through delegation, depth first.
    pub fn delegates(&self) -> Vec<&Arc<Agent>> {
        let mut out = Vec::new();
        for sub in self.sub_agents() {
            out.push(sub);
            out.extend(sub.delegates());
        }
        out
    }

    pub async fn invoke(
        &self,
        input: &str,
        session: &Session,
        ctx: &RunContext,
    ) -> Result<AgentResult, PipelineError> {
        let outcome = self.invoke_inner(input, session, ctx).await;
        match &outcome {
            Ok(result) => {
                if let Some(key) = &self.output_key {
                    self.write_output(key, result, session);
                }
                tracing::info!(
                    agent = %self.name,
                    escalate = result.escalate,
                    budget_exhausted = result.budget_exhausted,
                    has_text = result.text.is_some(),
                    "Agent completed"
                );
                ctx.emit(
                    "agent.completed",
                    json!({ "agent": self.name, "escalate": result.escalate }),
                );
            }
            Err(err) => {
                tracing::warn!(agent = %self.name, kind = %err.kind(), error = %err, "Agent failed");
                ctx.emit(
                    "agent.failed",
                    json!({ "agent": self.name, "kind": err.kind().label() }),
                );
            }
        }
        outcome
    }

    async fn invoke_inner(
        &self,
        input: &str,
        session: &Session,
        ctx: &RunContext,
    ) -> Result<AgentResult, PipelineError> {
        let instruction = resolve_instruction(&self.name, &self.instruction, session.state())?;
        match &self.capability {
            Capability::Llm {
                model,
                tools,
                max_tool_calls,
                ..
            } => {
                self.run_llm(model.as_ref(), tools, *max_tool_calls, instruction, input, session, ctx)
                    .await
            }
            Capability::Tool(tool) => self.run_tool(tool, input, session, ctx).await,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_llm(
        &self,
        model: &dyn Model,
        tools: &ToolSet,
        max_tool_calls: usize,
        instruction: String,
        input: &str,
        session: &Session,
        ctx: &RunContext,
    ) -> Result<AgentResult, PipelineError> {
        let dispatcher = ctx.dispatcher();
        let mut catalog = tools.specs();
        catalog.extend(self.sub_agents().iter().map(|sub| delegation_spec(sub)));
        let mut turns = vec![Turn::User {
            text: input.to_string(),
        }];
        let mut tool_calls_used = 0usize;
        let mut escalate = false;
        let mut last_text: Option<String> = None;

        loop {
            let request = ModelRequest {
                agent: self.name.clone(),
                instruction: instruction.clone(),
                turns: turns.clone(),
                tools: catalog.clone(),
            };
            let response = self.send(model, request, ctx).await?;
            if let Some(text) = response.text.as_ref().filter(|text| !text.trim().is_empty()) {
                last_text = Some(text.clone());
            }

            if response.tool_calls.is_empty() {
                let mut result = AgentResult::from_text(last_text);
                result.escalate = escalate;
                return Ok(result);
            }

            turns.push(Turn::Assistant {
                text: response.text.clone(),
                tool_calls: response.tool_calls.clone(),
            });

            let mut exhausted = false;
            for call in &response.tool_calls {
                if tool_calls_used >= max_tool_calls {
                    exhausted = true;
                    break;
                }
                tool_calls_used += 1;
                let outcome = match self.sub_agents().iter().find(|sub| sub.name == call.name) {
                    Some(sub) => self.delegate(sub, call, session, ctx).await,
                    None => {
                        tracing::debug!(agent = %self.name, tool = %call.name, params = %call.params, "Dispatching tool call");
                        dispatcher
                            .dispatch(tools, call, session.state(), ctx.telemetry())
                            .await
                    }
                };
                escalate |= outcome.escalate;
                turns.push(Turn::ToolResult {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    payload: outcome.payload,
                });
            }

            if exhausted {
                let budget_err = PipelineError::ToolCallBudgetExceeded {
                    agent: self.name.clone(),
                    budget: max_tool_calls,
                };
                tracing::warn!(agent = %self.name, error = %budget_err, "Returning partial result");
                let mut result = AgentResult::from_text(last_text);
                result.escalate = escalate;
                result.budget_exhausted = true;
                return Ok(result);
            }
        }
    }

    /// Runs a sub-agent on the request the model passed it. Failures go back
    /// to the model as an error payload, like a failed tool call.
    fn delegate<'a>(
        &'a self,
        sub: &'a Arc<Agent>,
        call: &'a ToolCall,
        session: &'a Session,
        ctx: &'a RunContext,
    ) -> BoxFuture<'a, DispatchOutcome> {
        Box::pin(async move {
            let Some(request) = call.params.get("request").and_then(Value::as_str) else {
                let error = PipelineError::InvalidParameters {
                    tool: sub.name.clone(),
                    reason: "missing required string field 'request'".to_string(),
                };
                return DispatchOutcome {
                    payload: error_payload(&error),
                    escalate: false,
                    error: Some(error),
                };
            };

            tracing::info!(agent = %self.name, sub_agent = %sub.name, "Delegating to sub-agent");
            ctx.emit(
                "agent.delegated",
                json!({ "agent": self.name, "sub_agent": sub.name }),
            );
            ctx.record(&sub.name, NodeStatus::Running);
            match sub.invoke(request, session, ctx).await {
                Ok(result) => {
                    ctx.record(&sub.name, NodeStatus::Completed);
                    let answer = result
                        .structured
                        .or_else(|| result.text.map(Value::String))
                        .unwrap_or(Value::Null);
                    DispatchOutcome {
                        payload: json!({ "result": answer }),
                        escalate: result.escalate,
                        error: None,
                    }
                }
                Err(error) => {
                    ctx.record(&sub.name, NodeStatus::Failed);
                    DispatchOutcome {
                        payload: error_payload(&error),
                        escalate: false,
                        error: Some(error),
                    }
                }
            }
        })
    }

    async fn send(
        &self,
        model: &dyn Model,
        request: ModelRequest,
        ctx: &RunContext,
    ) -> Result<ModelResponse, PipelineError> {
        let timeout = ctx.config.model_timeout;
        tracing::debug!(agent = %self.name, model = model.name(), turns = request.turns.len(), "Calling model");
        match tokio::time::timeout(timeout, model.send(request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(source)) => Err(PipelineError::Model {
                agent: self.name.clone(),
                source,
            }),
            Err(_) => Err(PipelineError::Model {
                agent: self.name.clone(),
                source: ModelError::Timeout(timeout),
            }),
        }
    }

    async fn run_tool(
        &self,
        tool: &ToolDescriptor,
        input: &str,
        session: &Session,
        ctx: &RunContext,
    ) -> Result<AgentResult, PipelineError> {
        let params = params_from_message(tool, input)?;
        validate_params(tool, &params)?;

        let timeout = ctx.config.tool_timeout;
        let output = tokio::time::timeout(timeout, tool.handler.call(params, session.state()))
            .await
            .map_err(|_| PipelineError::Timeout {
                operation: format!("tool '{}'", tool.name),
                after: timeout,
            })?;

        let value = output.result.map_err(|message| PipelineError::ToolFailed {
            tool: tool.name.clone(),
            message,
        })?;
        let text = match &value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        Ok(AgentResult {
            text: Some(text),
            structured: Some(value),
            escalate: output.escalate,
            budget_exhausted: false,
        })
    }

    fn write_output(&self, key: &str, result: &AgentResult, session: &Session) {
        let value = match &self.capability {
            Capability::Llm { .. } => result.text.clone().map(Value::String),
            Capability::Tool(_) => result.structured.clone(),
        };
        if let Some(value) = value {
            tracing::debug!(agent = %self.name, key = key, "Writing output key");
            session.state().write(key, value);
        }
    }
}

fn delegation_spec(sub: &Agent) -> ToolSpec {
    let description = if sub.description.is_empty() {
        format!("Hand a request to the '{}' agent.", sub.name)
    } else {
        sub.description.clone()
    };
    ToolSpec {
        name: sub.name.clone(),
        description,
        parameters: json!({
            "type": "object",
            "properties": {
                "request": {
                    "type": "string",
                    "description": "What the agent should do, in plain language."
                }
            },
            "required": ["request"],
            "additionalProperties": false
        }),
    }
}

/// Turns the incoming message into tool parameters: a JSON object message is
/// used as-is, a single-field schema binds the raw message to that field, and
/// an empty schema ignores the message.
pub fn params_from_message(
    tool: &ToolDescriptor,
    input: &str,
) -> Result<Map<String, Value>, PipelineError> {
    match tool.input_schema.as_slice() {
        [] => Ok(Map::new()),
        fields => {
            if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(input.trim()) {
                return Ok(map);
            }
            match fields {
                [field] => {
                    let value = match field.kind {
                        FieldType::String | FieldType::Any => Value::String(input.to_string()),
                        _ => serde_json::from_str::<Value>(input.trim())
                            .unwrap_or_else(|_| Value::String(input.to_string())),
                    };
                    let mut params = Map::new();
                    params.insert(field.name.clone(), value);
                    Ok(params)
                }
                _ => Err(PipelineError::InvalidParameters {
                    tool: tool.name.clone(),
                    reason: "tool agent input must be a JSON object when the tool takes several fields"
                        .to_string(),
                }),
            }
        }
    }
}

pub struct LlmAgentBuilder {
    name: String,
    description: String,
    instruction: String,
    model: Option<Arc<dyn Model>>,
    tools: Vec<ToolDescriptor>,
    sub_agents: Vec<Arc<Agent>>,
    max_tool_calls: usize,
    output_key: Option<String>,
}

impl LlmAgentBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            instruction: String::new(),
            model: None,
            tools: Vec::new(),
            sub_agents: Vec::new(),
            max_tool_calls: DEFAULT_MAX_TOOL_CALLS,
            output_key: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = instruction.into();
        self
    }

    pub fn model(mut self, model: Arc<dyn Model>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn tool(mut self, tool: ToolDescriptor) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn tools(mut self, tools: impl IntoIterator<Item = ToolDescriptor>) -> Self {
        self.tools.extend(tools);
        self
    }

    pub fn sub_agent(mut self, agent: impl Into<Arc<Agent>>) -> Self {
        self.sub_agents.push(agent.into());
        self
    }

    pub fn sub_agents(mut self, agents: impl IntoIterator<Item = Arc<Agent>>) -> Self {
        self.sub_agents.extend(agents);
        self
    }

    pub fn max_tool_calls(mut self, max_tool_calls: usize) -> Self {
        self.max_tool_calls = max_tool_calls.max(1);
        self
    }

    pub fn output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = Some(key.into());
        self
    }

    pub fn build(self) -> Result<Agent, PipelineError> {
        validate_name(&self.name)?;
        let model = self.model.ok_or_else(|| {
            PipelineError::InvalidPipeline(format!("agent '{}' has no model", self.name))
        })?;
        let mut tools = ToolSet::new();
        for tool in self.tools {
            tools.insert(tool)?;
        }
        let mut offered = tools.names();
        for sub in &self.sub_agents {
            if sub.name == self.name || offered.contains(&sub.name) {
                return Err(PipelineError::InvalidPipeline(format!(
                    "agent '{}': sub-agent '{}' clashes with another tool or agent name",
                    self.name, sub.name
                )));
            }
            offered.push(sub.name.clone());
        }
        Ok(Agent {
            name: self.name,
            description: self.description,
            instruction: self.instruction,
            capability: Capability::Llm {
                model,
                tools,
                max_tool_calls: self.max_tool_calls,
                sub_agents: self.sub_agents,
            },
            output_key: self.output_key,
        })
    }
}

pub struct ToolAgentBuilder {
    name: String,
    description: String,
    instruction: String,
    tool: Option<ToolDescriptor>,
    output_key: Option<String>,
}

impl ToolAgentBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            instruction: String::new(),
            tool: None,
            output_key: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = instruction.into();
        self
    }

    pub fn tool(mut self, tool: ToolDescriptor) -> Self {
        self.tool = Some(tool);
        self
    }

    pub fn output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = Some(key.into());
        self
    }

    pub fn build(self) -> Result<Agent, PipelineError> {
        validate_name(&self.name)?;
        let tool = self.tool.ok_or_else(|| {
            PipelineError::InvalidPipeline(format!("tool agent '{}' has no tool bound", self.name))
        })?;
        Ok(Agent {
            name: self.name,
            description: self.description,
            instruction: self.instruction,
            capability: Capability::Tool(tool),
            output_key: self.output_key,
        })
    }
}

fn validate_name(name: &str) -> Result<(), PipelineError> {
    if name.trim().is_empty() {
        return Err(PipelineError::InvalidPipeline(
            "agent name cannot be empty".to_string(),
        ));
    }
    Ok(())
}
