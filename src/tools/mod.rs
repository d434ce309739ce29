pub mod clock;
pub mod control;
pub mod dispatch;
pub mod network_info;
pub mod system_info;
pub mod web;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::error::PipelineError;
use crate::model::ToolSpec;
use crate::session::SessionState;

pub use dispatch::ToolDispatcher;

pub const EXIT_LOOP_TOOL_NAME: &str = control::EXIT_LOOP_TOOL_NAME;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
    Any,
}

impl FieldType {
    pub fn label(self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Object => "object",
            FieldType::Array => "array",
            FieldType::Any => "any",
        }
    }

    pub fn accepts(self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
            FieldType::Any => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldType,
    pub required: bool,
    pub description: String,
}

impl FieldSpec {
    pub fn required(name: &str, kind: FieldType, description: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            required: true,
            description: description.to_string(),
        }
    }

    pub fn optional(name: &str, kind: FieldType, description: &str) -> Self {
        Self {
            required: false,
            ..Self::required(name, kind, description)
        }
    }
}

/// What a tool hands back: a value or an error message, plus whether the
/// tool asks the enclosing loop to stop.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub result: Result<Value, String>,
    pub escalate: bool,
}

impl ToolOutput {
    pub fn ok(value: Value) -> Self {
        Self {
            result: Ok(value),
            escalate: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            result: Err(message.into()),
            escalate: false,
        }
    }

    pub fn escalate(value: Value) -> Self {
        Self {
            result: Ok(value),
            escalate: true,
        }
    }

    /// Payload fed back to the model: `{"result": ..}` or `{"error": .., "kind": ..}`.
    pub fn payload(&self) -> Value {
        match &self.result {
            Ok(value) => json!({ "result": value }),
            Err(message) => json!({ "error": message, "kind": "tool_failed" }),
        }
    }
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, params: Map<String, Value>, state: &SessionState) -> ToolOutput;
}

/// Adapts an async closure into a [`ToolHandler`].
pub struct FunctionTool<F> {
    func: F,
}

impl<F> FunctionTool<F> {
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F, Fut> ToolHandler for FunctionTool<F>
where
    F: Fn(Map<String, Value>, SessionState) -> Fut + Send + Sync,
    Fut: Future<Output = ToolOutput> + Send,
{
    async fn call(&self, params: Map<String, Value>, state: &SessionState) -> ToolOutput {
        (self.func)(params, state.clone()).await
    }
}

#[derive(Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Vec<FieldSpec>,
    pub handler: Arc<dyn ToolHandler>,
}

impl fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.name)
            .field("input_schema", &self.input_schema)
            .finish_non_exhaustive()
    }
}

impl ToolDescriptor {
    pub fn new(name: &str, description: &str, handler: impl ToolHandler + 'static) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            input_schema: Vec::new(),
            handler: Arc::new(handler),
        }
    }

    pub fn from_fn<F, Fut>(name: &str, description: &str, func: F) -> Self
    where
        F: Fn(Map<String, Value>, SessionState) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ToolOutput> + Send + 'static,
    {
        Self::new(name, description, FunctionTool::new(func))
    }

    pub fn with_field(mut self, field: FieldSpec) -> Self {
        self.input_schema.push(field);
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.input_schema.iter().find(|field| field.name == name)
    }

    pub fn json_schema(&self) -> Value {
        let mut properties = Map::new();
        for field in &self.input_schema {
            let mut property = Map::new();
            if field.kind != FieldType::Any {
                property.insert("type".to_string(), json!(field.kind.label()));
            }
            if !field.description.is_empty() {
                property.insert("description".to_string(), json!(field.description));
            }
            properties.insert(field.name.clone(), Value::Object(property));
        }
        let required = self
            .input_schema
            .iter()
            .filter(|field| field.required)
            .map(|field| field.name.clone())
            .collect::<Vec<String>>();

        json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        })
    }

    pub fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.json_schema(),
        }
    }
}

/// Tools an agent declared, in declaration order. Names are unique.
#[derive(Debug, Clone, Default)]
pub struct ToolSet {
    tools: Vec<ToolDescriptor>,
}

impl ToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tool: ToolDescriptor) -> Result<(), PipelineError> {
        if self.get(&tool.name).is_some() {
            return Err(PipelineError::InvalidPipeline(format!(
                "tool '{}' is declared twice",
                tool.name
            )));
        }
        self.tools.push(tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.iter().find(|tool| tool.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.tools.iter()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|tool| tool.name.clone()).collect()
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(ToolDescriptor::spec).collect()
    }
}

pub fn build_builtin_tools() -> Vec<ToolDescriptor> {
    vec![
        control::exit_loop_tool(),
        clock::current_time_tool(),
        system_info::system_info_tool(),
        network_info::network_info_tool(),
        web::web_search_tool(web::WebToolsConfig::from_env()),
        web::scrape_pages_tool(web::WebToolsConfig::from_env()),
    ]
}

pub fn find_builtin_tool(name: &str) -> Option<ToolDescriptor> {
    build_builtin_tools()
        .into_iter()
        .find(|tool| tool.name == name)
}

pub fn run_tools_list() {
    println!("Built-in tools:");
    for tool in build_builtin_tools() {
        println!("- {}: {}", tool.name, tool.description);
        for field in &tool.input_schema {
            println!(
                "    {} ({}{})",
                field.name,
                field.kind.label(),
                if field.required { ", required" } else { "" }
            );
        }
    }
}
