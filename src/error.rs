use std::time::Duration;

use serde::Serialize;

use crate::model::ModelError;

/// Failure taxonomy of the orchestration core.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PipelineError {
    #[error("agent '{agent}' instruction references '{{{placeholder}}}' but session state has no such key")]
    Template { agent: String, placeholder: String },

    #[error("tool '{tool}' is not declared for this agent")]
    UnknownTool { tool: String },

    #[error("invalid parameters for tool '{tool}': {reason}")]
    InvalidParameters { tool: String, reason: String },

    #[error("agent '{agent}' exhausted its tool-call budget of {budget}")]
    ToolCallBudgetExceeded { agent: String, budget: usize },

    #[error("tool '{tool}' failed: {message}")]
    ToolFailed { tool: String, message: String },

    #[error("model call for agent '{agent}' failed: {source}")]
    Model {
        agent: String,
        #[source]
        source: ModelError,
    },

    #[error("{operation} timed out after {}s", .after.as_secs_f64())]
    Timeout { operation: String, after: Duration },

    #[error("session '{session_id}' not found for app '{app_name}' and user '{user_id}'")]
    SessionNotFound {
        app_name: String,
        user_id: String,
        session_id: String,
    },

    #[error("session '{session_id}' already exists for app '{app_name}' and user '{user_id}'")]
    SessionAlreadyExists {
        app_name: String,
        user_id: String,
        session_id: String,
    },

    #[error("session state has no key '{key}'")]
    KeyMissing { key: String },

    #[error("session storage error: {0}")]
    Storage(String),

    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("every branch of parallel node '{node}' failed ({failures} failures)")]
    AllBranchesFailed { node: String, failures: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TemplateError,
    UnknownTool,
    InvalidParameters,
    ToolCallBudgetExceeded,
    ToolFailed,
    ModelError,
    Timeout,
    SessionNotFound,
    SessionAlreadyExists,
    KeyMissing,
    Storage,
    InvalidPipeline,
    AllBranchesFailed,
}

impl ErrorKind {
    pub fn label(self) -> &'static str {
        match self {
            ErrorKind::TemplateError => "template_error",
            ErrorKind::UnknownTool => "unknown_tool",
            ErrorKind::InvalidParameters => "invalid_parameters",
            ErrorKind::ToolCallBudgetExceeded => "tool_call_budget_exceeded",
            ErrorKind::ToolFailed => "tool_failed",
            ErrorKind::ModelError => "model_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::SessionNotFound => "session_not_found",
            ErrorKind::SessionAlreadyExists => "session_already_exists",
            ErrorKind::KeyMissing => "key_missing",
            ErrorKind::Storage => "storage",
            ErrorKind::InvalidPipeline => "invalid_pipeline",
            ErrorKind::AllBranchesFailed => "all_branches_failed",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Template { .. } => ErrorKind::TemplateError,
            PipelineError::UnknownTool { .. } => ErrorKind::UnknownTool,
            PipelineError::InvalidParameters { .. } => ErrorKind::InvalidParameters,
            PipelineError::ToolCallBudgetExceeded { .. } => ErrorKind::ToolCallBudgetExceeded,
            PipelineError::ToolFailed { .. } => ErrorKind::ToolFailed,
            PipelineError::Model {
                source: ModelError::Timeout(_),
                ..
            } => ErrorKind::Timeout,
            PipelineError::Model { .. } => ErrorKind::ModelError,
            PipelineError::Timeout { .. } => ErrorKind::Timeout,
            PipelineError::SessionNotFound { .. } => ErrorKind::SessionNotFound,
            PipelineError::SessionAlreadyExists { .. } => ErrorKind::SessionAlreadyExists,
            PipelineError::KeyMissing { .. } => ErrorKind::KeyMissing,
            PipelineError::Storage(_) => ErrorKind::Storage,
            PipelineError::InvalidPipeline(_) => ErrorKind::InvalidPipeline,
            PipelineError::AllBranchesFailed { .. } => ErrorKind::AllBranchesFailed,
        }
    }

    pub fn storage(err: impl std::fmt::Display) -> Self {
        PipelineError::Storage(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Provider,
    Session,
    Tooling,
    Pipeline,
    Input,
    Internal,
}

impl ErrorCategory {
    pub fn code(self) -> &'static str {
        match self {
            ErrorCategory::Provider => "PROVIDER",
            ErrorCategory::Session => "SESSION",
            ErrorCategory::Tooling => "TOOLING",
            ErrorCategory::Pipeline => "PIPELINE",
            ErrorCategory::Input => "INPUT",
            ErrorCategory::Internal => "INTERNAL",
        }
    }

    pub fn hint(self) -> &'static str {
        match self {
            ErrorCategory::Provider => {
                "Set OPENAI_API_KEY or OLLAMA_HOST, or run with --provider echo for an offline dry run."
            }
            ErrorCategory::Session => {
                "Check --session-backend/--session-db-url and run migrate for sqlite sessions."
            }
            ErrorCategory::Tooling => {
                "Review tool names and parameters; retry with RUST_LOG=info for tool dispatch logs."
            }
            ErrorCategory::Pipeline => {
                "Check the pipeline catalog: agent names, tool patterns and output keys must be consistent."
            }
            ErrorCategory::Input => "Run agent-pipeline --help and correct command arguments.",
            ErrorCategory::Internal => {
                "Retry with RUST_LOG=debug. If it persists, capture logs and open an issue."
            }
        }
    }
}

/// A pipeline run that ended with `TerminatedBy::Error`, lifted into the
/// CLI error path.
#[derive(Debug, Clone, thiserror::Error)]
#[error("pipeline '{pipeline}' failed with {kind}: {message}")]
pub struct RunFailed {
    pub pipeline: String,
    pub kind: ErrorKind,
    pub message: String,
}

pub fn category_for_kind(kind: ErrorKind) -> ErrorCategory {
    match kind {
        ErrorKind::ModelError | ErrorKind::Timeout => ErrorCategory::Provider,
        ErrorKind::SessionNotFound
        | ErrorKind::SessionAlreadyExists
        | ErrorKind::KeyMissing
        | ErrorKind::Storage => ErrorCategory::Session,
        ErrorKind::UnknownTool
        | ErrorKind::InvalidParameters
        | ErrorKind::ToolCallBudgetExceeded
        | ErrorKind::ToolFailed => ErrorCategory::Tooling,
        ErrorKind::TemplateError | ErrorKind::InvalidPipeline | ErrorKind::AllBranchesFailed => {
            ErrorCategory::Pipeline
        }
    }
}

pub fn categorize_error(err: &anyhow::Error) -> ErrorCategory {
    if let Some(pipeline_err) = err.downcast_ref::<PipelineError>() {
        return category_for_kind(pipeline_err.kind());
    }
    if let Some(failed) = err.downcast_ref::<RunFailed>() {
        return category_for_kind(failed.kind);
    }

    let msg = format!("{err:#}").to_ascii_lowercase();

    if msg.contains("api_key")
        || msg.contains("no provider could be auto-detected")
        || msg.contains("provider")
        || msg.contains("model call")
    {
        return ErrorCategory::Provider;
    }

    if msg.contains("--force")
        || msg.contains("destructive")
        || msg.contains("invalid value")
        || msg.contains("unknown argument")
        || msg.contains("failed to read input")
        || msg.contains("profile")
    {
        return ErrorCategory::Input;
    }

    if msg.contains("session") || msg.contains("sqlite") || msg.contains("migrat") {
        return ErrorCategory::Session;
    }

    if msg.contains("pipeline") || msg.contains("catalog") || msg.contains("template") {
        return ErrorCategory::Pipeline;
    }

    if msg.contains("tool") {
        return ErrorCategory::Tooling;
    }

    ErrorCategory::Internal
}

pub fn format_cli_error(err: &anyhow::Error, show_sensitive_config: bool) -> String {
    let category = categorize_error(err);
    let rendered_error = render_error_message(err, show_sensitive_config);
    format!(
        "[{}] {}\nHint: {}",
        category.code(),
        rendered_error,
        category.hint()
    )
}

pub fn render_error_message(err: &anyhow::Error, show_sensitive_config: bool) -> String {
    let text = format!("{err:#}");
    if show_sensitive_config {
        text
    } else {
        redact_sqlite_urls(&text)
    }
}

pub fn redact_sqlite_urls(text: &str) -> String {
    const SQLITE_PREFIX: &str = "sqlite:";
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0usize;

    while let Some(offset) = text[cursor..].find(SQLITE_PREFIX) {
        let start = cursor + offset;
        out.push_str(&text[cursor..start]);

        let remainder = &text[start..];
        let end = remainder
            .find(|ch: char| {
                ch.is_whitespace()
                    || matches!(
                        ch,
                        '"' | '\'' | '(' | ')' | '[' | ']' | '{' | '}' | ',' | ';'
                    )
            })
            .unwrap_or(remainder.len());
        out.push_str(&redact_sqlite_url_value(&remainder[..end]));
        cursor = start + end;
    }

    out.push_str(&text[cursor..]);
    out
}

pub fn redact_sqlite_url_value(value: &str) -> String {
    if value.starts_with("sqlite://") {
        "sqlite://[REDACTED]".to_string()
    } else if value.starts_with("sqlite:") {
        "sqlite:[REDACTED]".to_string()
    } else {
        value.to_string()
    }
}
