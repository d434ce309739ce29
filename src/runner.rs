use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::config::RuntimeConfig;
use crate::error::{ErrorKind, PipelineError, RunFailed};
use crate::node::{BranchFailure, Completion, Node, NodeStatus, NodeTransition};
use crate::session::{SessionKey, SessionStore};
use crate::telemetry::TelemetrySink;
use crate::tools::ToolDispatcher;

pub const NO_TEXTUAL_RESPONSE: &str = "No textual response produced by the agent.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunConfig {
    pub model_timeout: Duration,
    pub tool_timeout: Duration,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            model_timeout: Duration::from_secs(60),
            tool_timeout: Duration::from_secs(15),
        }
    }
}

impl RunConfig {
    pub fn from_runtime(cfg: &RuntimeConfig) -> Self {
        Self {
            model_timeout: Duration::from_secs(cfg.model_timeout_secs),
            tool_timeout: Duration::from_secs(cfg.tool_timeout_secs),
        }
    }
}

/// Per-run execution context shared by every node of one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub config: RunConfig,
    telemetry: Option<TelemetrySink>,
    trace: Arc<Mutex<Vec<NodeTransition>>>,
}

impl RunContext {
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            telemetry: None,
            trace: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_telemetry(mut self, telemetry: Option<TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn telemetry(&self) -> Option<&TelemetrySink> {
        self.telemetry.as_ref()
    }

    pub fn emit(&self, event: &str, payload: Value) {
        if let Some(sink) = &self.telemetry {
            sink.emit(event, payload);
        }
    }

    pub fn dispatcher(&self) -> ToolDispatcher {
        ToolDispatcher::new(self.config.tool_timeout)
    }

    pub fn record(&self, node: &str, status: NodeStatus) {
        tracing::debug!(node = node, status = ?status, "Node transition");
        let mut trace = self.trace.lock().unwrap_or_else(|e| e.into_inner());
        trace.push(NodeTransition {
            node: node.to_string(),
            status,
        });
    }

    pub fn trace(&self) -> Vec<NodeTransition> {
        self.trace.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TerminatedBy {
    Completed,
    MaxIterationsReached,
    Error { kind: ErrorKind, message: String },
}

impl From<Completion> for TerminatedBy {
    fn from(completion: Completion) -> Self {
        match completion {
            Completion::Completed => TerminatedBy::Completed,
            Completion::MaxIterationsReached => TerminatedBy::MaxIterationsReached,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub final_text: Option<String>,
    /// Structured output of the root node, e.g. the branch map of a root
    /// parallel node.
    pub final_structured: Option<Value>,
    pub final_state_snapshot: Map<String, Value>,
    pub terminated_by: TerminatedBy,
    pub partial_failures: Vec<BranchFailure>,
    pub trace: Vec<NodeTransition>,
}

impl PipelineResult {
    pub fn is_success(&self) -> bool {
        !matches!(self.terminated_by, TerminatedBy::Error { .. })
    }

    /// Succeeded, but some parallel branches failed along the way.
    pub fn is_partial(&self) -> bool {
        self.is_success() && !self.partial_failures.is_empty()
    }

    fn failed(err: &PipelineError) -> Self {
        Self {
            final_text: None,
            final_structured: None,
            final_state_snapshot: Map::new(),
            terminated_by: TerminatedBy::Error {
                kind: err.kind(),
                message: err.to_string(),
            },
            partial_failures: Vec::new(),
            trace: Vec::new(),
        }
    }
}

pub struct Runner {
    app_name: String,
    store: Arc<dyn SessionStore>,
    config: RunConfig,
    telemetry: Option<TelemetrySink>,
}

impl Runner {
    pub fn new(app_name: impl Into<String>, store: Arc<dyn SessionStore>, config: RunConfig) -> Self {
        Self {
            app_name: app_name.into(),
            store,
            config,
            telemetry: None,
        }
    }

    pub fn with_telemetry(mut self, telemetry: TelemetrySink) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Runs `root` against the session for `(app, user_id, session_id)`.
    /// Failures are reported through `terminated_by`, never as `Err`.
    pub async fn run(
        &self,
        root: &Node,
        user_id: &str,
        session_id: &str,
        message: &str,
    ) -> PipelineResult {
        let key = SessionKey::new(self.app_name.clone(), user_id, session_id);
        self.emit(
            "pipeline.started",
            json!({ "pipeline": root.name(), "session": key.to_string() }),
        );

        let result = self.run_inner(root, &key, message).await;

        match &result.terminated_by {
            TerminatedBy::Error { kind, message } => {
                tracing::warn!(pipeline = %root.name(), kind = %kind, error = %message, "Pipeline failed");
                self.emit(
                    "pipeline.failed",
                    json!({ "pipeline": root.name(), "kind": kind.label() }),
                );
            }
            terminated_by => {
                tracing::info!(
                    pipeline = %root.name(),
                    terminated_by = ?terminated_by,
                    partial_failures = result.partial_failures.len(),
                    "Pipeline completed"
                );
                self.emit(
                    "pipeline.completed",
                    json!({
                        "pipeline": root.name(),
                        "max_iterations_reached": matches!(terminated_by, TerminatedBy::MaxIterationsReached),
                        "partial_failures": result.partial_failures.len(),
                    }),
                );
            }
        }
        result
    }

    async fn run_inner(&self, root: &Node, key: &SessionKey, message: &str) -> PipelineResult {
        if let Err(err) = root.validate() {
            return PipelineResult::failed(&err);
        }

        let session = match self.store.load_or_create(key, Map::new()).await {
            Ok(session) => session,
            Err(err) => return PipelineResult::failed(&err),
        };

        let ctx = RunContext::new(self.config).with_telemetry(self.telemetry.clone());
        root.walk(&mut |node| ctx.record(node.name(), NodeStatus::Pending));

        let outcome = root.execute(message, &session, &ctx).await;

        let (final_text, final_structured, mut terminated_by, partial_failures) = match outcome {
            Ok(success) => (
                success.result.text.or(success.last_text),
                success.result.structured,
                TerminatedBy::from(success.terminated_by),
                success.partial_failures,
            ),
            Err(failure) => (
                failure.last_text,
                None,
                TerminatedBy::Error {
                    kind: failure.error.kind(),
                    message: failure.error.to_string(),
                },
                failure.partial_failures,
            ),
        };

        if let Err(err) = self.store.save(&session).await {
            tracing::error!(session = %key, error = %err, "Failed to persist session state");
            terminated_by = TerminatedBy::Error {
                kind: err.kind(),
                message: err.to_string(),
            };
        }

        PipelineResult {
            final_text,
            final_structured,
            final_state_snapshot: session.state().snapshot(),
            terminated_by,
            partial_failures,
            trace: ctx.trace(),
        }
    }

    fn emit(&self, event: &str, payload: Value) {
        if let Some(sink) = &self.telemetry {
            sink.emit(event, payload);
        }
    }
}

/// Prints a run the way the CLI reports it: the final text (or the JSON
/// result) on stdout, non-convergence and branch failures on stderr. An
/// `Error` termination comes back as `RunFailed`.
pub fn report_result(pipeline: &str, result: &PipelineResult, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
    } else {
        match result.final_text.as_deref() {
            Some(text) => println!("{text}"),
            None if result.is_success() => println!("{NO_TEXTUAL_RESPONSE}"),
            None => {}
        }
    }

    if result.terminated_by == TerminatedBy::MaxIterationsReached {
        eprintln!("Warning: a loop reached its iteration limit without converging.");
    }
    for failure in &result.partial_failures {
        eprintln!(
            "Warning: branch '{}' failed ({}): {}",
            failure.branch, failure.kind, failure.message
        );
    }

    match &result.terminated_by {
        TerminatedBy::Error { kind, message } => Err(RunFailed {
            pipeline: pipeline.to_string(),
            kind: *kind,
            message: message.clone(),
        }
        .into()),
        _ => Ok(()),
    }
}
