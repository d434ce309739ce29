//! Composite execution tree: agents wired into sequential, parallel and
//! bounded-loop nodes.
//!
//! Trees are immutable once built and can be executed any number of times.
//! Each node moves `Pending -> Running -> Completed | Failed` within a run and
//! every transition is appended to the run trace.

use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;

use futures::future::{BoxFuture, join_all};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::Instrument;

use crate::agent::{Agent, AgentResult, Capability};
use crate::error::{ErrorKind, PipelineError};
use crate::runner::RunContext;
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeTransition {
    pub node: String,
    pub status: NodeStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Completion {
    Completed,
    MaxIterationsReached,
}

/// One failed child of a parallel node that did not fail as a whole.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BranchFailure {
    pub branch: String,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct NodeSuccess {
    pub result: AgentResult,
    pub terminated_by: Completion,
    /// Last non-empty text produced anywhere along the executed path.
    pub last_text: Option<String>,
    pub partial_failures: Vec<BranchFailure>,
    /// Iterations run, for loop nodes.
    pub iterations: Option<u32>,
}

impl NodeSuccess {
    fn from_agent(result: AgentResult) -> Self {
        Self {
            last_text: result.text.clone(),
            result,
            terminated_by: Completion::Completed,
            partial_failures: Vec::new(),
            iterations: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeFailure {
    /// The innermost node that failed.
    pub node: String,
    pub error: PipelineError,
    pub last_text: Option<String>,
    pub partial_failures: Vec<BranchFailure>,
}

#[derive(Debug, Clone)]
pub struct SequentialNode {
    pub name: String,
    pub children: Vec<Node>,
}

#[derive(Debug, Clone)]
pub struct ParallelNode {
    pub name: String,
    pub children: Vec<Node>,
    /// State key for the per-branch result map. Defaults to the node name.
    pub output_key: Option<String>,
}

impl ParallelNode {
    pub fn new(name: impl Into<String>, children: Vec<Node>) -> Self {
        Self {
            name: name.into(),
            children,
            output_key: None,
        }
    }

    pub fn with_output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = Some(key.into());
        self
    }

    pub fn state_key(&self) -> &str {
        self.output_key.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone)]
pub struct LoopNode {
    pub name: String,
    pub body: Box<Node>,
    pub max_iterations: u32,
    pub termination_key: Option<String>,
}

impl LoopNode {
    pub fn new(name: impl Into<String>, body: Node, max_iterations: u32) -> Self {
        Self {
            name: name.into(),
            body: Box::new(body),
            max_iterations: max_iterations.max(1),
            termination_key: None,
        }
    }

    pub fn with_termination_key(mut self, key: impl Into<String>) -> Self {
        self.termination_key = Some(key.into());
        self
    }
}

#[derive(Debug, Clone)]
pub enum Node {
    Agent(Arc<Agent>),
    Sequential(SequentialNode),
    Parallel(ParallelNode),
    Loop(LoopNode),
}

impl From<Agent> for Node {
    fn from(agent: Agent) -> Self {
        Node::Agent(Arc::new(agent))
    }
}

impl From<ParallelNode> for Node {
    fn from(node: ParallelNode) -> Self {
        Node::Parallel(node)
    }
}

impl From<LoopNode> for Node {
    fn from(node: LoopNode) -> Self {
        Node::Loop(node)
    }
}

impl Node {
    pub fn sequential(name: impl Into<String>, children: Vec<Node>) -> Self {
        Node::Sequential(SequentialNode {
            name: name.into(),
            children,
        })
    }

    pub fn parallel(name: impl Into<String>, children: Vec<Node>) -> Self {
        Node::Parallel(ParallelNode::new(name, children))
    }

    pub fn looped(name: impl Into<String>, body: Node, max_iterations: u32) -> Self {
        Node::Loop(LoopNode::new(name, body, max_iterations))
    }

    pub fn name(&self) -> &str {
        match self {
            Node::Agent(agent) => &agent.name,
            Node::Sequential(node) => &node.name,
            Node::Parallel(node) => &node.name,
            Node::Loop(node) => &node.name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Node::Agent(_) => "agent",
            Node::Sequential(_) => "sequential",
            Node::Parallel(_) => "parallel",
            Node::Loop(_) => "loop",
        }
    }

    pub fn children(&self) -> Vec<&Node> {
        match self {
            Node::Agent(_) => Vec::new(),
            Node::Sequential(node) => node.children.iter().collect(),
            Node::Parallel(node) => node.children.iter().collect(),
            Node::Loop(node) => vec![node.body.as_ref()],
        }
    }

    /// Pre-order traversal.
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a Node)) {
        visit(self);
        for child in self.children() {
            child.walk(visit);
        }
    }

    pub fn agents(&self) -> Vec<&Arc<Agent>> {
        let mut agents = Vec::new();
        self.walk(&mut |node| {
            if let Node::Agent(agent) = node {
                agents.push(agent);
            }
        });
        agents
    }

    /// State keys this subtree writes: agent output keys (delegates
    /// included) and parallel result maps.
    pub fn written_keys(&self) -> HashSet<String> {
        let mut keys = HashSet::new();
        self.walk(&mut |node| match node {
            Node::Agent(agent) => {
                for agent in std::iter::once(agent).chain(agent.delegates()) {
                    if let Some(key) = &agent.output_key {
                        keys.insert(key.clone());
                    }
                }
            }
            Node::Parallel(parallel) => {
                keys.insert(parallel.state_key().to_string());
            }
            _ => {}
        });
        keys
    }

    /// Rejects trees with duplicate node or agent names, empty composites,
    /// or parallel branches that write the same state key.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let mut seen = HashSet::new();
        let mut problem: Option<PipelineError> = None;
        self.walk(&mut |node| {
            if problem.is_some() {
                return;
            }
            let mut names = vec![node.name()];
            if let Node::Agent(agent) = node {
                names.extend(agent.delegates().into_iter().map(|sub| sub.name.as_str()));
            }
            if let Some(duplicate) = names.into_iter().find(|name| !seen.insert(name.to_string())) {
                problem = Some(PipelineError::InvalidPipeline(format!(
                    "node name '{duplicate}' is used more than once"
                )));
                return;
            }
            match node {
                Node::Sequential(SequentialNode { name, children })
                | Node::Parallel(ParallelNode { name, children, .. })
                    if children.is_empty() =>
                {
                    problem = Some(PipelineError::InvalidPipeline(format!(
                        "{} node '{}' has no children",
                        node.kind(),
                        name
                    )));
                }
                Node::Parallel(parallel) => {
                    if let Err(err) = check_parallel_output_keys(parallel) {
                        problem = Some(err);
                    }
                }
                _ => {}
            }
        });
        problem.map_or(Ok(()), Err)
    }

    pub fn execute<'a>(
        &'a self,
        input: &'a str,
        session: &'a Session,
        ctx: &'a RunContext,
    ) -> BoxFuture<'a, Result<NodeSuccess, NodeFailure>> {
        let span = tracing::info_span!("node", name = %self.name(), kind = self.kind());
        Box::pin(
            async move {
                ctx.record(self.name(), NodeStatus::Running);
                let outcome = match self {
                    Node::Agent(agent) => run_agent(agent, input, session, ctx).await,
                    Node::Sequential(node) => run_sequential(node, input, session, ctx).await,
                    Node::Parallel(node) => run_parallel(node, input, session, ctx).await,
                    Node::Loop(node) => run_loop(node, input, session, ctx).await,
                };
                let status = if outcome.is_ok() {
                    NodeStatus::Completed
                } else {
                    NodeStatus::Failed
                };
                ctx.record(self.name(), status);
                outcome
            }
            .instrument(span),
        )
    }

    /// Indented outline of the tree, one node per line.
    pub fn render_tree(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out, 0);
        out
    }

    fn render_into(&self, out: &mut String, depth: usize) {
        let indent = "  ".repeat(depth);
        let detail = match self {
            Node::Agent(agent) => {
                let mut detail = match &agent.capability {
                    Capability::Llm { model, tools, .. } => {
                        let names = tools.names();
                        if names.is_empty() {
                            format!("llm model={}", model.name())
                        } else {
                            format!("llm model={} tools=[{}]", model.name(), names.join(", "))
                        }
                    }
                    Capability::Tool(tool) => format!("tool={}", tool.name),
                };
                let delegates = agent
                    .sub_agents()
                    .iter()
                    .map(|sub| sub.name.as_str())
                    .collect::<Vec<_>>();
                if !delegates.is_empty() {
                    let _ = write!(detail, " sub_agents=[{}]", delegates.join(", "));
                }
                if let Some(key) = &agent.output_key {
                    let _ = write!(detail, " output_key={key}");
                }
                detail
            }
            Node::Parallel(node) => node
                .output_key
                .as_ref()
                .map(|key| format!("output_key={key}"))
                .unwrap_or_default(),
            Node::Loop(node) => match &node.termination_key {
                Some(key) => format!(
                    "max_iterations={} termination_key={key}",
                    node.max_iterations
                ),
                None => format!("max_iterations={}", node.max_iterations),
            },
            _ => String::new(),
        };
        let _ = writeln!(
            out,
            "{indent}- {} [{}] {}",
            self.name(),
            self.kind(),
            detail
        );
        for child in self.children() {
            child.render_into(out, depth + 1);
        }
    }
}

fn check_parallel_output_keys(node: &ParallelNode) -> Result<(), PipelineError> {
    let mut owners = BTreeMap::<String, String>::new();
    for branch in &node.children {
        for key in branch.written_keys() {
            if key == node.state_key() {
                return Err(PipelineError::InvalidPipeline(format!(
                    "parallel node '{}': branch '{}' writes '{}', which holds the branch results",
                    node.name,
                    branch.name(),
                    key
                )));
            }
            if let Some(owner) = owners.insert(key.clone(), branch.name().to_string()) {
                return Err(PipelineError::InvalidPipeline(format!(
                    "parallel node '{}': branches '{}' and '{}' both write output key '{}'",
                    node.name,
                    owner,
                    branch.name(),
                    key
                )));
            }
        }
    }
    Ok(())
}

async fn run_agent(
    agent: &Agent,
    input: &str,
    session: &Session,
    ctx: &RunContext,
) -> Result<NodeSuccess, NodeFailure> {
    agent
        .invoke(input, session, ctx)
        .await
        .map(NodeSuccess::from_agent)
        .map_err(|error| NodeFailure {
            node: agent.name.clone(),
            error,
            last_text: None,
            partial_failures: Vec::new(),
        })
}

/// Fail-fast chain; each child's text becomes the next child's input.
async fn run_sequential(
    node: &SequentialNode,
    input: &str,
    session: &Session,
    ctx: &RunContext,
) -> Result<NodeSuccess, NodeFailure> {
    let mut current_input = input.to_string();
    let mut last_result = AgentResult::default();
    let mut last_text: Option<String> = None;
    let mut escalate = false;
    let mut completion = Completion::Completed;
    let mut partial_failures = Vec::new();

    for child in &node.children {
        match child.execute(&current_input, session, ctx).await {
            Ok(success) => {
                if success.last_text.is_some() {
                    last_text = success.last_text;
                }
                if success.terminated_by == Completion::MaxIterationsReached {
                    completion = Completion::MaxIterationsReached;
                }
                escalate |= success.result.escalate;
                partial_failures.extend(success.partial_failures);
                if let Some(text) = &success.result.text {
                    current_input = text.clone();
                }
                last_result = success.result;
            }
            Err(mut failure) => {
                tracing::warn!(node = %node.name, child = %child.name(), "Sequential step failed; skipping remaining steps");
                if failure.last_text.is_none() {
                    failure.last_text = last_text;
                }
                partial_failures.append(&mut failure.partial_failures);
                failure.partial_failures = partial_failures;
                return Err(failure);
            }
        }
    }

    last_result.escalate = escalate;
    Ok(NodeSuccess {
        result: last_result,
        terminated_by: completion,
        last_text,
        partial_failures,
        iterations: None,
    })
}

/// Runs every child on the same input and waits for all of them.
async fn run_parallel(
    node: &ParallelNode,
    input: &str,
    session: &Session,
    ctx: &RunContext,
) -> Result<NodeSuccess, NodeFailure> {
    let outcomes = join_all(
        node.children
            .iter()
            .map(|child| child.execute(input, session, ctx)),
    )
    .await;

    let mut branches = Map::new();
    let mut partial_failures = Vec::new();
    let mut failed = 0usize;
    let mut escalate = false;
    let mut completion = Completion::Completed;
    let mut last_text: Option<String> = None;

    for (child, outcome) in node.children.iter().zip(outcomes) {
        match outcome {
            Ok(success) => {
                escalate |= success.result.escalate;
                if success.terminated_by == Completion::MaxIterationsReached {
                    completion = Completion::MaxIterationsReached;
                }
                if success.last_text.is_some() {
                    last_text = success.last_text;
                }
                partial_failures.extend(success.partial_failures);
                let mut entry = json!({ "status": "completed", "text": success.result.text });
                if let Some(structured) = success.result.structured {
                    entry["output"] = structured;
                }
                branches.insert(child.name().to_string(), entry);
            }
            Err(failure) => {
                failed += 1;
                partial_failures.extend(failure.partial_failures);
                partial_failures.push(BranchFailure {
                    branch: child.name().to_string(),
                    kind: failure.error.kind(),
                    message: failure.error.to_string(),
                });
                branches.insert(
                    child.name().to_string(),
                    json!({
                        "status": "failed",
                        "kind": failure.error.kind().label(),
                        "error": failure.error.to_string(),
                    }),
                );
            }
        }
    }

    session
        .state()
        .write(node.state_key(), Value::Object(branches.clone()));

    if failed == node.children.len() {
        return Err(NodeFailure {
            node: node.name.clone(),
            error: PipelineError::AllBranchesFailed {
                node: node.name.clone(),
                failures: failed,
            },
            last_text: None,
            partial_failures,
        });
    }
    if failed > 0 {
        tracing::warn!(node = %node.name, failed, total = node.children.len(), "Parallel node completed with failed branches");
    }

    Ok(NodeSuccess {
        result: AgentResult {
            text: None,
            structured: Some(Value::Object(branches)),
            escalate,
            budget_exhausted: false,
        },
        terminated_by: completion,
        last_text,
        partial_failures,
        iterations: None,
    })
}

/// Re-runs the body until it escalates, the termination key turns truthy, or
/// the iteration cap is hit. Escalation stops here and is not passed upward.
/// Escalation is checked after the whole body has run, so later steps of the
/// body still run in the iteration that escalates.
async fn run_loop(
    node: &LoopNode,
    input: &str,
    session: &Session,
    ctx: &RunContext,
) -> Result<NodeSuccess, NodeFailure> {
    if let Some(key) = &node.termination_key {
        session.state().remove(key);
    }

    let mut current_input = input.to_string();
    let mut last_result = AgentResult::default();
    let mut last_text: Option<String> = None;
    let mut partial_failures = Vec::new();
    let mut nested_cap_hit = false;

    for iteration in 1..=node.max_iterations {
        tracing::debug!(node = %node.name, iteration, "Loop iteration");
        match node.body.execute(&current_input, session, ctx).await {
            Ok(success) => {
                if success.last_text.is_some() {
                    last_text = success.last_text;
                }
                nested_cap_hit |= success.terminated_by == Completion::MaxIterationsReached;
                partial_failures.extend(success.partial_failures);
                if let Some(text) = &success.result.text {
                    current_input = text.clone();
                }
                let signalled = success.result.escalate
                    || node
                        .termination_key
                        .as_deref()
                        .and_then(|key| session.state().get(key))
                        .is_some_and(|value| is_truthy(&value));
                last_result = success.result;
                last_result.escalate = false;

                if signalled {
                    tracing::info!(node = %node.name, iteration, "Loop terminated by escalation");
                    return Ok(NodeSuccess {
                        result: last_result,
                        terminated_by: if nested_cap_hit {
                            Completion::MaxIterationsReached
                        } else {
                            Completion::Completed
                        },
                        last_text,
                        partial_failures,
                        iterations: Some(iteration),
                    });
                }
            }
            Err(mut failure) => {
                tracing::warn!(node = %node.name, iteration, "Loop body failed");
                if failure.last_text.is_none() {
                    failure.last_text = last_text;
                }
                partial_failures.append(&mut failure.partial_failures);
                failure.partial_failures = partial_failures;
                return Err(failure);
            }
        }
    }

    tracing::warn!(node = %node.name, max_iterations = node.max_iterations, "Loop reached max iterations without converging");
    Ok(NodeSuccess {
        result: last_result,
        terminated_by: Completion::MaxIterationsReached,
        last_text,
        partial_failures,
        iterations: Some(node.max_iterations),
    })
}

pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}
