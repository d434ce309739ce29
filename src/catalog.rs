//! Declarative pipelines loaded from a TOML catalog.
//!
//! ```toml
//! [agents.planner]
//! instruction = "Plan the work."
//! output_key = "plan"
//!
//! [agents.clock]
//! tool = "current_time"
//!
//! [agents.manager]
//! sub_agents = ["clock"]
//!
//! [pipelines.plan_then_time]
//! root = { sequential = ["planner", "clock"] }
//! ```
//!
//! Node tables take exactly one of `sequential`, `parallel` or `loop`; any
//! key that kind does not use is an error.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::agent::{Agent, LlmAgentBuilder, ToolAgentBuilder};
use crate::config::RuntimeConfig;
use crate::error::PipelineError;
use crate::model::{EchoModel, Model};
use crate::node::{LoopNode, Node, ParallelNode};
use crate::tool_policy::{filter_tools_by_policy, unmatched_exact_patterns};
use crate::tools::{build_builtin_tools, find_builtin_tool};

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CatalogFile {
    #[serde(default)]
    pub agents: BTreeMap<String, AgentSpec>,
    #[serde(default)]
    pub pipelines: BTreeMap<String, PipelineSpec>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentSpec {
    pub description: Option<String>,
    pub instruction: Option<String>,
    pub model: Option<String>,
    /// Wildcard patterns over built-in tool names.
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub deny_tools: Vec<String>,
    pub output_key: Option<String>,
    pub max_tool_calls: Option<usize>,
    /// Binds the agent to one tool and makes it deterministic.
    pub tool: Option<String>,
    /// Catalog agents this one may delegate to.
    #[serde(default)]
    pub sub_agents: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineSpec {
    pub description: Option<String>,
    pub root: NodeSpec,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "RawNodeSpec")]
pub enum NodeSpec {
    Agent(String),
    Sequential {
        name: Option<String>,
        sequential: Vec<NodeSpec>,
    },
    Parallel {
        name: Option<String>,
        parallel: Vec<NodeSpec>,
        output_key: Option<String>,
    },
    Loop {
        name: Option<String>,
        body: Box<NodeSpec>,
        max_iterations: Option<u32>,
        termination_key: Option<String>,
    },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawNodeSpec {
    Agent(String),
    Table(toml::Table),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SequentialTable {
    name: Option<String>,
    sequential: Vec<NodeSpec>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ParallelTable {
    name: Option<String>,
    parallel: Vec<NodeSpec>,
    output_key: Option<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct LoopTable {
    name: Option<String>,
    #[serde(rename = "loop")]
    body: Box<NodeSpec>,
    max_iterations: Option<u32>,
    termination_key: Option<String>,
}

const NODE_KINDS: [&str; 3] = ["sequential", "parallel", "loop"];

impl TryFrom<RawNodeSpec> for NodeSpec {
    type Error = String;

    fn try_from(raw: RawNodeSpec) -> Result<Self, Self::Error> {
        let table = match raw {
            RawNodeSpec::Agent(name) => return Ok(NodeSpec::Agent(name)),
            RawNodeSpec::Table(table) => table,
        };
        let kinds = NODE_KINDS
            .into_iter()
            .filter(|kind| table.contains_key(*kind))
            .collect::<Vec<_>>();
        let kind = match kinds.as_slice() {
            [kind] => *kind,
            [] => {
                return Err(format!(
                    "node table needs one of 'sequential', 'parallel' or 'loop' (found: {})",
                    table.keys().cloned().collect::<Vec<_>>().join(", ")
                ));
            }
            _ => return Err(format!("node table mixes {}", kinds.join(" and "))),
        };
        let allowed: &[&str] = match kind {
            "sequential" => &["name", "sequential"],
            "parallel" => &["name", "parallel", "output_key"],
            _ => &["name", "loop", "max_iterations", "termination_key"],
        };
        if let Some(unknown) = table.keys().find(|key| !allowed.contains(&key.as_str())) {
            return Err(format!(
                "unknown key '{unknown}' in {kind} node (expected {})",
                allowed.join(", ")
            ));
        }

        let value = toml::Value::Table(table);
        let spec = match kind {
            "sequential" => {
                let table: SequentialTable = value.try_into().map_err(|err| err.to_string())?;
                NodeSpec::Sequential {
                    name: table.name,
                    sequential: table.sequential,
                }
            }
            "parallel" => {
                let table: ParallelTable = value.try_into().map_err(|err| err.to_string())?;
                NodeSpec::Parallel {
                    name: table.name,
                    parallel: table.parallel,
                    output_key: table.output_key,
                }
            }
            _ => {
                let table: LoopTable = value.try_into().map_err(|err| err.to_string())?;
                NodeSpec::Loop {
                    name: table.name,
                    body: table.body,
                    max_iterations: table.max_iterations,
                    termination_key: table.termination_key,
                }
            }
        };
        Ok(spec)
    }
}

/// Resolves an agent's model. `None` asks for the configured default.
pub type ModelFactory<'a> = dyn Fn(Option<&str>) -> Result<Arc<dyn Model>> + 'a;

#[derive(Debug, Clone, Copy)]
pub struct AssemblyDefaults {
    pub max_iterations: u32,
    pub max_tool_calls: usize,
}

impl AssemblyDefaults {
    pub fn from_runtime(cfg: &RuntimeConfig) -> Self {
        Self {
            max_iterations: cfg.max_iterations,
            max_tool_calls: cfg.max_tool_calls,
        }
    }
}

pub fn load_catalog(path: &str) -> Result<CatalogFile> {
    let path = Path::new(path);
    if !path.exists() {
        return Ok(CatalogFile::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read pipeline catalog at '{}'", path.display()))?;
    parse_catalog(&content)
        .with_context(|| format!("invalid pipeline catalog in '{}'", path.display()))
}

pub fn parse_catalog(content: &str) -> Result<CatalogFile> {
    toml::from_str::<CatalogFile>(content).context(
        "check agent fields and node shapes (agent name, sequential, parallel, or loop)",
    )
}

struct Assembler<'a> {
    catalog: &'a CatalogFile,
    models: &'a ModelFactory<'a>,
    defaults: AssemblyDefaults,
    pipeline: &'a str,
    generated: usize,
}

impl Assembler<'_> {
    fn node_name(&mut self, explicit: &Option<String>, kind: &str) -> String {
        match explicit {
            Some(name) => name.clone(),
            None => {
                self.generated += 1;
                format!("{}_{}_{}", self.pipeline, kind, self.generated)
            }
        }
    }

    fn assemble(&mut self, spec: &NodeSpec) -> Result<Node, PipelineError> {
        match spec {
            NodeSpec::Agent(name) => Ok(Node::from(self.agent(name, &mut Vec::new())?)),
            NodeSpec::Sequential { name, sequential } => {
                let name = self.node_name(name, "sequential");
                let children = sequential
                    .iter()
                    .map(|child| self.assemble(child))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Node::sequential(name, children))
            }
            NodeSpec::Parallel {
                name,
                parallel,
                output_key,
            } => {
                let name = self.node_name(name, "parallel");
                let children = parallel
                    .iter()
                    .map(|child| self.assemble(child))
                    .collect::<Result<Vec<_>, _>>()?;
                let mut node = ParallelNode::new(name, children);
                if let Some(key) = output_key {
                    node = node.with_output_key(key.clone());
                }
                Ok(Node::from(node))
            }
            NodeSpec::Loop {
                name,
                body,
                max_iterations,
                termination_key,
            } => {
                let name = self.node_name(name, "loop");
                let body = self.assemble(body)?;
                let mut node = LoopNode::new(
                    name,
                    body,
                    max_iterations.unwrap_or(self.defaults.max_iterations),
                );
                if let Some(key) = termination_key {
                    node = node.with_termination_key(key.clone());
                }
                Ok(Node::from(node))
            }
        }
    }

    /// `chain` holds the agents currently being built through `sub_agents`.
    fn agent(&self, name: &str, chain: &mut Vec<String>) -> Result<Agent, PipelineError> {
        let spec = self.catalog.agents.get(name).ok_or_else(|| {
            PipelineError::InvalidPipeline(format!(
                "pipeline '{}' references unknown agent '{}'",
                self.pipeline, name
            ))
        })?;
        let invalid = |reason: String| PipelineError::InvalidPipeline(format!("agent '{name}': {reason}"));

        if let Some(tool_name) = &spec.tool {
            if !spec.tools.is_empty() || spec.model.is_some() || !spec.sub_agents.is_empty() {
                return Err(invalid(
                    "'tool' cannot be combined with 'tools', 'model' or 'sub_agents'".to_string(),
                ));
            }
            let tool = find_builtin_tool(tool_name).ok_or_else(|| PipelineError::UnknownTool {
                tool: tool_name.clone(),
            })?;
            let mut builder = ToolAgentBuilder::new(name)
                .description(spec.description.clone().unwrap_or_default())
                .instruction(spec.instruction.clone().unwrap_or_default())
                .tool(tool);
            if let Some(key) = &spec.output_key {
                builder = builder.output_key(key.clone());
            }
            return builder.build();
        }

        let tools = if spec.tools.is_empty() {
            Vec::new()
        } else {
            let available = build_builtin_tools();
            if let Some(missing) = unmatched_exact_patterns(&available, &spec.tools).first() {
                return Err(PipelineError::UnknownTool {
                    tool: (*missing).to_string(),
                });
            }
            let selected = filter_tools_by_policy(available, &spec.tools, &spec.deny_tools);
            if selected.is_empty() {
                return Err(invalid(format!(
                    "no tools matched [{}]",
                    spec.tools.join(", ")
                )));
            }
            selected
        };

        let model = (self.models)(spec.model.as_deref())
            .map_err(|err| invalid(format!("failed to resolve model: {err:#}")))?;

        chain.push(name.to_string());
        let mut sub_agents = Vec::with_capacity(spec.sub_agents.len());
        for sub in &spec.sub_agents {
            if chain.contains(sub) {
                return Err(invalid(format!(
                    "sub-agent cycle: {} -> {sub}",
                    chain.join(" -> ")
                )));
            }
            sub_agents.push(Arc::new(self.agent(sub, chain)?));
        }
        chain.pop();

        let mut builder = LlmAgentBuilder::new(name)
            .description(spec.description.clone().unwrap_or_default())
            .instruction(spec.instruction.clone().unwrap_or_default())
            .model(model)
            .tools(tools)
            .sub_agents(sub_agents)
            .max_tool_calls(spec.max_tool_calls.unwrap_or(self.defaults.max_tool_calls));
        if let Some(key) = &spec.output_key {
            builder = builder.output_key(key.clone());
        }
        builder.build()
    }
}

/// Builds and validates the node tree of one catalog pipeline.
pub fn assemble_pipeline(
    catalog: &CatalogFile,
    pipeline: &str,
    models: &ModelFactory<'_>,
    defaults: AssemblyDefaults,
) -> Result<Node, PipelineError> {
    let spec = catalog.pipelines.get(pipeline).ok_or_else(|| {
        let names = catalog.pipelines.keys().cloned().collect::<Vec<String>>();
        if names.is_empty() {
            PipelineError::InvalidPipeline(format!(
                "pipeline '{pipeline}' not found. No pipelines are defined yet."
            ))
        } else {
            PipelineError::InvalidPipeline(format!(
                "pipeline '{pipeline}' not found. Available pipelines: {}",
                names.join(", ")
            ))
        }
    })?;

    let mut assembler = Assembler {
        catalog,
        models,
        defaults,
        pipeline,
        generated: 0,
    };
    let root = assembler.assemble(&spec.root)?;
    root.validate()?;
    Ok(root)
}

pub fn run_pipelines_list(cfg: &RuntimeConfig) -> Result<()> {
    let catalog = load_catalog(&cfg.catalog_path)?;
    if catalog.pipelines.is_empty() {
        println!("No pipelines defined in '{}'.", cfg.catalog_path);
        return Ok(());
    }
    println!("Pipelines ({}):", cfg.catalog_path);
    for (name, spec) in &catalog.pipelines {
        match &spec.description {
            Some(description) => println!("- {name}: {description}"),
            None => println!("- {name}"),
        }
    }
    Ok(())
}

/// Prints the assembled tree. Models are placeholders so no provider is needed.
pub fn run_pipelines_show(cfg: &RuntimeConfig, name: &str) -> Result<()> {
    let catalog = load_catalog(&cfg.catalog_path)?;
    let placeholder = |model: Option<&str>| -> Result<Arc<dyn Model>> {
        Ok(Arc::new(EchoModel::new(model.unwrap_or("<provider-default>"))))
    };
    let root = assemble_pipeline(
        &catalog,
        name,
        &placeholder,
        AssemblyDefaults::from_runtime(cfg),
    )?;
    if let Some(description) = catalog
        .pipelines
        .get(name)
        .and_then(|spec| spec.description.as_deref())
    {
        println!("{name}: {description}");
    }
    print!("{}", root.render_tree());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"
        [agents.planner]
        instruction = "Plan: {topic?}"
        output_key = "plan"

        [agents.inspector]
        instruction = "Inspect the host."
        tools = ["*_info"]
        deny_tools = ["network_*"]
        max_tool_calls = 2

        [agents.clock]
        tool = "current_time"
        output_key = "now"

        [agents.critic]
        instruction = "Critique {plan}."
        model = "critic-model"
        tools = ["exit_loop"]

        [pipelines.review]
        description = "Plan, inspect in parallel, then iterate"

        [pipelines.review.root]
        sequential = [
            "planner",
            { parallel = ["inspector", "clock"], name = "gather" },
            { loop = "critic", max_iterations = 2, termination_key = "done" },
        ]

        [pipelines.broken]
        root = { sequential = ["planner", "ghost"] }
    "#;

    fn echo_factory(model: Option<&str>) -> Result<Arc<dyn Model>> {
        Ok(Arc::new(EchoModel::new(model.unwrap_or("default"))))
    }

    fn defaults() -> AssemblyDefaults {
        AssemblyDefaults {
            max_iterations: 5,
            max_tool_calls: 8,
        }
    }

    #[test]
    fn assembles_nested_tree_with_generated_names() {
        let catalog = parse_catalog(CATALOG).expect("catalog parses");
        let root = assemble_pipeline(&catalog, "review", &echo_factory, defaults())
            .expect("review assembles");
        let tree = root.render_tree();
        assert!(tree.starts_with("- review_sequential_1 [sequential]"));
        assert!(tree.contains("- gather [parallel]"));
        assert!(tree.contains("inspector [agent] llm model=default tools=[system_info]"));
        assert!(tree.contains("clock [agent] tool=current_time output_key=now"));
        assert!(tree.contains("max_iterations=2 termination_key=done"));
        assert!(tree.contains("critic [agent] llm model=critic-model tools=[exit_loop]"));
    }

    #[test]
    fn unknown_agents_and_tools_are_invalid() {
        let catalog = parse_catalog(CATALOG).expect("catalog parses");
        let err = assemble_pipeline(&catalog, "broken", &echo_factory, defaults())
            .expect_err("ghost is not defined");
        assert!(err.to_string().contains("unknown agent 'ghost'"));

        let catalog = parse_catalog(
            "[agents.a]\ntools = [\"weather\"]\n[pipelines.p]\nroot = \"a\"\n",
        )
        .expect("catalog parses");
        let err = assemble_pipeline(&catalog, "p", &echo_factory, defaults())
            .expect_err("weather is not a tool");
        assert_eq!(err.kind(), crate::error::ErrorKind::UnknownTool);
    }

    #[test]
    fn missing_pipeline_lists_available_names() {
        let catalog = parse_catalog(CATALOG).expect("catalog parses");
        let err = assemble_pipeline(&catalog, "nope", &echo_factory, defaults())
            .expect_err("nope is not defined");
        assert!(err.to_string().contains("Available pipelines: broken, review"));
    }

    #[test]
    fn misspelled_node_keys_are_rejected() {
        let err = parse_catalog(
            "[agents.a]\n[pipelines.p]\nroot = { loop = \"a\", max_iteration = 3 }\n",
        )
        .expect_err("max_iteration is a typo");
        assert!(format!("{err:#}").contains("unknown key 'max_iteration'"));

        let err = parse_catalog(
            "[agents.a]\n[pipelines.p]\nroot = { sequential = [\"a\"], termination_key = \"done\" }\n",
        )
        .expect_err("termination_key belongs to loops");
        assert!(format!("{err:#}").contains("unknown key 'termination_key'"));

        let err = parse_catalog(
            "[agents.a]\n[pipelines.p]\nroot = { sequential = [\"a\"], parallel = [\"a\"] }\n",
        )
        .expect_err("two kinds");
        assert!(format!("{err:#}").contains("mixes sequential and parallel"));
    }

    #[test]
    fn sub_agents_and_parallel_output_keys_assemble() {
        let catalog = parse_catalog(
            r#"
            [agents.clock]
            tool = "current_time"
            output_key = "now"

            [agents.manager]
            instruction = "Help the user."
            sub_agents = ["clock"]

            [agents.echo]
            output_key = "echoed"

            [pipelines.team]
            root = { parallel = ["manager", "echo"], name = "fan", output_key = "fan_results" }
            "#,
        )
        .expect("catalog parses");
        let root = assemble_pipeline(&catalog, "team", &echo_factory, defaults())
            .expect("team assembles");
        let tree = root.render_tree();
        assert!(tree.contains("- fan [parallel] output_key=fan_results"));
        assert!(tree.contains("manager [agent] llm model=default sub_agents=[clock]"));
    }

    #[test]
    fn sub_agent_cycles_and_tool_agent_delegation_are_invalid() {
        let catalog = parse_catalog(
            "[agents.a]\nsub_agents = [\"b\"]\n[agents.b]\nsub_agents = [\"a\"]\n\
             [pipelines.p]\nroot = \"a\"\n",
        )
        .expect("catalog parses");
        let err = assemble_pipeline(&catalog, "p", &echo_factory, defaults())
            .expect_err("a and b delegate to each other");
        assert!(err.to_string().contains("sub-agent cycle: a -> b -> a"));

        let catalog = parse_catalog(
            "[agents.a]\ntool = \"current_time\"\nsub_agents = [\"b\"]\n[agents.b]\n\
             [pipelines.p]\nroot = \"a\"\n",
        )
        .expect("catalog parses");
        assert!(assemble_pipeline(&catalog, "p", &echo_factory, defaults()).is_err());
    }

    #[test]
    fn unknown_agent_fields_are_rejected() {
        assert!(parse_catalog("[agents.a]\ntemperature = 0.2\n").is_err());
    }
}
