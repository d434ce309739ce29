use std::sync::Arc;

use crate::agent::{LlmAgentBuilder, ToolAgentBuilder};
use crate::cli::WorkflowMode;
use crate::error::PipelineError;
use crate::model::Model;
use crate::node::Node;
use crate::prompts;
use crate::tools::clock::current_time_tool;
use crate::tools::control::exit_loop_tool;
use crate::tools::network_info::network_info_tool;
use crate::tools::system_info::system_info_tool;
use crate::tools::web::{WebToolsConfig, scrape_pages_tool, web_search_tool};

/// Settings the built-in workflows take from the resolved runtime config.
#[derive(Debug, Clone, Copy)]
pub struct WorkflowSettings {
    pub max_iterations: u32,
    pub max_tool_calls: usize,
}

pub fn build_workflow(
    mode: WorkflowMode,
    model: Arc<dyn Model>,
    settings: WorkflowSettings,
) -> Result<Node, PipelineError> {
    match mode {
        WorkflowMode::Single => build_single_workflow(model, settings),
        WorkflowMode::Sequential => build_sequential_workflow(model, settings),
        WorkflowMode::Parallel => build_parallel_workflow(model, settings),
        WorkflowMode::Loop => build_loop_workflow(model, settings),
        WorkflowMode::Team => build_team_workflow(model, settings),
    }
}

fn build_single_workflow(model: Arc<dyn Model>, settings: WorkflowSettings) -> Result<Node, PipelineError> {
    let assistant = LlmAgentBuilder::new("assistant")
        .description("General assistant with local machine tools.")
        .instruction(prompts::ASSISTANT)
        .model(model)
        .tools([current_time_tool(), system_info_tool(), network_info_tool()])
        .max_tool_calls(settings.max_tool_calls)
        .build()?;
    Ok(Node::from(assistant))
}

fn build_sequential_workflow(
    model: Arc<dyn Model>,
    settings: WorkflowSettings,
) -> Result<Node, PipelineError> {
    let web = WebToolsConfig::from_env();

    let query_agent = LlmAgentBuilder::new("query_generation_agent")
        .description("Turns the question into a web search query.")
        .instruction(prompts::QUERY_GENERATION)
        .model(model.clone())
        .max_tool_calls(settings.max_tool_calls)
        .output_key("generated_query")
        .build()?;

    let search_agent = LlmAgentBuilder::new("web_search_agent")
        .description("Searches the web for the generated query.")
        .instruction(prompts::WEB_SEARCH)
        .model(model.clone())
        .tool(web_search_tool(web.clone()))
        .max_tool_calls(settings.max_tool_calls)
        .output_key("web_results")
        .build()?;

    let scrape_agent = LlmAgentBuilder::new("web_scrape_single_page_agent")
        .description("Scrapes the pages found by the search.")
        .instruction(prompts::WEB_SCRAPER)
        .model(model.clone())
        .tool(scrape_pages_tool(web))
        .max_tool_calls(settings.max_tool_calls)
        .output_key("scraped_pages")
        .build()?;

    let reviewer = LlmAgentBuilder::new("reviewer_agent")
        .description("Answers the question from the gathered material.")
        .instruction(prompts::RESEARCH_REVIEWER)
        .model(model)
        .max_tool_calls(settings.max_tool_calls)
        .output_key("overall_review_report")
        .build()?;

    Ok(Node::sequential(
        "sequential_agent",
        vec![
            query_agent.into(),
            search_agent.into(),
            scrape_agent.into(),
            reviewer.into(),
        ],
    ))
}

/// A manager that answers directly and delegates live lookups to its
/// sub-agents.
fn build_team_workflow(model: Arc<dyn Model>, settings: WorkflowSettings) -> Result<Node, PipelineError> {
    let time_agent = ToolAgentBuilder::new("get_current_time_agent")
        .description("Tells the current time.")
        .instruction(prompts::TIME_AGENT)
        .tool(current_time_tool())
        .output_key("current_time")
        .build()?;

    let search_agent = LlmAgentBuilder::new("web_search_agent")
        .description("Searches the web for information.")
        .instruction(prompts::SEARCH_AGENT)
        .model(model.clone())
        .tool(web_search_tool(WebToolsConfig::from_env()))
        .max_tool_calls(settings.max_tool_calls)
        .output_key("search_results")
        .build()?;

    let manager = LlmAgentBuilder::new("team_manager")
        .description("A team manager that can manage a team of agents.")
        .instruction(prompts::TEAM_MANAGER)
        .model(model)
        .sub_agent(time_agent)
        .sub_agent(search_agent)
        .max_tool_calls(settings.max_tool_calls)
        .build()?;
    Ok(Node::from(manager))
}

fn build_parallel_workflow(
    model: Arc<dyn Model>,
    settings: WorkflowSettings,
) -> Result<Node, PipelineError> {
    let system_agent = ToolAgentBuilder::new("system_info_agent")
        .description("Collects host system information.")
        .instruction(prompts::SYSTEM_INFO_AGENT)
        .tool(system_info_tool())
        .output_key("system_information")
        .build()?;

    let network_agent = ToolAgentBuilder::new("network_system_agent")
        .description("Collects host network information.")
        .instruction(prompts::NETWORK_INFO_AGENT)
        .tool(network_info_tool())
        .output_key("network_analysis_report")
        .build()?;

    let reviewer = LlmAgentBuilder::new("reviewer_agent")
        .description("Reviews the collected diagnostics.")
        .instruction(prompts::REVIEWER)
        .model(model)
        .max_tool_calls(settings.max_tool_calls)
        .build()?;

    Ok(Node::sequential(
        "system_diagnostics_pipeline",
        vec![
            Node::parallel(
                "diagnostics_collection",
                vec![system_agent.into(), network_agent.into()],
            ),
            reviewer.into(),
        ],
    ))
}

fn build_loop_workflow(model: Arc<dyn Model>, settings: WorkflowSettings) -> Result<Node, PipelineError> {
    let expert = LlmAgentBuilder::new("python_expert_agent")
        .description("Writes the first version of the code.")
        .instruction(prompts::PYTHON_EXPERT)
        .model(model.clone())
        .max_tool_calls(settings.max_tool_calls)
        .output_key("generated_code")
        .build()?;

    let reviewer = LlmAgentBuilder::new("python_reviewer_agent")
        .description("Reviews the code and exits the loop once it is acceptable.")
        .instruction(prompts::PYTHON_REVIEWER)
        .model(model.clone())
        .tool(exit_loop_tool())
        .max_tool_calls(settings.max_tool_calls)
        .output_key("review_comments")
        .build()?;

    let refiner = LlmAgentBuilder::new("python_refiner_agent")
        .description("Applies review comments to the code.")
        .instruction(prompts::PYTHON_REFINER)
        .model(model)
        .max_tool_calls(settings.max_tool_calls)
        .output_key("generated_code")
        .build()?;

    Ok(Node::sequential(
        "code_refinement_pipeline",
        vec![
            expert.into(),
            Node::looped(
                "refinement_loop",
                Node::sequential("review_and_refine", vec![reviewer.into(), refiner.into()]),
                settings.max_iterations,
            ),
        ],
    ))
}
