use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::filter::LevelFilter;

use agent_pipeline::catalog::{
    AssemblyDefaults, assemble_pipeline, load_catalog, run_pipelines_list, run_pipelines_show,
};
use agent_pipeline::chat::run_chat;
use agent_pipeline::cli::{
    Cli, Commands, PipelineCommands, ProfileCommands, SessionCommands, TelemetryCommands,
    ToolCommands, WorkflowMode, command_label, workflow_mode_label,
};
use agent_pipeline::config::{RuntimeConfig, load_profiles, resolve_runtime_config};
use agent_pipeline::doctor::{run_doctor, run_migrate};
use agent_pipeline::error::{categorize_error, format_cli_error};
use agent_pipeline::model::Model;
use agent_pipeline::node::Node;
use agent_pipeline::profiles::{run_profiles_list, run_profiles_show};
use agent_pipeline::provider::{build_model, resolve_model, resolve_provider};
use agent_pipeline::runner::{RunConfig, Runner, report_result};
use agent_pipeline::session::commands::{
    build_session_store, run_sessions_delete, run_sessions_list, run_sessions_prune,
    run_sessions_show,
};
use agent_pipeline::telemetry::{TelemetrySink, run_telemetry_report};
use agent_pipeline::tools::run_tools_list;
use agent_pipeline::workflow::{WorkflowSettings, build_workflow};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let show_sensitive = cli.show_sensitive_config;
    if let Err(err) = run_cli(cli).await {
        eprintln!("{}", format_cli_error(&err, show_sensitive));
        tracing::error!(category = %categorize_error(&err).code(), error = %err, "command failed");
        std::process::exit(1);
    }

    Ok(())
}

fn init_tracing(log_filter: &str) -> Result<()> {
    let level = log_filter
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_env_filter(log_filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing subscriber: {e}"))
}

async fn run_cli(cli: Cli) -> Result<()> {
    init_tracing(&cli.log_filter)?;
    let profiles = load_profiles(&cli.config_path)?;
    let cfg = resolve_runtime_config(&cli, &profiles)?;
    let label = cli
        .command
        .as_ref()
        .map(command_label)
        .unwrap_or_else(|| "chat".to_string());
    let telemetry = TelemetrySink::new(&cfg, label);

    let Some(command) = cli.command else {
        let root = workflow_root(&cfg, WorkflowMode::Single, None)?;
        let runner = build_runner(&cfg, &telemetry).await?;
        return run_chat(&cfg, &runner, &root, &telemetry).await;
    };

    match command {
        Commands::Ask { prompt, json } => {
            let root = workflow_root(&cfg, WorkflowMode::Single, None)?;
            run_once(&cfg, &telemetry, &root, &prompt.join(" "), json).await?;
        }
        Commands::Workflow {
            mode,
            prompt,
            max_iterations,
            json,
        } => {
            let root = workflow_root(&cfg, mode, max_iterations)?;
            run_once(&cfg, &telemetry, &root, &prompt.join(" "), json).await?;
        }
        Commands::Run {
            pipeline,
            prompt,
            json,
        } => {
            let root = catalog_root(&cfg, &pipeline)?;
            run_once(&cfg, &telemetry, &root, &prompt.join(" "), json).await?;
        }
        Commands::Chat { workflow, pipeline } => {
            let root = match pipeline {
                Some(name) => catalog_root(&cfg, &name)?,
                None => workflow_root(&cfg, workflow.unwrap_or(WorkflowMode::Single), None)?,
            };
            let runner = build_runner(&cfg, &telemetry).await?;
            run_chat(&cfg, &runner, &root, &telemetry).await?;
        }
        Commands::Pipelines { command } => match command {
            PipelineCommands::List => run_pipelines_list(&cfg)?,
            PipelineCommands::Show { name } => run_pipelines_show(&cfg, &name)?,
        },
        Commands::Tools { command } => match command {
            ToolCommands::List => run_tools_list(),
        },
        Commands::Doctor => {
            run_doctor(&cfg).await?;
        }
        Commands::Migrate => {
            run_migrate(&cfg).await?;
        }
        Commands::Profiles { command } => match command {
            ProfileCommands::List => run_profiles_list(&profiles, &cfg)?,
            ProfileCommands::Show => run_profiles_show(&cfg)?,
        },
        Commands::Sessions { command } => match command {
            SessionCommands::List => run_sessions_list(&cfg).await?,
            SessionCommands::Show { session_id } => run_sessions_show(&cfg, session_id).await?,
            SessionCommands::Delete { session_id, force } => {
                run_sessions_delete(&cfg, session_id, force).await?
            }
            SessionCommands::Prune {
                keep,
                dry_run,
                force,
            } => run_sessions_prune(&cfg, keep, dry_run, force).await?,
        },
        Commands::Telemetry { command } => match command {
            TelemetryCommands::Report { path, limit } => {
                run_telemetry_report(&cfg, path, limit)?;
            }
        },
    }

    Ok(())
}

fn workflow_root(cfg: &RuntimeConfig, mode: WorkflowMode, max_iterations: Option<u32>) -> Result<Node> {
    let (model, provider, model_name) = resolve_model(cfg)?;
    tracing::info!(
        provider = provider.label(),
        model = %model_name,
        workflow = workflow_mode_label(mode),
        "Using workflow"
    );
    let settings = WorkflowSettings {
        max_iterations: max_iterations.unwrap_or(cfg.max_iterations).max(1),
        max_tool_calls: cfg.max_tool_calls,
    };
    Ok(build_workflow(mode, model, settings)?)
}

/// Models are resolved per agent so pipelines made only of tool agents
/// need no provider.
fn catalog_root(cfg: &RuntimeConfig, pipeline: &str) -> Result<Node> {
    let catalog = load_catalog(&cfg.catalog_path)?;
    let models = |name: Option<&str>| -> Result<Arc<dyn Model>> {
        let provider = resolve_provider(cfg)?;
        let (model, model_name) = build_model(cfg, provider, name.or(cfg.model.as_deref()))?;
        tracing::info!(provider = provider.label(), model = %model_name, "Using model");
        Ok(model)
    };
    let root = assemble_pipeline(&catalog, pipeline, &models, AssemblyDefaults::from_runtime(cfg))?;
    tracing::info!(pipeline = pipeline, root = %root.name(), "Assembled catalog pipeline");
    Ok(root)
}

async fn build_runner(cfg: &RuntimeConfig, telemetry: &TelemetrySink) -> Result<Runner> {
    let store = build_session_store(cfg).await?;
    tracing::info!(backend = store.backend_name(), session = %cfg.session_id, "Using session store");
    Ok(Runner::new(cfg.app_name.clone(), store, RunConfig::from_runtime(cfg))
        .with_telemetry(telemetry.clone()))
}

async fn run_once(
    cfg: &RuntimeConfig,
    telemetry: &TelemetrySink,
    root: &Node,
    prompt: &str,
    json: bool,
) -> Result<()> {
    let runner = build_runner(cfg, telemetry).await?;
    let result = runner.run(root, &cfg.user_id, &cfg.session_id, prompt).await;
    report_result(root.name(), &result, json)
}
