use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Auto,
    Echo,
    Openai,
    Ollama,
}

impl Provider {
    pub fn label(self) -> &'static str {
        match self {
            Provider::Auto => "auto",
            Provider::Echo => "echo",
            Provider::Openai => "openai",
            Provider::Ollama => "ollama",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum WorkflowMode {
    Single,
    Sequential,
    Parallel,
    Loop,
    Team,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Subcommand)]
pub enum ProfileCommands {
    #[command(about = "List configured profiles and highlight the active profile")]
    List,
    #[command(about = "Show the active profile's resolved runtime settings")]
    Show,
}

#[derive(Debug, Subcommand)]
pub enum PipelineCommands {
    #[command(about = "List pipelines defined in the catalog")]
    List,
    #[command(about = "Show the node tree of one catalog pipeline")]
    Show {
        #[arg(long)]
        name: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum ToolCommands {
    #[command(about = "List built-in tools and their parameters")]
    List,
}

#[derive(Debug, Subcommand)]
pub enum SessionCommands {
    #[command(about = "List all sessions for the current app/user")]
    List,
    #[command(about = "Show the state of a specific session")]
    Show {
        #[arg(long)]
        session_id: Option<String>,
    },
    #[command(about = "Delete a session (requires --force)")]
    Delete {
        #[arg(long)]
        session_id: Option<String>,
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    #[command(
        about = "Prune old sessions, keeping N most recent (requires --force unless --dry-run)"
    )]
    Prune {
        #[arg(long, default_value_t = 20)]
        keep: usize,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        #[arg(long, default_value_t = false)]
        force: bool,
    },
}

#[derive(Debug, Subcommand)]
pub enum TelemetryCommands {
    #[command(about = "Summarize telemetry events from a JSONL stream")]
    Report {
        #[arg(long)]
        path: Option<String>,
        #[arg(long, default_value_t = 5000)]
        limit: usize,
    },
}

const CLI_EXAMPLES: &str = "Examples:\n\
  agent-pipeline --provider echo ask \"hello\"\n\
  agent-pipeline workflow sequential \"best rust web frameworks 2026\"\n\
  agent-pipeline workflow parallel \"Review this machine\"\n\
  agent-pipeline workflow loop --max-iterations 3 \"Write a function that parses ISO dates\"\n\
  agent-pipeline workflow team \"What time is it?\"\n\
  agent-pipeline --catalog-path pipelines.toml pipelines list\n\
  agent-pipeline run research \"Summarise the release notes\" --json\n\
  agent-pipeline chat --workflow sequential\n\
  agent-pipeline --session-backend sqlite sessions list\n\
  agent-pipeline --session-backend sqlite sessions prune --keep 20 --dry-run\n\
  agent-pipeline tools list\n\
  agent-pipeline telemetry report --limit 2000";

#[derive(Debug, Parser)]
#[command(name = "agent-pipeline")]
#[command(about = "Run agent pipelines (sequential, parallel, loop) over persistent sessions")]
#[command(after_long_help = CLI_EXAMPLES)]
pub struct Cli {
    #[arg(long, env = "PIPELINE_PROVIDER", value_enum, default_value_t = Provider::Auto)]
    pub provider: Provider,

    #[arg(long, env = "PIPELINE_MODEL")]
    pub model: Option<String>,

    #[arg(long, env = "PIPELINE_API_BASE")]
    pub api_base: Option<String>,

    #[arg(long, env = "PIPELINE_PROFILE", default_value = "default")]
    pub profile: String,

    #[arg(long, env = "PIPELINE_CONFIG", default_value = ".pipeline/config.toml")]
    pub config_path: String,

    #[arg(long, env = "PIPELINE_CATALOG")]
    pub catalog_path: Option<String>,

    #[arg(long, env = "PIPELINE_APP_NAME")]
    pub app_name: Option<String>,

    #[arg(long, env = "PIPELINE_USER_ID")]
    pub user_id: Option<String>,

    #[arg(long, env = "PIPELINE_SESSION_ID")]
    pub session_id: Option<String>,

    #[arg(long, env = "PIPELINE_SESSION_BACKEND", value_enum)]
    pub session_backend: Option<SessionBackend>,

    #[arg(long, env = "PIPELINE_SESSION_DB_URL")]
    pub session_db_url: Option<String>,

    #[arg(long, env = "PIPELINE_SHOW_SENSITIVE_CONFIG", default_value_t = false)]
    pub show_sensitive_config: bool,

    #[arg(long, env = "PIPELINE_MODEL_TIMEOUT_SECS")]
    pub model_timeout_secs: Option<u64>,

    #[arg(long, env = "PIPELINE_TOOL_TIMEOUT_SECS")]
    pub tool_timeout_secs: Option<u64>,

    #[arg(long, env = "PIPELINE_MAX_TOOL_CALLS")]
    pub max_tool_calls: Option<usize>,

    #[arg(long, env = "PIPELINE_MAX_ITERATIONS")]
    pub max_iterations: Option<u32>,

    #[arg(long, env = "PIPELINE_TELEMETRY_ENABLED", action = clap::ArgAction::Set)]
    pub telemetry_enabled: Option<bool>,

    #[arg(long, env = "PIPELINE_TELEMETRY_PATH")]
    pub telemetry_path: Option<String>,

    #[arg(long, env = "RUST_LOG", default_value = "error")]
    pub log_filter: String,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(about = "Run a one-shot prompt through the single-agent workflow")]
    Ask {
        #[arg(required = true)]
        prompt: Vec<String>,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    #[command(about = "Run a built-in workflow (single, sequential, parallel, loop, team) for a prompt")]
    Workflow {
        #[arg(value_enum)]
        mode: WorkflowMode,
        #[arg(required = true)]
        prompt: Vec<String>,
        #[arg(long)]
        max_iterations: Option<u32>,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    #[command(about = "Run a pipeline from the catalog for a prompt")]
    Run {
        pipeline: String,
        #[arg(required = true)]
        prompt: Vec<String>,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    #[command(about = "Run interactive chat mode over one session")]
    Chat {
        #[arg(long, value_enum, conflicts_with = "pipeline")]
        workflow: Option<WorkflowMode>,
        #[arg(long)]
        pipeline: Option<String>,
    },
    #[command(about = "Inspect the pipeline catalog")]
    Pipelines {
        #[command(subcommand)]
        command: PipelineCommands,
    },
    #[command(about = "Inspect built-in tools")]
    Tools {
        #[command(subcommand)]
        command: ToolCommands,
    },
    #[command(about = "Validate provider environment and session backend configuration")]
    Doctor,
    #[command(about = "Run session backend migrations (sqlite only)")]
    Migrate,
    #[command(about = "Inspect profile configuration and active resolved profile state")]
    Profiles {
        #[command(subcommand)]
        command: ProfileCommands,
    },
    #[command(about = "Manage session lifecycle (list/show/delete/prune)")]
    Sessions {
        #[command(subcommand)]
        command: SessionCommands,
    },
    #[command(about = "Telemetry utilities and reporting")]
    Telemetry {
        #[command(subcommand)]
        command: TelemetryCommands,
    },
}

pub fn workflow_mode_label(mode: WorkflowMode) -> &'static str {
    match mode {
        WorkflowMode::Single => "single",
        WorkflowMode::Sequential => "sequential",
        WorkflowMode::Parallel => "parallel",
        WorkflowMode::Loop => "loop",
        WorkflowMode::Team => "team",
    }
}

pub fn command_label(command: &Commands) -> String {
    match command {
        Commands::Ask { .. } => "ask".to_string(),
        Commands::Workflow { mode, .. } => format!("workflow.{}", workflow_mode_label(*mode)),
        Commands::Run { pipeline, .. } => format!("run.{pipeline}"),
        Commands::Chat { .. } => "chat".to_string(),
        Commands::Pipelines { command } => match command {
            PipelineCommands::List => "pipelines.list".to_string(),
            PipelineCommands::Show { .. } => "pipelines.show".to_string(),
        },
        Commands::Tools { command } => match command {
            ToolCommands::List => "tools.list".to_string(),
        },
        Commands::Doctor => "doctor".to_string(),
        Commands::Migrate => "migrate".to_string(),
        Commands::Profiles { command } => match command {
            ProfileCommands::List => "profiles.list".to_string(),
            ProfileCommands::Show => "profiles.show".to_string(),
        },
        Commands::Sessions { command } => match command {
            SessionCommands::List => "sessions.list".to_string(),
            SessionCommands::Show { .. } => "sessions.show".to_string(),
            SessionCommands::Delete { .. } => "sessions.delete".to_string(),
            SessionCommands::Prune { .. } => "sessions.prune".to_string(),
        },
        Commands::Telemetry { command } => match command {
            TelemetryCommands::Report { .. } => "telemetry.report".to_string(),
        },
    }
}
