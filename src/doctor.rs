use anyhow::Result;

use crate::catalog::load_catalog;
use crate::cli::SessionBackend;
use crate::config::{RuntimeConfig, display_session_db_url};
use crate::provider::{detect_provider, env_present};
use crate::session::open_sqlite_session_store;

pub async fn run_doctor(cfg: &RuntimeConfig) -> Result<()> {
    println!(
        "Active profile: '{}' (config: {})",
        cfg.profile, cfg.config_path
    );

    let checks = [
        ("OPENAI_API_KEY", env_present("OPENAI_API_KEY")),
        ("OLLAMA_HOST", env_present("OLLAMA_HOST")),
    ];

    println!("Provider environment check:");
    for (key, ok) in checks {
        let status = if ok { "set" } else { "missing" };
        println!("- {key}: {status}");
    }

    match detect_provider() {
        Some(provider) => println!("Auto provider resolution: {}", provider.label()),
        None => {
            println!("Auto provider resolution: none");
            println!("Tip: export OPENAI_API_KEY, set OLLAMA_HOST, or run with --provider echo");
        }
    }

    let web_key = env_present("SERPER_API_KEY") || env_present("SCRAPER_API_KEY");
    println!(
        "Web tools (web_search, scrape_pages): {}",
        if web_key { "API key set" } else { "SERPER_API_KEY missing" }
    );

    println!(
        "Session backend: {:?} (session_id: {}, app: {}, user: {})",
        cfg.session_backend, cfg.session_id, cfg.app_name, cfg.user_id
    );
    println!(
        "Limits: model_timeout_secs={} tool_timeout_secs={} max_tool_calls={} max_iterations={}",
        cfg.model_timeout_secs, cfg.tool_timeout_secs, cfg.max_tool_calls, cfg.max_iterations
    );
    println!(
        "Telemetry: enabled={} path={}",
        cfg.telemetry_enabled, cfg.telemetry_path
    );

    let catalog = load_catalog(&cfg.catalog_path)?;
    println!(
        "Pipeline catalog: {} (agents={}, pipelines={})",
        cfg.catalog_path,
        catalog.agents.len(),
        catalog.pipelines.len()
    );

    if matches!(cfg.session_backend, SessionBackend::Sqlite) {
        let _store = open_sqlite_session_store(&cfg.session_db_url).await?;
        println!(
            "SQLite session DB check: ok ({})",
            display_session_db_url(cfg)
        );
    }

    Ok(())
}

pub async fn run_migrate(cfg: &RuntimeConfig) -> Result<()> {
    match cfg.session_backend {
        SessionBackend::Memory => {
            println!("Session backend is memory; no migration required.");
        }
        SessionBackend::Sqlite => {
            let _store = open_sqlite_session_store(&cfg.session_db_url).await?;
            println!(
                "SQLite migrations applied successfully: {}",
                display_session_db_url(cfg)
            );
        }
    }
    Ok(())
}
