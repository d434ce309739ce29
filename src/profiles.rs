use anyhow::Result;

use crate::config::{ProfilesFile, RuntimeConfig, display_session_db_url};

pub fn run_profiles_list(profiles: &ProfilesFile, cfg: &RuntimeConfig) -> Result<()> {
    let mut names = profiles.profiles.keys().cloned().collect::<Vec<String>>();
    if !names.iter().any(|name| name == "default") {
        names.push("default".to_string());
    }
    names.sort();

    println!("Configured profiles (active='{}'):", cfg.profile);
    for name in names {
        let marker = if name == cfg.profile { "*" } else { " " };
        let source = if profiles.profiles.contains_key(&name) {
            "configured"
        } else {
            "implicit"
        };
        println!("{marker} {name} ({source})");
    }

    Ok(())
}

pub fn run_profiles_show(cfg: &RuntimeConfig) -> Result<()> {
    println!("Active profile: {}", cfg.profile);
    println!("Config path: {}", cfg.config_path);
    println!("Provider: {}", cfg.provider.label());
    println!(
        "Model: {}",
        cfg.model.as_deref().unwrap_or("<provider-default>")
    );
    println!(
        "API base: {}",
        cfg.api_base.as_deref().unwrap_or("<provider-default>")
    );
    println!("App: {}", cfg.app_name);
    println!("User: {}", cfg.user_id);
    println!("Session ID: {}", cfg.session_id);
    println!("Session backend: {:?}", cfg.session_backend);
    println!("Session DB URL: {}", display_session_db_url(cfg));
    println!("Model timeout (secs): {}", cfg.model_timeout_secs);
    println!("Tool timeout (secs): {}", cfg.tool_timeout_secs);
    println!("Max tool calls per agent: {}", cfg.max_tool_calls);
    println!("Loop max iterations: {}", cfg.max_iterations);
    println!("Pipeline catalog: {}", cfg.catalog_path);
    println!("Telemetry enabled: {}", cfg.telemetry_enabled);
    println!("Telemetry path: {}", cfg.telemetry_path);
    Ok(())
}
