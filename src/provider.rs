use clap::ValueEnum;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::cli::Provider;
use crate::config::RuntimeConfig;
use crate::model::openai::{OpenAiCompatConfig, OpenAiCompatModel};
use crate::model::{EchoModel, Model};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const OLLAMA_DEFAULT_HOST: &str = "http://localhost:11434";

pub fn default_model_name(provider: Provider) -> &'static str {
    match provider {
        Provider::Openai => "gpt-4o-mini",
        Provider::Ollama => "llama3.1",
        Provider::Echo | Provider::Auto => "echo",
    }
}

/// Resolves `auto` against the environment. Explicit providers pass through.
pub fn resolve_provider(cfg: &RuntimeConfig) -> Result<Provider> {
    match cfg.provider {
        Provider::Auto => detect_provider().context(
            "no provider could be auto-detected. Set OPENAI_API_KEY or OLLAMA_HOST, \
             or use --provider echo for an offline dry run",
        ),
        p => Ok(p),
    }
}

pub fn resolve_model(cfg: &RuntimeConfig) -> Result<(Arc<dyn Model>, Provider, String)> {
    let provider = resolve_provider(cfg)?;
    let (model, model_name) = build_model(cfg, provider, cfg.model.as_deref())?;
    Ok((model, provider, model_name))
}

/// Builds a model client for an already-resolved provider. `model_name`
/// falls back to the provider default.
pub fn build_model(
    cfg: &RuntimeConfig,
    provider: Provider,
    model_name: Option<&str>,
) -> Result<(Arc<dyn Model>, String)> {
    let model_name = model_name
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or(default_model_name(provider))
        .to_string();
    let timeout = Duration::from_secs(cfg.model_timeout_secs);

    match provider {
        Provider::Echo => Ok((Arc::new(EchoModel::new(model_name.clone())), model_name)),
        Provider::Openai => {
            let api_key = std::env::var("OPENAI_API_KEY")
                .context("OPENAI_API_KEY is required for OpenAI provider")?;
            let model = OpenAiCompatModel::new(OpenAiCompatConfig {
                base_url: cfg
                    .api_base
                    .clone()
                    .unwrap_or_else(|| OPENAI_BASE_URL.to_string()),
                model: model_name.clone(),
                api_key: Some(api_key),
                timeout,
            })?;
            Ok((Arc::new(model), model_name))
        }
        Provider::Ollama => {
            let base_url = cfg.api_base.clone().unwrap_or_else(|| {
                let host = std::env::var("OLLAMA_HOST")
                    .ok()
                    .filter(|v| !v.trim().is_empty())
                    .unwrap_or_else(|| OLLAMA_DEFAULT_HOST.to_string());
                ollama_base_url(&host)
            });
            let model = OpenAiCompatModel::new(OpenAiCompatConfig {
                base_url,
                model: model_name.clone(),
                api_key: None,
                timeout,
            })?;
            Ok((Arc::new(model), model_name))
        }
        Provider::Auto => Err(anyhow::anyhow!(
            "auto provider must be resolved before building a model"
        )),
    }
}

/// Ollama serves its OpenAI-compatible API under `/v1`.
pub fn ollama_base_url(host: &str) -> String {
    let host = host.trim().trim_end_matches('/');
    let host = if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("http://{host}")
    };
    if host.ends_with("/v1") {
        host
    } else {
        format!("{host}/v1")
    }
}

pub fn detect_provider() -> Option<Provider> {
    if env_present("OPENAI_API_KEY") {
        return Some(Provider::Openai);
    }
    if env_present("OLLAMA_HOST") {
        return Some(Provider::Ollama);
    }
    None
}

pub fn env_present(key: &str) -> bool {
    std::env::var(key)
        .map(|v| !v.trim().is_empty())
        .unwrap_or(false)
}

pub fn parse_provider_name(value: &str) -> Result<Provider> {
    Provider::from_str(value, true).map_err(|_| {
        anyhow::anyhow!(
            "invalid provider '{}'. Supported values: auto, echo, openai, ollama",
            value
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ollama_host_gets_scheme_and_v1_suffix() {
        assert_eq!(ollama_base_url("localhost:11434"), "http://localhost:11434/v1");
        assert_eq!(
            ollama_base_url("http://gpu-box:11434/"),
            "http://gpu-box:11434/v1"
        );
        assert_eq!(ollama_base_url("https://x/v1"), "https://x/v1");
    }

    #[test]
    fn provider_names_parse_case_insensitively() {
        assert_eq!(parse_provider_name("Echo").expect("echo"), Provider::Echo);
        assert!(parse_provider_name("gemini").is_err());
    }
}
