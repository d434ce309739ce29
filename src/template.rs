//! `{placeholder}` substitution for agent instructions.
//!
//! `{name}` is required and fails the agent when `name` is absent from state.
//! `{name?}` is optional and resolves to the empty string. Brace text that is
//! not a bare identifier (JSON examples inside prompts, `{}`) is left alone.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value;

use crate::error::PipelineError;
use crate::session::SessionState;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)(\?)?\}").expect("placeholder pattern is valid")
});

pub fn resolve_instruction(
    agent: &str,
    template: &str,
    state: &SessionState,
) -> Result<String, PipelineError> {
    let mut missing: Option<String> = None;
    let resolved = PLACEHOLDER.replace_all(template, |caps: &Captures<'_>| {
        let name = &caps[1];
        let optional = caps.get(2).is_some();
        match state.get(name) {
            Some(value) => render_value(&value),
            None if optional => String::new(),
            None => {
                if missing.is_none() {
                    missing = Some(name.to_string());
                }
                String::new()
            }
        }
    });

    if let Some(placeholder) = missing {
        return Err(PipelineError::Template {
            agent: agent.to_string(),
            placeholder,
        });
    }
    Ok(resolved.into_owned())
}

/// Names referenced by a template, in order of first appearance.
pub fn placeholders(template: &str) -> Vec<(String, bool)> {
    let mut seen = Vec::<(String, bool)>::new();
    for caps in PLACEHOLDER.captures_iter(template) {
        let name = caps[1].to_string();
        if !seen.iter().any(|(existing, _)| *existing == name) {
            seen.push((name, caps.get(2).is_some()));
        }
    }
    seen
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
