use std::sync::Arc;

use anyhow::{Context, Result};

use super::sqlite::open_sqlite_session_store;
use super::{InMemorySessionStore, SessionKey, SessionStore};
use crate::cli::SessionBackend;
use crate::config::RuntimeConfig;

pub async fn build_session_store(cfg: &RuntimeConfig) -> Result<Arc<dyn SessionStore>> {
    match cfg.session_backend {
        SessionBackend::Memory => Ok(Arc::new(InMemorySessionStore::new())),
        SessionBackend::Sqlite => {
            let store = open_sqlite_session_store(&cfg.session_db_url).await?;
            Ok(Arc::new(store))
        }
    }
}

fn session_key(cfg: &RuntimeConfig, session_id_override: Option<String>) -> SessionKey {
    SessionKey::new(
        cfg.app_name.clone(),
        cfg.user_id.clone(),
        session_id_override.unwrap_or_else(|| cfg.session_id.clone()),
    )
}

pub async fn run_sessions_list(cfg: &RuntimeConfig) -> Result<()> {
    let store = build_session_store(cfg).await?;
    let sessions = store
        .list(&cfg.app_name, &cfg.user_id)
        .await
        .with_context(|| {
            format!(
                "failed to list sessions for app '{}' and user '{}'",
                cfg.app_name, cfg.user_id
            )
        })?;

    if sessions.is_empty() {
        println!(
            "No sessions found for app '{}' and user '{}'.",
            cfg.app_name, cfg.user_id
        );
        return Ok(());
    }

    println!(
        "Sessions for app '{}' and user '{}':",
        cfg.app_name, cfg.user_id
    );
    for session in sessions {
        println!(
            "- {} (updated: {}, keys: {})",
            session.key.session_id,
            session.updated_at.to_rfc3339(),
            session.key_count
        );
    }

    Ok(())
}

pub async fn run_sessions_show(
    cfg: &RuntimeConfig,
    session_id_override: Option<String>,
) -> Result<()> {
    let key = session_key(cfg, session_id_override);
    let store = build_session_store(cfg).await?;
    let session = store.get(&key).await.with_context(|| {
        format!(
            "failed to load session '{}' for app '{}' and user '{}'",
            key.session_id, key.app_name, key.user_id
        )
    })?;

    let snapshot = session.state().snapshot();
    println!(
        "Session '{}' (app='{}', user='{}', keys={}, updated={}):",
        session.id(),
        key.app_name,
        key.user_id,
        snapshot.len(),
        session.state().updated_at().to_rfc3339()
    );

    if snapshot.is_empty() {
        println!("Session state is empty.");
        return Ok(());
    }

    let rendered = serde_json::to_string_pretty(&snapshot)
        .context("failed to render session state as JSON")?;
    println!("{rendered}");
    Ok(())
}

pub async fn run_sessions_delete(
    cfg: &RuntimeConfig,
    session_id_override: Option<String>,
    force: bool,
) -> Result<()> {
    let key = session_key(cfg, session_id_override);
    if !force {
        return Err(anyhow::anyhow!(
            "session delete is destructive. Re-run with --force to delete session '{}'",
            key.session_id
        ));
    }

    let store = build_session_store(cfg).await?;
    store.delete(&key).await.with_context(|| {
        format!(
            "failed to delete session '{}' for app '{}' and user '{}'",
            key.session_id, key.app_name, key.user_id
        )
    })?;

    println!(
        "Deleted session '{}' for app '{}' and user '{}'.",
        key.session_id, key.app_name, key.user_id
    );
    Ok(())
}

/// Keeps the `keep` most recently updated sessions and deletes the rest.
pub async fn run_sessions_prune(
    cfg: &RuntimeConfig,
    keep: usize,
    dry_run: bool,
    force: bool,
) -> Result<()> {
    let keep = keep.max(1);
    let store = build_session_store(cfg).await?;
    let sessions = store
        .list(&cfg.app_name, &cfg.user_id)
        .await
        .with_context(|| {
            format!(
                "failed to list sessions for prune in app '{}' and user '{}'",
                cfg.app_name, cfg.user_id
            )
        })?;

    let prune_keys = sessions
        .into_iter()
        .skip(keep)
        .map(|summary| summary.key)
        .collect::<Vec<SessionKey>>();

    if prune_keys.is_empty() {
        println!(
            "Nothing to prune. Keep={} and current session count is within limit.",
            keep
        );
        return Ok(());
    }

    if dry_run {
        println!(
            "Dry-run: {} session(s) would be deleted (keeping {} most recent):",
            prune_keys.len(),
            keep
        );
        for key in prune_keys {
            println!("- {}", key.session_id);
        }
        return Ok(());
    }

    if !force {
        return Err(anyhow::anyhow!(
            "session prune is destructive and would delete {} session(s). Re-run with --force or preview with --dry-run",
            prune_keys.len()
        ));
    }

    for key in &prune_keys {
        store.delete(key).await.with_context(|| {
            format!(
                "failed to delete pruned session '{}' for app '{}' and user '{}'",
                key.session_id, key.app_name, key.user_id
            )
        })?;
    }

    println!(
        "Pruned {} session(s). Kept {} most recent session(s).",
        prune_keys.len(),
        keep
    );
    Ok(())
}
