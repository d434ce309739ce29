use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use super::{Session, SessionKey, SessionState, SessionStore, SessionSummary, sort_newest_first};
use crate::error::PipelineError;

const CREATE_SESSIONS_TABLE: &str = "CREATE TABLE IF NOT EXISTS pipeline_sessions (
    app_name TEXT NOT NULL,
    user_id TEXT NOT NULL,
    session_id TEXT NOT NULL,
    state TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (app_name, user_id, session_id)
)";

/// SQLite-backed store. Live handles are cached so that one triple maps to
/// one in-process record; `save` writes the state blob through.
pub struct SqliteSessionStore {
    pool: SqlitePool,
    live: Mutex<HashMap<SessionKey, Session>>,
}

impl SqliteSessionStore {
    pub async fn connect(db_url: &str) -> Result<Self, PipelineError> {
        let options = SqliteConnectOptions::from_str(db_url)
            .map_err(PipelineError::storage)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(PipelineError::storage)?;
        Ok(Self {
            pool,
            live: Mutex::new(HashMap::new()),
        })
    }

    pub async fn migrate(&self) -> Result<(), PipelineError> {
        sqlx::query(CREATE_SESSIONS_TABLE)
            .execute(&self.pool)
            .await
            .map_err(PipelineError::storage)?;
        Ok(())
    }

    fn cached(&self, key: &SessionKey) -> Option<Session> {
        let live = self.live.lock().unwrap_or_else(|e| e.into_inner());
        live.get(key).cloned()
    }

    fn remember(&self, session: Session) -> Session {
        let mut live = self.live.lock().unwrap_or_else(|e| e.into_inner());
        live.entry(session.key().clone()).or_insert(session).clone()
    }

    fn forget(&self, key: &SessionKey) {
        let mut live = self.live.lock().unwrap_or_else(|e| e.into_inner());
        live.remove(key);
    }
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_state(raw: &str) -> Result<Map<String, Value>, PipelineError> {
    serde_json::from_str::<Map<String, Value>>(raw)
        .map_err(|err| PipelineError::Storage(format!("corrupt session state blob: {err}")))
}

fn encode_state(state: &Map<String, Value>) -> Result<String, PipelineError> {
    serde_json::to_string(state).map_err(PipelineError::storage)
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn get(&self, key: &SessionKey) -> Result<Session, PipelineError> {
        if let Some(session) = self.cached(key) {
            return Ok(session);
        }

        let row = sqlx::query(
            "SELECT state, created_at, updated_at FROM pipeline_sessions \
             WHERE app_name = ? AND user_id = ? AND session_id = ?",
        )
        .bind(key.app_name.as_str())
        .bind(key.user_id.as_str())
        .bind(key.session_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(PipelineError::storage)?
        .ok_or_else(|| key.not_found())?;

        let state: String = row.try_get("state").map_err(PipelineError::storage)?;
        let created_at: String = row.try_get("created_at").map_err(PipelineError::storage)?;
        let updated_at: String = row.try_get("updated_at").map_err(PipelineError::storage)?;

        let session = Session::restore(
            key.clone(),
            SessionState::restore(parse_state(&state)?, parse_timestamp(&updated_at)),
            parse_timestamp(&created_at),
        );
        Ok(self.remember(session))
    }

    async fn create(
        &self,
        key: &SessionKey,
        initial_state: Map<String, Value>,
    ) -> Result<Session, PipelineError> {
        if self.cached(key).is_some() {
            return Err(key.already_exists());
        }

        let session = Session::new(key.clone(), initial_state);
        let now = session.created_at().to_rfc3339();
        let result = sqlx::query(
            "INSERT INTO pipeline_sessions (app_name, user_id, session_id, state, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(key.app_name.as_str())
        .bind(key.user_id.as_str())
        .bind(key.session_id.as_str())
        .bind(encode_state(&session.state().snapshot())?)
        .bind(now.as_str())
        .bind(now.as_str())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(self.remember(session)),
            Err(err)
                if err
                    .as_database_error()
                    .is_some_and(|db_err| db_err.is_unique_violation()) =>
            {
                Err(key.already_exists())
            }
            Err(err) => Err(PipelineError::storage(err)),
        }
    }

    async fn save(&self, session: &Session) -> Result<(), PipelineError> {
        let snapshot = session.state().snapshot();
        let result = sqlx::query(
            "UPDATE pipeline_sessions SET state = ?, updated_at = ? \
             WHERE app_name = ? AND user_id = ? AND session_id = ?",
        )
        .bind(encode_state(&snapshot)?)
        .bind(session.state().updated_at().to_rfc3339())
        .bind(session.key().app_name.as_str())
        .bind(session.key().user_id.as_str())
        .bind(session.key().session_id.as_str())
        .execute(&self.pool)
        .await
        .map_err(PipelineError::storage)?;

        if result.rows_affected() == 0 {
            return Err(session.key().not_found());
        }

        if let Some(live) = self.cached(session.key())
            && !live.state().same_record(session.state())
        {
            live.state().replace(snapshot);
        }
        Ok(())
    }

    async fn list(
        &self,
        app_name: &str,
        user_id: &str,
    ) -> Result<Vec<SessionSummary>, PipelineError> {
        let rows = sqlx::query(
            "SELECT session_id, state, created_at, updated_at FROM pipeline_sessions \
             WHERE app_name = ? AND user_id = ?",
        )
        .bind(app_name)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(PipelineError::storage)?;

        let mut summaries = Vec::with_capacity(rows.len());
        for row in rows {
            let session_id: String = row.try_get("session_id").map_err(PipelineError::storage)?;
            let state: String = row.try_get("state").map_err(PipelineError::storage)?;
            let created_at: String = row.try_get("created_at").map_err(PipelineError::storage)?;
            let updated_at: String = row.try_get("updated_at").map_err(PipelineError::storage)?;
            summaries.push(SessionSummary {
                key: SessionKey::new(app_name, user_id, session_id),
                created_at: parse_timestamp(&created_at),
                updated_at: parse_timestamp(&updated_at),
                key_count: parse_state(&state)?.len(),
            });
        }
        sort_newest_first(&mut summaries);
        Ok(summaries)
    }

    async fn delete(&self, key: &SessionKey) -> Result<(), PipelineError> {
        let result = sqlx::query(
            "DELETE FROM pipeline_sessions WHERE app_name = ? AND user_id = ? AND session_id = ?",
        )
        .bind(key.app_name.as_str())
        .bind(key.user_id.as_str())
        .bind(key.session_id.as_str())
        .execute(&self.pool)
        .await
        .map_err(PipelineError::storage)?;

        self.forget(key);
        if result.rows_affected() == 0 {
            return Err(key.not_found());
        }
        Ok(())
    }
}

pub async fn open_sqlite_session_store(db_url: &str) -> anyhow::Result<SqliteSessionStore> {
    ensure_parent_dir_for_sqlite_url(db_url)?;
    let store = SqliteSessionStore::connect(db_url)
        .await
        .context("failed to open sqlite session database")?;
    store
        .migrate()
        .await
        .context("failed to run sqlite session migrations")?;
    Ok(store)
}

pub fn ensure_parent_dir_for_sqlite_url(db_url: &str) -> anyhow::Result<()> {
    let Some(db_path) = sqlite_path_from_url(db_url) else {
        return Ok(());
    };

    if let Some(parent) = db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).with_context(|| {
            format!(
                "failed to create directory for sqlite database: {}",
                parent.display()
            )
        })?;
    }

    Ok(())
}

pub fn sqlite_path_from_url(db_url: &str) -> Option<PathBuf> {
    if !db_url.starts_with("sqlite://") {
        return None;
    }

    let path_with_params = db_url.trim_start_matches("sqlite://");
    let path_without_params = path_with_params
        .split_once('?')
        .map(|(path, _)| path)
        .unwrap_or(path_with_params);

    if path_without_params.is_empty() || path_without_params == ":memory:" {
        return None;
    }

    Some(Path::new(path_without_params).to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_url_paths_strip_params_and_memory_urls() {
        assert_eq!(
            sqlite_path_from_url("sqlite://.pipeline/sessions.db?mode=rwc"),
            Some(PathBuf::from(".pipeline/sessions.db"))
        );
        assert_eq!(sqlite_path_from_url("sqlite://:memory:"), None);
        assert_eq!(sqlite_path_from_url("postgres://db"), None);
    }
}
