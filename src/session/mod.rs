//! Session store: one live state record per (app, user, session) triple.

pub mod commands;
pub mod memory;
pub mod sqlite;

use std::fmt;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::error::PipelineError;

pub use memory::InMemorySessionStore;
pub use sqlite::{SqliteSessionStore, open_sqlite_session_store};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    pub app_name: String,
    pub user_id: String,
    pub session_id: String,
}

impl SessionKey {
    pub fn new(
        app_name: impl Into<String>,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            user_id: user_id.into(),
            session_id: session_id.into(),
        }
    }

    pub fn not_found(&self) -> PipelineError {
        PipelineError::SessionNotFound {
            app_name: self.app_name.clone(),
            user_id: self.user_id.clone(),
            session_id: self.session_id.clone(),
        }
    }

    pub fn already_exists(&self) -> PipelineError {
        PipelineError::SessionAlreadyExists {
            app_name: self.app_name.clone(),
            user_id: self.user_id.clone(),
            session_id: self.session_id.clone(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.app_name, self.user_id, self.session_id)
    }
}

#[derive(Debug)]
struct StateRecord {
    values: Map<String, Value>,
    updated_at: DateTime<Utc>,
}

/// Shared, mutable key/value state of one session.
///
/// Clones share the same record. Every `read`/`write` is individually atomic;
/// there is no multi-key transaction, so concurrent writers must own
/// disjoint keys (last writer wins on a shared key).
#[derive(Debug, Clone)]
pub struct SessionState {
    inner: Arc<RwLock<StateRecord>>,
}

impl SessionState {
    pub fn new(initial: Map<String, Value>) -> Self {
        Self::restore(initial, Utc::now())
    }

    pub(crate) fn restore(values: Map<String, Value>, updated_at: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(StateRecord { values, updated_at })),
        }
    }

    pub fn read(&self, key: &str) -> Result<Value, PipelineError> {
        self.get(key).ok_or_else(|| PipelineError::KeyMissing {
            key: key.to_string(),
        })
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let record = self.inner.read().unwrap_or_else(|e| e.into_inner());
        record.values.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        let record = self.inner.read().unwrap_or_else(|e| e.into_inner());
        record.values.contains_key(key)
    }

    pub fn write(&self, key: impl Into<String>, value: Value) {
        let mut record = self.inner.write().unwrap_or_else(|e| e.into_inner());
        record.values.insert(key.into(), value);
        record.updated_at = Utc::now();
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        let mut record = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let removed = record.values.remove(key);
        if removed.is_some() {
            record.updated_at = Utc::now();
        }
        removed
    }

    pub fn snapshot(&self) -> Map<String, Value> {
        let record = self.inner.read().unwrap_or_else(|e| e.into_inner());
        record.values.clone()
    }

    pub fn len(&self) -> usize {
        let record = self.inner.read().unwrap_or_else(|e| e.into_inner());
        record.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        let record = self.inner.read().unwrap_or_else(|e| e.into_inner());
        record.updated_at
    }

    pub(crate) fn replace(&self, values: Map<String, Value>) {
        let mut record = self.inner.write().unwrap_or_else(|e| e.into_inner());
        record.values = values;
        record.updated_at = Utc::now();
    }

    pub(crate) fn same_record(&self, other: &SessionState) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Handle onto a live session record. Cloning is cheap and shares state.
#[derive(Debug, Clone)]
pub struct Session {
    key: SessionKey,
    state: SessionState,
    created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(key: SessionKey, initial: Map<String, Value>) -> Self {
        Self {
            key,
            state: SessionState::new(initial),
            created_at: Utc::now(),
        }
    }

    pub(crate) fn restore(key: SessionKey, state: SessionState, created_at: DateTime<Utc>) -> Self {
        Self {
            key,
            state,
            created_at,
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn id(&self) -> &str {
        &self.key.session_id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            key: self.key.clone(),
            created_at: self.created_at,
            updated_at: self.state.updated_at(),
            key_count: self.state.len(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub key: SessionKey,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub key_count: usize,
}

/// Persistence contract for sessions. Backends are swappable without
/// touching the orchestration core.
#[async_trait]
pub trait SessionStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    async fn get(&self, key: &SessionKey) -> Result<Session, PipelineError>;

    /// Fails with `SessionAlreadyExists` when the triple is already present.
    async fn create(
        &self,
        key: &SessionKey,
        initial_state: Map<String, Value>,
    ) -> Result<Session, PipelineError>;

    /// Writes the session's current state through to the backend.
    async fn save(&self, session: &Session) -> Result<(), PipelineError>;

    /// Sessions for one app/user, most recently updated first.
    async fn list(&self, app_name: &str, user_id: &str)
    -> Result<Vec<SessionSummary>, PipelineError>;

    async fn delete(&self, key: &SessionKey) -> Result<(), PipelineError>;

    /// Returns the existing record (ignoring `initial_state`) or creates one.
    async fn load_or_create(
        &self,
        key: &SessionKey,
        initial_state: Map<String, Value>,
    ) -> Result<Session, PipelineError> {
        match self.get(key).await {
            Ok(session) => {
                tracing::debug!(session = %key, "Loaded existing session");
                Ok(session)
            }
            Err(PipelineError::SessionNotFound { .. }) => {
                match self.create(key, initial_state).await {
                    Ok(session) => {
                        tracing::info!(session = %key, backend = self.backend_name(), "Created session");
                        Ok(session)
                    }
                    // Lost a create race against another caller; theirs is the live record.
                    Err(PipelineError::SessionAlreadyExists { .. }) => self.get(key).await,
                    Err(err) => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }
}

pub fn sort_newest_first(summaries: &mut [SessionSummary]) {
    summaries.sort_by(|a, b| {
        b.updated_at
            .cmp(&a.updated_at)
            .then_with(|| a.key.session_id.cmp(&b.key.session_id))
    });
}
