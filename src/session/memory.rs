use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{Session, SessionKey, SessionStore, SessionSummary, sort_newest_first};
use crate::error::PipelineError;

/// Process-local session store. `get` hands out the single live record.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<SessionKey, Session>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &SessionKey) -> Result<Session, PipelineError> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.get(key).cloned().ok_or_else(|| key.not_found())
    }

    async fn create(
        &self,
        key: &SessionKey,
        initial_state: Map<String, Value>,
    ) -> Result<Session, PipelineError> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if sessions.contains_key(key) {
            return Err(key.already_exists());
        }
        let session = Session::new(key.clone(), initial_state);
        sessions.insert(key.clone(), session.clone());
        Ok(session)
    }

    async fn save(&self, session: &Session) -> Result<(), PipelineError> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let live = sessions
            .get(session.key())
            .ok_or_else(|| session.key().not_found())?;
        if !live.state().same_record(session.state()) {
            live.state().replace(session.state().snapshot());
        }
        Ok(())
    }

    async fn list(
        &self,
        app_name: &str,
        user_id: &str,
    ) -> Result<Vec<SessionSummary>, PipelineError> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let mut summaries = sessions
            .values()
            .filter(|session| session.key().app_name == app_name && session.key().user_id == user_id)
            .map(Session::summary)
            .collect::<Vec<_>>();
        sort_newest_first(&mut summaries);
        Ok(summaries)
    }

    async fn delete(&self, key: &SessionKey) -> Result<(), PipelineError> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| key.not_found())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn initial(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn create_rejects_existing_triple() {
        let store = InMemorySessionStore::new();
        let key = SessionKey::new("app", "user", "s1");
        store
            .create(&key, Map::new())
            .await
            .expect("first create should succeed");
        let err = store
            .create(&key, Map::new())
            .await
            .expect_err("second create should fail");
        assert!(matches!(err, PipelineError::SessionAlreadyExists { .. }));
    }

    #[tokio::test]
    async fn get_returns_the_same_live_record() {
        let store = InMemorySessionStore::new();
        let key = SessionKey::new("app", "user", "s1");
        let created = store
            .create(&key, initial(json!({"a": 1})))
            .await
            .expect("create should succeed");
        created.state().write("b", json!(2));

        let loaded = store.get(&key).await.expect("session should exist");
        assert_eq!(loaded.state().get("b"), Some(json!(2)));
        assert!(loaded.state().same_record(created.state()));
    }

    #[tokio::test]
    async fn missing_session_and_missing_key_are_distinct_errors() {
        let store = InMemorySessionStore::new();
        let key = SessionKey::new("app", "user", "absent");
        let err = store.get(&key).await.expect_err("should be missing");
        assert!(matches!(err, PipelineError::SessionNotFound { .. }));

        let session = store
            .load_or_create(&key, Map::new())
            .await
            .expect("load_or_create should create");
        let err = session.state().read("nope").expect_err("key should be missing");
        assert!(matches!(err, PipelineError::KeyMissing { .. }));
    }
}
