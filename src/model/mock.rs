//! Deterministic models for tests and dry runs.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{Model, ModelError, ModelRequest, ModelResponse};

/// Replays canned responses in order and records every request it receives.
///
/// Once the script runs out the last response is repeated, so a loop body
/// driven by a one-entry script behaves the same on every iteration.
pub struct ScriptedModel {
    name: String,
    script: Mutex<VecDeque<Result<ModelResponse, ModelError>>>,
    last: Mutex<Option<Result<ModelResponse, ModelError>>>,
    requests: Arc<Mutex<Vec<ModelRequest>>>,
}

impl ScriptedModel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(VecDeque::new()),
            last: Mutex::new(None),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_response(self, response: ModelResponse) -> Self {
        self.push(Ok(response));
        self
    }

    pub fn with_text(self, text: &str) -> Self {
        self.with_response(ModelResponse::text(text))
    }

    pub fn with_error(self, error: ModelError) -> Self {
        self.push(Err(error));
        self
    }

    fn push(&self, entry: Result<ModelResponse, ModelError>) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(entry);
    }

    /// Shared handle onto the recorded requests, usable after the model has
    /// been moved into an agent.
    pub fn request_log(&self) -> Arc<Mutex<Vec<ModelRequest>>> {
        self.requests.clone()
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl Model for ScriptedModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request);

        let next = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        match next {
            Some(entry) => {
                *last = Some(entry.clone());
                entry
            }
            None => (*last).clone().unwrap_or_else(|| {
                Err(ModelError::Malformed(format!(
                    "scripted model '{}' has no responses",
                    self.name
                )))
            }),
        }
    }
}

type ResponderFn = dyn Fn(&ModelRequest) -> Result<ModelResponse, ModelError> + Send + Sync;

/// Computes each response from the request with a closure.
pub struct FnModel {
    name: String,
    responder: Box<ResponderFn>,
}

impl FnModel {
    pub fn new<F>(name: impl Into<String>, responder: F) -> Self
    where
        F: Fn(&ModelRequest) -> Result<ModelResponse, ModelError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            responder: Box::new(responder),
        }
    }
}

#[async_trait]
impl Model for FnModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        (self.responder)(&request)
    }
}
