use std::collections::{BTreeMap, BTreeSet};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::RuntimeConfig;

pub fn unix_ms_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

/// One line of the JSONL event log. Event-specific fields are flattened
/// next to the envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub ts_unix_ms: u64,
    pub event: String,
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Appends pipeline lifecycle events to a JSONL file. Clones share the
/// run id and the write lock.
#[derive(Debug, Clone)]
pub struct TelemetrySink {
    enabled: bool,
    path: PathBuf,
    run_id: String,
    command: String,
    session_id: String,
    write_lock: Arc<Mutex<()>>,
}

impl TelemetrySink {
    pub fn new(cfg: &RuntimeConfig, command: String) -> Self {
        Self::build(
            cfg.telemetry_enabled,
            PathBuf::from(&cfg.telemetry_path),
            command,
            cfg.session_id.clone(),
        )
    }

    /// Always-enabled sink writing to `path`.
    pub fn at_path(
        path: impl Into<PathBuf>,
        command: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self::build(true, path.into(), command.into(), session_id.into())
    }

    fn build(enabled: bool, path: PathBuf, command: String, session_id: String) -> Self {
        Self {
            enabled,
            path,
            run_id: format!("run-{}-{}", unix_ms_now(), std::process::id()),
            command,
            session_id,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn emit(&self, event: &str, payload: Value) {
        if !self.enabled {
            return;
        }

        let record = TelemetryEvent {
            ts_unix_ms: unix_ms_now(),
            event: event.to_string(),
            run_id: self.run_id.clone(),
            command: self.command.clone(),
            session_id: self.session_id.clone(),
            fields: match payload {
                Value::Object(map) => map,
                _ => Map::new(),
            },
        };
        if let Err(err) = self.append(&record) {
            tracing::warn!(event = event, path = %self.path.display(), error = %err, "telemetry write failed");
        }
    }

    fn append(&self, record: &TelemetryEvent) -> Result<()> {
        let mut line = serde_json::to_string(record)
            .with_context(|| format!("failed to encode telemetry event '{}'", record.event))?;
        line.push('\n');

        if let Some(dir) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).with_context(|| {
                format!("failed to create telemetry directory '{}'", dir.display())
            })?;
        }

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(line.as_bytes()))
            .with_context(|| format!("failed to append to telemetry file '{}'", self.path.display()))
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Outcomes {
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
pub struct TelemetrySummary {
    pub lines_read: usize,
    pub events: usize,
    pub unreadable: usize,
    pub runs: BTreeSet<String>,
    /// Completed/failed counts per root pipeline name.
    pub pipelines: BTreeMap<String, Outcomes>,
    pub agents: Outcomes,
    pub tool_calls: usize,
    pub tools: Outcomes,
    /// Error kinds seen on failed pipelines, agents and tool calls.
    pub failure_kinds: BTreeMap<String, usize>,
    pub latest_ts_unix_ms: Option<u64>,
}

/// Folds the newest `limit` lines into a summary.
pub fn summarize_telemetry_lines(lines: Vec<String>, limit: usize) -> TelemetrySummary {
    let mut summary = TelemetrySummary {
        lines_read: lines.len(),
        ..TelemetrySummary::default()
    };

    for line in lines.iter().rev().take(limit.max(1)) {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<TelemetryEvent>(line) {
            Ok(event) => summary.record(event),
            Err(_) => summary.unreadable += 1,
        }
    }
    summary
}

impl TelemetrySummary {
    fn record(&mut self, event: TelemetryEvent) {
        self.events += 1;
        if !event.run_id.is_empty() {
            self.runs.insert(event.run_id.clone());
        }
        self.latest_ts_unix_ms = Some(self.latest_ts_unix_ms.unwrap_or(0).max(event.ts_unix_ms));

        let field = |name: &str| {
            event
                .fields
                .get(name)
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string()
        };
        let failed = match event.event.as_str() {
            "pipeline.completed" => {
                self.pipelines.entry(field("pipeline")).or_default().completed += 1;
                false
            }
            "pipeline.failed" => {
                self.pipelines.entry(field("pipeline")).or_default().failed += 1;
                true
            }
            "agent.completed" => {
                self.agents.completed += 1;
                false
            }
            "agent.failed" => {
                self.agents.failed += 1;
                true
            }
            "tool.requested" => {
                self.tool_calls += 1;
                false
            }
            "tool.succeeded" => {
                self.tools.completed += 1;
                false
            }
            "tool.failed" => {
                self.tools.failed += 1;
                true
            }
            _ => false,
        };
        if failed {
            *self.failure_kinds.entry(field("kind")).or_default() += 1;
        }
    }
}

pub fn run_telemetry_report(
    cfg: &RuntimeConfig,
    path_override: Option<String>,
    limit: usize,
) -> Result<()> {
    let path = PathBuf::from(path_override.unwrap_or_else(|| cfg.telemetry_path.clone()));
    if !path.exists() {
        println!("No telemetry recorded yet at '{}'.", path.display());
        return Ok(());
    }

    let file = std::fs::File::open(&path)
        .with_context(|| format!("failed to open telemetry file '{}'", path.display()))?;
    let lines = BufReader::new(file)
        .lines()
        .collect::<std::io::Result<Vec<String>>>()
        .with_context(|| format!("failed to read telemetry file '{}'", path.display()))?;
    let summary = summarize_telemetry_lines(lines, limit);

    println!("Telemetry: {}", path.display());
    println!(
        "Events: {} of {} lines ({} unreadable), runs={}",
        summary.events,
        summary.lines_read,
        summary.unreadable,
        summary.runs.len()
    );
    if summary.pipelines.is_empty() {
        println!("Pipelines: none");
    } else {
        println!("Pipelines:");
        for (name, outcomes) in &summary.pipelines {
            println!(
                "- {name}: completed={} failed={}",
                outcomes.completed, outcomes.failed
            );
        }
    }
    println!(
        "Agents: completed={} failed={}",
        summary.agents.completed, summary.agents.failed
    );
    println!(
        "Tool calls: {} (succeeded={} failed={})",
        summary.tool_calls, summary.tools.completed, summary.tools.failed
    );
    if !summary.failure_kinds.is_empty() {
        let kinds = summary
            .failure_kinds
            .iter()
            .map(|(kind, count)| format!("{kind}={count}"))
            .collect::<Vec<_>>()
            .join(" ");
        println!("Failure kinds: {kinds}");
    }
    if let Some(ts) = summary.latest_ts_unix_ms {
        println!("Latest event ts_unix_ms: {ts}");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn summary_groups_outcomes_by_pipeline_and_failure_kind() {
        let lines = vec![
            r#"{"event":"pipeline.started","run_id":"r1","ts_unix_ms":10,"pipeline":"review"}"#,
            r#"{"event":"tool.requested","run_id":"r1","ts_unix_ms":11,"tool":"add"}"#,
            r#"{"event":"tool.failed","run_id":"r1","ts_unix_ms":12,"kind":"invalid_parameters"}"#,
            r#"{"event":"agent.failed","run_id":"r1","ts_unix_ms":13,"kind":"model_error"}"#,
            r#"{"event":"pipeline.failed","run_id":"r1","ts_unix_ms":14,"pipeline":"review","kind":"model_error"}"#,
            "not json",
            r#"{"event":"pipeline.completed","run_id":"r2","ts_unix_ms":20,"pipeline":"review"}"#,
        ]
        .into_iter()
        .map(String::from)
        .collect();

        let summary = summarize_telemetry_lines(lines, 100);
        assert_eq!(summary.events, 6);
        assert_eq!(summary.unreadable, 1);
        assert_eq!(summary.runs.len(), 2);
        assert_eq!(
            summary.pipelines.get("review"),
            Some(&Outcomes {
                completed: 1,
                failed: 1
            })
        );
        assert_eq!(summary.agents.failed, 1);
        assert_eq!(summary.tool_calls, 1);
        assert_eq!(summary.tools.failed, 1);
        assert_eq!(summary.failure_kinds.get("model_error"), Some(&2));
        assert_eq!(summary.failure_kinds.get("invalid_parameters"), Some(&1));
        assert_eq!(summary.latest_ts_unix_ms, Some(20));
    }

    #[test]
    fn limit_keeps_only_the_newest_lines() {
        let lines = (0..10)
            .map(|i| format!(r#"{{"event":"agent.completed","run_id":"r{i}","ts_unix_ms":{i}}}"#))
            .collect();
        let summary = summarize_telemetry_lines(lines, 3);
        assert_eq!(summary.agents.completed, 3);
        assert_eq!(summary.latest_ts_unix_ms, Some(9));
    }

    #[test]
    fn sink_appends_one_json_line_per_event() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested/events.jsonl");
        let sink = TelemetrySink::at_path(&path, "ask", "s1");
        sink.emit("pipeline.started", json!({"pipeline": "assistant"}));
        sink.emit("pipeline.completed", json!({"pipeline": "assistant"}));

        let content = std::fs::read_to_string(&path).expect("telemetry file exists");
        let events = content
            .lines()
            .map(|line| serde_json::from_str::<TelemetryEvent>(line).expect("valid event line"))
            .collect::<Vec<_>>();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, "pipeline.started");
        assert_eq!(events[1].fields["pipeline"], "assistant");
        assert_eq!(events[1].session_id, "s1");
        assert_eq!(events[0].run_id, events[1].run_id);
    }
}
