use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tempfile::tempdir;

use crate::agent::{LlmAgentBuilder, ToolAgentBuilder};
use crate::catalog::{AssemblyDefaults, assemble_pipeline, parse_catalog};
use crate::cli::*;
use crate::config::*;
use crate::error::ErrorKind;
use crate::model::mock::{FnModel, ScriptedModel};
use crate::model::*;
use crate::node::{LoopNode, Node, NodeStatus, NodeTransition, ParallelNode};
use crate::runner::*;
use crate::session::*;
use crate::telemetry::TelemetrySink;
use crate::tools::clock::current_time_tool;
use crate::tools::control::exit_loop_tool;
use crate::tools::{FieldSpec, FieldType, ToolDescriptor, ToolOutput};
use crate::workflow::{WorkflowSettings, build_workflow};

fn base_cfg() -> RuntimeConfig {
    RuntimeConfig {
        profile: "default".to_string(),
        config_path: ".pipeline/config.toml".to_string(),
        provider: Provider::Echo,
        model: None,
        api_base: None,
        app_name: "test-app".to_string(),
        user_id: "test-user".to_string(),
        session_id: "test-session".to_string(),
        session_backend: SessionBackend::Memory,
        session_db_url: "sqlite://.pipeline/test.db".to_string(),
        show_sensitive_config: false,
        model_timeout_secs: 60,
        tool_timeout_secs: 15,
        max_tool_calls: 8,
        max_iterations: 5,
        telemetry_enabled: false,
        telemetry_path: ".pipeline/test-telemetry.jsonl".to_string(),
        catalog_path: ".pipeline/pipelines.toml".to_string(),
    }
}

fn memory_runner() -> Runner {
    let cfg = base_cfg();
    Runner::new(
        cfg.app_name.clone(),
        Arc::new(InMemorySessionStore::new()),
        RunConfig::from_runtime(&cfg),
    )
}

fn session_key(session_id: &str) -> SessionKey {
    SessionKey::new("test-app", "test-user", session_id)
}

/// Counts calls and answers with `reply`, or fails when `reply` is `None`.
fn counting_model(counter: Arc<AtomicUsize>, reply: Option<&'static str>) -> Arc<dyn Model> {
    Arc::new(FnModel::new("counting", move |_request| {
        counter.fetch_add(1, Ordering::SeqCst);
        match reply {
            Some(text) => Ok(ModelResponse::text(text)),
            None => Err(ModelError::Transport("connection reset".to_string())),
        }
    }))
}

fn llm(name: &str, model: Arc<dyn Model>, output_key: Option<&str>) -> Node {
    let mut builder = LlmAgentBuilder::new(name).model(model);
    if let Some(key) = output_key {
        builder = builder.output_key(key);
    }
    builder.build().expect("agent should build").into()
}

fn add_tool() -> ToolDescriptor {
    ToolDescriptor::from_fn("add", "Adds two integers.", |params, _state| async move {
        let a = params.get("a").and_then(Value::as_i64).unwrap_or_default();
        let b = params.get("b").and_then(Value::as_i64).unwrap_or_default();
        ToolOutput::ok(json!(a + b))
    })
    .with_field(FieldSpec::required("a", FieldType::Integer, "left operand"))
    .with_field(FieldSpec::required("b", FieldType::Integer, "right operand"))
}

fn statuses_for<'a>(trace: &'a [NodeTransition], node: &str) -> Vec<NodeStatus> {
    trace
        .iter()
        .filter(|transition| transition.node == node)
        .map(|transition| transition.status)
        .collect()
}

fn error_kind(result: &PipelineResult) -> Option<ErrorKind> {
    match &result.terminated_by {
        TerminatedBy::Error { kind, .. } => Some(*kind),
        _ => None,
    }
}

#[tokio::test]
async fn sequential_failure_skips_remaining_children() {
    let calls = [
        Arc::new(AtomicUsize::new(0)),
        Arc::new(AtomicUsize::new(0)),
        Arc::new(AtomicUsize::new(0)),
    ];
    let root = Node::sequential(
        "chain",
        vec![
            llm("first", counting_model(calls[0].clone(), Some("first out")), None),
            llm("second", counting_model(calls[1].clone(), None), None),
            llm("third", counting_model(calls[2].clone(), Some("third out")), None),
        ],
    );

    let result = memory_runner()
        .run(&root, "test-user", "seq-fail", "start")
        .await;

    assert_eq!(calls[0].load(Ordering::SeqCst), 1);
    assert_eq!(calls[1].load(Ordering::SeqCst), 1);
    assert_eq!(calls[2].load(Ordering::SeqCst), 0);
    assert_eq!(error_kind(&result), Some(ErrorKind::ModelError));
    assert_eq!(result.final_text.as_deref(), Some("first out"));
    assert_eq!(
        statuses_for(&result.trace, "second"),
        vec![NodeStatus::Pending, NodeStatus::Running, NodeStatus::Failed]
    );
    assert_eq!(statuses_for(&result.trace, "third"), vec![NodeStatus::Pending]);
}

#[tokio::test]
async fn parallel_with_some_failed_branches_still_completes() {
    let counter = Arc::new(AtomicUsize::new(0));
    let root = Node::parallel(
        "fan_out",
        vec![
            llm("ok_a", counting_model(counter.clone(), Some("a")), Some("a_out")),
            llm("broken", counting_model(counter.clone(), None), Some("broken_out")),
            llm("ok_c", counting_model(counter.clone(), Some("c")), Some("c_out")),
        ],
    );

    let result = memory_runner().run(&root, "test-user", "par", "go").await;

    assert_eq!(counter.load(Ordering::SeqCst), 3);
    assert_eq!(result.terminated_by, TerminatedBy::Completed);
    assert!(result.is_partial());
    assert_eq!(result.partial_failures.len(), 1);
    assert_eq!(result.partial_failures[0].branch, "broken");
    assert_eq!(result.partial_failures[0].kind, ErrorKind::ModelError);
    assert_eq!(result.final_state_snapshot.get("a_out"), Some(&json!("a")));
    assert_eq!(result.final_state_snapshot.get("c_out"), Some(&json!("c")));
    assert!(!result.final_state_snapshot.contains_key("broken_out"));
}

#[tokio::test]
async fn parallel_with_every_branch_failed_is_an_error() {
    let counter = Arc::new(AtomicUsize::new(0));
    let root = Node::parallel(
        "fan_out",
        vec![
            llm("x", counting_model(counter.clone(), None), None),
            llm("y", counting_model(counter.clone(), None), None),
        ],
    );

    let result = memory_runner().run(&root, "test-user", "par-all", "go").await;

    assert_eq!(error_kind(&result), Some(ErrorKind::AllBranchesFailed));
    assert_eq!(result.partial_failures.len(), 2);
}

#[tokio::test]
async fn parallel_output_feeds_a_following_step_through_state() {
    let reader = ScriptedModel::new("reader").with_text("merged");
    let log = reader.request_log();
    let reviewer = LlmAgentBuilder::new("reviewer")
        .instruction("Left: {left?} Right: {right?}")
        .model(Arc::new(reader))
        .build()
        .expect("agent should build");
    let root = Node::sequential(
        "diagnose",
        vec![
            Node::parallel(
                "collect",
                vec![
                    llm("left_agent", Arc::new(EchoModel::default()), Some("left")),
                    llm("right_agent", Arc::new(EchoModel::default()), Some("right")),
                ],
            ),
            reviewer.into(),
        ],
    );

    let result = memory_runner().run(&root, "test-user", "par-seq", "ping").await;

    assert!(result.is_success());
    assert_eq!(result.final_text.as_deref(), Some("merged"));
    let requests = log.lock().unwrap_or_else(|e| e.into_inner());
    assert_eq!(requests[0].instruction, "Left: ping Right: ping");
    // A parallel node has no text, so the next step sees the original input.
    assert_eq!(requests[0].latest_user_text(), Some("ping"));
}

#[tokio::test]
async fn parallel_branch_results_land_in_state_and_the_result() {
    let root = Node::parallel(
        "gather",
        vec![
            llm(
                "left",
                Arc::new(ScriptedModel::new("left").with_text("LEFT-OUT")),
                None,
            ),
            llm(
                "right",
                Arc::new(ScriptedModel::new("right").with_text("RIGHT-OUT")),
                None,
            ),
        ],
    );

    let result = memory_runner().run(&root, "test-user", "par-map", "go").await;

    assert!(result.is_success());
    let stored = result
        .final_state_snapshot
        .get("gather")
        .expect("branch map is stored under the node name");
    assert_eq!(stored["left"]["text"], "LEFT-OUT");
    assert_eq!(stored["right"]["text"], "RIGHT-OUT");
    assert_eq!(stored["left"]["status"], "completed");
    let structured = result
        .final_structured
        .as_ref()
        .expect("root parallel exposes its branch map");
    assert_eq!(structured["left"]["text"], "LEFT-OUT");
    assert_eq!(structured["right"]["text"], "RIGHT-OUT");
}

#[tokio::test]
async fn parallel_output_key_names_the_branch_map() {
    let fan = ParallelNode::new(
        "fan",
        vec![
            llm("a", Arc::new(EchoModel::default()), None),
            llm(
                "b",
                Arc::new(ScriptedModel::new("b").with_error(ModelError::Transport(
                    "down".to_string(),
                ))),
                None,
            ),
        ],
    )
    .with_output_key("findings");
    let reader = ScriptedModel::new("reader").with_text("ok");
    let log = reader.request_log();
    let summary = LlmAgentBuilder::new("summary")
        .instruction("Findings: {findings}")
        .model(Arc::new(reader))
        .build()
        .expect("agent should build");
    let root = Node::sequential("chain", vec![fan.into(), summary.into()]);

    let result = memory_runner().run(&root, "test-user", "par-key", "ping").await;

    assert!(result.is_partial());
    assert!(!result.final_state_snapshot.contains_key("fan"));
    let findings = &result.final_state_snapshot["findings"];
    assert_eq!(findings["a"]["text"], "ping");
    assert_eq!(findings["b"]["status"], "failed");
    assert_eq!(findings["b"]["kind"], "model_error");
    let requests = log.lock().unwrap_or_else(|e| e.into_inner());
    assert!(requests[0].instruction.contains("\"ping\""));
}

#[tokio::test]
async fn tool_state_writes_are_visible_to_later_steps() {
    let remember = ToolDescriptor::from_fn(
        "remember",
        "Stores a note in session state.",
        |params, state| async move {
            let note = params.get("note").cloned().unwrap_or(Value::Null);
            state.write("note", note);
            ToolOutput::ok(json!({"stored": true}))
        },
    )
    .with_field(FieldSpec::required("note", FieldType::String, "text to keep"));
    let writer = LlmAgentBuilder::new("writer")
        .model(Arc::new(
            ScriptedModel::new("writer")
                .with_response(ModelResponse::tool_calls(vec![ToolCall::new(
                    "call-1",
                    "remember",
                    json!({"note": "blue"}),
                )]))
                .with_text("noted"),
        ))
        .tool(remember)
        .build()
        .expect("agent should build");
    let reader = ScriptedModel::new("reader").with_text("blue it is");
    let log = reader.request_log();
    let recaller = LlmAgentBuilder::new("recaller")
        .instruction("Recall {note}")
        .model(Arc::new(reader))
        .build()
        .expect("agent should build");
    let root = Node::sequential("memo", vec![writer.into(), recaller.into()]);

    let result = memory_runner().run(&root, "test-user", "memo", "remember blue").await;

    assert!(result.is_success());
    assert_eq!(result.final_text.as_deref(), Some("blue it is"));
    let requests = log.lock().unwrap_or_else(|e| e.into_inner());
    assert_eq!(requests[0].instruction, "Recall blue");
    assert_eq!(result.final_state_snapshot.get("note"), Some(&json!("blue")));
}

#[tokio::test]
async fn loop_stops_at_the_escalating_iteration() {
    let iterations = Arc::new(AtomicUsize::new(0));
    let seen = iterations.clone();
    let model = FnModel::new("critic", move |request| {
        if request.latest_tool_result().is_some() {
            return Ok(ModelResponse::text("approved"));
        }
        let iteration = seen.fetch_add(1, Ordering::SeqCst) + 1;
        if iteration == 2 {
            Ok(ModelResponse::tool_calls(vec![ToolCall::new(
                "call-1",
                "exit_loop",
                Value::Null,
            )]))
        } else {
            Ok(ModelResponse::text(format!("revise {iteration}")))
        }
    });
    let critic = LlmAgentBuilder::new("critic")
        .model(Arc::new(model))
        .tool(exit_loop_tool())
        .build()
        .expect("agent should build");
    let root = Node::looped("refine", critic.into(), 5);

    let result = memory_runner().run(&root, "test-user", "loop-esc", "draft").await;

    assert_eq!(iterations.load(Ordering::SeqCst), 2);
    assert_eq!(result.terminated_by, TerminatedBy::Completed);
    assert_eq!(result.final_text.as_deref(), Some("approved"));
}

#[tokio::test]
async fn steps_after_an_escalating_step_finish_the_iteration() {
    let reviewer = LlmAgentBuilder::new("reviewer")
        .model(Arc::new(
            ScriptedModel::new("reviewer")
                .with_response(ModelResponse::tool_calls(vec![ToolCall::new(
                    "call-1",
                    "exit_loop",
                    Value::Null,
                )]))
                .with_text("looks good"),
        ))
        .tool(exit_loop_tool())
        .build()
        .expect("agent should build");
    let refiner_calls = Arc::new(AtomicUsize::new(0));
    let root = Node::looped(
        "refine",
        Node::sequential(
            "review_then_refine",
            vec![
                reviewer.into(),
                llm(
                    "refiner",
                    counting_model(refiner_calls.clone(), Some("refined")),
                    Some("code"),
                ),
            ],
        ),
        5,
    );

    let result = memory_runner().run(&root, "test-user", "loop-tail", "draft").await;

    assert_eq!(result.terminated_by, TerminatedBy::Completed);
    assert_eq!(refiner_calls.load(Ordering::SeqCst), 1);
    assert_eq!(result.final_state_snapshot.get("code"), Some(&json!("refined")));
    assert_eq!(
        statuses_for(&result.trace, "refiner"),
        vec![NodeStatus::Pending, NodeStatus::Running, NodeStatus::Completed]
    );
}

#[tokio::test]
async fn loop_without_escalation_reaches_max_iterations() {
    let calls = Arc::new(AtomicUsize::new(0));
    let root = Node::looped(
        "spin",
        llm("worker", counting_model(calls.clone(), Some("again")), None),
        3,
    );

    let result = memory_runner().run(&root, "test-user", "loop-cap", "go").await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(result.terminated_by, TerminatedBy::MaxIterationsReached);
    assert!(result.is_success());
}

#[tokio::test]
async fn max_iterations_propagates_through_a_sequential_parent() {
    let root = Node::sequential(
        "outer",
        vec![
            Node::looped(
                "spin",
                llm("worker", Arc::new(EchoModel::default()), None),
                2,
            ),
            llm("after", Arc::new(EchoModel::default()), None),
        ],
    );

    let result = memory_runner().run(&root, "test-user", "loop-prop", "x").await;

    assert_eq!(result.terminated_by, TerminatedBy::MaxIterationsReached);
    assert_eq!(result.final_text.as_deref(), Some("x"));
}

#[tokio::test]
async fn termination_key_is_cleared_on_entry_and_stops_the_loop_when_truthy() {
    let store = Arc::new(InMemorySessionStore::new());
    let mut stale = Map::new();
    stale.insert("approved".to_string(), json!(true));
    store
        .create(&session_key("loop-key"), stale)
        .await
        .expect("session should create");

    let iterations = Arc::new(AtomicUsize::new(0));
    let seen = iterations.clone();
    let model = FnModel::new("judge", move |_request| {
        let iteration = seen.fetch_add(1, Ordering::SeqCst) + 1;
        if iteration == 2 {
            Ok(ModelResponse::text("yes"))
        } else {
            Ok(ModelResponse::default())
        }
    });
    let judge = llm("judge", Arc::new(model), Some("approved"));
    let root = Node::from(LoopNode::new("gate", judge, 5).with_termination_key("approved"));

    let runner = Runner::new("test-app", store, RunConfig::default());
    let result = runner.run(&root, "test-user", "loop-key", "check").await;

    assert_eq!(iterations.load(Ordering::SeqCst), 2);
    assert_eq!(result.terminated_by, TerminatedBy::Completed);
    assert_eq!(result.final_state_snapshot.get("approved"), Some(&json!("yes")));
}

#[tokio::test]
async fn output_key_placeholder_reaches_the_next_agent() {
    let downstream = ScriptedModel::new("b").with_text("done");
    let log = downstream.request_log();
    let agent_b = LlmAgentBuilder::new("b")
        .instruction("Answer the question: {q}")
        .model(Arc::new(downstream))
        .build()
        .expect("agent should build");
    let root = Node::sequential(
        "qa",
        vec![
            llm("a", Arc::new(EchoModel::default()), Some("q")),
            agent_b.into(),
        ],
    );

    let result = memory_runner().run(&root, "test-user", "qa", "hello").await;

    assert!(result.is_success());
    let requests = log.lock().unwrap_or_else(|e| e.into_inner());
    assert_eq!(requests.len(), 1);
    assert!(requests[0].instruction.contains("hello"));
    assert_eq!(result.final_state_snapshot.get("q"), Some(&json!("hello")));
}

#[tokio::test]
async fn invalid_tool_parameters_are_reported_back_to_the_model() {
    let model = ScriptedModel::new("calc")
        .with_response(ModelResponse::tool_calls(vec![ToolCall::new(
            "call-1",
            "add",
            json!({"bad": 1}),
        )]))
        .with_text("I could not add those.");
    let log = model.request_log();
    let agent = LlmAgentBuilder::new("calculator")
        .model(Arc::new(model))
        .tool(add_tool())
        .build()
        .expect("agent should build");

    let result = memory_runner()
        .run(&Node::from(agent), "test-user", "calc", "add things")
        .await;

    assert!(result.is_success());
    assert_eq!(result.final_text.as_deref(), Some("I could not add those."));
    let requests = log.lock().unwrap_or_else(|e| e.into_inner());
    assert_eq!(requests.len(), 2);
    let payload = requests[1]
        .latest_tool_result()
        .expect("second turn carries the tool result");
    assert_eq!(payload["kind"], "invalid_parameters");
}

#[tokio::test]
async fn missing_template_key_fails_the_run_and_still_saves_the_session() {
    let root = Node::sequential(
        "broken",
        vec![
            llm("writer", Arc::new(EchoModel::default()), Some("draft")),
            LlmAgentBuilder::new("reader")
                .instruction("Use {missing_key}")
                .model(Arc::new(EchoModel::default()))
                .build()
                .expect("agent should build")
                .into(),
        ],
    );
    let store = Arc::new(InMemorySessionStore::new());
    let runner = Runner::new("test-app", store.clone(), RunConfig::default());

    let result = runner.run(&root, "test-user", "tmpl", "text").await;

    assert_eq!(error_kind(&result), Some(ErrorKind::TemplateError));
    let session = store
        .get(&session_key("tmpl"))
        .await
        .expect("session exists after the run");
    assert_eq!(session.state().get("draft"), Some(json!("text")));
}

#[tokio::test]
async fn invalid_trees_fail_before_anything_runs() {
    let calls = Arc::new(AtomicUsize::new(0));
    let root = Node::sequential(
        "dupes",
        vec![
            llm("same", counting_model(calls.clone(), Some("x")), None),
            llm("same", counting_model(calls.clone(), Some("y")), None),
        ],
    );

    let result = memory_runner().run(&root, "test-user", "dupes", "go").await;

    assert_eq!(error_kind(&result), Some(ErrorKind::InvalidPipeline));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

struct StalledModel;

#[async_trait]
impl Model for StalledModel {
    fn name(&self) -> &str {
        "stalled"
    }

    async fn send(&self, _request: ModelRequest) -> Result<ModelResponse, ModelError> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(ModelResponse::text("too late"))
    }
}

#[tokio::test]
async fn model_calls_are_bounded_by_the_model_timeout() {
    let runner = Runner::new(
        "test-app",
        Arc::new(InMemorySessionStore::new()),
        RunConfig {
            model_timeout: Duration::from_millis(50),
            tool_timeout: Duration::from_secs(1),
        },
    );
    let root = llm("slow", Arc::new(StalledModel), None);

    let result = runner.run(&root, "test-user", "slow", "hi").await;

    assert_eq!(error_kind(&result), Some(ErrorKind::Timeout));
}

#[tokio::test]
async fn empty_model_output_is_an_empty_success() {
    let model = ScriptedModel::new("quiet").with_response(ModelResponse::default());
    let root = llm("quiet", Arc::new(model), Some("said"));

    let result = memory_runner().run(&root, "test-user", "quiet", "anything").await;

    assert_eq!(result.terminated_by, TerminatedBy::Completed);
    assert_eq!(result.final_text, None);
    assert!(!result.final_state_snapshot.contains_key("said"));
}

#[tokio::test]
async fn tool_agents_write_structured_results() {
    let clock = ToolAgentBuilder::new("clock")
        .tool(current_time_tool())
        .output_key("now")
        .build()
        .expect("agent should build");

    let result = memory_runner()
        .run(&Node::from(clock), "test-user", "clock", "what time is it")
        .await;

    assert!(result.is_success());
    let now = result
        .final_state_snapshot
        .get("now")
        .expect("tool output is stored");
    assert!(now["utc"].is_string());
    assert!(now["unix_utc_seconds"].is_i64());
}

#[tokio::test]
async fn load_or_create_ignores_later_initial_state() {
    let store = InMemorySessionStore::new();
    let key = session_key("idem");
    let mut first = Map::new();
    first.insert("x".to_string(), json!(1));
    let mut second = Map::new();
    second.insert("x".to_string(), json!(2));

    let a = store
        .load_or_create(&key, first)
        .await
        .expect("first call creates");
    let b = store
        .load_or_create(&key, second)
        .await
        .expect("second call loads");

    assert_eq!(a.state().read("x").expect("x exists"), json!(1));
    assert_eq!(b.state().read("x").expect("x exists"), json!(1));
}

#[tokio::test]
async fn state_values_round_trip_exactly() {
    let store = InMemorySessionStore::new();
    let session = store
        .load_or_create(&session_key("round-trip"), Map::new())
        .await
        .expect("session should create");
    let values = [
        json!(null),
        json!(false),
        json!(-17),
        json!(2.5),
        json!("text with {braces}"),
        json!([1, "two", {"three": 3}]),
        json!({"nested": {"deep": [true, null]}}),
    ];

    for (index, value) in values.iter().enumerate() {
        let key = format!("k{index}");
        session.state().write(key.clone(), value.clone());
        assert_eq!(&session.state().read(&key).expect("key exists"), value);
    }
}

fn sqlite_url(dir: &tempfile::TempDir) -> String {
    format!("sqlite://{}", dir.path().join("sessions.db").to_string_lossy())
}

#[tokio::test]
async fn sqlite_sessions_persist_between_store_instances() {
    let dir = tempdir().expect("temp directory should create");
    let db_url = sqlite_url(&dir);

    let first_store = open_sqlite_session_store(&db_url)
        .await
        .expect("sqlite store should open");
    let runner = Runner::new("test-app", Arc::new(first_store), RunConfig::default());
    let root = llm("echo", Arc::new(EchoModel::default()), Some("last_prompt"));
    let result = runner.run(&root, "test-user", "persisted", "first prompt").await;
    assert!(result.is_success());

    let second_store = open_sqlite_session_store(&db_url)
        .await
        .expect("sqlite store should reopen");
    let session = second_store
        .get(&session_key("persisted"))
        .await
        .expect("session should persist");
    assert_eq!(session.state().get("last_prompt"), Some(json!("first prompt")));

    let recall = ScriptedModel::new("recall").with_text("ok");
    let log = recall.request_log();
    let reader = LlmAgentBuilder::new("reader")
        .instruction("Previously: {last_prompt}")
        .model(Arc::new(recall))
        .build()
        .expect("agent should build");
    let runner = Runner::new("test-app", Arc::new(second_store), RunConfig::default());
    let result = runner
        .run(&Node::from(reader), "test-user", "persisted", "again")
        .await;
    assert!(result.is_success());
    let requests = log.lock().unwrap_or_else(|e| e.into_inner());
    assert_eq!(requests[0].instruction, "Previously: first prompt");
}

#[tokio::test]
async fn sqlite_store_lists_newest_first_and_deletes() {
    let dir = tempdir().expect("temp directory should create");
    let store = open_sqlite_session_store(&sqlite_url(&dir))
        .await
        .expect("sqlite store should open");

    let older = store
        .create(&session_key("older"), Map::new())
        .await
        .expect("create older");
    let newer = store
        .create(&session_key("newer"), Map::new())
        .await
        .expect("create newer");
    older.state().write("touched", json!(false));
    store.save(&older).await.expect("save older");
    tokio::time::sleep(Duration::from_millis(5)).await;
    newer.state().write("touched", json!(true));
    store.save(&newer).await.expect("save newer");

    let listed = store.list("test-app", "test-user").await.expect("list");
    let ids = listed
        .iter()
        .map(|summary| summary.key.session_id.as_str())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec!["newer", "older"]);

    let err = store
        .create(&session_key("older"), Map::new())
        .await
        .expect_err("duplicate triple");
    assert_eq!(err.kind(), ErrorKind::SessionAlreadyExists);

    store.delete(&session_key("older")).await.expect("delete");
    let err = store
        .get(&session_key("older"))
        .await
        .expect_err("deleted session is gone");
    assert_eq!(err.kind(), ErrorKind::SessionNotFound);
}

#[tokio::test]
async fn runs_emit_pipeline_agent_and_tool_telemetry() {
    let dir = tempdir().expect("temp directory should create");
    let path = dir.path().join("events.jsonl");
    let model = ScriptedModel::new("calc")
        .with_response(ModelResponse::tool_calls(vec![ToolCall::new(
            "call-1",
            "add",
            json!({"a": 2, "b": 3}),
        )]))
        .with_text("5");
    let agent = LlmAgentBuilder::new("calculator")
        .model(Arc::new(model))
        .tool(add_tool())
        .build()
        .expect("agent should build");
    let runner = memory_runner().with_telemetry(TelemetrySink::at_path(&path, "ask", "calc"));

    let result = runner
        .run(&Node::from(agent), "test-user", "calc", "2+3")
        .await;
    assert_eq!(result.final_text.as_deref(), Some("5"));

    let events = std::fs::read_to_string(&path)
        .expect("telemetry file exists")
        .lines()
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .filter_map(|event| event["event"].as_str().map(str::to_string))
        .collect::<Vec<_>>();
    assert_eq!(
        events,
        vec![
            "pipeline.started",
            "tool.requested",
            "tool.succeeded",
            "agent.completed",
            "pipeline.completed",
        ]
    );
}

#[tokio::test]
async fn sequential_workflow_threads_the_query_through_to_the_review() {
    let root = build_workflow(
        WorkflowMode::Sequential,
        Arc::new(EchoModel::default()),
        WorkflowSettings {
            max_iterations: 2,
            max_tool_calls: 4,
        },
    )
    .expect("workflow builds");

    let result = memory_runner()
        .run(&root, "test-user", "wf-seq", "rust async runtimes")
        .await;

    assert!(result.is_success());
    assert_eq!(result.final_text.as_deref(), Some("rust async runtimes"));
    for key in ["generated_query", "web_results", "scraped_pages", "overall_review_report"] {
        assert_eq!(
            result.final_state_snapshot.get(key),
            Some(&json!("rust async runtimes")),
            "state key {key}"
        );
    }
    assert!(!result.final_state_snapshot.contains_key("scraped_urls_results"));
}

#[tokio::test]
async fn team_workflow_delegates_to_the_time_agent() {
    let manager_model = ScriptedModel::new("manager")
        .with_response(ModelResponse::tool_calls(vec![ToolCall::new(
            "d1",
            "get_current_time_agent",
            json!({"request": "what time is it"}),
        )]))
        .with_text("It is late.");
    let root = build_workflow(
        WorkflowMode::Team,
        Arc::new(manager_model),
        WorkflowSettings {
            max_iterations: 2,
            max_tool_calls: 4,
        },
    )
    .expect("workflow builds");

    let result = memory_runner()
        .run(&root, "test-user", "wf-team", "what time is it?")
        .await;

    assert!(result.is_success());
    assert_eq!(result.final_text.as_deref(), Some("It is late."));
    assert!(result.final_state_snapshot["current_time"]["utc"].is_string());
    assert!(!result.final_state_snapshot.contains_key("search_results"));
    assert_eq!(
        statuses_for(&result.trace, "get_current_time_agent"),
        vec![NodeStatus::Running, NodeStatus::Completed]
    );
}

#[tokio::test]
async fn loop_workflow_with_a_silent_reviewer_hits_its_cap() {
    let root = build_workflow(
        WorkflowMode::Loop,
        Arc::new(EchoModel::default()),
        WorkflowSettings {
            max_iterations: 2,
            max_tool_calls: 4,
        },
    )
    .expect("workflow builds");

    let result = memory_runner()
        .run(&root, "test-user", "wf-loop", "parse dates")
        .await;

    assert_eq!(result.terminated_by, TerminatedBy::MaxIterationsReached);
    assert!(result.final_state_snapshot.contains_key("generated_code"));
    assert!(result.final_state_snapshot.contains_key("review_comments"));
}

#[tokio::test]
async fn catalog_pipelines_run_end_to_end() {
    let catalog = parse_catalog(
        r#"
        [agents.echoer]
        instruction = "Repeat the request."
        output_key = "echoed"

        [agents.clock]
        tool = "current_time"
        output_key = "now"

        [pipelines.echo_and_time]
        root = { sequential = ["echoer", "clock"] }
        "#,
    )
    .expect("catalog parses");
    let models = |_name: Option<&str>| -> anyhow::Result<Arc<dyn Model>> {
        Ok(Arc::new(EchoModel::default()))
    };
    let root = assemble_pipeline(
        &catalog,
        "echo_and_time",
        &models,
        AssemblyDefaults {
            max_iterations: 3,
            max_tool_calls: 4,
        },
    )
    .expect("pipeline assembles");

    let result = memory_runner()
        .run(&root, "test-user", "catalog", "hi there")
        .await;

    assert!(result.is_success());
    assert_eq!(
        result.final_state_snapshot.get("echoed"),
        Some(&json!("hi there"))
    );
    assert!(result.final_state_snapshot["now"]["utc"].is_string());
}

#[test]
fn profiles_file_on_disk_resolves_into_runtime_config() {
    use clap::Parser;

    let dir = tempdir().expect("temp directory should create");
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
        [profiles.ci]
        provider = "echo"
        session_backend = "sqlite"
        session_db_url = "sqlite://ci.db"
        max_tool_calls = 3
        catalog_path = "ci-pipelines.toml"
        "#,
    )
    .expect("config should write");
    let config_path = path.to_string_lossy().to_string();
    let cli = Cli::parse_from([
        "agent-pipeline",
        "--config-path",
        config_path.as_str(),
        "--profile",
        "ci",
        "tools",
        "list",
    ]);

    let profiles = load_profiles(&cli.config_path).expect("profiles load");
    let cfg = resolve_runtime_config(&cli, &profiles).expect("config resolves");

    assert_eq!(cfg.provider, Provider::Echo);
    assert_eq!(cfg.session_backend, SessionBackend::Sqlite);
    assert_eq!(cfg.max_tool_calls, 3);
    assert_eq!(cfg.catalog_path, "ci-pipelines.toml");
    assert_eq!(
        display_session_db_url(&cfg),
        "sqlite://[REDACTED] (set --show-sensitive-config to reveal)"
    );
}

#[test]
fn failed_results_report_as_run_failed_errors() {
    let result = PipelineResult {
        final_text: None,
        final_structured: None,
        final_state_snapshot: Map::new(),
        terminated_by: TerminatedBy::Error {
            kind: ErrorKind::ToolFailed,
            message: "tool 'x' failed".to_string(),
        },
        partial_failures: Vec::new(),
        trace: Vec::new(),
    };
    let err = report_result("demo", &result, true).expect_err("error terminations fail");
    assert_eq!(
        crate::error::categorize_error(&err),
        crate::error::ErrorCategory::Tooling
    );
}
