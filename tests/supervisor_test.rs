//! Supervisor behaviour against a scripted engine: planning happy path,
//! tool-budget grace turns, stall recovery, provider-error parking.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use factoryd::activity::{ActivityEntry, SystemEventKind};
use factoryd::agent::mock::{self, MockEngine, ScriptStep};
use factoryd::agent::{EngineEvent, SessionStore, StopReason};
use factoryd::hub::WorkspaceCore;
use factoryd::supervisor::guardrails::Guardrails;
use factoryd::supervisor::ExecutionSupervisor;
use factoryd::tasks::model::{Actor, Phase, PlanningStatus};
use factoryd::tasks::store::CreateTaskRequest;
use factoryd::workspace::{Workspace, WorkspaceConfig};

fn workspace_at(dir: &Path) -> Workspace {
    Workspace {
        id: "ws-1".into(),
        path: dir.join("demo"),
        name: "demo".into(),
        artifact_root: dir.join("artifacts"),
    }
}

fn build(
    dir: &Path,
    guardrails: Guardrails,
) -> (Arc<WorkspaceCore>, Arc<ExecutionSupervisor>, Arc<MockEngine>) {
    let engine = Arc::new(MockEngine::new(&dir.join("sessions")));
    let workspace = workspace_at(dir);
    let tasks_dir = workspace.artifact_root.join("tasks");
    std::fs::create_dir_all(&tasks_dir).unwrap();
    let (core, _kick_rx) = WorkspaceCore::new(
        workspace,
        WorkspaceConfig::default(),
        engine.clone() as Arc<dyn SessionStore>,
        guardrails,
    );
    let supervisor = ExecutionSupervisor::new(core.clone());
    (core, supervisor, engine)
}

fn save_plan_step(goal: &str) -> Vec<ScriptStep> {
    vec![
        ScriptStep::Event(EngineEvent::ToolExecutionStart {
            tool_name: "save_plan".into(),
            tool_call_id: "sp1".into(),
            args: json!({
                "acceptanceCriteria": ["X is shipped"],
                "plan": {
                    "goal": goal,
                    "steps": ["S"],
                    "validation": ["V"],
                    "cleanup": [],
                    "generatedAt": "2024-01-01T00:00:00Z",
                }
            }),
        }),
        ScriptStep::Event(EngineEvent::ToolExecutionEnd {
            tool_name: "save_plan".into(),
            tool_call_id: "sp1".into(),
            is_error: false,
            result: json!({"text": "saved"}),
        }),
    ]
}

fn bash_call(id: &str) -> Vec<ScriptStep> {
    mock::tool_call("bash", id, json!({"text": "ok"}))
}

#[tokio::test]
async fn planning_happy_path_persists_plan() {
    let dir = tempfile::tempdir().unwrap();
    let (core, supervisor, engine) = build(dir.path(), Guardrails::default());

    let task = core
        .store
        .create_task(CreateTaskRequest {
            description: "ship X".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(task.id(), "DEMO-1");

    let mut turn = vec![ScriptStep::Event(EngineEvent::AgentStart)];
    turn.extend(save_plan_step("G"));
    turn.extend(mock::turn_end(StopReason::EndTurn));
    engine.push_session_script(vec![turn]).await;

    let plan = supervisor.plan_task(task.id()).await.unwrap().unwrap();
    assert_eq!(plan.goal, "G");

    let stored = core.store.get_task(task.id()).await.unwrap();
    assert_eq!(stored.frontmatter.planning_status, PlanningStatus::Completed);
    assert_eq!(stored.frontmatter.plan.as_ref().unwrap().goal, "G");
    assert_eq!(stored.frontmatter.acceptance_criteria.len(), 1);
    assert_eq!(stored.frontmatter.acceptance_criteria[0].text, "X is shipped");
    // Without workflow automation the task stays in backlog.
    assert_eq!(stored.phase(), Phase::Backlog);
    // The session was aborted once the plan became durable.
    let sessions = engine.sessions.lock().await;
    assert!(sessions[0].abort_count.load(std::sync::atomic::Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn tool_budget_breach_gets_exactly_one_grace_turn() {
    let dir = tempfile::tempdir().unwrap();
    let guardrails = Guardrails {
        max_tool_calls: 2,
        ..Default::default()
    };
    let (core, supervisor, engine) = build(dir.path(), guardrails);

    let task = core
        .store
        .create_task(CreateTaskRequest {
            description: "needs a plan".into(),
            ..Default::default()
        })
        .await
        .unwrap();

    // Turn 1 blows the budget without saving; the grace turn saves.
    let mut turn1 = vec![ScriptStep::Event(EngineEvent::AgentStart)];
    turn1.extend(bash_call("t1"));
    turn1.extend(bash_call("t2"));
    turn1.extend(bash_call("t3"));
    turn1.extend(mock::turn_end(StopReason::EndTurn));
    let mut grace = vec![ScriptStep::Event(EngineEvent::AgentStart)];
    grace.extend(save_plan_step("late plan"));
    grace.extend(mock::turn_end(StopReason::EndTurn));
    engine.push_session_script(vec![turn1, grace]).await;

    let plan = supervisor.plan_task(task.id()).await.unwrap();
    assert!(plan.is_some());

    let sessions = engine.sessions.lock().await;
    let prompts = sessions[0].prompts.lock().await;
    assert_eq!(prompts.len(), 2, "exactly one grace turn after the breach");
    assert!(prompts[1].contains("save_plan"));
}

#[tokio::test]
async fn second_budget_breach_fails_planning() {
    let dir = tempfile::tempdir().unwrap();
    let guardrails = Guardrails {
        max_tool_calls: 1,
        ..Default::default()
    };
    let (core, supervisor, engine) = build(dir.path(), guardrails);

    let task = core
        .store
        .create_task(CreateTaskRequest {
            description: "never plans".into(),
            ..Default::default()
        })
        .await
        .unwrap();

    let mut turn1 = vec![ScriptStep::Event(EngineEvent::AgentStart)];
    turn1.extend(bash_call("t1"));
    turn1.extend(bash_call("t2"));
    turn1.extend(mock::turn_end(StopReason::EndTurn));
    // Grace turn also fails to save a plan.
    let mut grace = vec![ScriptStep::Event(EngineEvent::AgentStart)];
    grace.extend(bash_call("t4"));
    grace.extend(mock::turn_end(StopReason::EndTurn));
    engine.push_session_script(vec![turn1, grace]).await;

    let plan = supervisor.plan_task(task.id()).await.unwrap();
    assert!(plan.is_none());

    let stored = core.store.get_task(task.id()).await.unwrap();
    assert_eq!(stored.frontmatter.planning_status, PlanningStatus::Error);
}

#[tokio::test]
async fn post_tool_stall_recovers_and_parks() {
    let dir = tempfile::tempdir().unwrap();
    let guardrails = Guardrails {
        post_tool_stall: Duration::from_millis(150),
        ..Default::default()
    };
    let (core, supervisor, engine) = build(dir.path(), guardrails);

    let task = core
        .store
        .create_task(CreateTaskRequest {
            description: "stalls".into(),
            acceptance_criteria: vec!["done".into()],
            ..Default::default()
        })
        .await
        .unwrap();
    let task = core
        .store
        .move_task_to_phase(&task, Phase::Ready, Actor::User, None, None)
        .await
        .unwrap();
    let task = core
        .store
        .move_task_to_phase(&task, Phase::Executing, Actor::User, None, None)
        .await
        .unwrap();

    let mut turn = vec![ScriptStep::Event(EngineEvent::AgentStart)];
    turn.extend(mock::tool_call("read", "r1", json!({"text": "file contents"})));
    turn.push(ScriptStep::Delay(Duration::from_secs(30)));
    engine.push_session_script(vec![turn]).await;

    let mut control = core.broadcaster.subscribe();
    supervisor.execute_task(task.id(), None).await.unwrap();

    // Parked: still executing, awaiting user input, no live supervisor.
    let stored = core.store.get_task(task.id()).await.unwrap();
    assert_eq!(stored.phase(), Phase::Executing);
    assert!(stored.frontmatter.awaiting_user_input);
    assert!(!supervisor.has_active(task.id()).await);

    // Reliability telemetry names the stall phase.
    let entries = core.activity.replay(100, None).await.unwrap();
    let stall = entries.iter().find_map(|e| match e {
        ActivityEntry::SystemEvent(s)
            if s.event == SystemEventKind::ExecutionReliability
                && s.metadata
                    .as_ref()
                    .and_then(|m| m.get("signal"))
                    .and_then(|v| v.as_str())
                    == Some("turn_stall_recovered") =>
        {
            Some(s.clone())
        }
        _ => None,
    });
    let stall = stall.expect("stall telemetry present");
    assert_eq!(
        stall.metadata.unwrap()["stallPhase"].as_str().unwrap(),
        "post-tool"
    );

    // Exactly one agent:turn_end was broadcast for the stalled turn.
    let mut turn_ends = 0;
    while let Ok(event) = control.try_recv() {
        if event.event == "agent:turn_end" {
            turn_ends += 1;
        }
    }
    assert_eq!(turn_ends, 1);
}

#[tokio::test]
async fn provider_error_parks_without_retry() {
    let dir = tempfile::tempdir().unwrap();
    let (core, supervisor, engine) = build(dir.path(), Guardrails::default());

    let task = core
        .store
        .create_task(CreateTaskRequest {
            description: "provider dies".into(),
            acceptance_criteria: vec!["c".into()],
            ..Default::default()
        })
        .await
        .unwrap();
    let task = core
        .store
        .move_task_to_phase(&task, Phase::Executing, Actor::User, None, None)
        .await
        .unwrap();

    let turn = vec![
        ScriptStep::Event(EngineEvent::AgentStart),
        ScriptStep::Event(EngineEvent::TurnEnd {
            message: factoryd::agent::AssistantMessage {
                role: "assistant".into(),
                content: String::new(),
                usage: None,
                provider: "mock".into(),
                model: "mock-1".into(),
                stop_reason: StopReason::Error,
                error_message: Some("overloaded".into()),
            },
            tool_results: vec![],
        }),
    ];
    engine.push_session_script(vec![turn]).await;

    supervisor.execute_task(task.id(), None).await.unwrap();

    let stored = core.store.get_task(task.id()).await.unwrap();
    assert_eq!(stored.phase(), Phase::Executing);
    assert!(stored.frontmatter.awaiting_user_input);

    let entries = core.activity.replay(100, None).await.unwrap();
    assert!(entries.iter().any(|e| matches!(
        e,
        ActivityEntry::SystemEvent(s) if s.message.contains("Agent turn failed: overloaded")
    )));
    // Only one session was ever created: no automatic retry.
    assert_eq!(engine.sessions.lock().await.len(), 1);
}

#[tokio::test]
async fn successful_execution_completes_the_task() {
    let dir = tempfile::tempdir().unwrap();
    let (core, supervisor, engine) = build(dir.path(), Guardrails::default());

    let task = core
        .store
        .create_task(CreateTaskRequest {
            description: "easy win".into(),
            acceptance_criteria: vec!["c".into()],
            ..Default::default()
        })
        .await
        .unwrap();
    let task = core
        .store
        .move_task_to_phase(&task, Phase::Executing, Actor::User, None, None)
        .await
        .unwrap();

    engine
        .push_session_script(vec![mock::text_turn("done, all criteria met")])
        .await;

    supervisor.execute_task(task.id(), None).await.unwrap();

    let stored = core.store.get_task(task.id()).await.unwrap();
    assert_eq!(stored.phase(), Phase::Complete);
    assert!(stored.frontmatter.completed.is_some());
    assert!(stored.frontmatter.cycle_time.unwrap() >= 0);
}

#[tokio::test]
async fn usage_samples_merge_additively() {
    let dir = tempfile::tempdir().unwrap();
    let (core, supervisor, engine) = build(dir.path(), Guardrails::default());

    let task = core
        .store
        .create_task(CreateTaskRequest {
            description: "usage".into(),
            acceptance_criteria: vec!["c".into()],
            ..Default::default()
        })
        .await
        .unwrap();
    let task = core
        .store
        .move_task_to_phase(&task, Phase::Executing, Actor::User, None, None)
        .await
        .unwrap();

    let usage_message = |input: u64| factoryd::agent::AssistantMessage {
        role: "assistant".into(),
        content: "chunk".into(),
        usage: Some(factoryd::agent::events::UsagePayload {
            input_tokens: Some(input),
            output_tokens: Some(5),
            cost: Some(0.01),
            ..Default::default()
        }),
        provider: "mock".into(),
        model: "mock-1".into(),
        stop_reason: StopReason::EndTurn,
        error_message: None,
    };
    let turn = vec![
        ScriptStep::Event(EngineEvent::AgentStart),
        ScriptStep::Event(EngineEvent::MessageEnd {
            message: usage_message(10),
        }),
        ScriptStep::Event(EngineEvent::MessageEnd {
            message: usage_message(20),
        }),
        ScriptStep::Event(EngineEvent::TurnEnd {
            message: mock::assistant_message("done", StopReason::EndTurn),
            tool_results: vec![],
        }),
    ];
    engine.push_session_script(vec![turn]).await;

    supervisor.execute_task(task.id(), None).await.unwrap();

    let stored = core.store.get_task(task.id()).await.unwrap();
    let metrics = &stored.frontmatter.usage_metrics;
    assert_eq!(metrics.totals.input, 30);
    assert_eq!(metrics.totals.output, 10);
    assert_eq!(metrics.by_model.len(), 1);
    let by_model_total: u64 = metrics.by_model.iter().map(|m| m.totals.total).sum();
    assert_eq!(metrics.totals.total, by_model_total);
}

#[tokio::test]
async fn stop_without_active_session_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let (core, supervisor, _engine) = build(dir.path(), Guardrails::default());

    let task = core
        .store
        .create_task(CreateTaskRequest {
            description: "idle".into(),
            ..Default::default()
        })
        .await
        .unwrap();

    let before = core.store.get_task(task.id()).await.unwrap();
    let stopped = supervisor.stop_task_execution(task.id()).await;
    assert!(!stopped);

    let after = core.store.get_task(task.id()).await.unwrap();
    assert_eq!(before.frontmatter.updated, after.frontmatter.updated);
    assert!(core.activity.replay(100, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn concurrent_supervisors_for_one_task_are_refused() {
    let dir = tempfile::tempdir().unwrap();
    let (core, supervisor, engine) = build(dir.path(), Guardrails::default());

    let task = core
        .store
        .create_task(CreateTaskRequest {
            description: "slow".into(),
            acceptance_criteria: vec!["c".into()],
            ..Default::default()
        })
        .await
        .unwrap();
    let task = core
        .store
        .move_task_to_phase(&task, Phase::Executing, Actor::User, None, None)
        .await
        .unwrap();

    let mut turn = vec![ScriptStep::Event(EngineEvent::AgentStart)];
    turn.push(ScriptStep::Delay(Duration::from_millis(300)));
    turn.extend(mock::turn_end(StopReason::EndTurn));
    engine.push_session_script(vec![turn]).await;

    let task_id = task.id().to_string();
    let supervisor_bg = supervisor.clone();
    let id_bg = task_id.clone();
    let first = tokio::spawn(async move { supervisor_bg.execute_task(&id_bg, None).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = supervisor.execute_task(&task_id, None).await;
    assert!(second.is_err(), "second supervisor must be refused");
    assert!(first.await.unwrap().is_ok());
}
