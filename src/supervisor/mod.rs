//! Execution supervisor: drives one agent session per task, applies
//! guardrails, and translates engine events into activity entries and typed
//! control events.
//!
//! Two run shapes share the same event-handling core: a planning run waits
//! for the agent to call `save_plan` and aborts as soon as the plan is
//! durable; an execution run streams through `turn_end`, then completes the
//! task or parks it.

pub mod guardrails;

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::activity::SystemEventKind;
use crate::agent::events::{AssistantDelta, AssistantMessage, EngineEvent, StopReason};
use crate::agent::AgentSession;
use crate::hub::{SavePlanPayload, WorkspaceCore};
use crate::tasks::model::{Actor, Phase, Plan, PlanningStatus, Task};
use crate::tasks::store::UpdateTaskRequest;
use guardrails::{StallPhase, ToolBudget, TurnWatchdog};

// ─── Status and outcomes ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Idle,
    Streaming,
    ToolUse,
    Thinking,
    Completed,
    Error,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Idle => "idle",
            ExecutionStatus::Streaming => "streaming",
            ExecutionStatus::ToolUse => "tool_use",
            ExecutionStatus::Thinking => "thinking",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Planning,
    Execution,
}

#[derive(Debug)]
enum TurnOutcome {
    /// Natural `turn_end` from the engine.
    Completed(AssistantMessage),
    /// A watchdog tripped and the session was recovered.
    Stalled(StallPhase),
    /// `stop_task_execution` interrupted the turn.
    Stopped,
    /// The event stream died without a terminal event.
    StreamClosed,
}

struct TurnReport {
    outcome: TurnOutcome,
    budget_breached: bool,
    saved_plan: Option<SavePlanPayload>,
}

// ─── Active run registry ─────────────────────────────────────────────────────

pub struct ActiveRun {
    /// Monotonic supervisor instance id; late callbacks from a replaced run
    /// compare against the registry entry and are dropped.
    pub id: u64,
    pub task_id: String,
    pub kind: RunKind,
    session: Arc<dyn AgentSession>,
    stop_requested: AtomicBool,
    stop_notify: Notify,
    steer: Mutex<Vec<String>>,
    follow_ups: Mutex<Vec<String>>,
    turn_counter: AtomicU64,
}

// ─── Supervisor ──────────────────────────────────────────────────────────────

pub struct ExecutionSupervisor {
    core: Arc<WorkspaceCore>,
    active: Mutex<HashMap<String, Arc<ActiveRun>>>,
    seq: AtomicU64,
}

impl ExecutionSupervisor {
    pub fn new(core: Arc<WorkspaceCore>) -> Arc<Self> {
        Arc::new(Self {
            core,
            active: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(1),
        })
    }

    // ─── Registry queries ────────────────────────────────────────────────────

    pub async fn has_active(&self, task_id: &str) -> bool {
        self.active.lock().await.contains_key(task_id)
    }

    pub async fn get_active(&self) -> Vec<(String, RunKind)> {
        self.active
            .lock()
            .await
            .values()
            .map(|r| (r.task_id.clone(), r.kind))
            .collect()
    }

    pub async fn active_execution_count(&self) -> usize {
        self.active
            .lock()
            .await
            .values()
            .filter(|r| r.kind == RunKind::Execution)
            .count()
    }

    pub async fn active_planning_count(&self) -> usize {
        self.active
            .lock()
            .await
            .values()
            .filter(|r| r.kind == RunKind::Planning)
            .count()
    }

    /// Abort every live session. Used on daemon shutdown.
    pub async fn drain(&self) {
        let runs: Vec<Arc<ActiveRun>> = self.active.lock().await.drain().map(|(_, r)| r).collect();
        for run in runs {
            run.stop_requested.store(true, Ordering::SeqCst);
            run.stop_notify.notify_one();
            run.session.abort().await;
        }
    }

    // ─── Planning run ────────────────────────────────────────────────────────

    /// Run a planning session against one task until the agent saves a plan
    /// or a guardrail gives up. Returns the persisted plan, or `None` when
    /// planning failed (`planningStatus` records the failure).
    pub async fn plan_task(&self, task_id: &str) -> Result<Option<Plan>> {
        let task = self.core.store.get_task(task_id).await?;
        let run = self.register(&task, RunKind::Planning).await?;

        let updated = self
            .core
            .store
            .update_task(
                &task,
                UpdateTaskRequest {
                    planning_status: Some(PlanningStatus::Running),
                    session_file: Some(run.session.session_file()),
                    ..Default::default()
                },
            )
            .await?;
        self.broadcast_task_updated(&updated);

        self.run_skills(task_id, &updated.frontmatter.pre_planning_skills, "pre-planning")
            .await;

        let started = Instant::now();
        let result = tokio::time::timeout(
            self.core.guardrails.planning_timeout,
            self.planning_loop(&run, &updated),
        )
        .await;

        let outcome = match result {
            Ok(inner) => inner,
            Err(_) => {
                run.session.abort().await;
                self.core
                    .activity
                    .append_system(
                        Some(task_id.to_string()),
                        SystemEventKind::Timeout,
                        "planning run timed out",
                        Some(json!({ "durationMs": started.elapsed().as_millis() as u64 })),
                    )
                    .await;
                self.set_planning_status(task_id, PlanningStatus::Error).await;
                self.clear_active(task_id, run.id).await;
                self.core.request_kick();
                bail!("planning timed out for {task_id}");
            }
        };

        self.clear_active(task_id, run.id).await;
        self.core.request_kick();
        outcome
    }

    async fn planning_loop(&self, run: &Arc<ActiveRun>, task: &Task) -> Result<Option<Plan>> {
        let mut budget = ToolBudget::new(self.core.guardrails.max_tool_calls);
        let mut grace_used = false;
        let mut prompt = planning_prompt(task);

        loop {
            let report = self.run_turn(run, &prompt, Some(&mut budget)).await;

            if let Some(payload) = report.saved_plan {
                let plan = payload.plan.clone();
                let fresh = self.core.store.get_task(&run.task_id).await?;
                let criteria = if payload.acceptance_criteria.is_empty() {
                    None
                } else {
                    Some(
                        payload
                            .acceptance_criteria
                            .into_iter()
                            .map(crate::tasks::model::AcceptanceCriterion::new)
                            .collect(),
                    )
                };
                // Plan and status are durable before this function returns.
                let updated = self
                    .core
                    .store
                    .update_task(
                        &fresh,
                        UpdateTaskRequest {
                            plan: Some(plan.clone()),
                            acceptance_criteria: criteria,
                            planning_status: Some(PlanningStatus::Completed),
                            ..Default::default()
                        },
                    )
                    .await?;
                run.session.abort().await;
                self.broadcast_task_updated(&updated);
                info!(task = %run.task_id, "plan saved");
                return Ok(Some(plan));
            }

            let wants_grace = match &report.outcome {
                _ if report.budget_breached => true,
                TurnOutcome::Completed(msg) if msg.stop_reason == StopReason::Length => true,
                _ => false,
            };

            match report.outcome {
                TurnOutcome::Stopped => return Ok(None),
                TurnOutcome::Completed(msg) if msg.stop_reason == StopReason::Error => {
                    self.core
                        .activity
                        .append_system(
                            Some(run.task_id.clone()),
                            SystemEventKind::Error,
                            format!(
                                "Agent turn failed: {}",
                                msg.error_message.as_deref().unwrap_or("unknown error")
                            ),
                            None,
                        )
                        .await;
                    self.set_planning_status(&run.task_id, PlanningStatus::Error).await;
                    return Ok(None);
                }
                TurnOutcome::Completed(_) if wants_grace && !grace_used => {
                    // Exactly one grace turn asking explicitly for save_plan.
                    grace_used = true;
                    prompt = grace_prompt().to_string();
                    continue;
                }
                TurnOutcome::Completed(_)
                | TurnOutcome::Stalled(_)
                | TurnOutcome::StreamClosed => {
                    self.set_planning_status(&run.task_id, PlanningStatus::Error).await;
                    return Ok(None);
                }
            }
        }
    }

    async fn set_planning_status(&self, task_id: &str, status: PlanningStatus) {
        if let Ok(task) = self.core.store.get_task(task_id).await {
            if let Ok(updated) = self
                .core
                .store
                .update_task(
                    &task,
                    UpdateTaskRequest {
                        planning_status: Some(status),
                        ..Default::default()
                    },
                )
                .await
            {
                self.broadcast_task_updated(&updated);
            }
        }
    }

    // ─── Execution run ───────────────────────────────────────────────────────

    /// Run the task's execution session to a terminal state. On success the
    /// task moves to `complete`; on irrecoverable failure it is parked.
    pub async fn execute_task(&self, task_id: &str, initial_message: Option<String>) -> Result<()> {
        let mut task = self.core.store.get_task(task_id).await?;
        // Direct invocations on a non-executing task pull it into the phase
        // first; queue dispatch has already done this.
        if task.phase() != Phase::Executing {
            let from = task.phase();
            task = self
                .core
                .store
                .move_task_to_phase(&task, Phase::Executing, Actor::User, None, None)
                .await?;
            self.broadcast_task_moved(&task, from).await;
        }
        let run = self.register(&task, RunKind::Execution).await?;

        let task = self
            .core
            .store
            .update_task(
                &task,
                UpdateTaskRequest {
                    session_file: Some(run.session.session_file()),
                    awaiting_user_input: Some(false),
                    ..Default::default()
                },
            )
            .await?;

        self.run_skills(task_id, &task.frontmatter.pre_execution_skills, "pre-execution")
            .await;

        let started = Instant::now();
        let result = tokio::time::timeout(
            self.core.guardrails.execution_timeout,
            self.execution_loop(&run, &task, initial_message),
        )
        .await;

        if result.is_err() {
            run.session.abort().await;
            self.core
                .activity
                .append_system(
                    Some(task_id.to_string()),
                    SystemEventKind::Timeout,
                    "execution run timed out",
                    Some(json!({ "durationMs": started.elapsed().as_millis() as u64 })),
                )
                .await;
            self.park(task_id, "execution run timed out").await;
        }

        self.clear_active(task_id, run.id).await;
        self.core.request_kick();
        result.unwrap_or(Ok(()))
    }

    async fn execution_loop(
        &self,
        run: &Arc<ActiveRun>,
        task: &Task,
        initial_message: Option<String>,
    ) -> Result<()> {
        let mut prompt = initial_message.unwrap_or_else(|| execution_prompt(task));

        loop {
            let report = self.run_turn(run, &prompt, None).await;

            match report.outcome {
                TurnOutcome::Stopped => return Ok(()),
                TurnOutcome::Completed(msg) if msg.stop_reason == StopReason::Error => {
                    // Provider-reported failure: surface, park, never retry
                    // automatically.
                    self.core
                        .activity
                        .append_system(
                            Some(run.task_id.clone()),
                            SystemEventKind::Error,
                            format!(
                                "Agent turn failed: {}",
                                msg.error_message.as_deref().unwrap_or("unknown error")
                            ),
                            None,
                        )
                        .await;
                    self.park(&run.task_id, "provider error").await;
                    self.broadcast_status(&run.task_id, ExecutionStatus::Error);
                    return Ok(());
                }
                TurnOutcome::Completed(_) => {
                    let queued: Vec<String> = run.follow_ups.lock().await.drain(..).collect();
                    if !queued.is_empty() {
                        prompt = queued.join("\n\n");
                        continue;
                    }
                    let fresh = self.core.store.get_task(&run.task_id).await?;
                    self.run_skills(
                        &run.task_id,
                        &fresh.frontmatter.post_execution_skills,
                        "post-execution",
                    )
                    .await;
                    if fresh.phase() == Phase::Executing {
                        match self
                            .core
                            .store
                            .move_task_to_phase(&fresh, Phase::Complete, Actor::Agent, None, None)
                            .await
                        {
                            Ok(moved) => self.broadcast_task_moved(&moved, Phase::Executing).await,
                            Err(e) => warn!(task = %run.task_id, err = %e, "completion move failed"),
                        }
                    }
                    self.broadcast_status(&run.task_id, ExecutionStatus::Completed);
                    return Ok(());
                }
                TurnOutcome::Stalled(_) | TurnOutcome::StreamClosed => {
                    self.park(&run.task_id, "turn stalled, awaiting user input").await;
                    return Ok(());
                }
            }
        }
    }

    /// Park: leave the task in `executing`, flagged as awaiting user input,
    /// with no live supervisor. The queue skips parked tasks until a user
    /// action reopens them.
    async fn park(&self, task_id: &str, reason: &str) {
        debug!(task = task_id, reason, "parking task");
        if let Ok(task) = self.core.store.get_task(task_id).await {
            let _ = self
                .core
                .store
                .update_task(
                    &task,
                    UpdateTaskRequest {
                        awaiting_user_input: Some(true),
                        ..Default::default()
                    },
                )
                .await;
        }
        self.broadcast_status(task_id, ExecutionStatus::Idle);
    }

    // ─── Stop / steer / follow-up ────────────────────────────────────────────

    /// Cancel the task's current turn. Returns false (and changes nothing)
    /// when no session is active; cancellation is idempotent.
    pub async fn stop_task_execution(&self, task_id: &str) -> bool {
        let run = { self.active.lock().await.remove(task_id) };
        let Some(run) = run else {
            return false;
        };
        run.stop_requested.store(true, Ordering::SeqCst);
        run.stop_notify.notify_one();
        run.session.abort().await;
        self.broadcast_status(task_id, ExecutionStatus::Idle);
        self.core
            .broadcaster
            .broadcast("agent:turn_end", json!({ "taskId": task_id, "outcome": "stopped" }));
        info!(task = task_id, "execution stopped");
        self.core.request_kick();
        true
    }

    /// Prepend a steering instruction to the next prompt turn. Requires an
    /// active session.
    pub async fn steer_task(&self, task_id: &str, instruction: &str) -> Result<()> {
        let active = self.active.lock().await;
        let run = active
            .get(task_id)
            .with_context(|| format!("no active session for {task_id}"))?;
        run.steer.lock().await.push(instruction.to_string());
        Ok(())
    }

    /// Queue a user message for delivery once the current turn ends; when no
    /// turn is active, start a new one immediately.
    pub async fn follow_up_task(self: &Arc<Self>, task_id: &str, message: &str) -> Result<()> {
        {
            let active = self.active.lock().await;
            if let Some(run) = active.get(task_id) {
                run.follow_ups.lock().await.push(message.to_string());
                return Ok(());
            }
        }
        let this = self.clone();
        let task_id = task_id.to_string();
        let message = message.to_string();
        tokio::spawn(async move {
            if let Err(e) = this.execute_task(&task_id, Some(message)).await {
                warn!(task = %task_id, err = %e, "follow-up execution failed");
            }
        });
        Ok(())
    }

    // ─── Session management ──────────────────────────────────────────────────

    /// Open (or resume) the task's session and register the run. Refuses to
    /// start while another supervisor is live for the task — the planning
    /// and execution sessions for one task never run concurrently.
    async fn register(&self, task: &Task, kind: RunKind) -> Result<Arc<ActiveRun>> {
        let mut active = self.active.lock().await;
        if active.contains_key(task.id()) {
            bail!("a supervisor is already live for {}", task.id());
        }

        let session = match task.frontmatter.session_file {
            Some(ref file) => match self.core.engine.open(file).await {
                Ok(session) => session,
                Err(e) => {
                    warn!(task = %task.id(), err = %e, "session resume failed, creating fresh");
                    self.core.engine.create(&self.core.workspace.path).await?
                }
            },
            None => self.core.engine.create(&self.core.workspace.path).await?,
        };

        let run = Arc::new(ActiveRun {
            id: self.seq.fetch_add(1, Ordering::SeqCst),
            task_id: task.id().to_string(),
            kind,
            session,
            stop_requested: AtomicBool::new(false),
            stop_notify: Notify::new(),
            steer: Mutex::new(Vec::new()),
            follow_ups: Mutex::new(Vec::new()),
            turn_counter: AtomicU64::new(0),
        });
        active.insert(task.id().to_string(), run.clone());
        Ok(run)
    }

    /// Remove the registry entry, but only when it still belongs to this run
    /// — a stop or replacement may already have swapped it out.
    async fn clear_active(&self, task_id: &str, run_id: u64) {
        let mut active = self.active.lock().await;
        if active.get(task_id).map(|r| r.id) == Some(run_id) {
            active.remove(task_id);
        }
    }

    // ─── Turn driver ─────────────────────────────────────────────────────────

    async fn run_turn(
        &self,
        run: &Arc<ActiveRun>,
        prompt: &str,
        mut budget: Option<&mut ToolBudget>,
    ) -> TurnReport {
        let task_id = run.task_id.clone();
        let turn_number = run.turn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let turn_id = ulid::Ulid::new().to_string();

        // Steering control-messages are prepended to this prompt turn.
        let steers: Vec<String> = run.steer.lock().await.drain(..).collect();
        let full_prompt = if steers.is_empty() {
            prompt.to_string()
        } else {
            format!("[steering]\n{}\n\n{}", steers.join("\n"), prompt)
        };

        // Subscribe before prompting so no event can be missed.
        let mut rx = run.session.subscribe();
        let session = run.session.clone();
        let prompt_task = tokio::spawn(async move { session.prompt(&full_prompt, &[]).await });

        let mut watchdog = TurnWatchdog::armed(&self.core.guardrails);
        let started = Instant::now();
        let mut first_token_at: Option<Instant> = None;
        let mut budget_breached = false;
        let mut saved_plan: Option<SavePlanPayload> = None;
        let mut tool_args: HashMap<String, (String, Value)> = HashMap::new();

        let outcome = loop {
            if run.stop_requested.load(Ordering::SeqCst) {
                break TurnOutcome::Stopped;
            }
            let (deadline, phase) = watchdog.next_deadline();
            tokio::select! {
                _ = run.stop_notify.notified() => {
                    break TurnOutcome::Stopped;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    // Watchdog trip: abort, record, emit a single turn_end,
                    // and let the caller park the task.
                    run.session.abort().await;
                    self.reliability(&task_id, "turn_stall_recovered", json!({
                        "stallPhase": phase.as_str(),
                        "turnId": turn_id.clone(),
                    }))
                    .await;
                    self.core.broadcaster.broadcast(
                        "agent:turn_end",
                        json!({ "taskId": &task_id, "outcome": "stalled" }),
                    );
                    break TurnOutcome::Stalled(phase);
                }
                received = rx.recv() => {
                    let event = match received {
                        Ok(event) => event,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!(task = %task_id, skipped = n, "supervisor lagged on engine events");
                            continue;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            break TurnOutcome::StreamClosed;
                        }
                    };
                    watchdog.observe(&event);

                    match event {
                        EngineEvent::AgentStart => {
                            self.broadcast_status(&task_id, ExecutionStatus::Streaming);
                            self.reliability(&task_id, "turn_start", json!({
                                "turnId": turn_id.clone(),
                                "turnNumber": turn_number,
                            }))
                            .await;
                        }
                        EngineEvent::MessageStart => {}
                        EngineEvent::MessageUpdate { delta } => match delta {
                            AssistantDelta::TextDelta { .. } => {
                                if first_token_at.is_none() {
                                    first_token_at = Some(Instant::now());
                                    self.reliability(&task_id, "first_token", json!({
                                        "timeToFirstTokenMs":
                                            started.elapsed().as_millis() as u64,
                                    }))
                                    .await;
                                }
                                self.broadcast_status(&task_id, ExecutionStatus::Streaming);
                            }
                            AssistantDelta::ThinkingDelta { .. } => {
                                self.broadcast_status(&task_id, ExecutionStatus::Thinking);
                            }
                        },
                        EngineEvent::ToolExecutionStart { tool_name, tool_call_id, args } => {
                            self.broadcast_status(&task_id, ExecutionStatus::ToolUse);
                            self.core
                                .activity
                                .append_chat(
                                    Some(task_id.clone()),
                                    Actor::Agent,
                                    format!("tool {tool_name}"),
                                    vec![],
                                    Some(json!({
                                        "toolName": &tool_name,
                                        "toolCallId": &tool_call_id,
                                        "args": &args,
                                    })),
                                )
                                .await;
                            tool_args.insert(tool_call_id, (tool_name, args));
                        }
                        EngineEvent::ToolExecutionUpdate { .. } => {}
                        EngineEvent::ToolExecutionEnd { tool_name, tool_call_id, is_error, result } => {
                            let text = tool_result_text(&result);
                            self.core
                                .activity
                                .append_chat(
                                    Some(task_id.clone()),
                                    Actor::Agent,
                                    text,
                                    vec![],
                                    Some(json!({
                                        "toolName": &tool_name,
                                        "toolCallId": &tool_call_id,
                                        "isError": is_error,
                                    })),
                                )
                                .await;

                            // Extension tool payloads are consumed here.
                            if tool_name == "save_plan" && !is_error {
                                let payload = tool_args
                                    .remove(&tool_call_id)
                                    .map(|(_, args)| args)
                                    .filter(|a| !a.is_null())
                                    .unwrap_or(result);
                                match serde_json::from_value::<SavePlanPayload>(payload) {
                                    Ok(parsed) => saved_plan = Some(parsed),
                                    Err(e) => {
                                        warn!(task = %task_id, err = %e, "save_plan payload unparseable");
                                    }
                                }
                            }

                            if let Some(budget) = budget.as_deref_mut() {
                                if budget.charge(&tool_name) && !budget_breached {
                                    budget_breached = true;
                                    self.reliability(&task_id, "tool_budget_exceeded", json!({
                                        "used": budget.used(),
                                    }))
                                    .await;
                                }
                            }
                        }
                        EngineEvent::AutoCompactionStart { reason } => {
                            self.core
                                .activity
                                .append_system(
                                    Some(task_id.clone()),
                                    SystemEventKind::Compaction,
                                    "context compaction started",
                                    Some(json!({ "phase": "start", "reason": reason })),
                                )
                                .await;
                        }
                        EngineEvent::AutoCompactionEnd { aborted, will_retry, error_message } => {
                            let outcome = if aborted {
                                "aborted"
                            } else if error_message.is_some() {
                                "failed"
                            } else {
                                "success"
                            };
                            self.core
                                .activity
                                .append_system(
                                    Some(task_id.clone()),
                                    SystemEventKind::Compaction,
                                    format!("context compaction {outcome}"),
                                    Some(json!({
                                        "phase": "end",
                                        "outcome": outcome,
                                        "willRetry": will_retry,
                                    })),
                                )
                                .await;
                            self.reliability(&task_id, "compaction", json!({ "outcome": outcome }))
                                .await;
                        }
                        EngineEvent::AutoRetryStart { attempt, max_attempts, delay_ms, error_message } => {
                            self.core
                                .activity
                                .append_system(
                                    Some(task_id.clone()),
                                    SystemEventKind::ProviderRetry,
                                    format!("provider retry {attempt}/{max_attempts}: {error_message}"),
                                    Some(json!({ "delayMs": delay_ms })),
                                )
                                .await;
                            self.reliability(&task_id, "provider_retry_start", json!({
                                "attempt": attempt,
                                "maxAttempts": max_attempts,
                            }))
                            .await;
                        }
                        EngineEvent::AutoRetryEnd { success, attempt } => {
                            let outcome = if success { "success" } else { "failed" };
                            self.reliability(&task_id, "provider_retry_end", json!({
                                "attempt": attempt,
                                "outcome": outcome,
                            }))
                            .await;
                        }
                        EngineEvent::MessageEnd { message } => {
                            if let Some(sample) = message.usage_sample() {
                                match self.core.store.get_task(&task_id).await {
                                    Ok(task) => {
                                        if let Err(e) =
                                            self.core.store.record_usage(&task, &sample).await
                                        {
                                            warn!(task = %task_id, err = %e, "usage record failed");
                                        }
                                    }
                                    Err(e) => warn!(task = %task_id, err = %e, "usage task load failed"),
                                }
                            }
                        }
                        EngineEvent::TurnEnd { message, .. } => {
                            let duration_ms = started.elapsed().as_millis() as u64;
                            let outcome = match message.stop_reason {
                                StopReason::Error => "error",
                                StopReason::Length => "length",
                                _ => "success",
                            };
                            self.reliability(&task_id, "turn_end", json!({
                                "outcome": outcome,
                                "durationMs": duration_ms,
                                "turnId": turn_id.clone(),
                            }))
                            .await;
                            self.core.broadcaster.broadcast(
                                "agent:turn_end",
                                json!({ "taskId": &task_id, "outcome": outcome }),
                            );
                            break TurnOutcome::Completed(message);
                        }
                    }
                }
            }
        };

        prompt_task.abort();
        TurnReport {
            outcome,
            budget_breached,
            saved_plan,
        }
    }

    // ─── Skills ──────────────────────────────────────────────────────────────

    /// Surface skill start/end markers. The catalog itself is external; the
    /// core consumes only ids and hook metadata.
    async fn run_skills(&self, task_id: &str, skills: &[String], hook: &str) {
        for skill in skills {
            self.core
                .activity
                .append_system(
                    Some(task_id.to_string()),
                    SystemEventKind::SkillStart,
                    format!("skill {skill} started"),
                    Some(json!({ "skillId": skill, "hook": hook })),
                )
                .await;
            self.core
                .activity
                .append_system(
                    Some(task_id.to_string()),
                    SystemEventKind::SkillEnd,
                    format!("skill {skill} finished"),
                    Some(json!({ "skillId": skill, "hook": hook })),
                )
                .await;
        }
    }

    // ─── Broadcast helpers ───────────────────────────────────────────────────

    fn broadcast_status(&self, task_id: &str, status: ExecutionStatus) {
        self.core.broadcaster.broadcast(
            "agent:execution_status",
            json!({ "taskId": task_id, "status": status.as_str() }),
        );
    }

    fn broadcast_task_updated(&self, task: &Task) {
        self.core
            .broadcaster
            .broadcast("task:updated", json!({ "taskId": task.id() }));
    }

    async fn broadcast_task_moved(&self, task: &Task, from: Phase) {
        self.core
            .activity
            .append_system(
                Some(task.id().to_string()),
                SystemEventKind::PhaseChange,
                format!("{} moved {} -> {}", task.id(), from, task.phase()),
                None,
            )
            .await;
        self.core.broadcaster.broadcast(
            "task:moved",
            json!({
                "taskId": task.id(),
                "from": from.as_str(),
                "to": task.phase().as_str(),
            }),
        );
    }

    async fn reliability(&self, task_id: &str, signal: &str, mut extra: Value) {
        if let Some(map) = extra.as_object_mut() {
            map.insert("signal".to_string(), Value::String(signal.to_string()));
        }
        self.core
            .activity
            .append_system(
                Some(task_id.to_string()),
                SystemEventKind::ExecutionReliability,
                format!("execution reliability: {signal}"),
                Some(extra),
            )
            .await;
    }
}

// ─── Prompts ─────────────────────────────────────────────────────────────────

fn planning_prompt(task: &Task) -> String {
    let mut out = String::new();
    out.push_str("Plan the following task.\n\n");
    if let Some(ref title) = task.frontmatter.title {
        out.push_str(&format!("Title: {title}\n"));
    }
    out.push_str(&format!("Task: {}\n", task.description));
    if !task.frontmatter.acceptance_criteria.is_empty() {
        out.push_str("Existing acceptance criteria:\n");
        for c in &task.frontmatter.acceptance_criteria {
            out.push_str(&format!("- {}\n", c.text));
        }
    }
    out.push_str(
        "\nInvestigate the repository as needed, then call save_plan exactly once \
         with acceptanceCriteria and a plan {goal, steps, validation, cleanup}.",
    );
    out
}

fn grace_prompt() -> &'static str {
    "Stop investigating. Call save_plan now with your best plan based on what \
     you already know."
}

fn execution_prompt(task: &Task) -> String {
    let mut out = String::new();
    out.push_str("Execute the following task.\n\n");
    if let Some(ref title) = task.frontmatter.title {
        out.push_str(&format!("Title: {title}\n"));
    }
    out.push_str(&format!("Task: {}\n", task.description));
    if !task.frontmatter.acceptance_criteria.is_empty() {
        out.push_str("Acceptance criteria:\n");
        for c in &task.frontmatter.acceptance_criteria {
            out.push_str(&format!("- {}\n", c.text));
        }
    }
    if let Some(ref plan) = task.frontmatter.plan {
        out.push_str(&format!("\nGoal: {}\nSteps:\n", plan.goal));
        for step in &plan.steps {
            out.push_str(&format!("- {step}\n"));
        }
        if !plan.validation.is_empty() {
            out.push_str("Validate with:\n");
            for v in &plan.validation {
                out.push_str(&format!("- {v}\n"));
            }
        }
    }
    out
}

/// Pull a readable string out of a tool result value.
fn tool_result_text(result: &Value) -> String {
    match result {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("text")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| result.to_string()),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
