//! Per-workspace conversational planning session.
//!
//! One long-lived agent session per workspace (not per task) produces draft
//! tasks and artifacts via extension tools and can answer questions through
//! the QA subflow. Messages persist with a debounced writer and replay into
//! a recreated session after an engine failure.

pub mod messages;
pub mod shelf;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, OnceCell, RwLock};
use tracing::{info, warn};

use crate::activity::SystemEventKind;
use crate::agent::events::{AssistantDelta, EngineEvent, StopReason};
use crate::agent::AgentSession;
use crate::hub::{QaAnswer, QaQuestion, WorkspaceCore};
use crate::config::Settings;
use crate::supervisor::ExecutionStatus;
use crate::tasks::model::{Actor, Phase, Task};
use crate::tasks::store::CreateTaskRequest;
use crate::tasks::TaskScope;

pub use messages::{MessageLog, PlanningMessage};
pub use shelf::{Artifact, DraftTask, Shelf, ShelfState};

const SESSION_ID_FILE: &str = "planning-session-id.txt";
const CONTEXT_FILE: &str = "workspace-context.md";
/// Messages replayed into a recreated session.
const REPLAY_COUNT: usize = 10;
const REPLAY_MAX_CHARS: usize = 500;

// ─── QA subflow ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct QaRequest {
    pub request_id: String,
    pub questions: Vec<QaQuestion>,
}

// ─── Session ─────────────────────────────────────────────────────────────────

pub struct PlanningSession {
    core: Arc<WorkspaceCore>,
    messages: Arc<MessageLog>,
    shelf: Shelf,
    session: Mutex<Option<Arc<dyn AgentSession>>>,
    session_id: RwLock<String>,
    qa_pending: Mutex<HashMap<String, QaRequest>>,
    status: RwLock<ExecutionStatus>,
    /// Serialises turns; the planning session is one conversation.
    turn_lock: Mutex<()>,
    stop_notify: Notify,
    stop_requested: AtomicBool,
    loaded: OnceCell<()>,
}

impl PlanningSession {
    pub fn new(core: Arc<WorkspaceCore>, settings: &Settings) -> Arc<Self> {
        let messages = MessageLog::new(&core.workspace.artifact_root, settings.planning_debounce());
        let shelf = Shelf::new(&core.workspace.artifact_root);
        Arc::new(Self {
            messages,
            shelf,
            session: Mutex::new(None),
            session_id: RwLock::new(String::new()),
            qa_pending: Mutex::new(HashMap::new()),
            status: RwLock::new(ExecutionStatus::Idle),
            turn_lock: Mutex::new(()),
            stop_notify: Notify::new(),
            stop_requested: AtomicBool::new(false),
            loaded: OnceCell::new(),
            core,
        })
    }

    async fn ensure_loaded(&self) {
        self.loaded
            .get_or_init(|| async {
                self.messages.load().await;
                let history = self.messages.all().await;
                self.shelf.load(&history).await;

                let id_path = self.core.workspace.artifact_root.join(SESSION_ID_FILE);
                let id = match tokio::fs::read_to_string(&id_path).await {
                    Ok(raw) if !raw.trim().is_empty() => raw.trim().to_string(),
                    _ => {
                        let id = uuid::Uuid::new_v4().to_string();
                        let _ = tokio::fs::write(&id_path, &id).await;
                        id
                    }
                };
                *self.session_id.write().await = id;
            })
            .await;
    }

    pub async fn status(&self) -> ExecutionStatus {
        *self.status.read().await
    }

    pub async fn shelf_state(&self) -> ShelfState {
        self.ensure_loaded().await;
        self.shelf.snapshot().await
    }

    pub async fn messages_snapshot(&self) -> Vec<PlanningMessage> {
        self.ensure_loaded().await;
        self.messages.all().await
    }

    /// Flush pending message writes. Called on shutdown.
    pub async fn flush(&self) {
        self.messages.flush().await;
    }

    // ─── Public operations ───────────────────────────────────────────────────

    /// Start a new turn on the planning session, creating it lazily. The
    /// first message on a fresh session is prefixed with the system prompt.
    pub async fn send_planning_message(
        self: &Arc<Self>,
        content: &str,
        images: Vec<PathBuf>,
    ) -> Result<()> {
        self.send_internal(content, images, None).await
    }

    /// Abort the current turn, but only from a stoppable state.
    pub async fn stop_planning_execution(&self) -> bool {
        let status = *self.status.read().await;
        if !matches!(
            status,
            ExecutionStatus::Streaming | ExecutionStatus::ToolUse | ExecutionStatus::Thinking
        ) {
            return false;
        }
        self.stop_requested.store(true, Ordering::SeqCst);
        self.stop_notify.notify_one();
        if let Some(session) = self.session.lock().await.clone() {
            session.abort().await;
        }
        *self.status.write().await = ExecutionStatus::Idle;
        self.broadcast_status(ExecutionStatus::Idle);
        true
    }

    /// Archive the message history under the old session id, tear down the
    /// agent session, rotate the id, and clear the shelf.
    pub async fn reset_planning_session(&self) -> Result<()> {
        self.ensure_loaded().await;
        let _turn = self.turn_lock.lock().await;

        if let Some(session) = self.session.lock().await.take() {
            session.abort().await;
        }

        let old_id = self.session_id.read().await.clone();
        self.messages
            .archive_and_clear(&self.core.workspace.artifact_root, &old_id)
            .await;

        let new_id = uuid::Uuid::new_v4().to_string();
        let id_path = self.core.workspace.artifact_root.join(SESSION_ID_FILE);
        tokio::fs::write(&id_path, &new_id).await?;
        *self.session_id.write().await = new_id.clone();

        self.shelf.clear().await;
        self.qa_pending.lock().await.clear();
        *self.status.write().await = ExecutionStatus::Idle;

        self.core
            .broadcaster
            .broadcast("planning:reset", json!({ "sessionId": new_id }));
        self.core
            .broadcaster
            .broadcast("shelf:updated", json!({ "drafts": 0, "artifacts": 0 }));
        info!(workspace = %self.core.workspace_id(), old = %old_id, "planning session reset");
        Ok(())
    }

    /// Answer a pending QA request; the tool call resumes on the next turn.
    pub async fn resolve_qa_request(
        self: &Arc<Self>,
        request_id: &str,
        answers: Vec<QaAnswer>,
    ) -> Result<()> {
        let request = self
            .qa_pending
            .lock()
            .await
            .remove(request_id)
            .with_context(|| format!("qa request {request_id} not found"))?;

        let mut lines = Vec::new();
        for answer in &answers {
            let question = request
                .questions
                .iter()
                .find(|q| q.id == answer.question_id)
                .map(|q| q.text.as_str())
                .unwrap_or("?");
            let reply = answer
                .selected_option
                .as_deref()
                .or(answer.text.as_deref())
                .unwrap_or("(no answer)");
            lines.push(format!("{question}: {reply}"));
        }
        let content = format!("Answers to your questions:\n{}", lines.join("\n"));
        let metadata = json!({
            "qaResponse": { "requestId": request_id, "answers": answers },
        });
        self.send_internal(&content, vec![], Some(metadata)).await
    }

    /// Abandon a pending QA request without answering.
    pub async fn abort_qa_request(&self, request_id: &str) -> Result<()> {
        self.qa_pending
            .lock()
            .await
            .remove(request_id)
            .with_context(|| format!("qa request {request_id} not found"))?;
        let message = PlanningMessage::new(
            Actor::System,
            "question request dismissed",
            Some(json!({ "qaAborted": { "requestId": request_id } })),
        );
        self.persist_message(message).await;
        Ok(())
    }

    /// Promote a shelf draft into a real task in this workspace.
    pub async fn promote_draft(&self, draft_id: &str) -> Result<Task> {
        self.ensure_loaded().await;
        let draft = self
            .shelf
            .take_draft(draft_id)
            .await
            .with_context(|| format!("draft {draft_id} not found"))?;

        let task = self
            .core
            .store
            .create_task(CreateTaskRequest {
                title: Some(draft.title),
                description: draft.description,
                acceptance_criteria: draft.acceptance_criteria,
                ..Default::default()
            })
            .await?;

        let state = self.shelf.snapshot().await;
        self.core.broadcaster.broadcast(
            "shelf:updated",
            json!({ "drafts": state.drafts.len(), "artifacts": state.artifacts.len() }),
        );
        self.core
            .broadcaster
            .broadcast("task:updated", json!({ "taskId": task.id() }));
        self.core.request_kick();
        Ok(task)
    }

    // ─── Turn driving ────────────────────────────────────────────────────────

    async fn send_internal(
        self: &Arc<Self>,
        content: &str,
        images: Vec<PathBuf>,
        metadata: Option<Value>,
    ) -> Result<()> {
        self.ensure_loaded().await;
        let _turn = self.turn_lock.lock().await;
        self.stop_requested.store(false, Ordering::SeqCst);

        let user_message = PlanningMessage::new(Actor::User, content, metadata);
        self.persist_message(user_message).await;

        let mut recreate_used = false;
        loop {
            let (session, fresh) = self.ensure_session(recreate_used).await?;
            let prompt = if fresh {
                format!("{}\n\n{}", self.system_prompt(recreate_used).await, content)
            } else {
                content.to_string()
            };

            let turn = tokio::time::timeout(
                self.core.guardrails.planning_timeout,
                self.drive_turn(&session, &prompt, &images),
            )
            .await;

            let failure = match turn {
                Ok(Ok(reply)) => {
                    let message = PlanningMessage::new(Actor::Agent, reply.clone(), None);
                    self.persist_message(message).await;
                    *self.status.write().await = ExecutionStatus::Idle;
                    self.broadcast_status(ExecutionStatus::Idle);
                    self.core
                        .broadcaster
                        .broadcast("planning:turn_end", json!({ "content": reply }));
                    return Ok(());
                }
                Ok(Err(e)) => format!("{e}"),
                Err(_) => "planning turn timed out".to_string(),
            };

            if !recreate_used {
                // Destroy and recreate once, replaying a small message
                // window into the new session's system prompt.
                warn!(err = %failure, "planning turn failed, recreating session");
                if let Some(session) = self.session.lock().await.take() {
                    session.abort().await;
                }
                recreate_used = true;
                continue;
            }

            *self.status.write().await = ExecutionStatus::Error;
            self.broadcast_status(ExecutionStatus::Error);
            self.core
                .activity
                .append_system(
                    None,
                    SystemEventKind::Error,
                    format!("planning session failed: {failure}"),
                    None,
                )
                .await;
            anyhow::bail!("planning session failed: {failure}");
        }
    }

    async fn ensure_session(&self, force_new: bool) -> Result<(Arc<dyn AgentSession>, bool)> {
        let mut guard = self.session.lock().await;
        if force_new {
            *guard = None;
        }
        if let Some(ref session) = *guard {
            return Ok((session.clone(), false));
        }
        let session = self.core.engine.create(&self.core.workspace.path).await?;
        *guard = Some(session.clone());
        Ok((session, true))
    }

    /// Consume events for one turn; returns the assistant's text content.
    async fn drive_turn(
        &self,
        session: &Arc<dyn AgentSession>,
        prompt: &str,
        images: &[PathBuf],
    ) -> Result<String> {
        let mut rx = session.subscribe();
        {
            let session = session.clone();
            let prompt = prompt.to_string();
            let images = images.to_vec();
            tokio::spawn(async move {
                if let Err(e) = session.prompt(&prompt, &images).await {
                    warn!(err = %e, "planning prompt failed");
                }
            });
        }

        let mut text = String::new();
        let mut tool_args: HashMap<String, (String, Value)> = HashMap::new();
        loop {
            tokio::select! {
                _ = self.stop_notify.notified() => {
                    return Ok(text);
                }
                received = rx.recv() => {
                    let event = match received {
                        Ok(event) => event,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            anyhow::bail!("planning event stream closed");
                        }
                    };
                    match event {
                        EngineEvent::AgentStart | EngineEvent::MessageStart => {
                            self.set_status(ExecutionStatus::Streaming).await;
                        }
                        EngineEvent::MessageUpdate { delta } => match delta {
                            AssistantDelta::TextDelta { text: t } => {
                                text.push_str(&t);
                                self.set_status(ExecutionStatus::Streaming).await;
                            }
                            AssistantDelta::ThinkingDelta { .. } => {
                                self.set_status(ExecutionStatus::Thinking).await;
                            }
                        },
                        EngineEvent::ToolExecutionStart { tool_name, tool_call_id, args } => {
                            self.set_status(ExecutionStatus::ToolUse).await;
                            tool_args.insert(tool_call_id, (tool_name, args));
                        }
                        EngineEvent::ToolExecutionEnd { tool_name, tool_call_id, is_error, result } => {
                            let args = tool_args
                                .remove(&tool_call_id)
                                .map(|(_, args)| args)
                                .unwrap_or(Value::Null);
                            if !is_error {
                                self.handle_tool(&tool_name, args, result).await;
                            }
                        }
                        EngineEvent::TurnEnd { message, .. } => {
                            if message.stop_reason == StopReason::Error {
                                anyhow::bail!(
                                    "planning turn failed: {}",
                                    message.error_message.as_deref().unwrap_or("unknown error")
                                );
                            }
                            if text.is_empty() {
                                text = message.content;
                            }
                            return Ok(text);
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    /// Extension-tool dispatch for the planning session.
    async fn handle_tool(&self, tool_name: &str, args: Value, result: Value) {
        let payload = if args.is_null() { result } else { args };
        match tool_name {
            "create_draft_task" => {
                let draft = DraftTask {
                    id: payload
                        .get("id")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| ulid::Ulid::new().to_string()),
                    title: payload
                        .get("title")
                        .and_then(Value::as_str)
                        .unwrap_or("untitled draft")
                        .to_string(),
                    description: payload
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    acceptance_criteria: payload
                        .get("acceptanceCriteria")
                        .and_then(Value::as_array)
                        .map(|a| {
                            a.iter()
                                .filter_map(Value::as_str)
                                .map(str::to_string)
                                .collect()
                        })
                        .unwrap_or_default(),
                    created_at: Utc::now(),
                };
                let metadata = json!({ "draftTask": &draft });
                self.shelf.add_draft(draft).await;
                self.persist_message(PlanningMessage::new(Actor::Agent, "draft task created", Some(metadata)))
                    .await;
                self.broadcast_shelf().await;
            }
            "create_artifact" => {
                let artifact = Artifact {
                    id: payload
                        .get("id")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| ulid::Ulid::new().to_string()),
                    title: payload
                        .get("title")
                        .and_then(Value::as_str)
                        .unwrap_or("untitled artifact")
                        .to_string(),
                    content: payload
                        .get("content")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    created_at: Utc::now(),
                };
                let metadata = json!({ "artifact": &artifact });
                self.shelf.add_artifact(artifact).await;
                self.persist_message(PlanningMessage::new(Actor::Agent, "artifact created", Some(metadata)))
                    .await;
                self.broadcast_shelf().await;
            }
            "ask_questions" => {
                let questions: Vec<QaQuestion> = payload
                    .get("questions")
                    .cloned()
                    .or_else(|| payload.as_array().map(|_| payload.clone()))
                    .and_then(|v| serde_json::from_value(v).ok())
                    .unwrap_or_default();
                if questions.is_empty() {
                    return;
                }
                let request = QaRequest {
                    request_id: uuid::Uuid::new_v4().to_string(),
                    questions,
                };
                let metadata = json!({
                    "qaRequest": {
                        "requestId": &request.request_id,
                        "questions": &request.questions,
                    }
                });
                self.persist_message(PlanningMessage::new(
                    Actor::Agent,
                    "questions for you",
                    Some(metadata.clone()),
                ))
                .await;
                self.core
                    .broadcaster
                    .broadcast("qa:request", metadata["qaRequest"].clone());
                self.qa_pending
                    .lock()
                    .await
                    .insert(request.request_id.clone(), request);
            }
            "manage_shelf" => {
                if payload.get("action").and_then(Value::as_str) == Some("remove") {
                    if let Some(id) = payload.get("draftId").and_then(Value::as_str) {
                        self.shelf.take_draft(id).await;
                    }
                }
                self.broadcast_shelf().await;
            }
            _ => {}
        }
    }

    // ─── Helpers ─────────────────────────────────────────────────────────────

    /// Planning messages share the activity append/broadcast path and also
    /// land in the session-scoped message log.
    async fn persist_message(&self, message: PlanningMessage) {
        self.core
            .activity
            .append_chat(
                None,
                message.role,
                message.content.clone(),
                vec![],
                message.metadata.clone(),
            )
            .await;
        self.messages.push(message).await;
    }

    async fn set_status(&self, status: ExecutionStatus) {
        let mut guard = self.status.write().await;
        if *guard != status {
            *guard = status;
            drop(guard);
            self.broadcast_status(status);
        }
    }

    fn broadcast_status(&self, status: ExecutionStatus) {
        self.core
            .broadcaster
            .broadcast("planning:status", json!({ "status": status.as_str() }));
    }

    async fn broadcast_shelf(&self) {
        let state = self.shelf.snapshot().await;
        self.core.broadcaster.broadcast(
            "shelf:updated",
            json!({ "drafts": state.drafts.len(), "artifacts": state.artifacts.len() }),
        );
    }

    /// System prompt for a fresh session: tasks-by-phase summary, shared
    /// workspace context, tool catalog, and (on recreate) a replay window of
    /// recent messages.
    async fn system_prompt(&self, with_replay: bool) -> String {
        let mut out = String::from(
            "You are the planning assistant for this workspace. Use create_draft_task \
             to propose tasks, create_artifact for documents, ask_questions when you \
             need a decision, and manage_shelf to maintain your drafts.\n",
        );

        if let Ok(tasks) = self.core.store.discover_tasks(TaskScope::Active).await {
            out.push_str("\nCurrent tasks by phase:\n");
            for phase in Phase::all() {
                let in_phase: Vec<&Task> =
                    tasks.iter().filter(|t| t.phase() == phase).collect();
                if in_phase.is_empty() {
                    continue;
                }
                out.push_str(&format!("- {phase}:\n"));
                for task in in_phase {
                    let title = task
                        .frontmatter
                        .title
                        .as_deref()
                        .unwrap_or(task.description.lines().next().unwrap_or(""));
                    out.push_str(&format!("  - {} {}\n", task.id(), title));
                }
            }
        }

        let context_path = self.core.workspace.artifact_root.join(CONTEXT_FILE);
        if let Ok(context) = tokio::fs::read_to_string(&context_path).await {
            out.push_str("\nWorkspace context:\n");
            out.push_str(&context);
            out.push('\n');
        }

        if with_replay {
            let tail = self.messages.tail(REPLAY_COUNT, REPLAY_MAX_CHARS).await;
            if !tail.is_empty() {
                out.push_str("\nRecent conversation (recovered after a session failure):\n");
                for message in tail {
                    let role = match message.role {
                        Actor::User => "user",
                        Actor::Agent => "assistant",
                        Actor::System => "system",
                    };
                    out.push_str(&format!("[{role}] {}\n", message.content));
                }
            }
        }

        out
    }
}
