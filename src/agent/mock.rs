//! Scripted in-process engine for tests.
//!
//! Each `prompt` replays the next scripted turn onto the session's event
//! stream, with optional delays so watchdog behaviour can be exercised.
//! Kept as a library module (not `cfg(test)`) so integration tests under
//! `tests/` can drive the supervisor without a real engine.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Notify};

use super::events::{AssistantMessage, ContextUsage, EngineEvent, StopReason};
use super::session::{AgentSession, SessionStore};

/// One step of a scripted turn.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Delay(Duration),
    Event(EngineEvent),
}

pub type TurnScript = Vec<ScriptStep>;

// ─── Engine ──────────────────────────────────────────────────────────────────

/// Hands out sessions whose turns replay pre-baked scripts. Sessions are
/// recorded so tests can inspect prompts after the fact.
pub struct MockEngine {
    dir: PathBuf,
    scripts: Mutex<VecDeque<Vec<TurnScript>>>,
    pub sessions: Mutex<Vec<Arc<MockSession>>>,
}

impl MockEngine {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            scripts: Mutex::new(VecDeque::new()),
            sessions: Mutex::new(Vec::new()),
        }
    }

    /// Queue the turn scripts for the next created/opened session.
    pub async fn push_session_script(&self, turns: Vec<TurnScript>) {
        self.scripts.lock().await.push_back(turns);
    }

    async fn next_session(&self, session_file: PathBuf) -> Arc<MockSession> {
        let turns = self.scripts.lock().await.pop_front().unwrap_or_default();
        let session = Arc::new(MockSession::new(session_file, turns));
        self.sessions.lock().await.push(session.clone());
        session
    }
}

#[async_trait]
impl SessionStore for MockEngine {
    async fn create(&self, _cwd: &Path) -> anyhow::Result<Arc<dyn AgentSession>> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let file = self.dir.join(format!("{}.jsonl", uuid::Uuid::new_v4()));
        tokio::fs::write(&file, b"").await?;
        Ok(self.next_session(file).await)
    }

    async fn open(&self, session_file: &Path) -> anyhow::Result<Arc<dyn AgentSession>> {
        Ok(self.next_session(session_file.to_path_buf()).await)
    }
}

// ─── Session ─────────────────────────────────────────────────────────────────

pub struct MockSession {
    session_file: PathBuf,
    tx: broadcast::Sender<EngineEvent>,
    turns: Mutex<VecDeque<TurnScript>>,
    pub prompts: Mutex<Vec<String>>,
    aborted: Arc<AtomicBool>,
    abort_notify: Arc<Notify>,
    pub abort_count: Arc<std::sync::atomic::AtomicU32>,
}

impl MockSession {
    fn new(session_file: PathBuf, turns: Vec<TurnScript>) -> Self {
        let (tx, _) = broadcast::channel(4096);
        Self {
            session_file,
            tx,
            turns: Mutex::new(turns.into()),
            prompts: Mutex::new(Vec::new()),
            aborted: Arc::new(AtomicBool::new(false)),
            abort_notify: Arc::new(Notify::new()),
            abort_count: Arc::new(std::sync::atomic::AtomicU32::new(0)),
        }
    }

    pub async fn prompt_count(&self) -> usize {
        self.prompts.lock().await.len()
    }
}

#[async_trait]
impl AgentSession for MockSession {
    async fn prompt(&self, content: &str, _images: &[PathBuf]) -> anyhow::Result<()> {
        self.prompts.lock().await.push(content.to_string());
        self.aborted.store(false, Ordering::SeqCst);

        let script = self.turns.lock().await.pop_front().unwrap_or_default();
        let tx = self.tx.clone();
        let aborted = self.aborted.clone();
        let notify = self.abort_notify.clone();
        tokio::spawn(async move {
            for step in script {
                if aborted.load(Ordering::SeqCst) {
                    return;
                }
                match step {
                    ScriptStep::Delay(d) => {
                        tokio::select! {
                            _ = tokio::time::sleep(d) => {}
                            _ = notify.notified() => return,
                        }
                    }
                    ScriptStep::Event(event) => {
                        let _ = tx.send(event);
                    }
                }
            }
        });
        Ok(())
    }

    async fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.abort_count.fetch_add(1, Ordering::SeqCst);
        self.abort_notify.notify_waiters();
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    async fn context_usage(&self) -> Option<ContextUsage> {
        None
    }

    fn session_file(&self) -> PathBuf {
        self.session_file.clone()
    }
}

// ─── Script builders ─────────────────────────────────────────────────────────

pub fn assistant_message(content: &str, stop_reason: StopReason) -> AssistantMessage {
    AssistantMessage {
        role: "assistant".into(),
        content: content.into(),
        usage: None,
        provider: "mock".into(),
        model: "mock-1".into(),
        stop_reason,
        error_message: None,
    }
}

/// A plain happy-path turn: start, one text message, turn end.
pub fn text_turn(content: &str) -> TurnScript {
    vec![
        ScriptStep::Event(EngineEvent::AgentStart),
        ScriptStep::Event(EngineEvent::MessageStart),
        ScriptStep::Event(EngineEvent::MessageUpdate {
            delta: super::events::AssistantDelta::TextDelta {
                text: content.into(),
            },
        }),
        ScriptStep::Event(EngineEvent::MessageEnd {
            message: assistant_message(content, StopReason::EndTurn),
        }),
        ScriptStep::Event(EngineEvent::TurnEnd {
            message: assistant_message(content, StopReason::EndTurn),
            tool_results: vec![],
        }),
    ]
}

/// A tool call followed by its completion.
pub fn tool_call(tool_name: &str, call_id: &str, result: serde_json::Value) -> Vec<ScriptStep> {
    vec![
        ScriptStep::Event(EngineEvent::ToolExecutionStart {
            tool_name: tool_name.into(),
            tool_call_id: call_id.into(),
            args: serde_json::json!({}),
        }),
        ScriptStep::Event(EngineEvent::ToolExecutionEnd {
            tool_name: tool_name.into(),
            tool_call_id: call_id.into(),
            is_error: false,
            result,
        }),
    ]
}

/// Terminal pair for a turn that already streamed content.
pub fn turn_end(stop_reason: StopReason) -> Vec<ScriptStep> {
    vec![ScriptStep::Event(EngineEvent::TurnEnd {
        message: assistant_message("", stop_reason),
        tool_results: vec![],
    })]
}
